//! Payment provider integration.

mod memory;
mod orchestrator;
mod provider;
mod retry;

pub use memory::InMemoryPaymentProvider;
pub use orchestrator::PaymentOrchestrator;
pub use provider::{AuthorizeRequest, PaymentProvider, ProviderError, ProviderPayment, ProviderStatus};
pub use retry::RetryPolicy;
