//! Domain layer for the fulfillment core.
//!
//! Pure event-sourced aggregates and the value objects they share:
//! - `Aggregate`/`DomainEvent` traits and the generic `CommandHandler`
//! - `Cart`, `CartSnapshot` and the checkout `IdempotencyKey`
//! - `ProductStock` counts and the `StockItem` intake stream
//! - `Reservation` holds against stock
//! - `OrderAttempt`, which owns the order lifecycle, its `PaymentIntent`
//!   and, once payment succeeds, its `Order`

pub mod aggregate;
pub mod attempt;
pub mod cart;
pub mod command;
pub mod error;
pub mod inventory;
pub mod reservation;
pub mod values;

pub use aggregate::{Aggregate, DomainEvent};
pub use attempt::{
    AttemptError, AttemptEvent, AttemptState, FailureKind, FailureReason, OrderAttempt,
    Order, OrderStatus, PaymentIntent, PaymentIntentState, StateTransition, TransitionKind,
};
pub use cart::{Cart, CartError, CartItem, CartSnapshot, IdempotencyKey};
pub use command::{CommandHandler, CommandResult};
pub use error::DomainError;
pub use inventory::{ProductStock, StockError, StockEvent, StockItem};
pub use reservation::{
    ReleaseReason, Reservation, ReservationError, ReservationEvent, ReservationLine,
    ReservationState,
};
pub use values::{Money, ShopperId, VariantId};
