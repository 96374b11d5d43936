//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::{CartError, DomainError, FailureKind};
use event_store::EventStoreError;
use fulfillment::FulfillmentError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Fulfillment service error.
    Fulfillment(FulfillmentError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = match &self {
            ApiError::Fulfillment(FulfillmentError::CheckoutFailed { attempt_id, .. }) => {
                serde_json::json!({ "attempt_id": attempt_id.to_string() })
            }
            _ => serde_json::json!({}),
        };

        let (status, kind, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Fulfillment(err) => {
                let status = fulfillment_status(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, "fulfillment request failed");
                }
                (status, err.kind(), err.to_string())
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        };

        body["error"] = message.into();
        body["kind"] = kind.into();
        (status, axum::Json(body)).into_response()
    }
}

fn fulfillment_status(err: &FulfillmentError) -> StatusCode {
    match err {
        FulfillmentError::InsufficientStock { .. } => StatusCode::CONFLICT,
        FulfillmentError::CartInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FulfillmentError::PaymentDeclined(_) | FulfillmentError::CaptureFailed(_) => {
            StatusCode::PAYMENT_REQUIRED
        }
        FulfillmentError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        FulfillmentError::PaymentPending(_) => StatusCode::GATEWAY_TIMEOUT,
        FulfillmentError::InvalidReservationState { .. }
        | FulfillmentError::InvalidTransition { .. } => StatusCode::CONFLICT,
        FulfillmentError::CheckoutFailed { reason, .. } => failure_status(reason.kind),
        FulfillmentError::AttemptNotFound(_) => StatusCode::NOT_FOUND,
        FulfillmentError::NoPaymentIntent(_) => StatusCode::CONFLICT,
        // The provider retries until the attempt it refers to is known.
        FulfillmentError::UnknownPaymentReference(_) => StatusCode::CONFLICT,
        FulfillmentError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
        FulfillmentError::MalformedWebhook(_) => StatusCode::BAD_REQUEST,
        FulfillmentError::Domain(DomainError::EventStore(e)) | FulfillmentError::EventStore(e) => {
            store_status(e)
        }
        FulfillmentError::Domain(DomainError::Serialization(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        FulfillmentError::Domain(_) => StatusCode::BAD_REQUEST,
    }
}

fn failure_status(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::InsufficientStock => StatusCode::CONFLICT,
        FailureKind::CartInvalid => StatusCode::UNPROCESSABLE_ENTITY,
        FailureKind::PaymentDeclined
        | FailureKind::CaptureFailed
        | FailureKind::ProviderReported => StatusCode::PAYMENT_REQUIRED,
        FailureKind::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::ShopperCanceled | FailureKind::ReservationExpired => StatusCode::CONFLICT,
    }
}

fn store_status(err: &EventStoreError) -> StatusCode {
    match err {
        EventStoreError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
        EventStoreError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<FulfillmentError> for ApiError {
    fn from(err: FulfillmentError) -> Self {
        ApiError::Fulfillment(err)
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Fulfillment(err.into())
    }
}

impl From<CartError> for ApiError {
    fn from(err: CartError) -> Self {
        ApiError::Fulfillment(FulfillmentError::CartInvalid(err.to_string()))
    }
}

impl From<EventStoreError> for ApiError {
    fn from(err: EventStoreError) -> Self {
        ApiError::Fulfillment(err.into())
    }
}
