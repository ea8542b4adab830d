//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use m402::gateway::GatewayError;
use m402::ledger::LedgerError;
use m402::proto::{AccessDenied, AccessReceipt, AsPaymentProblem, ErrorReason, PaymentProblem};
use m402::validator::ValidationError;

/// Errors returned by the resource handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The payment proof could not be decoded.
    #[error("malformed payment proof: {0}")]
    MalformedProof(String),

    /// The proof was judged and refused.
    #[error(transparent)]
    Rejected(ValidationError),

    /// The gateway could not reach an outcome.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The ledger could not be read for a status query.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A response body or header could not be encoded.
    #[error("response encoding failed: {0}")]
    Encoding(String),

    /// The blocking validation task did not complete.
    #[error("validation task failed: {0}")]
    Task(String),
}

impl From<ValidationError> for ServerError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::StorageUnavailable(err) => Self::Ledger(err),
            other => Self::Rejected(other),
        }
    }
}

fn denied(status: StatusCode, problem: PaymentProblem) -> Response {
    (status, axum::Json(AccessDenied::from(problem))).into_response()
}

fn storage_unavailable() -> Response {
    denied(
        StatusCode::SERVICE_UNAVAILABLE,
        PaymentProblem::new(
            ErrorReason::StorageUnavailable,
            "payment ledger unavailable".to_owned(),
        ),
    )
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            Self::MalformedProof(details) => denied(
                StatusCode::BAD_REQUEST,
                PaymentProblem::new(ErrorReason::Malformed, details),
            ),
            Self::Rejected(err) => {
                let status = match err.reason() {
                    ErrorReason::UnknownResource => StatusCode::NOT_FOUND,
                    _ => StatusCode::PAYMENT_REQUIRED,
                };
                denied(status, err.as_payment_problem())
            }
            Self::Ledger(err) | Self::Gateway(GatewayError::StorageUnavailable(err)) => {
                tracing::error!(error = %err, "Payment ledger unavailable");
                storage_unavailable()
            }
            Self::Gateway(GatewayError::DataUnavailable { grant, source }) => {
                tracing::error!(
                    payment_id = %grant.payment_id,
                    error = %source,
                    "Payment consumed but resource data unavailable"
                );
                let body = serde_json::json!({
                    "error": source.to_string(),
                    "receipt": AccessReceipt::from(grant.as_ref()),
                });
                (StatusCode::BAD_GATEWAY, axum::Json(body)).into_response()
            }
            Self::Encoding(details) | Self::Task(details) => {
                tracing::error!(error = %details, "Internal server error");
                let body = serde_json::json!({ "error": "internal error" });
                (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
            }
        }
    }
}
