//! Machine-readable reason codes for rejected payments.

use serde::{Deserialize, Serialize};

/// Reason a payment proof did not unlock a resource.
///
/// Every rejection is surfaced to the caller verbatim so forgery, expiry and
/// replay can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorReason {
    /// Proof fields are missing or have an invalid shape.
    Malformed,
    /// The proof names a different resource than the one requested.
    ResourceMismatch,
    /// The requested resource is not in the catalog.
    UnknownResource,
    /// The proof amount differs from the catalog price.
    AmountMismatch,
    /// The proof was made on a different token ledger.
    LedgerMismatch,
    /// The proof's expiry has passed.
    Expired,
    /// The facilitator attestation did not verify.
    InvalidSignature,
    /// The payment identifier was already consumed.
    Replayed,
    /// The consumed-payment ledger could not be reached; access denied.
    StorageUnavailable,
}

impl ErrorReason {
    /// Returns the `snake_case` string representation matching the wire format.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::ResourceMismatch => "resource_mismatch",
            Self::UnknownResource => "unknown_resource",
            Self::AmountMismatch => "amount_mismatch",
            Self::LedgerMismatch => "ledger_mismatch",
            Self::Expired => "expired",
            Self::InvalidSignature => "invalid_signature",
            Self::Replayed => "replayed",
            Self::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl core::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for converting errors into structured payment problems.
pub trait AsPaymentProblem {
    /// Converts this error into a [`PaymentProblem`].
    fn as_payment_problem(&self) -> PaymentProblem;
}

/// A rejection reason together with human-readable details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentProblem {
    reason: ErrorReason,
    details: String,
}

impl PaymentProblem {
    /// Creates a new payment problem with the given reason and details.
    #[must_use]
    pub const fn new(reason: ErrorReason, details: String) -> Self {
        Self { reason, details }
    }

    /// Returns the error reason code.
    #[must_use]
    pub const fn reason(&self) -> ErrorReason {
        self.reason
    }

    /// Returns the human-readable error details.
    #[must_use]
    pub fn details(&self) -> &str {
        &self.details
    }
}
