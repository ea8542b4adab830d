//! Wire types exchanged between callers and the payment engine.
//!
//! # Key Types
//!
//! - [`PaymentProof`] - The caller-submitted claim of payment
//! - [`PaymentChallenge`] - What a caller must pay to access a resource
//! - [`PaymentRequired`] - The HTTP-402-equivalent envelope around a challenge
//! - [`AccessReceipt`] / [`AccessDenied`] - Outcome bodies returned to callers
//! - [`ErrorReason`] - Machine-readable rejection codes
//!
//! # Wire Format
//!
//! All types serialize to JSON with `snake_case` field names. Byte fields use
//! [`Base64Bytes`]; timestamps are Unix seconds.

use serde::{Deserialize, Serialize};

use crate::encoding::Base64Bytes;
use crate::timestamp::UnixTimestamp;

mod error;

pub use error::{AsPaymentProblem, ErrorReason, PaymentProblem};

/// Payment scheme advertised in challenges: the exact price, no tolerance.
pub const SCHEME_EXACT: &str = "exact";

/// Status code carried in the [`PaymentRequired`] envelope.
pub const PAYMENT_REQUIRED_CODE: &str = "402";

/// Human-readable message carried in the [`PaymentRequired`] envelope.
pub const PAYMENT_REQUIRED_MESSAGE: &str = "Payment Required";

/// The caller-submitted claim that a payment was made for a resource.
///
/// Every field except `nonce` is bound either to the catalog entry of the
/// resource or to the facilitator's signature over the canonical message
/// (see [`crate::signature::canonical_message`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProof {
    /// Globally unique identifier of this payment attempt.
    pub payment_id: String,
    /// Caller-chosen salt. Informational; replay detection uses `payment_id`.
    pub nonce: u64,
    /// Identity of the paying principal.
    pub payer: String,
    /// Amount paid in the token's smallest unit.
    pub amount: u64,
    /// Identity of the fungible-token ledger the payment was made on.
    pub token_ledger: String,
    /// Facilitator signature over the canonical message.
    pub facilitator_signature: Base64Bytes,
    /// Instant from which the proof is no longer accepted.
    pub expiry: UnixTimestamp,
    /// Resource this payment is bound to.
    pub resource_id: String,
}

/// Token accepted for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Chain or network the ledger lives on (e.g. `"ICP"`).
    pub chain: String,
    /// Identity of the token ledger; must match `PaymentProof::token_ledger`.
    pub ledger_id: String,
    /// Display symbol (e.g. `"ckBTC"`).
    pub symbol: String,
}

/// What a caller must pay to access a resource.
///
/// Derived from the catalog on demand and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentChallenge {
    /// The resource being offered.
    pub resource_id: String,
    /// Exact price in the token's smallest unit.
    pub amount: u64,
    /// Accepted token.
    pub token: TokenInfo,
    /// Facilitator whose attestation is required.
    pub facilitator: String,
    /// Payment scheme; always [`SCHEME_EXACT`] for catalog prices.
    pub scheme: String,
    /// Recipient of the funds, if the merchant advertises one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_to: Option<String>,
}

/// Envelope returned when a caller asks for a resource without a proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequired {
    /// Always [`PAYMENT_REQUIRED_CODE`].
    pub code: String,
    /// Always [`PAYMENT_REQUIRED_MESSAGE`].
    pub message: String,
    /// The payment terms.
    pub x402: PaymentChallenge,
}

impl From<PaymentChallenge> for PaymentRequired {
    fn from(challenge: PaymentChallenge) -> Self {
        Self {
            code: PAYMENT_REQUIRED_CODE.to_owned(),
            message: PAYMENT_REQUIRED_MESSAGE.to_owned(),
            x402: challenge,
        }
    }
}

/// Body returned to a caller whose proof was accepted and consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessReceipt {
    /// Always `true`.
    pub success: bool,
    /// The consumed payment identifier.
    pub payment_id: String,
    /// The payer recorded as consumer.
    pub payer: String,
    /// The resource access was granted to.
    pub resource_id: String,
    /// Amount that was paid.
    pub amount: u64,
    /// When the payment was consumed.
    pub consumed_at: UnixTimestamp,
}

/// Body returned to a caller whose proof was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDenied {
    /// Always `false`.
    pub success: bool,
    /// Machine-readable reason.
    pub reason: ErrorReason,
    /// Human-readable details.
    pub message: String,
}

impl From<PaymentProblem> for AccessDenied {
    fn from(problem: PaymentProblem) -> Self {
        Self {
            success: false,
            reason: problem.reason(),
            message: problem.details().to_owned(),
        }
    }
}
