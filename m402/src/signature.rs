//! Facilitator attestation: canonical message, key registry and verification.
//!
//! A facilitator attests a payment by signing the canonical encoding of the
//! proof's bound fields with its Ed25519 key. The merchant checks the
//! attestation against the facilitator's *current* key from a
//! [`FacilitatorKeyRegistry`], fetched once per validation.
//!
//! # Canonical message
//!
//! ```text
//! "m402-payment-proof-v1" 0x00
//! len(payment_id)   u64 BE || payment_id   UTF-8
//! len(payer)        u64 BE || payer        UTF-8
//! amount            u64 BE
//! len(token_ledger) u64 BE || token_ledger UTF-8
//! len(resource_id)  u64 BE || resource_id  UTF-8
//! expiry            u64 BE
//! ```
//!
//! Every variable-length field is length-prefixed, so no two distinct field
//! tuples share an encoding. `nonce` is not covered.

use std::sync::Arc;

use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::encoding::Base64Bytes;
use crate::proto::PaymentProof;
use crate::timestamp::UnixTimestamp;

/// Domain separation tag prefixed to every canonical message.
pub const DOMAIN_TAG: &[u8] = b"m402-payment-proof-v1";

/// Ed25519 signature size in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// The proof fields covered by a facilitator signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedFields<'a> {
    /// Payment identifier.
    pub payment_id: &'a str,
    /// Paying principal.
    pub payer: &'a str,
    /// Amount in smallest units.
    pub amount: u64,
    /// Token ledger identity.
    pub token_ledger: &'a str,
    /// Bound resource.
    pub resource_id: &'a str,
    /// Expiry instant.
    pub expiry: UnixTimestamp,
}

impl<'a> From<&'a PaymentProof> for SignedFields<'a> {
    fn from(proof: &'a PaymentProof) -> Self {
        Self {
            payment_id: &proof.payment_id,
            payer: &proof.payer,
            amount: proof.amount,
            token_ledger: &proof.token_ledger,
            resource_id: &proof.resource_id,
            expiry: proof.expiry,
        }
    }
}

impl SignedFields<'_> {
    /// Encodes the fields into the canonical message.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let variable = self.payment_id.len()
            + self.payer.len()
            + self.token_ledger.len()
            + self.resource_id.len();
        let mut out = Vec::with_capacity(DOMAIN_TAG.len() + 1 + variable + 6 * 8);
        out.extend_from_slice(DOMAIN_TAG);
        out.push(0);
        put_str(&mut out, self.payment_id);
        put_str(&mut out, self.payer);
        out.extend_from_slice(&self.amount.to_be_bytes());
        put_str(&mut out, self.token_ledger);
        put_str(&mut out, self.resource_id);
        out.extend_from_slice(&self.expiry.as_secs().to_be_bytes());
        out
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u64).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Returns the canonical message a facilitator signs for `proof`.
#[must_use]
pub fn canonical_message(proof: &PaymentProof) -> Vec<u8> {
    SignedFields::from(proof).encode()
}

/// Signs the canonical message of `proof` with a facilitator key.
///
/// This is the facilitator's side of the protocol; the validator never calls
/// it.
#[must_use]
pub fn attest(signing_key: &SigningKey, proof: &PaymentProof) -> Base64Bytes {
    let signature = signing_key.sign(&canonical_message(proof));
    Base64Bytes(signature.to_bytes().to_vec())
}

/// Errors while loading facilitator key material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The key is not valid hex.
    #[error("facilitator key for '{facilitator}' is not valid hex: {reason}")]
    Encoding {
        /// Facilitator the key belongs to.
        facilitator: String,
        /// Decoder message.
        reason: String,
    },
    /// The key has the wrong length.
    #[error("facilitator key for '{facilitator}' must be {PUBLIC_KEY_SIZE} bytes, got {len}")]
    Length {
        /// Facilitator the key belongs to.
        facilitator: String,
        /// Decoded length.
        len: usize,
    },
    /// The bytes are not a valid Ed25519 point.
    #[error("facilitator key for '{0}' is not a valid Ed25519 public key")]
    InvalidPoint(String),
}

/// Parses a hex-encoded Ed25519 verifying key.
///
/// # Errors
///
/// Returns [`KeyError`] if the input is not 32 bytes of hex describing a
/// valid curve point.
pub fn parse_verifying_key(facilitator: &str, hex_key: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = hex::decode(hex_key.trim().trim_start_matches("0x")).map_err(|e| {
        KeyError::Encoding {
            facilitator: facilitator.to_owned(),
            reason: e.to_string(),
        }
    })?;
    let array: [u8; PUBLIC_KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| KeyError::Length {
        facilitator: facilitator.to_owned(),
        len: bytes.len(),
    })?;
    VerifyingKey::from_bytes(&array).map_err(|_| KeyError::InvalidPoint(facilitator.to_owned()))
}

/// Source of facilitator verification keys.
pub trait FacilitatorKeyRegistry: Send + Sync {
    /// Returns the facilitator's current key, or `None` if it is unknown.
    fn current_key(&self, facilitator: &str) -> Option<VerifyingKey>;
}

impl<T: FacilitatorKeyRegistry + ?Sized> FacilitatorKeyRegistry for Arc<T> {
    fn current_key(&self, facilitator: &str) -> Option<VerifyingKey> {
        (**self).current_key(facilitator)
    }
}

/// In-process key registry that supports rotation while serving.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: DashMap<String, VerifyingKey>,
}

impl KeyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces a facilitator's key, returning the previous one.
    pub fn rotate(&self, facilitator: impl Into<String>, key: VerifyingKey) -> Option<VerifyingKey> {
        let facilitator = facilitator.into();

        #[cfg(feature = "telemetry")]
        tracing::info!(facilitator = %facilitator, "Installed facilitator key");

        self.keys.insert(facilitator, key)
    }

    /// Removes a facilitator; its attestations stop verifying immediately.
    pub fn revoke(&self, facilitator: &str) -> Option<VerifyingKey> {
        self.keys.remove(facilitator).map(|(_, key)| key)
    }

    /// Number of known facilitators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if no facilitator is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FacilitatorKeyRegistry for KeyRegistry {
    fn current_key(&self, facilitator: &str) -> Option<VerifyingKey> {
        self.keys.get(facilitator).map(|entry| *entry.value())
    }
}

/// Checks a facilitator attestation over a canonical message.
///
/// Implementations must answer `false`, never panic or error, for unknown
/// facilitators and malformed signatures.
pub trait SignatureVerifier: Send + Sync {
    /// Returns `true` only if `signature` is `facilitator`'s valid signature
    /// over `message`.
    fn verify(&self, signature: &[u8], message: &[u8], facilitator: &str) -> bool;
}

/// Ed25519 [`SignatureVerifier`] backed by a key registry.
///
/// Uses strict verification, which rejects small-order keys and
/// non-canonical signatures.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier<R> {
    registry: R,
}

impl<R> Ed25519Verifier<R> {
    /// Creates a verifier over `registry`.
    pub const fn new(registry: R) -> Self {
        Self { registry }
    }

    /// Returns the key registry.
    pub const fn registry(&self) -> &R {
        &self.registry
    }
}

impl<R: FacilitatorKeyRegistry> SignatureVerifier for Ed25519Verifier<R> {
    fn verify(&self, signature: &[u8], message: &[u8], facilitator: &str) -> bool {
        let Some(key) = self.registry.current_key(facilitator) else {
            #[cfg(feature = "telemetry")]
            tracing::debug!(facilitator = %facilitator, "Unknown facilitator");
            return false;
        };
        if signature.len() != SIGNATURE_SIZE {
            return false;
        }
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_strict(message, &signature).is_ok()
    }
}
