//! The payment proof validator.
//!
//! [`PaymentValidator::validate_and_consume`] runs a fixed sequence of checks
//! and stops at the first failure:
//!
//! 1. structure ([`ValidationError::Malformed`])
//! 2. resource binding ([`ValidationError::ResourceMismatch`])
//! 3. catalog lookup ([`ValidationError::UnknownResource`])
//! 4. amount binding ([`ValidationError::AmountMismatch`])
//! 5. token ledger binding ([`ValidationError::LedgerMismatch`])
//! 6. freshness, `now < expiry` ([`ValidationError::Expired`])
//! 7. facilitator signature ([`ValidationError::InvalidSignature`])
//! 8. atomic consume ([`ValidationError::Replayed`])
//!
//! Only step 8 writes, and only after steps 1-7 passed. A proof that fails
//! any earlier check leaves the ledger untouched.

use std::sync::Arc;

use crate::catalog::ResourceCatalog;
use crate::ledger::{ConsumeOutcome, ConsumedPaymentLedger, ConsumedPaymentRecord, LedgerError};
use crate::proto::{AccessReceipt, AsPaymentProblem, ErrorReason, PaymentProblem, PaymentProof};
use crate::signature::{SignatureVerifier, SignedFields};
use crate::timestamp::{Clock, SystemClock, UnixTimestamp};

/// Maximum length of a payment identifier in bytes.
pub const MAX_PAYMENT_ID_LEN: usize = 128;

/// Why a proof did not unlock a resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A field is missing or has an invalid shape.
    #[error("malformed payment proof: {0}")]
    Malformed(String),
    /// The proof is bound to another resource.
    #[error("proof is for resource '{proof}', not '{requested}'")]
    ResourceMismatch {
        /// Resource named in the proof.
        proof: String,
        /// Resource the caller asked for.
        requested: String,
    },
    /// The requested resource is not in the catalog.
    #[error("resource '{0}' not found")]
    UnknownResource(String),
    /// The amount paid differs from the price.
    #[error("amount {actual} does not match price {expected}")]
    AmountMismatch {
        /// Catalog price.
        expected: u64,
        /// Amount in the proof.
        actual: u64,
    },
    /// The payment was made on another token ledger.
    #[error("payment made on ledger '{actual}', expected '{expected}'")]
    LedgerMismatch {
        /// Catalog token ledger.
        expected: String,
        /// Ledger in the proof.
        actual: String,
    },
    /// The proof is no longer fresh.
    #[error("proof expired at {expiry}, now {now}")]
    Expired {
        /// Expiry in the proof.
        expiry: UnixTimestamp,
        /// Time of validation.
        now: UnixTimestamp,
    },
    /// The facilitator signature did not verify.
    #[error("facilitator signature is invalid")]
    InvalidSignature,
    /// The payment identifier was already consumed.
    #[error("payment '{0}' was already consumed")]
    Replayed(String),
    /// The consumed-payment ledger could not be consulted; access is denied.
    #[error(transparent)]
    StorageUnavailable(#[from] LedgerError),
}

impl ValidationError {
    /// Returns the machine-readable reason code.
    #[must_use]
    pub const fn reason(&self) -> ErrorReason {
        match self {
            Self::Malformed(_) => ErrorReason::Malformed,
            Self::ResourceMismatch { .. } => ErrorReason::ResourceMismatch,
            Self::UnknownResource(_) => ErrorReason::UnknownResource,
            Self::AmountMismatch { .. } => ErrorReason::AmountMismatch,
            Self::LedgerMismatch { .. } => ErrorReason::LedgerMismatch,
            Self::Expired { .. } => ErrorReason::Expired,
            Self::InvalidSignature => ErrorReason::InvalidSignature,
            Self::Replayed(_) => ErrorReason::Replayed,
            Self::StorageUnavailable(_) => ErrorReason::StorageUnavailable,
        }
    }

    /// Returns `true` if the proof itself was judged and refused, as opposed
    /// to the engine failing to reach a decision.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        !matches!(self, Self::StorageUnavailable(_))
    }
}

impl AsPaymentProblem for ValidationError {
    fn as_payment_problem(&self) -> PaymentProblem {
        let details = match self {
            // Backend messages stay in the logs.
            Self::StorageUnavailable(_) => "payment ledger unavailable".to_owned(),
            other => other.to_string(),
        };
        PaymentProblem::new(self.reason(), details)
    }
}

/// A successful validation: the payment is now consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// The consumed payment identifier.
    pub payment_id: String,
    /// The payer recorded as consumer.
    pub payer: String,
    /// The unlocked resource.
    pub resource_id: String,
    /// Amount paid.
    pub amount: u64,
    /// Time of consumption.
    pub consumed_at: UnixTimestamp,
}

impl From<&Grant> for AccessReceipt {
    fn from(grant: &Grant) -> Self {
        Self {
            success: true,
            payment_id: grant.payment_id.clone(),
            payer: grant.payer.clone(),
            resource_id: grant.resource_id.clone(),
            amount: grant.amount,
            consumed_at: grant.consumed_at,
        }
    }
}

/// Checks payment proofs against the catalog and consumes them.
///
/// Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct PaymentValidator {
    catalog: Arc<ResourceCatalog>,
    ledger: Arc<dyn ConsumedPaymentLedger>,
    verifier: Arc<dyn SignatureVerifier>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PaymentValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentValidator")
            .field("resources", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl PaymentValidator {
    /// Creates a validator reading the system clock.
    pub fn new(
        catalog: Arc<ResourceCatalog>,
        ledger: Arc<dyn ConsumedPaymentLedger>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            verifier,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for freshness and consumption times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<ResourceCatalog> {
        &self.catalog
    }

    /// Validates `proof` for `requested_resource_id` and consumes it.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`ValidationError`]. A
    /// [`ValidationError::StorageUnavailable`] means no decision was reached
    /// and access must be denied.
    pub fn validate_and_consume(
        &self,
        proof: &PaymentProof,
        requested_resource_id: &str,
    ) -> Result<Grant, ValidationError> {
        let result = self.check_and_consume(proof, requested_resource_id);

        #[cfg(feature = "telemetry")]
        match &result {
            Ok(grant) => tracing::info!(
                payment_id = %grant.payment_id,
                payer = %grant.payer,
                resource_id = %grant.resource_id,
                amount = grant.amount,
                nonce = proof.nonce,
                "Payment accepted"
            ),
            Err(err @ ValidationError::StorageUnavailable(_)) => tracing::error!(
                payment_id = %proof.payment_id,
                resource_id = %requested_resource_id,
                error = %err,
                "Payment ledger unavailable, denying access"
            ),
            Err(err) => tracing::debug!(
                payment_id = %proof.payment_id,
                resource_id = %requested_resource_id,
                reason = %err.reason(),
                error = %err,
                "Payment rejected"
            ),
        }

        result
    }

    fn check_and_consume(
        &self,
        proof: &PaymentProof,
        requested_resource_id: &str,
    ) -> Result<Grant, ValidationError> {
        check_structure(proof)?;

        if proof.resource_id != requested_resource_id {
            return Err(ValidationError::ResourceMismatch {
                proof: proof.resource_id.clone(),
                requested: requested_resource_id.to_owned(),
            });
        }

        let descriptor = self
            .catalog
            .lookup(requested_resource_id)
            .map_err(|_| ValidationError::UnknownResource(requested_resource_id.to_owned()))?;

        if proof.amount != descriptor.price {
            return Err(ValidationError::AmountMismatch {
                expected: descriptor.price,
                actual: proof.amount,
            });
        }

        if proof.token_ledger != descriptor.token_ledger() {
            return Err(ValidationError::LedgerMismatch {
                expected: descriptor.token_ledger().to_owned(),
                actual: proof.token_ledger.clone(),
            });
        }

        let now = self.clock.now();
        if now >= proof.expiry {
            return Err(ValidationError::Expired {
                expiry: proof.expiry,
                now,
            });
        }

        let message = SignedFields::from(proof).encode();
        if !self.verifier.verify(
            proof.facilitator_signature.as_slice(),
            &message,
            &descriptor.facilitator,
        ) {
            return Err(ValidationError::InvalidSignature);
        }

        let record = ConsumedPaymentRecord {
            payment_id: proof.payment_id.clone(),
            consumer: proof.payer.clone(),
            consumed_at: now,
        };
        match self.ledger.try_consume(record)? {
            ConsumeOutcome::Consumed => Ok(Grant {
                payment_id: proof.payment_id.clone(),
                payer: proof.payer.clone(),
                resource_id: descriptor.resource_id.clone(),
                amount: proof.amount,
                consumed_at: now,
            }),
            ConsumeOutcome::AlreadyConsumed => {
                Err(ValidationError::Replayed(proof.payment_id.clone()))
            }
        }
    }

    /// Number of payments consumed so far.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger cannot be read.
    pub fn consumed_payment_count(&self) -> Result<u64, LedgerError> {
        self.ledger.count()
    }
}

fn check_structure(proof: &PaymentProof) -> Result<(), ValidationError> {
    let malformed = |msg: &str| Err(ValidationError::Malformed(msg.to_owned()));

    if proof.payment_id.is_empty() {
        return malformed("payment_id is empty");
    }
    if proof.payment_id.len() > MAX_PAYMENT_ID_LEN {
        return Err(ValidationError::Malformed(format!(
            "payment_id exceeds {MAX_PAYMENT_ID_LEN} bytes"
        )));
    }
    if proof.payment_id.chars().any(char::is_control) {
        return malformed("payment_id contains control characters");
    }
    if proof.payer.is_empty() {
        return malformed("payer is empty");
    }
    if proof.token_ledger.is_empty() {
        return malformed("token_ledger is empty");
    }
    if proof.resource_id.is_empty() {
        return malformed("resource_id is empty");
    }
    if proof.amount == 0 {
        return malformed("amount is zero");
    }
    if proof.expiry.as_secs() == 0 {
        return malformed("expiry is unset");
    }
    if proof.facilitator_signature.is_empty() {
        return malformed("facilitator_signature is empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::catalog::ResourceDescriptor;
    use crate::encoding::Base64Bytes;
    use crate::ledger::MemoryLedger;
    use crate::proto::TokenInfo;
    use crate::signature::{Ed25519Verifier, KeyRegistry, attest};
    use crate::timestamp::FixedClock;

    const NOW: u64 = 1_700_000_000;
    const RESOURCE: &str = "premium-data-v1";
    const LEDGER: &str = "mxzaz-hqmqe";
    const FACILITATOR: &str = "ogkpr-lyaaa";
    /// Same price, ledger and facilitator as `RESOURCE`.
    const SIBLING: &str = "premium-data-v2";

    struct Harness {
        validator: PaymentValidator,
        ledger: Arc<MemoryLedger>,
        clock: Arc<FixedClock>,
        key: SigningKey,
    }

    fn harness() -> Harness {
        let mut catalog = ResourceCatalog::new();
        catalog
            .register(ResourceDescriptor::new(
                RESOURCE,
                1000,
                TokenInfo {
                    chain: "ICP".into(),
                    ledger_id: LEDGER.into(),
                    symbol: "ckBTC".into(),
                },
                FACILITATOR,
            ))
            .unwrap();
        catalog
            .register(ResourceDescriptor::new(
                "basic-data-v1",
                10,
                TokenInfo {
                    chain: "ICP".into(),
                    ledger_id: LEDGER.into(),
                    symbol: "ckBTC".into(),
                },
                FACILITATOR,
            ))
            .unwrap();

        catalog
            .register(ResourceDescriptor::new(
                SIBLING,
                1000,
                TokenInfo {
                    chain: "ICP".into(),
                    ledger_id: LEDGER.into(),
                    symbol: "ckBTC".into(),
                },
                FACILITATOR,
            ))
            .unwrap();

        let key = SigningKey::from_bytes(&[7; 32]);
        let registry = KeyRegistry::new();
        registry.rotate(FACILITATOR, key.verifying_key());

        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(FixedClock::new(UnixTimestamp::from_secs(NOW)));
        let validator = PaymentValidator::new(
            Arc::new(catalog),
            Arc::clone(&ledger) as Arc<dyn ConsumedPaymentLedger>,
            Arc::new(Ed25519Verifier::new(registry)),
        )
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);

        Harness {
            validator,
            ledger,
            clock,
            key,
        }
    }

    impl Harness {
        fn proof(&self, payment_id: &str) -> PaymentProof {
            let mut proof = PaymentProof {
                payment_id: payment_id.into(),
                nonce: 1,
                payer: "ic3ca-7ynev".into(),
                amount: 1000,
                token_ledger: LEDGER.into(),
                facilitator_signature: Base64Bytes::default(),
                expiry: UnixTimestamp::from_secs(NOW + 300),
                resource_id: RESOURCE.into(),
            };
            self.sign(&mut proof);
            proof
        }

        fn sign(&self, proof: &mut PaymentProof) {
            proof.facilitator_signature = attest(&self.key, proof);
        }

        fn count(&self) -> u64 {
            self.validator.consumed_payment_count().unwrap()
        }

        fn reject(&self, proof: &PaymentProof, resource: &str) -> ErrorReason {
            let before = self.count();
            let err = self
                .validator
                .validate_and_consume(proof, resource)
                .unwrap_err();
            assert_eq!(self.count(), before, "rejection wrote to the ledger");
            err.reason()
        }
    }

    #[test]
    fn test_valid_proof_is_granted_once() {
        let h = harness();
        let proof = h.proof("p1");

        let grant = h.validator.validate_and_consume(&proof, RESOURCE).unwrap();
        assert_eq!(grant.payment_id, "p1");
        assert_eq!(grant.resource_id, RESOURCE);
        assert_eq!(grant.consumed_at.as_secs(), NOW);
        assert_eq!(h.count(), 1);
        assert_eq!(
            h.ledger.get("p1").unwrap().map(|r| r.consumer),
            Some("ic3ca-7ynev".to_owned())
        );

        assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::Replayed);
    }

    #[test]
    fn test_malformed_proofs() {
        let h = harness();
        let cases: [fn(&mut PaymentProof); 7] = [
            |p| p.payment_id.clear(),
            |p| p.payment_id = "x".repeat(MAX_PAYMENT_ID_LEN + 1),
            |p| p.payment_id = "p\n1".into(),
            |p| p.payer.clear(),
            |p| p.amount = 0,
            |p| p.expiry = UnixTimestamp::from_secs(0),
            |p| p.facilitator_signature = Base64Bytes::default(),
        ];
        for mutate in cases {
            let mut proof = h.proof("p1");
            mutate(&mut proof);
            assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::Malformed);
        }
    }

    #[test]
    fn test_resource_binding() {
        let h = harness();
        let proof = h.proof("p1");
        assert_eq!(h.reject(&proof, "basic-data-v1"), ErrorReason::ResourceMismatch);
    }

    #[test]
    fn test_unknown_resource() {
        let h = harness();
        let mut proof = h.proof("p1");
        proof.resource_id = "missing".into();
        h.sign(&mut proof);
        assert_eq!(h.reject(&proof, "missing"), ErrorReason::UnknownResource);
    }

    #[test]
    fn test_amount_binding_even_with_valid_signature() {
        let h = harness();
        let mut proof = h.proof("p1");
        proof.amount = 999;
        h.sign(&mut proof);
        assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::AmountMismatch);
    }

    #[test]
    fn test_ledger_binding() {
        let h = harness();
        let mut proof = h.proof("p1");
        proof.token_ledger = "other-ledger".into();
        h.sign(&mut proof);
        assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::LedgerMismatch);
    }

    #[test]
    fn test_expiry_boundary() {
        let h = harness();

        let mut at_now = h.proof("p-now");
        at_now.expiry = UnixTimestamp::from_secs(NOW);
        h.sign(&mut at_now);
        assert_eq!(h.reject(&at_now, RESOURCE), ErrorReason::Expired);

        let mut next_second = h.proof("p-next");
        next_second.expiry = UnixTimestamp::from_secs(NOW + 1);
        h.sign(&mut next_second);
        assert!(h.validator.validate_and_consume(&next_second, RESOURCE).is_ok());
    }

    #[test]
    fn test_proof_expires_as_clock_advances() {
        let h = harness();
        let proof = h.proof("p1");
        h.clock.advance(300);
        assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::Expired);
    }

    #[test]
    fn test_tampered_fields_fail_signature() {
        let h = harness();
        let cases: [fn(&mut PaymentProof); 3] = [
            |p| p.payment_id = "p2".into(),
            |p| p.payer = "someone-else".into(),
            |p| p.expiry = p.expiry + 60,
        ];
        for mutate in cases {
            let mut proof = h.proof("p1");
            mutate(&mut proof);
            assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::InvalidSignature);
        }
    }

    #[test]
    fn test_resource_swap_between_identical_terms_fails_signature() {
        let h = harness();
        let mut proof = h.proof("p1");
        // Every catalog check passes for the sibling; only the signature binds the resource.
        proof.resource_id = SIBLING.into();
        assert_eq!(h.reject(&proof, SIBLING), ErrorReason::InvalidSignature);

        h.sign(&mut proof);
        let grant = h.validator.validate_and_consume(&proof, SIBLING).unwrap();
        assert_eq!(grant.resource_id, SIBLING);
    }

    #[test]
    fn test_flipped_signature_byte_fails() {
        let h = harness();
        let mut proof = h.proof("p1");
        proof.facilitator_signature.0[10] ^= 0x80;
        assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::InvalidSignature);
    }

    #[test]
    fn test_invalid_proof_does_not_burn_payment_id() {
        let h = harness();
        let mut forged = h.proof("p1");
        forged.facilitator_signature.0[0] ^= 0x01;
        assert_eq!(h.reject(&forged, RESOURCE), ErrorReason::InvalidSignature);

        assert!(h.validator.validate_and_consume(&h.proof("p1"), RESOURCE).is_ok());
    }

    #[test]
    fn test_first_failing_check_wins() {
        let h = harness();
        let mut proof = h.proof("p1");
        proof.amount = 999;
        proof.expiry = UnixTimestamp::from_secs(NOW - 100);
        assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::AmountMismatch);
    }

    #[test]
    fn test_nonce_does_not_affect_replay() {
        let h = harness();
        let mut proof = h.proof("p1");
        h.validator.validate_and_consume(&proof, RESOURCE).unwrap();
        proof.nonce += 1;
        assert_eq!(h.reject(&proof, RESOURCE), ErrorReason::Replayed);
    }

    struct UnavailableLedger;

    impl ConsumedPaymentLedger for UnavailableLedger {
        fn is_consumed(&self, _: &str) -> Result<bool, LedgerError> {
            Err(LedgerError::Unavailable("disk gone".into()))
        }

        fn try_consume(&self, _: ConsumedPaymentRecord) -> Result<ConsumeOutcome, LedgerError> {
            Err(LedgerError::Unavailable("disk gone".into()))
        }

        fn get(&self, _: &str) -> Result<Option<ConsumedPaymentRecord>, LedgerError> {
            Err(LedgerError::Unavailable("disk gone".into()))
        }

        fn count(&self) -> Result<u64, LedgerError> {
            Err(LedgerError::Unavailable("disk gone".into()))
        }
    }

    #[test]
    fn test_storage_failure_denies() {
        let h = harness();
        let validator = PaymentValidator {
            ledger: Arc::new(UnavailableLedger),
            ..h.validator.clone()
        };
        let err = validator
            .validate_and_consume(&h.proof("p1"), RESOURCE)
            .unwrap_err();
        assert_eq!(err.reason(), ErrorReason::StorageUnavailable);
        assert!(!err.is_rejection());
        assert_eq!(
            err.as_payment_problem().details(),
            "payment ledger unavailable"
        );
    }
}
