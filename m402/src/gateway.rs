//! Access gateway: the single entry point callers go through.
//!
//! A request without a proof gets a challenge. A request with a proof is
//! validated, and on success the resource's data is fetched from a
//! [`ResourceDataProvider`]. A rejected proof is reported as such and never
//! downgraded to a fresh challenge.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::challenge::ChallengeGenerator;
use crate::ledger::LedgerError;
use crate::proto::{PaymentProof, PaymentRequired};
use crate::validator::{Grant, PaymentValidator, ValidationError};

/// Payload of a protected resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    /// MIME type of `content`.
    pub mime_type: String,
    /// The payload itself.
    pub content: serde_json::Value,
}

/// Errors from a [`ResourceDataProvider`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider has no data for the resource.
    #[error("no data for resource '{0}'")]
    NotFound(String),
    /// The provider could not be reached.
    #[error("resource data unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the payload of a resource once access has been granted.
#[async_trait::async_trait]
pub trait ResourceDataProvider: Send + Sync {
    /// Fetches the payload for `resource_id`.
    async fn fetch(&self, resource_id: &str) -> Result<ResourceData, ProviderError>;
}

/// Provider serving fixed payloads from memory.
#[derive(Debug, Clone, Default)]
pub struct StaticDataProvider {
    data: HashMap<String, ResourceData>,
}

impl StaticDataProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the payload for a resource.
    pub fn insert(&mut self, resource_id: impl Into<String>, data: ResourceData) {
        self.data.insert(resource_id.into(), data);
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, resource_id: impl Into<String>, data: ResourceData) -> Self {
        self.insert(resource_id, data);
        self
    }
}

#[async_trait::async_trait]
impl ResourceDataProvider for StaticDataProvider {
    async fn fetch(&self, resource_id: &str) -> Result<ResourceData, ProviderError> {
        self.data
            .get(resource_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(resource_id.to_owned()))
    }
}

/// What a caller gets back from [`AccessGateway::access`].
#[derive(Debug, Clone, PartialEq)]
pub enum AccessOutcome {
    /// The proof was accepted and consumed.
    Granted {
        /// Details of the consumed payment.
        grant: Grant,
        /// The resource payload.
        data: ResourceData,
    },
    /// No proof was offered; here are the terms.
    PaymentRequired(PaymentRequired),
    /// The request was refused for the given reason.
    Rejected(ValidationError),
}

/// Decision reached by [`AccessGateway::authorize`] before any data is fetched.
#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    /// The proof was accepted and consumed; the payload is still owed.
    Granted(Grant),
    /// No proof was offered; here are the terms.
    PaymentRequired(PaymentRequired),
    /// The request was refused for the given reason.
    Rejected(ValidationError),
}

/// Failures that prevented the gateway from reaching an outcome.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The consumed-payment ledger is unavailable; access is denied.
    #[error(transparent)]
    StorageUnavailable(LedgerError),
    /// The payment was consumed but the payload could not be fetched.
    #[error("payment '{}' consumed but data is unavailable: {source}", .grant.payment_id)]
    DataUnavailable {
        /// The grant that was issued.
        grant: Box<Grant>,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
}

/// Entry point composing challenge generation, validation and data fetch.
#[derive(Clone)]
pub struct AccessGateway {
    challenges: ChallengeGenerator,
    validator: PaymentValidator,
    provider: Arc<dyn ResourceDataProvider>,
}

impl std::fmt::Debug for AccessGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGateway")
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

impl AccessGateway {
    /// Creates a gateway; challenges are derived from the validator's catalog.
    pub fn new(validator: PaymentValidator, provider: Arc<dyn ResourceDataProvider>) -> Self {
        Self {
            challenges: ChallengeGenerator::new(Arc::clone(validator.catalog())),
            validator,
            provider,
        }
    }

    /// Returns the challenge generator.
    #[must_use]
    pub const fn challenges(&self) -> &ChallengeGenerator {
        &self.challenges
    }

    /// Returns the validator.
    #[must_use]
    pub const fn validator(&self) -> &PaymentValidator {
        &self.validator
    }

    /// Serves one access request.
    ///
    /// Without a proof, returns the resource's challenge, or
    /// [`ValidationError::UnknownResource`] if it does not exist. With a
    /// proof, returns either the granted payload or the rejection.
    ///
    /// This is [`authorize`](Self::authorize) followed by
    /// [`deliver`](Self::deliver). Callers on an async runtime backed by a
    /// durable ledger may prefer to run `authorize` on a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::StorageUnavailable`] when the ledger cannot be
    /// consulted and [`GatewayError::DataUnavailable`] when a payment was
    /// consumed but the provider failed.
    pub async fn access(
        &self,
        resource_id: &str,
        proof: Option<&PaymentProof>,
    ) -> Result<AccessOutcome, GatewayError> {
        match self.authorize(resource_id, proof)? {
            Authorization::Granted(grant) => self.deliver(resource_id, grant).await,
            Authorization::PaymentRequired(required) => {
                Ok(AccessOutcome::PaymentRequired(required))
            }
            Authorization::Rejected(rejection) => Ok(AccessOutcome::Rejected(rejection)),
        }
    }

    /// Decides a request without fetching any data.
    ///
    /// A granted proof has been consumed when this returns. With a
    /// [`SledLedger`](crate::ledger::SledLedger) this blocks on a disk flush.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::StorageUnavailable`] when the ledger cannot be
    /// consulted.
    pub fn authorize(
        &self,
        resource_id: &str,
        proof: Option<&PaymentProof>,
    ) -> Result<Authorization, GatewayError> {
        let Some(proof) = proof else {
            return Ok(match self.challenges.payment_required(resource_id) {
                Ok(required) => Authorization::PaymentRequired(required),
                Err(_) => {
                    Authorization::Rejected(ValidationError::UnknownResource(resource_id.to_owned()))
                }
            });
        };

        match self.validator.validate_and_consume(proof, resource_id) {
            Ok(grant) => Ok(Authorization::Granted(grant)),
            Err(ValidationError::StorageUnavailable(err)) => {
                Err(GatewayError::StorageUnavailable(err))
            }
            Err(rejection) => Ok(Authorization::Rejected(rejection)),
        }
    }

    /// Fetches the payload for an already consumed payment.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DataUnavailable`], carrying the grant, when
    /// the provider fails.
    pub async fn deliver(
        &self,
        resource_id: &str,
        grant: Grant,
    ) -> Result<AccessOutcome, GatewayError> {
        match self.provider.fetch(resource_id).await {
            Ok(data) => Ok(AccessOutcome::Granted { grant, data }),
            Err(source) => {
                #[cfg(feature = "telemetry")]
                tracing::error!(
                    payment_id = %grant.payment_id,
                    resource_id = %resource_id,
                    error = %source,
                    "Resource data unavailable after payment was consumed"
                );
                Err(GatewayError::DataUnavailable {
                    grant: Box::new(grant),
                    source,
                })
            }
        }
    }

    /// Number of payments consumed so far.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger cannot be read.
    pub fn consumed_payment_count(&self) -> Result<u64, LedgerError> {
        self.validator.consumed_payment_count()
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    use super::*;
    use crate::catalog::{ResourceCatalog, ResourceDescriptor};
    use crate::encoding::Base64Bytes;
    use crate::ledger::{ConsumedPaymentLedger, MemoryLedger};
    use crate::proto::{ErrorReason, TokenInfo};
    use crate::signature::{Ed25519Verifier, KeyRegistry, SignatureVerifier, attest};
    use crate::timestamp::{Clock, FixedClock, UnixTimestamp};

    const NOW: u64 = 1_700_000_000;

    fn gateway(provider: StaticDataProvider) -> (AccessGateway, SigningKey) {
        let mut catalog = ResourceCatalog::new();
        catalog
            .register(ResourceDescriptor::new(
                "premium-data-v1",
                1000,
                TokenInfo {
                    chain: "ICP".into(),
                    ledger_id: "mxzaz-hqmqe".into(),
                    symbol: "ckBTC".into(),
                },
                "ogkpr-lyaaa",
            ))
            .unwrap();
        let key = SigningKey::from_bytes(&[3; 32]);
        let registry = KeyRegistry::new();
        registry.rotate("ogkpr-lyaaa", key.verifying_key());

        let ledger: Arc<dyn ConsumedPaymentLedger> = Arc::new(MemoryLedger::new());
        let verifier: Arc<dyn SignatureVerifier> = Arc::new(Ed25519Verifier::new(registry));
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(UnixTimestamp::from_secs(NOW)));
        let validator = PaymentValidator::new(Arc::new(catalog), ledger, verifier).with_clock(clock);
        (AccessGateway::new(validator, Arc::new(provider)), key)
    }

    fn provider() -> StaticDataProvider {
        StaticDataProvider::new().with(
            "premium-data-v1",
            ResourceData {
                mime_type: "application/json".into(),
                content: json!({ "secret": 42 }),
            },
        )
    }

    fn proof(key: &SigningKey) -> PaymentProof {
        let mut proof = PaymentProof {
            payment_id: "p1".into(),
            nonce: 0,
            payer: "ic3ca-7ynev".into(),
            amount: 1000,
            token_ledger: "mxzaz-hqmqe".into(),
            facilitator_signature: Base64Bytes::default(),
            expiry: UnixTimestamp::from_secs(NOW + 300),
            resource_id: "premium-data-v1".into(),
        };
        proof.facilitator_signature = attest(key, &proof);
        proof
    }

    #[tokio::test]
    async fn test_no_proof_returns_challenge() {
        let (gateway, _) = gateway(provider());
        let outcome = gateway.access("premium-data-v1", None).await.unwrap();
        let AccessOutcome::PaymentRequired(required) = outcome else {
            panic!("expected a challenge, got {outcome:?}");
        };
        assert_eq!(required.x402.amount, 1000);
        assert_eq!(gateway.consumed_payment_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_proof_unknown_resource() {
        let (gateway, _) = gateway(provider());
        let outcome = gateway.access("missing", None).await.unwrap();
        assert!(matches!(
            outcome,
            AccessOutcome::Rejected(ValidationError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_valid_proof_returns_data_then_replay() {
        let (gateway, key) = gateway(provider());
        let proof = proof(&key);

        let outcome = gateway.access("premium-data-v1", Some(&proof)).await.unwrap();
        let AccessOutcome::Granted { grant, data } = outcome else {
            panic!("expected a grant, got {outcome:?}");
        };
        assert_eq!(grant.payment_id, "p1");
        assert_eq!(data.content["secret"], 42);
        assert_eq!(gateway.consumed_payment_count().unwrap(), 1);

        let outcome = gateway.access("premium-data-v1", Some(&proof)).await.unwrap();
        let AccessOutcome::Rejected(err) = outcome else {
            panic!("expected a rejection, got {outcome:?}");
        };
        assert_eq!(err.reason(), ErrorReason::Replayed);
        assert_eq!(gateway.consumed_payment_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_proof_is_not_a_challenge() {
        let (gateway, key) = gateway(provider());
        let mut proof = proof(&key);
        proof.facilitator_signature.0[0] ^= 0xff;
        let outcome = gateway.access("premium-data-v1", Some(&proof)).await.unwrap();
        assert!(matches!(
            outcome,
            AccessOutcome::Rejected(ValidationError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn test_authorize_consumes_before_delivery() {
        let (gateway, key) = gateway(provider());
        let proof = proof(&key);

        let Authorization::Granted(grant) =
            gateway.authorize("premium-data-v1", Some(&proof)).unwrap()
        else {
            panic!("expected a grant");
        };
        assert_eq!(gateway.consumed_payment_count().unwrap(), 1);
        assert!(matches!(
            gateway.authorize("premium-data-v1", Some(&proof)).unwrap(),
            Authorization::Rejected(ValidationError::Replayed(_))
        ));

        let outcome = gateway.deliver("premium-data-v1", grant).await.unwrap();
        assert!(matches!(outcome, AccessOutcome::Granted { .. }));
    }

    #[tokio::test]
    async fn test_missing_data_after_grant() {
        let (gateway, key) = gateway(StaticDataProvider::new());
        let err = gateway
            .access("premium-data-v1", Some(&proof(&key)))
            .await
            .unwrap_err();
        let GatewayError::DataUnavailable { grant, source } = err else {
            panic!("expected data unavailable, got {err:?}");
        };
        assert_eq!(grant.payment_id, "p1");
        assert_eq!(source, ProviderError::NotFound("premium-data-v1".into()));
    }
}
