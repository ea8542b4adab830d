//! Builds the payment challenge returned when a caller offers no proof.

use std::sync::Arc;

use crate::catalog::{CatalogError, ResourceCatalog, ResourceDescriptor};
use crate::proto::{PaymentChallenge, PaymentRequired, SCHEME_EXACT};

impl From<&ResourceDescriptor> for PaymentChallenge {
    fn from(descriptor: &ResourceDescriptor) -> Self {
        Self {
            resource_id: descriptor.resource_id.clone(),
            amount: descriptor.price,
            token: descriptor.token.clone(),
            facilitator: descriptor.facilitator.clone(),
            scheme: SCHEME_EXACT.to_owned(),
            pay_to: descriptor.pay_to.clone(),
        }
    }
}

/// Derives [`PaymentChallenge`]s from the catalog.
///
/// Pure and idempotent: calling it never changes any state.
#[derive(Debug, Clone)]
pub struct ChallengeGenerator {
    catalog: Arc<ResourceCatalog>,
}

impl ChallengeGenerator {
    /// Creates a generator over a shared catalog.
    #[must_use]
    pub const fn new(catalog: Arc<ResourceCatalog>) -> Self {
        Self { catalog }
    }

    /// Returns the challenge for a resource.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] if the resource is not registered.
    pub fn challenge_for(&self, resource_id: &str) -> Result<PaymentChallenge, CatalogError> {
        self.catalog.lookup(resource_id).map(PaymentChallenge::from)
    }

    /// Returns the challenge wrapped in the 402 envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] if the resource is not registered.
    pub fn payment_required(&self, resource_id: &str) -> Result<PaymentRequired, CatalogError> {
        self.challenge_for(resource_id).map(PaymentRequired::from)
    }

    /// Returns a challenge for every registered resource.
    #[must_use]
    pub fn all(&self) -> Vec<PaymentChallenge> {
        self.catalog.iter().map(PaymentChallenge::from).collect()
    }
}
