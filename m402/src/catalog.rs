//! Resource catalog: which resources are protected and what they cost.
//!
//! The catalog is filled at configuration time and then shared read-only
//! (typically behind an `Arc`) with the challenge generator and validator.
//! Registration needs `&mut self`, so no request path can change the terms of
//! a challenge that is already outstanding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::proto::TokenInfo;

/// Default MIME type of a protected resource's payload.
pub const DEFAULT_MIME_TYPE: &str = "application/json";

/// A protected resource and its fixed payment terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Unique key of the resource.
    pub resource_id: String,
    /// Price in the token's smallest unit.
    pub price: u64,
    /// Accepted token.
    pub token: TokenInfo,
    /// Identity of the trusted facilitator.
    pub facilitator: String,
    /// Recipient advertised in challenges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_to: Option<String>,
    /// Free-form description shown to callers.
    #[serde(default)]
    pub description: String,
    /// MIME type of the payload.
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
}

fn default_mime_type() -> String {
    DEFAULT_MIME_TYPE.to_owned()
}

impl ResourceDescriptor {
    /// Creates a descriptor with no recipient and an empty description.
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        price: u64,
        token: TokenInfo,
        facilitator: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            price,
            token,
            facilitator: facilitator.into(),
            pay_to: None,
            description: String::new(),
            mime_type: default_mime_type(),
        }
    }

    /// Sets the advertised recipient.
    #[must_use]
    pub fn with_pay_to(mut self, pay_to: impl Into<String>) -> Self {
        self.pay_to = Some(pay_to.into());
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Identity of the accepted token ledger.
    #[must_use]
    pub fn token_ledger(&self) -> &str {
        &self.token.ledger_id
    }
}

/// Errors from catalog registration and lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// A resource with this identifier is already registered.
    #[error("resource '{0}' is already registered")]
    AlreadyRegistered(String),
    /// No resource with this identifier exists.
    #[error("resource '{0}' not found")]
    NotFound(String),
    /// The descriptor cannot be registered as given.
    #[error("invalid resource descriptor: {0}")]
    Invalid(String),
}

/// Static mapping from resource identifier to [`ResourceDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    resources: BTreeMap<String, ResourceDescriptor>,
}

impl ResourceCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource.
    ///
    /// Re-registering an existing identifier is refused rather than
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::AlreadyRegistered`] for a duplicate identifier
    /// and [`CatalogError::Invalid`] for an empty identifier, ledger or
    /// facilitator, or a zero price.
    pub fn register(&mut self, descriptor: ResourceDescriptor) -> Result<(), CatalogError> {
        if descriptor.resource_id.is_empty() {
            return Err(CatalogError::Invalid("resource_id is empty".into()));
        }
        if descriptor.price == 0 {
            return Err(CatalogError::Invalid(format!(
                "resource '{}' has a zero price",
                descriptor.resource_id
            )));
        }
        if descriptor.token.ledger_id.is_empty() || descriptor.facilitator.is_empty() {
            return Err(CatalogError::Invalid(format!(
                "resource '{}' needs a token ledger and a facilitator",
                descriptor.resource_id
            )));
        }
        if self.resources.contains_key(&descriptor.resource_id) {
            return Err(CatalogError::AlreadyRegistered(descriptor.resource_id));
        }

        #[cfg(feature = "telemetry")]
        tracing::info!(
            resource_id = %descriptor.resource_id,
            price = descriptor.price,
            facilitator = %descriptor.facilitator,
            "Registered protected resource"
        );

        self.resources
            .insert(descriptor.resource_id.clone(), descriptor);
        Ok(())
    }

    /// Looks up a resource by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::NotFound`] if the resource is not registered.
    pub fn lookup(&self, resource_id: &str) -> Result<&ResourceDescriptor, CatalogError> {
        self.resources
            .get(resource_id)
            .ok_or_else(|| CatalogError::NotFound(resource_id.to_owned()))
    }

    /// Iterates over all resources in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.values()
    }

    /// Number of registered resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns `true` if no resource is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
