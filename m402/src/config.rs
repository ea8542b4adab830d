//! Engine configuration.
//!
//! [`EngineConfig`] describes protected resources, trusted facilitator keys
//! and the ledger backend. It deserializes from any serde format; the server
//! reads it from TOML.
//!
//! # Example Configuration
//!
//! ```toml
//! [ledger]
//! backend = "sled"
//! path = "./data/consumed"
//!
//! [[facilitators]]
//! id = "ogkpr-lyaaa"
//! public_key = "$FACILITATOR_PUBKEY"
//!
//! [[resources]]
//! resource_id = "premium-data-v1"
//! price = 1000
//! facilitator = "ogkpr-lyaaa"
//! token = { chain = "ICP", ledger_id = "mxzaz-hqmqe", symbol = "ckBTC" }
//! data = { report = "Q3 premium dataset" }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogError, DEFAULT_MIME_TYPE, ResourceCatalog, ResourceDescriptor};
use crate::gateway::{AccessGateway, ResourceData, StaticDataProvider};
use crate::ledger::{ConsumedPaymentLedger, LedgerError, MemoryLedger, SledLedger};
use crate::proto::{SCHEME_EXACT, TokenInfo};
use crate::signature::{
    Ed25519Verifier, FacilitatorKeyRegistry, KeyError, KeyRegistry, parse_verifying_key,
};
use crate::validator::PaymentValidator;

/// Errors raised while turning configuration into a running engine.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A resource could not be registered.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// A facilitator key is invalid.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// The ledger backend could not be opened.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// A resource asks for a scheme the engine does not implement.
    #[error("resource '{resource_id}' uses unsupported scheme '{scheme}'")]
    UnsupportedScheme {
        /// Offending resource.
        resource_id: String,
        /// Requested scheme.
        scheme: String,
    },
    /// The same facilitator is listed twice.
    #[error("facilitator '{0}' is configured more than once")]
    DuplicateFacilitator(String),
    /// A resource names a facilitator with no configured key.
    #[error("resource '{resource_id}' names facilitator '{facilitator}' which has no key")]
    MissingFacilitatorKey {
        /// Offending resource.
        resource_id: String,
        /// Facilitator without a key.
        facilitator: String,
    },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Protected resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Trusted facilitators and their verification keys.
    #[serde(default)]
    pub facilitators: Vec<FacilitatorKeyConfig>,
    /// Consumed-payment ledger backend.
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// One protected resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Unique key of the resource.
    pub resource_id: String,
    /// Price in the token's smallest unit.
    pub price: u64,
    /// Accepted token.
    pub token: TokenInfo,
    /// Trusted facilitator identity.
    pub facilitator: String,
    /// Recipient advertised in challenges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_to: Option<String>,
    /// Payment scheme; only `"exact"` is supported.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the payload.
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// Inline payload served on a grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

fn default_scheme() -> String {
    SCHEME_EXACT.to_owned()
}

fn default_mime_type() -> String {
    DEFAULT_MIME_TYPE.to_owned()
}

impl ResourceConfig {
    /// Converts into a catalog descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedScheme`] for any scheme but
    /// `"exact"`.
    pub fn to_descriptor(&self) -> Result<ResourceDescriptor, ConfigError> {
        if self.scheme != SCHEME_EXACT {
            return Err(ConfigError::UnsupportedScheme {
                resource_id: self.resource_id.clone(),
                scheme: self.scheme.clone(),
            });
        }
        let mut descriptor = ResourceDescriptor::new(
            self.resource_id.clone(),
            self.price,
            self.token.clone(),
            self.facilitator.clone(),
        );
        descriptor.pay_to.clone_from(&self.pay_to);
        if let Some(description) = &self.description {
            descriptor.description.clone_from(description);
        }
        descriptor.mime_type.clone_from(&self.mime_type);
        Ok(descriptor)
    }
}

/// A trusted facilitator key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitatorKeyConfig {
    /// Facilitator identity referenced by resources.
    pub id: String,
    /// Hex-encoded 32-byte Ed25519 verifying key.
    pub public_key: String,
}

/// Consumed-payment ledger backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum LedgerConfig {
    /// Process-local ledger; consumed payments are forgotten on restart.
    #[default]
    Memory,
    /// Durable sled database at `path`.
    Sled {
        /// Database directory.
        path: PathBuf,
    },
}

impl LedgerConfig {
    /// Opens the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the database cannot be opened.
    pub fn open(&self) -> Result<Arc<dyn ConsumedPaymentLedger>, LedgerError> {
        match self {
            Self::Memory => {
                #[cfg(feature = "telemetry")]
                tracing::warn!("Using in-memory payment ledger; consumed payments reset on restart");
                Ok(Arc::new(MemoryLedger::new()))
            }
            Self::Sled { path } => {
                #[cfg(feature = "telemetry")]
                tracing::info!(path = %path.display(), "Opening sled payment ledger");
                Ok(Arc::new(SledLedger::open(path)?))
            }
        }
    }
}

impl EngineConfig {
    /// Builds the resource catalog.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an invalid or duplicate resource.
    pub fn build_catalog(&self) -> Result<ResourceCatalog, ConfigError> {
        let mut catalog = ResourceCatalog::new();
        for resource in &self.resources {
            catalog.register(resource.to_descriptor()?)?;
        }
        Ok(catalog)
    }

    /// Builds the facilitator key registry and checks every resource has a
    /// key for its facilitator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an invalid, duplicate or missing key.
    pub fn build_key_registry(&self) -> Result<KeyRegistry, ConfigError> {
        let registry = KeyRegistry::new();
        for facilitator in &self.facilitators {
            let key = parse_verifying_key(&facilitator.id, &facilitator.public_key)?;
            if registry.rotate(facilitator.id.clone(), key).is_some() {
                return Err(ConfigError::DuplicateFacilitator(facilitator.id.clone()));
            }
        }
        if let Some(resource) = self
            .resources
            .iter()
            .find(|r| registry.current_key(&r.facilitator).is_none())
        {
            return Err(ConfigError::MissingFacilitatorKey {
                resource_id: resource.resource_id.clone(),
                facilitator: resource.facilitator.clone(),
            });
        }
        Ok(registry)
    }

    /// Builds a provider serving each resource's inline `data`.
    #[must_use]
    pub fn build_data_provider(&self) -> StaticDataProvider {
        let mut provider = StaticDataProvider::new();
        for resource in &self.resources {
            if let Some(content) = &resource.data {
                provider.insert(
                    resource.resource_id.clone(),
                    ResourceData {
                        mime_type: resource.mime_type.clone(),
                        content: content.clone(),
                    },
                );
            }
        }
        provider
    }

    /// Builds a complete gateway from this configuration.
    ///
    /// Returns the key registry alongside so keys can be rotated while
    /// serving.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any component fails to build.
    pub fn build_gateway(&self) -> Result<(AccessGateway, Arc<KeyRegistry>), ConfigError> {
        let catalog = Arc::new(self.build_catalog()?);
        let registry = Arc::new(self.build_key_registry()?);
        let ledger = self.ledger.open()?;
        let validator = PaymentValidator::new(
            catalog,
            ledger,
            Arc::new(Ed25519Verifier::new(Arc::clone(&registry))),
        );
        let gateway = AccessGateway::new(validator, Arc::new(self.build_data_provider()));
        Ok((gateway, registry))
    }
}
