//! Server configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4402
//!
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
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `config.toml`)
//! - `HOST` - Override server bind address
//! - `PORT` - Override server port
//! - Facilitator keys referenced by `$VAR` in the config file

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use m402::config::EngineConfig;
use serde::{Deserialize, Serialize};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Errors while loading the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Configuration path.
        path: String,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid configuration TOML.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `4402`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Resources, facilitator keys and ledger backend.
    #[serde(flatten)]
    pub engine: EngineConfig,
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    4402
}

impl ServerConfig {
    /// Loads configuration from a file path.
    ///
    /// A missing file yields the defaults: no resources and an in-memory
    /// ledger. `$VAR` / `${VAR}` references are expanded from the process
    /// environment before parsing.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| LoadError::Read {
                path: path.display().to_string(),
                source,
            })?
        } else {
            String::new()
        };
        Self::from_toml(&content)
    }

    /// Parses configuration from TOML text after expanding `$VAR` references.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Parse`] if the text is not valid configuration.
    pub fn from_toml(content: &str) -> Result<Self, LoadError> {
        Ok(toml::from_str(&expand_env_vars(content))?)
    }
}

/// Expands `$VAR` and `${VAR}` patterns from environment variables.
///
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        let braced = chars.next_if_eq(&'{').is_some();
        let mut name = String::new();
        let mut closed = false;
        while let Some(&c) = chars.peek() {
            if braced && c == '}' {
                chars.next();
                closed = true;
                break;
            }
            if !braced && !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match lookup(&name).filter(|_| !name.is_empty()) {
            Some(value) => result.push_str(&value),
            None => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if closed {
                    result.push('}');
                }
            }
        }
    }

    result
}
