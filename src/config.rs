//! Configuration management for the governor service.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use http::HeaderName;
use tracing::info;

use crate::error::{GovernorError, Result};
use crate::ratelimit::{Governor, PolicyDocument};

/// Prefix for environment overrides, e.g. `GOVERNOR__SERVER__LISTEN_ADDR`.
const ENV_PREFIX: &str = "GOVERNOR";

/// Main configuration for the governor service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission configuration
    #[serde(default)]
    pub governor: GovernorConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Path to the policy document
    pub policy_path: Option<PathBuf>,

    /// Header carrying the caller identity
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            policy_path: None,
            identity_header: default_identity_header(),
        }
    }
}

fn default_identity_header() -> String {
    "X-Project-ID".to_string()
}

impl ServiceConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// Later sources override earlier ones.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading service configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        builder
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| GovernorError::Config(e.to_string()))
    }

    /// The identity header as an HTTP header name.
    pub fn identity_header(&self) -> Result<HeaderName> {
        HeaderName::from_bytes(self.governor.identity_header.as_bytes()).map_err(|e| {
            GovernorError::Config(format!(
                "invalid identity header '{}': {}",
                self.governor.identity_header, e
            ))
        })
    }

    /// Load the policy document and build a governor from it.
    pub fn load_governor(&self) -> Result<Governor> {
        let path = self.governor.policy_path.as_ref().ok_or_else(|| {
            GovernorError::Config("governor.policy_path is not set".to_string())
        })?;
        let doc = PolicyDocument::from_file(path)?;
        Governor::from_policy(&doc)
    }
}
