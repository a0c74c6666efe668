//! Error types for the admission governor.

use std::time::Duration;

use thiserror::Error;

/// Main error type for governor setup and serving.
///
/// Every variant is fatal at startup: a process must not serve traffic
/// with a policy that failed to load.
#[derive(Error, Debug)]
pub enum GovernorError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule in the policy document violates an invariant
    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule {
        /// Name of the offending rule
        rule: String,
        /// What is wrong with it
        reason: String,
    },

    /// A rule's route pattern did not compile
    #[error("Invalid route pattern for rule '{rule}': {source}")]
    InvalidRoute {
        /// Name of the offending rule
        rule: String,
        /// Underlying regex error
        #[source]
        source: regex::Error,
    },

    /// JSON policy document errors
    #[error("Failed to parse JSON policy: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML policy document errors
    #[error("Failed to parse YAML policy: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for governor operations.
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Control signal raised when a caller exceeded a rule's hard limit during
/// the previous window.
///
/// Carried inside [`Verdict::Reject`](crate::ratelimit::Verdict::Reject) so
/// the adapter can log the context before answering 429.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "Hard limit exceeded for '{identity}' on rule '{rule}': \
     {observed} requests in the previous window (limit {limit})"
)]
pub struct HardLimitExceeded {
    /// Name of the rule that rejected the request
    pub rule: String,
    /// Identity the request was counted against
    pub identity: String,
    /// Request count observed in the previous window
    pub observed: u64,
    /// The rule's hard limit
    pub limit: u64,
    /// Time left until the current window closes
    pub retry_after: Duration,
}

/// The request did not carry the identity header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Request headers did not include {header}")]
pub struct MissingIdentity {
    /// Name of the header that was expected
    pub header: String,
}
