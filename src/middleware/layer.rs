use std::sync::Arc;

use http::HeaderName;
use tower::Layer;

use super::service::GovernorService;
use crate::ratelimit::{Clock, Governor, SystemClock};

/// Header carrying the caller identity unless configured otherwise.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-project-id";

/// Applies admission governing to requests.
#[derive(Debug, Clone)]
pub struct GovernorLayer {
    governor: Arc<Governor>,
    identity_header: HeaderName,
    clock: Arc<dyn Clock>,
}

impl GovernorLayer {
    /// Create a GovernorLayer reading identities from `X-Project-ID`.
    pub fn new(governor: Arc<Governor>) -> Self {
        Self {
            governor,
            identity_header: HeaderName::from_static(DEFAULT_IDENTITY_HEADER),
            clock: Arc::new(SystemClock),
        }
    }

    /// Read the caller identity from a different header.
    pub fn with_identity_header(mut self, header: HeaderName) -> Self {
        self.identity_header = header;
        self
    }

    /// Use a different time source for window computation.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The governor shared by every service this layer produces.
    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }
}

impl<S> Layer<S> for GovernorLayer {
    type Service = GovernorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GovernorService::new(
            inner,
            Arc::clone(&self.governor),
            self.identity_header.clone(),
            Arc::clone(&self.clock),
        )
    }
}
