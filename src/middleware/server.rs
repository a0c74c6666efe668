//! HTTP server running a stub handler behind the governor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use http::HeaderName;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::layer::{GovernorLayer, DEFAULT_IDENTITY_HEADER};
use crate::error::{GovernorError, Result};
use crate::ratelimit::{Clock, Governor, SystemClock};

/// HTTP server fronted by the admission governor.
///
/// Every request that gets through is answered with `204 No Content`,
/// which makes the server useful for exercising a policy under load.
pub struct GovernorServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The governor instance
    governor: Arc<Governor>,
    /// Header carrying the caller identity
    identity_header: HeaderName,
}

impl GovernorServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, governor: Arc<Governor>) -> Self {
        Self {
            addr,
            governor,
            identity_header: HeaderName::from_static(DEFAULT_IDENTITY_HEADER),
        }
    }

    /// Read the caller identity from a different header.
    pub fn with_identity_header(mut self, header: HeaderName) -> Self {
        self.identity_header = header;
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let layer = GovernorLayer::new(Arc::clone(&self.governor))
            .with_identity_header(self.identity_header.clone());

        Router::new()
            .fallback(|| async { StatusCode::NO_CONTENT })
            .layer(layer)
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let sweeper = spawn_sweeper(Arc::clone(&self.governor), Arc::new(SystemClock));

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(
            addr = %self.addr,
            identity_header = %self.identity_header,
            "Starting HTTP server with graceful shutdown"
        );

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GovernorError::Server(e.to_string())
            });

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }
}

/// Periodically reclaim expired counters.
///
/// Runs once per window of the longest rule period. Returns `None` when the
/// catalog is empty, since nothing is ever counted.
pub fn spawn_sweeper(governor: Arc<Governor>, clock: Arc<dyn Clock>) -> Option<JoinHandle<()>> {
    let period = governor
        .catalog()
        .rules()
        .iter()
        .map(|rule| rule.period())
        .max()?;

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = governor.sweep(clock.now());
            debug!(
                removed = removed,
                remaining = governor.store().len(),
                "Swept expired counters"
            );
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{GovernorSettings, ManualClock, PolicyDocument, RuleCatalog};
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http::Request;
    use tower::ServiceExt;

    fn governor() -> Arc<Governor> {
        let doc = PolicyDocument::from_json(
            r#"{"period_seconds": 10, "rates": [
                {"name": "v1", "route": "/v1.*", "soft_limit": 10, "hard_limit": 20}
            ]}"#,
        )
        .unwrap();
        Arc::new(Governor::from_policy(&doc).unwrap())
    }

    fn server() -> GovernorServer {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        GovernorServer::new(addr, governor())
    }

    #[tokio::test]
    async fn test_router_answers_no_content() {
        let request = Request::builder()
            .uri("/v1/queues")
            .header("X-Project-ID", "84197")
            .body(Body::empty())
            .unwrap();

        let response = server().router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_router_requires_identity_on_governed_routes() {
        let request = Request::builder().uri("/v1").body(Body::empty()).unwrap();
        let response = server().router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = server().router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_router_custom_identity_header() {
        let server = server().with_identity_header(HeaderName::from_static("x-tenant"));
        let request = Request::builder()
            .uri("/v1")
            .header("X-Tenant", "acme")
            .body(Body::empty())
            .unwrap();

        let response = server.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_counters() {
        let governor = governor();
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));

        governor.decide("GET", "/v1", "84197", clock.now());
        assert_eq!(governor.store().len(), 1);

        clock.advance(Duration::from_secs(30));
        let handle = spawn_sweeper(Arc::clone(&governor), clock.clone()).unwrap();

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(governor.store().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_no_sweeper_without_rules() {
        let governor = Arc::new(Governor::new(RuleCatalog::new(), GovernorSettings::default()));
        assert!(spawn_sweeper(governor, Arc::new(SystemClock)).is_none());
    }
}
