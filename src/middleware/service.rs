//! Admission middleware service.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use http::header::{CONTENT_LENGTH, RETRY_AFTER};
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use tower::Service;
use tracing::{debug, warn};

use crate::error::{HardLimitExceeded, MissingIdentity};
use crate::ratelimit::{Clock, Governor, Verdict};

/// Wraps an HTTP service and governs admission to it.
///
/// Requests no rule applies to go straight through. Governed requests must
/// carry the identity header; they are then forwarded, held for a pacing
/// delay and forwarded, or answered with `429 Too Many Requests`.
#[derive(Clone, Debug)]
pub struct GovernorService<S> {
    inner: S,
    governor: Arc<Governor>,
    identity_header: HeaderName,
    clock: Arc<dyn Clock>,
}

impl<S> GovernorService<S> {
    /// Create a new service around `inner`.
    pub fn new(
        inner: S,
        governor: Arc<Governor>,
        identity_header: HeaderName,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            governor,
            identity_header,
            clock,
        }
    }

    /// Get a reference to the inner service.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GovernorService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let rule = self
            .governor
            .rule_for(req.method().as_str(), req.uri().path())
            .cloned();

        let Some(rule) = rule else {
            debug!(
                method = %req.method(),
                path = %req.uri().path(),
                "Requested path not recognized, not limiting"
            );
            return Box::pin(self.inner.call(req));
        };

        let identity = match extract_identity(&req, &self.identity_header) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(
                    rule = %rule.name(),
                    path = %req.uri().path(),
                    error = %err,
                    "Rejecting request without identity"
                );
                return Box::pin(async { Ok(empty_response(StatusCode::BAD_REQUEST)) });
            }
        };

        match self.governor.decide_for_rule(&rule, &identity, self.clock.now()) {
            Verdict::Admit => Box::pin(self.inner.call(req)),
            Verdict::AdmitAfterDelay(delay) => {
                // The ready service goes into the future; keep a fresh clone.
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    inner.call(req).await
                })
            }
            Verdict::Reject(err) => {
                warn!(
                    rule = %err.rule,
                    identity = %err.identity,
                    observed = err.observed,
                    limit = err.limit,
                    retry_after_secs = err.retry_after.as_secs_f64(),
                    "Hard limit exceeded, rejecting request"
                );
                let response = too_many_requests(&err);
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

fn extract_identity<B>(
    req: &Request<B>,
    header: &HeaderName,
) -> Result<String, MissingIdentity> {
    req.headers()
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| MissingIdentity {
            header: header.to_string(),
        })
}

fn empty_response<B: Default>(status: StatusCode) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

fn too_many_requests<B: Default>(err: &HardLimitExceeded) -> Response<B> {
    let mut response = empty_response(StatusCode::TOO_MANY_REQUESTS);
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(err.retry_after)));
    response
}

/// Whole seconds to advertise in `Retry-After`, rounded up, at least one.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    let secs = if retry_after.subsec_nanos() > 0 { secs + 1 } else { secs };
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, PolicyDocument};
    use chrono::{TimeZone, Utc};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const POLICY: &str = r#"
{
    "period_seconds": 10,
    "node_count": 1,
    "rules": [
        {
            "name": "messages",
            "route": "/v1/queues/[^/]+/messages",
            "soft_limit": 10,
            "hard_limit": 20
        }
    ]
}
"#;

    const PATH: &str = "/v1/queues/fizbit/messages";

    struct Harness {
        governor: Arc<Governor>,
        clock: Arc<ManualClock>,
        forwarded: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            let doc = PolicyDocument::from_json(POLICY).unwrap();
            Self {
                governor: Arc::new(Governor::from_policy(&doc).unwrap()),
                clock: Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap())),
                forwarded: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn service(
            &self,
        ) -> impl Service<Request<String>, Response = Response<String>, Error = Infallible> {
            let forwarded = Arc::clone(&self.forwarded);
            let inner = tower::service_fn(move |_req: Request<String>| {
                forwarded.fetch_add(1, Ordering::SeqCst);
                async {
                    let mut response = Response::new(String::new());
                    *response.status_mut() = StatusCode::NO_CONTENT;
                    Ok::<_, Infallible>(response)
                }
            });
            let clock: Arc<dyn Clock> = self.clock.clone();
            GovernorService::new(
                inner,
                Arc::clone(&self.governor),
                HeaderName::from_static("x-project-id"),
                clock,
            )
        }

        async fn send(&self, path: &str, identity: Option<&str>) -> Response<String> {
            let mut builder = Request::builder().method("GET").uri(path);
            if let Some(identity) = identity {
                builder = builder.header("X-Project-ID", identity);
            }
            let req = builder.body(String::new()).unwrap();
            self.service().oneshot(req).await.unwrap()
        }

        fn forwarded(&self) -> usize {
            self.forwarded.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_missing_identity_is_bad_request() {
        let harness = Harness::new();

        let response = harness.send(PATH, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[CONTENT_LENGTH], "0");
        assert_eq!(harness.forwarded(), 0);
        assert!(harness.governor.store().is_empty());
    }

    #[tokio::test]
    async fn test_blank_identity_is_bad_request() {
        let harness = Harness::new();

        let response = harness.send(PATH, Some("  ")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(harness.forwarded(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_route_passes_without_identity() {
        let harness = Harness::new();

        let response = harness.send("/unrelated", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(harness.forwarded(), 1);
        assert!(harness.governor.store().is_empty());
    }

    #[tokio::test]
    async fn test_admitted_request_is_forwarded() {
        let harness = Harness::new();

        let response = harness.send(PATH, Some("84197")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(harness.forwarded(), 1);
    }

    #[tokio::test]
    async fn test_hard_limit_is_too_many_requests() {
        let harness = Harness::new();

        for _ in 0..25 {
            harness.send(PATH, Some("84197")).await;
        }
        harness.clock.advance(Duration::from_millis(12_500));

        let response = harness.send(PATH, Some("84197")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[CONTENT_LENGTH], "0");
        // Window ends at 1020s, clock is at 1012.5s.
        assert_eq!(response.headers()[RETRY_AFTER], "8");
        assert_eq!(harness.forwarded(), 25);

        // Other identities are unaffected.
        let response = harness.send(PATH, Some("1234")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_limit_delays_before_forwarding() {
        let harness = Harness::new();

        for _ in 0..15 {
            harness.send(PATH, Some("84197")).await;
        }
        harness.clock.advance(Duration::from_secs(10));

        let start = tokio::time::Instant::now();
        let response = harness.send(PATH, Some("84197")).await;
        let elapsed = start.elapsed();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(harness.forwarded(), 16);
        // 1 / target - 0.2 / previous
        let expected = Duration::from_secs_f64(1.0 - 0.2 / 15.0);
        assert!(elapsed >= expected, "slept {:?}", elapsed);
        assert!(elapsed < expected + Duration::from_millis(50), "slept {:?}", elapsed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
        assert_eq!(retry_after_secs(Duration::from_millis(3_001)), 4);
    }
}
