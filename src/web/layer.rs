//! Tower layer that admits or rejects requests before they reach a handler.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::{HeaderName, HeaderValue, Request, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::extract::{KeyExtractor, PeerAddr};
use super::sink::{emit, LogSink, TracingSink};
use crate::admission::{AdmissionFilter, ClientKey, Decision, Policy};

/// Response header carrying the downstream processing time in seconds.
pub const X_PROCESS_TIME: HeaderName = HeaderName::from_static("x-process-time");

/// Body of the `429 Too Many Requests` response.
pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded";

/// Settings for an [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionOptions {
    pub window: Duration,
    pub key_extractor: Arc<dyn KeyExtractor>,
    pub log_sink: Arc<dyn LogSink>,
}

impl AdmissionOptions {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_key_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.key_extractor = Arc::new(extractor);
        self
    }

    pub fn with_log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.log_sink = Arc::new(sink);
        self
    }
}

impl Default for AdmissionOptions {
    fn default() -> Self {
        Self {
            window: Policy::default().window(),
            key_extractor: Arc::new(PeerAddr),
            log_sink: Arc::new(TracingSink),
        }
    }
}

impl fmt::Debug for AdmissionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionOptions")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// Applies [`AdmissionService`] to the wrapped service.
///
/// Every service produced by one layer shares a single filter, so a layer
/// applied to a whole router rate-limits a client across all its routes.
#[derive(Clone)]
pub struct AdmissionLayer {
    filter: Arc<AdmissionFilter>,
    key_extractor: Arc<dyn KeyExtractor>,
    log_sink: Arc<dyn LogSink>,
}

impl AdmissionLayer {
    /// Create a layer with its own fresh filter.
    pub fn new(options: AdmissionOptions) -> Self {
        let filter = Arc::new(AdmissionFilter::new(Policy::new(options.window)));
        Self::with_filter(filter, options.key_extractor, options.log_sink)
    }

    /// Create a layer around an existing filter; the window comes from the
    /// filter's own policy.
    pub fn with_filter(
        filter: Arc<AdmissionFilter>,
        key_extractor: Arc<dyn KeyExtractor>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            filter,
            key_extractor,
            log_sink,
        }
    }

    pub fn filter(&self) -> &Arc<AdmissionFilter> {
        &self.filter
    }
}

impl Default for AdmissionLayer {
    fn default() -> Self {
        Self::new(AdmissionOptions::default())
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            filter: Arc::clone(&self.filter),
            key_extractor: Arc::clone(&self.key_extractor),
            log_sink: Arc::clone(&self.log_sink),
        }
    }
}

/// Middleware that runs every request through an [`AdmissionFilter`].
///
/// Rejected requests get `429 Too Many Requests` without touching the inner
/// service. Admitted requests are forwarded and their response gains an
/// `X-Process-Time` header. Errors from the inner service pass through
/// unchanged.
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    filter: Arc<AdmissionFilter>,
    key_extractor: Arc<dyn KeyExtractor>,
    log_sink: Arc<dyn LogSink>,
}

impl<S, B> Service<Request<B>> for AdmissionService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let (parts, body) = request.into_parts();
        let key = self
            .key_extractor
            .extract(&parts)
            .unwrap_or_else(ClientKey::unknown);
        let path = parts.uri.path().to_owned();
        let request = Request::from_parts(parts, body);

        if self.filter.evaluate(&key, Instant::now()) == Decision::Reject {
            debug!(key = %key, path = %path, "Request rejected");
            return Box::pin(async { Ok(rejection()) });
        }

        // Take the service that was driven to readiness and leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let sink = Arc::clone(&self.log_sink);

        Box::pin(async move {
            emit(sink.as_ref(), &format!("Request to {}", path));

            let timer = InFlight::start(path, sink);
            let result = inner.call(request).await;
            let elapsed = timer.finish();

            match result {
                Ok(mut response) => {
                    attach_process_time(&mut response, elapsed.elapsed);
                    emit(
                        elapsed.sink.as_ref(),
                        &format!(
                            "Response from {} took {:.4} seconds",
                            elapsed.path,
                            elapsed.elapsed.as_secs_f64()
                        ),
                    );
                    Ok(response)
                }
                Err(err) => {
                    emit(
                        elapsed.sink.as_ref(),
                        &format!(
                            "Request to {} failed after {:.4} seconds",
                            elapsed.path,
                            elapsed.elapsed.as_secs_f64()
                        ),
                    );
                    Err(err)
                }
            }
        })
    }
}

fn rejection() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_MESSAGE).into_response()
}

fn attach_process_time(response: &mut Response, elapsed: Duration) {
    match HeaderValue::from_str(&elapsed.as_secs_f64().to_string()) {
        Ok(value) => {
            response.headers_mut().insert(X_PROCESS_TIME, value);
        }
        Err(e) => warn!(error = %e, "Could not encode process time header"),
    }
}

/// Tracks a downstream call; if dropped before `finish`, the call was
/// cancelled and the time spent so far is still reported.
struct InFlight {
    path: String,
    started: Instant,
    sink: Arc<dyn LogSink>,
    finished: bool,
}

struct Finished {
    path: String,
    elapsed: Duration,
    sink: Arc<dyn LogSink>,
}

impl InFlight {
    fn start(path: String, sink: Arc<dyn LogSink>) -> Self {
        Self {
            path,
            started: Instant::now(),
            sink,
            finished: false,
        }
    }

    fn finish(mut self) -> Finished {
        self.finished = true;
        Finished {
            path: std::mem::take(&mut self.path),
            elapsed: self.started.elapsed(),
            sink: Arc::clone(&self.sink),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished {
            emit(
                self.sink.as_ref(),
                &format!(
                    "Request to {} cancelled after {:.4} seconds",
                    self.path,
                    self.started.elapsed().as_secs_f64()
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use tower::util::BoxCloneService;
    use tower::{service_fn, ServiceExt};

    use crate::web::{HeaderKey, NullSink};

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl Recording {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl LogSink for Recording {
        fn log(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    impl LogSink for Arc<Recording> {
        fn log(&self, message: &str) {
            (**self).log(message);
        }
    }

    fn request(peer: &str, path: &str) -> Request<Body> {
        let addr: SocketAddr = peer.parse().unwrap();
        let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    type Handler = BoxCloneService<Request<Body>, Response, Infallible>;

    fn counting_handler(calls: Arc<AtomicUsize>) -> Handler {
        BoxCloneService::new(service_fn(move |_req: Request<Body>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>("Hello World!".into_response())
            }
        }))
    }

    fn quiet_options() -> AdmissionOptions {
        AdmissionOptions::default().with_log_sink(NullSink)
    }

    #[tokio::test]
    async fn test_first_request_is_forwarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = AdmissionLayer::new(quiet_options());
        let service = layer.layer(counting_handler(Arc::clone(&calls)));

        let response = service.oneshot(request("10.0.0.1:1000", "/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(X_PROCESS_TIME));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Hello World!");
    }

    #[tokio::test]
    async fn test_reject_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = AdmissionLayer::new(quiet_options());

        let first = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(request("10.0.0.1:1000", "/"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(request("10.0.0.1:1001", "/"))
            .await
            .unwrap();

        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(!second.headers().contains_key(X_PROCESS_TIME));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], RATE_LIMIT_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_distinct_clients_are_independent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = AdmissionLayer::new(quiet_options());

        for peer in ["10.0.0.1:1", "10.0.0.2:1", "10.0.0.3:1"] {
            let response = layer
                .layer(counting_handler(Arc::clone(&calls)))
                .oneshot(request(peer, "/"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(layer.filter().tracked_clients(), 3);
    }

    #[tokio::test]
    async fn test_window_expiry_readmits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = AdmissionLayer::new(quiet_options().with_window(Duration::from_millis(50)));

        let first = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(request("10.0.0.1:1", "/"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(request("10.0.0.1:1", "/"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_process_time_header_reflects_handler_duration() {
        let layer = AdmissionLayer::new(quiet_options());
        let slow = service_fn(|_req: Request<Body>| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, Infallible>(StatusCode::OK.into_response())
        });

        let response = layer
            .layer(slow)
            .oneshot(request("10.0.0.1:1", "/slow"))
            .await
            .unwrap();

        let seconds: f64 = response
            .headers()
            .get(X_PROCESS_TIME)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(seconds >= 0.05, "process time {} too small", seconds);
        assert!(seconds < 5.0, "process time {} too large", seconds);
    }

    #[tokio::test]
    async fn test_missing_peer_uses_unknown_bucket() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = AdmissionLayer::new(quiet_options());
        let anonymous = || Request::builder().uri("/").body(Body::empty()).unwrap();

        let first = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(anonymous())
            .await
            .unwrap();
        let second = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(anonymous())
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(layer
            .filter()
            .last_admitted(&ClientKey::unknown())
            .is_some());
    }

    #[tokio::test]
    async fn test_header_value_unknown_does_not_share_anonymous_bucket() {
        let calls = Arc::new(AtomicUsize::new(0));
        let options = quiet_options()
            .with_key_extractor(HeaderKey::new(HeaderName::from_static("x-api-key")));
        let layer = AdmissionLayer::new(options);

        let anonymous = Request::builder().uri("/").body(Body::empty()).unwrap();
        let labelled = Request::builder()
            .uri("/")
            .header("x-api-key", "unknown")
            .body(Body::empty())
            .unwrap();

        let first = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(anonymous)
            .await
            .unwrap();
        let second = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(labelled)
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(layer.filter().tracked_clients(), 2);
    }

    #[tokio::test]
    async fn test_access_log_lines() {
        let sink = Arc::new(Recording::default());
        let layer = AdmissionLayer::new(AdmissionOptions::default().with_log_sink(Arc::clone(&sink)));
        let calls = Arc::new(AtomicUsize::new(0));

        layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(request("10.0.0.1:1", "/items"))
            .await
            .unwrap();
        layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(request("10.0.0.1:1", "/items"))
            .await
            .unwrap();

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "Request to /items");
        assert!(lines[1].starts_with("Response from /items took "));
        assert!(lines[1].ends_with(" seconds"));
    }

    #[tokio::test]
    async fn test_panicking_sink_does_not_affect_response() {
        struct Exploding;
        impl LogSink for Exploding {
            fn log(&self, _message: &str) {
                panic!("sink failure");
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let layer = AdmissionLayer::new(AdmissionOptions::default().with_log_sink(Exploding));

        let response = layer
            .layer(counting_handler(Arc::clone(&calls)))
            .oneshot(request("10.0.0.1:1", "/"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(X_PROCESS_TIME));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_propagates_unchanged() {
        #[derive(Debug, PartialEq)]
        struct Boom(&'static str);

        let sink = Arc::new(Recording::default());
        let layer = AdmissionLayer::new(AdmissionOptions::default().with_log_sink(Arc::clone(&sink)));
        let failing = service_fn(|_req: Request<Body>| async { Err::<Response, _>(Boom("downstream")) });

        let result = layer.layer(failing).oneshot(request("10.0.0.1:1", "/fail")).await;

        assert_eq!(result.unwrap_err(), Boom("downstream"));
        let lines = sink.lines();
        assert!(lines[1].starts_with("Request to /fail failed after "));
    }

    #[tokio::test]
    async fn test_cancelled_call_reports_elapsed_time() {
        let sink = Arc::new(Recording::default());
        let layer = AdmissionLayer::new(AdmissionOptions::default().with_log_sink(Arc::clone(&sink)));
        let hanging = service_fn(|_req: Request<Body>| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Infallible>(StatusCode::OK.into_response())
        });

        let call = layer.layer(hanging).oneshot(request("10.0.0.1:1", "/hang"));
        let outcome = tokio::time::timeout(Duration::from_millis(30), call).await;
        assert!(outcome.is_err());

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("Request to /hang cancelled after "));
    }

    #[tokio::test]
    async fn test_custom_key_extractor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let options = quiet_options().with_key_extractor(|parts: &http::request::Parts| {
            Some(ClientKey::new(parts.uri.path()))
        });
        let layer = AdmissionLayer::new(options);

        // Same peer, different paths: keyed by path, so both admitted.
        for path in ["/a", "/b"] {
            let response = layer
                .layer(counting_handler(Arc::clone(&calls)))
                .oneshot(request("10.0.0.1:1", path))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_requests_admit_once() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let layer = AdmissionLayer::new(quiet_options().with_window(Duration::from_secs(60)));

            let tasks: Vec<_> = (0..64)
                .map(|_| {
                    let service = layer.layer(counting_handler(Arc::clone(&calls)));
                    tokio::spawn(async move {
                        service
                            .oneshot(request("10.0.0.1:1", "/"))
                            .await
                            .unwrap()
                            .status()
                    })
                })
                .collect();

            let statuses: Vec<StatusCode> = futures::future::join_all(tasks)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .collect();

            let admitted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
            assert_eq!(admitted, 1);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_options_debug_and_defaults() {
        let options = AdmissionOptions::default();
        assert_eq!(options.window, Duration::from_secs(1));
        assert!(format!("{:?}", options).contains("window"));
    }

    #[test]
    fn test_layer_window_comes_from_options() {
        let layer = AdmissionLayer::new(quiet_options().with_window(Duration::from_millis(750)));
        assert_eq!(layer.filter().policy().window(), Duration::from_millis(750));
    }

    #[test]
    fn test_layer_with_shared_filter() {
        let filter = Arc::new(AdmissionFilter::new(Policy::new(Duration::from_secs(3))));
        let layer = AdmissionLayer::with_filter(
            Arc::clone(&filter),
            Arc::new(PeerAddr),
            Arc::new(NullSink),
        );
        assert!(Arc::ptr_eq(layer.filter(), &filter));
        assert_eq!(layer.filter().policy().window(), Duration::from_secs(3));
    }

    #[test]
    fn test_sequential_requests_without_runtime() {
        let layer = AdmissionLayer::new(quiet_options());
        let calls = Arc::new(AtomicUsize::new(0));

        let statuses: Vec<StatusCode> = (0..2)
            .map(|_| {
                let service = layer.layer(counting_handler(Arc::clone(&calls)));
                tokio_test::block_on(service.oneshot(request("10.0.0.9:1", "/")))
                    .unwrap()
                    .status()
            })
            .collect();

        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]);
    }
}
