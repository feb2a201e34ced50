//! Integration tests for request promises against a local mock server.
//!
//! Promises block their worker while the transport drives `reqwest` on the
//! test runtime, so waits go through `spawn_blocking`.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue};
use roundabout_cache::{CacheError, CacheManager, MemoryCacheManager};
use roundabout_core::{
    Error, Inline, JsonFieldPostProcessor, JsonPostProcessor, Part, Utf8PostProcessor,
};
use roundabout_request::{
    BuildError, HttpTransport, ManualConnectivity, OfflineBehavior, Request, Transport,
    TransportSettings, UrlRequestBuilder, UrlRequestPromise,
};
use serde_json::Value;
use tokio::runtime::Handle;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport() -> Arc<dyn Transport> {
    let settings = TransportSettings::default();
    Arc::new(HttpTransport::with_handle(&settings, Handle::current()).unwrap())
}

fn builder(server: &MockServer, route: &str) -> UrlRequestBuilder {
    let url = Url::parse(&format!("{}{route}", server.uri())).unwrap();
    UrlRequestBuilder::new(Request::get(url), transport())
}

fn identifier(server: &MockServer, route: &str) -> String {
    format!("{}{route}", server.uri())
}

async fn resolve<T: Clone + Send + 'static>(promise: &UrlRequestPromise<T>) -> Result<T, Error> {
    let promise = promise.clone();
    tokio::task::spawn_blocking(move || promise.wait())
        .await
        .unwrap()
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map_or(0, |requests| requests.len())
}

fn ok(body: &str, etag: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("ETag", etag)
        .set_body_string(body)
}

/// Delegates to memory storage, failing the operations it is told to and
/// counting writes and removals.
#[derive(Default)]
struct FlakyCache {
    inner: MemoryCacheManager,
    fail_writes: bool,
    fail_reads: bool,
    /// Report every payload as missing while keeping revisions.
    hide_payloads: bool,
    writes: AtomicUsize,
    removals: AtomicUsize,
}

fn refused() -> CacheError {
    CacheError::Io {
        path: "flaky".into(),
        source: io::Error::other("refused"),
    }
}

impl CacheManager for FlakyCache {
    fn revision_for_identifier(&self, identifier: &str) -> Option<String> {
        self.inner.revision_for_identifier(identifier)
    }

    fn cache_data(&self, data: &[u8], identifier: &str, revision: &str) -> Result<(), CacheError> {
        if self.fail_writes {
            return Err(refused());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.cache_data(data, identifier, revision)
    }

    fn cached_data_for_identifier(&self, identifier: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if self.fail_reads {
            return Err(refused());
        }
        if self.hide_payloads {
            return Ok(None);
        }
        self.inner.cached_data_for_identifier(identifier)
    }

    fn remove_cache_for_identifier(&self, identifier: &str) -> Result<(), CacheError> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_cache_for_identifier(identifier)
    }

    fn remove_all_cache(&self) -> Result<(), CacheError> {
        self.inner.remove_all_cache()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn new_revision_replaces_cached_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ok("one", "\"v1\""))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ok("two", "\"v2\""))
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCacheManager::new());
    let id = identifier(&server, "/feed");

    let first = builder(&server, "/feed")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&first).await.unwrap(), b"one");
    assert_eq!(cache.revision_for_identifier(&id).as_deref(), Some("\"v1\""));

    let second = builder(&server, "/feed")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&second).await.unwrap(), b"two");
    assert_eq!(cache.revision_for_identifier(&id).as_deref(), Some("\"v2\""));
    assert_eq!(
        cache.cached_data_for_identifier(&id).unwrap().as_deref(),
        Some(&b"two"[..])
    );

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[1].headers.get("if-none-match").unwrap(), "\"v1\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn not_modified_resolves_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/item"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/item"))
        .respond_with(ok("payload", "\"v1\""))
        .mount(&server)
        .await;

    let cache = Arc::new(FlakyCache::default());
    let first = builder(&server, "/item")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&first).await.unwrap(), b"payload");

    let second = builder(&server, "/item")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&second).await.unwrap(), b"payload");
    assert_eq!(second.response().unwrap().status.as_u16(), 304);
    // Only the first, fresh response was written.
    assert_eq!(cache.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn matching_revision_prefers_cached_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok("server copy", "\"v1\""))
        .mount(&server)
        .await;

    let cache = Arc::new(FlakyCache::default());
    cache
        .inner
        .cache_data(b"cached copy", &identifier(&server, "/doc"), "\"v1\"")
        .unwrap();

    let promise = builder(&server, "/doc")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&promise).await.unwrap(), b"cached copy");
    assert_eq!(cache.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unchanged_revision_cancels_when_requested() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok("same", "\"v1\""))
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCacheManager::new());
    cache
        .cache_data(b"same", &identifier(&server, "/doc"), "\"v1\"")
        .unwrap();

    let promise = builder(&server, "/doc")
        .cache_manager(cache)
        .cancel_when_remote_data_unchanged(true)
        .build::<Vec<u8>>()
        .unwrap();
    let err = resolve(&promise).await.unwrap_err();
    assert!(matches!(err, Error::Unchanged));
    assert!(err.is_cancellation());
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_payload_without_revision_is_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("static"))
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCacheManager::new());
    let build = || {
        builder(&server, "/static")
            .cache_manager(cache.clone())
            .offline_behavior(OfflineBehavior::UseCache)
            .cancel_when_remote_data_unchanged(true)
            .build::<Vec<u8>>()
            .unwrap()
    };

    assert_eq!(resolve(&build()).await.unwrap(), b"static");
    let revision = cache
        .revision_for_identifier(&identifier(&server, "/static"))
        .unwrap();
    assert!(roundabout_request::is_synthetic_revision(&revision));

    assert!(matches!(resolve(&build()).await, Err(Error::Unchanged)));

    // Locally generated revisions are never offered to the server.
    for request in server.received_requests().await.unwrap() {
        assert!(request.headers.get("if-none-match").is_none());
        assert!(request.headers.get("if-modified-since").is_none());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_revision_with_fail_skips_the_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("live"))
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCacheManager::new());
    let promise = builder(&server, "/live")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&promise).await.unwrap(), b"live");
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_with_cache_skips_the_network() {
    let server = MockServer::start().await;
    let cache = Arc::new(MemoryCacheManager::new());
    cache
        .cache_data(b"saved", &identifier(&server, "/saved"), "\"v1\"")
        .unwrap();

    let promise = builder(&server, "/saved")
        .cache_manager(cache)
        .connectivity(Arc::new(ManualConnectivity::with_reachable(false)))
        .offline_behavior(OfflineBehavior::UseCache)
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&promise).await.unwrap(), b"saved");
    assert_eq!(request_count(&server).await, 0);
    assert!(promise.response().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_without_cached_entry_has_no_connection() {
    let server = MockServer::start().await;
    let promise = builder(&server, "/absent")
        .cache_manager(Arc::new(MemoryCacheManager::new()))
        .connectivity(Arc::new(ManualConnectivity::with_reachable(false)))
        .offline_behavior(OfflineBehavior::UseCache)
        .build::<Vec<u8>>()
        .unwrap();
    assert!(matches!(resolve(&promise).await, Err(Error::NoConnection)));
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_fail_ignores_the_cache() {
    let server = MockServer::start().await;
    let cache = Arc::new(MemoryCacheManager::new());
    cache
        .cache_data(b"saved", &identifier(&server, "/saved"), "\"v1\"")
        .unwrap();

    let promise = builder(&server, "/saved")
        .cache_manager(cache)
        .connectivity(Arc::new(ManualConnectivity::with_reachable(false)))
        .build::<Vec<u8>>()
        .unwrap();
    assert!(matches!(resolve(&promise).await, Err(Error::NoConnection)));
    assert_eq!(request_count(&server).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_write_failure_still_accepts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok("fresh", "\"v9\""))
        .mount(&server)
        .await;

    let cache = Arc::new(FlakyCache {
        fail_writes: true,
        ..FlakyCache::default()
    });
    let promise = builder(&server, "/w")
        .cache_manager(cache)
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&promise).await.unwrap(), b"fresh");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_entry_on_not_modified_is_purged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let cache = Arc::new(FlakyCache {
        fail_reads: true,
        ..FlakyCache::default()
    });
    let id = identifier(&server, "/r");
    cache.cache_data(b"old", &id, "\"v1\"").unwrap();

    let promise = builder(&server, "/r")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    match resolve(&promise).await {
        Err(Error::CacheRead { identifier, .. }) => assert_eq!(identifier, id),
        other => panic!("expected cache read failure, got {other:?}"),
    }
    assert_eq!(cache.removals.load(Ordering::SeqCst), 1);
    assert_eq!(cache.revision_for_identifier(&id), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn not_modified_without_payload_is_purged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let cache = Arc::new(FlakyCache {
        hide_payloads: true,
        ..FlakyCache::default()
    });
    let id = identifier(&server, "/gone");
    cache.inner.cache_data(b"old", &id, "\"v1\"").unwrap();

    let promise = builder(&server, "/gone")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    match resolve(&promise).await {
        Err(Error::CacheRead { cause, .. }) => assert!(matches!(
            cause.downcast_ref::<CacheError>(),
            Some(CacheError::MissingPayload { identifier }) if *identifier == id
        )),
        other => panic!("expected cache read failure, got {other:?}"),
    }
    assert_eq!(cache.removals.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_previous_payload_counts_as_changed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
        .mount(&server)
        .await;

    let cache = Arc::new(FlakyCache {
        fail_reads: true,
        ..FlakyCache::default()
    });
    let promise = builder(&server, "/fresh")
        .cache_manager(cache.clone())
        .offline_behavior(OfflineBehavior::UseCache)
        .cancel_when_remote_data_unchanged(true)
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&promise).await.unwrap(), b"fresh");
    assert_eq!(cache.writes.load(Ordering::SeqCst), 1);
    assert_eq!(cache.removals.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn error_status_rejects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCacheManager::new());
    let promise = builder(&server, "/broken")
        .cache_manager(cache.clone())
        .build::<Vec<u8>>()
        .unwrap();
    assert!(matches!(
        resolve(&promise).await,
        Err(Error::HttpStatus { status: 500 })
    ));
    assert!(cache.is_empty());
    assert_eq!(promise.response().unwrap().status.as_u16(), 500);
}

#[tokio::test(flavor = "multi_thread")]
async fn use_cache_requires_a_cache_manager() {
    let server = MockServer::start().await;
    let result = builder(&server, "/x")
        .offline_behavior(OfflineBehavior::UseCache)
        .build::<Vec<u8>>();
    assert!(matches!(result, Err(BuildError::CacheManagerRequired)));
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_data_reads_without_network() {
    let server = MockServer::start().await;
    let cache = Arc::new(MemoryCacheManager::new());
    cache
        .cache_data(b"hello", &identifier(&server, "/greeting"), "\"v1\"")
        .unwrap();

    let promise = builder(&server, "/greeting")
        .cache_manager(cache)
        .post_processor(Utf8PostProcessor)
        .build::<String>()
        .unwrap();
    let cached = promise.cached_data();
    let value = tokio::task::spawn_blocking(move || cached.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, "hello");
    assert_eq!(request_count(&server).await, 0);

    let missing = builder(&server, "/other")
        .cache_manager(Arc::new(MemoryCacheManager::new()))
        .build::<Vec<u8>>()
        .unwrap()
        .cached_data();
    let err = tokio::task::spawn_blocking(move || missing.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::CacheMiss { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn progressive_delivers_cache_then_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok("new", "\"v2\""))
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCacheManager::new());
    cache
        .cache_data(b"old", &identifier(&server, "/p"), "\"v1\"")
        .unwrap();

    let promise = builder(&server, "/p")
        .cache_manager(cache)
        .post_processor(Utf8PostProcessor)
        .build::<String>()
        .unwrap();

    let parts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&parts);
    promise.progressive().then_each(
        move |part, value| seen.lock().push((part, value)),
        |err| panic!("unexpected failure: {err}"),
        Arc::new(Inline),
    );
    resolve(&promise).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        *parts.lock(),
        vec![
            (Part::First, "old".to_string()),
            (Part::Second, "new".to_string())
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn progressive_offline_only_delivers_the_request() {
    let server = MockServer::start().await;
    let cache = Arc::new(MemoryCacheManager::new());
    cache
        .cache_data(b"old", &identifier(&server, "/p"), "\"v1\"")
        .unwrap();

    let promise = builder(&server, "/p")
        .cache_manager(cache)
        .connectivity(Arc::new(ManualConnectivity::with_reachable(false)))
        .offline_behavior(OfflineBehavior::UseCache)
        .build::<Vec<u8>>()
        .unwrap();
    let parts = promise.progressive();
    assert!(parts.first().is_none());
    assert!(parts.second().ptr_eq(promise.promise()));
}

#[tokio::test(flavor = "multi_thread")]
async fn nothing_is_sent_until_observed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok("lazy", "\"v1\""))
        .mount(&server)
        .await;

    let promise = builder(&server, "/lazy").build::<Vec<u8>>().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(request_count(&server).await, 0);

    assert_eq!(resolve(&promise).await.unwrap(), b"lazy");
    assert_eq!(resolve(&promise).await.unwrap(), b"lazy");
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn json_field_pipeline_over_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ok(r#"{"name":"ada","id":7}"#, "\"u1\""))
        .mount(&server)
        .await;

    let promise = builder(&server, "/user")
        .post_processor(JsonPostProcessor)
        .post_processor(JsonFieldPostProcessor::new("name"))
        .build::<Value>()
        .unwrap();
    assert_eq!(resolve(&promise).await.unwrap(), Value::from("ada"));
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_json_carries_the_request_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let promise = builder(&server, "/bad")
        .post_processor(JsonPostProcessor)
        .build::<Value>()
        .unwrap();
    match resolve(&promise).await {
        Err(Error::Processing { source_url, .. }) => {
            assert_eq!(source_url, Some(identifier(&server, "/bad")));
        }
        other => panic!("expected processing failure, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn preflight_rewrites_and_rejects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-token", "secret"))
        .respond_with(ok("authorized", "\"a\""))
        .mount(&server)
        .await;

    let promise = builder(&server, "/auth")
        .preflight(|request| {
            Ok(request.with_header(
                HeaderName::from_static("x-token"),
                HeaderValue::from_static("secret"),
            ))
        })
        .build::<Vec<u8>>()
        .unwrap();
    assert_eq!(resolve(&promise).await.unwrap(), b"authorized");

    let refused = builder(&server, "/auth")
        .preflight(|_| Err("token expired".to_string()))
        .build::<Vec<u8>>()
        .unwrap();
    match resolve(&refused).await {
        Err(Error::Preflight(message)) => assert_eq!(message, "token expired"),
        other => panic!("expected preflight failure, got {other:?}"),
    }
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_before_firing_never_hits_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ok("late", "\"v1\""))
        .mount(&server)
        .await;

    let promise = builder(&server, "/c").build::<Vec<u8>>().unwrap();
    promise.cancel();
    assert!(matches!(resolve(&promise).await, Err(Error::Cancelled)));
    assert_eq!(request_count(&server).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn default_name_and_identifier() {
    let server = MockServer::start().await;
    let promise = builder(&server, "/n#frag").build::<Vec<u8>>().unwrap();
    assert_eq!(promise.cache_identifier(), identifier(&server, "/n"));
    assert!(promise.promise().name().starts_with("GET "));
    assert_eq!(promise.offline_behavior(), OfflineBehavior::Fail);
}
