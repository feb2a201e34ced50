//! Lazy HTTP request promises with revision-aware caching.
//!
//! A [`UrlRequestPromise`] does nothing until it is observed or waited on.
//! It then runs on its work queue:
//!
//! 1. Bail out with [`Error::Cancelled`] if cancelled, then apply the
//!    preflight transform.
//! 2. When the connectivity manager reports offline, either fail with
//!    [`Error::NoConnection`] or, with [`OfflineBehavior::UseCache`], resolve
//!    from the cache without touching the network.
//! 3. Otherwise send the request. A cached server revision is offered back
//!    as a conditional header.
//! 4. The response's revision (`ETag`, else `Last-Modified`) is compared
//!    with the cached one. A match, or a 304, resolves from the cache. Fresh
//!    payloads are written back with their revision.
//!
//! Every path resolves the promise exactly once. Payloads are raw bytes
//! (`Vec<u8>`) fed to the promise's post-processors.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{
    ETAG, HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{Method, StatusCode};
use roundabout_cache::{CacheError, CacheManager};
use roundabout_core::{
    Error, Executor, IllegalState, MultiPart, Pipeline, PostProcessor, Promise, PromiseState,
    WorkQueue,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::connectivity::{ConnectivityManager, ManualConnectivity};
use crate::transport::{Request, Response, Transport};

/// Prefix of locally generated revisions. These never equal a server token.
pub const SYNTHETIC_REVISION_PREFIX: &str = "synthetic-";

/// What a request does when connectivity reports offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineBehavior {
    /// Reject with [`Error::NoConnection`].
    #[default]
    Fail,
    /// Resolve from the cache, rejecting only when nothing is cached.
    UseCache,
}

/// Metadata of the network response, recorded before the promise resolves.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// URL after redirects.
    pub url: Url,
}

impl From<&Response> for ResponseInfo {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            url: response.url.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("offline behavior `use_cache` requires a cache manager")]
    CacheManagerRequired,
}

/// Rewrites a request just before it is sent.
pub type Preflight = dyn Fn(Request) -> Result<Request, String> + Send + Sync;

struct RequestState {
    request: Request,
    transport: Arc<dyn Transport>,
    cache_manager: Option<Arc<dyn CacheManager>>,
    connectivity: Arc<dyn ConnectivityManager>,
    offline_behavior: OfflineBehavior,
    cache_identifier: String,
    cancel_when_unchanged: bool,
    preflight: Option<Arc<Preflight>>,
    activity_logging: bool,
    executor: Arc<dyn Executor>,
    response: Mutex<Option<ResponseInfo>>,
}

/// Configures a [`UrlRequestPromise`].
pub struct UrlRequestBuilder {
    request: Request,
    transport: Arc<dyn Transport>,
    cache_manager: Option<Arc<dyn CacheManager>>,
    connectivity: Option<Arc<dyn ConnectivityManager>>,
    offline_behavior: OfflineBehavior,
    cache_identifier: Option<String>,
    cancel_when_unchanged: bool,
    preflight: Option<Arc<Preflight>>,
    activity_logging: bool,
    executor: Option<Arc<dyn Executor>>,
    pipeline: Pipeline,
    name: Option<String>,
    group: Option<String>,
}

impl UrlRequestBuilder {
    pub fn new(request: Request, transport: Arc<dyn Transport>) -> Self {
        Self {
            request,
            transport,
            cache_manager: None,
            connectivity: None,
            offline_behavior: OfflineBehavior::Fail,
            cache_identifier: None,
            cancel_when_unchanged: false,
            preflight: None,
            activity_logging: false,
            executor: None,
            pipeline: Pipeline::new(),
            name: None,
            group: None,
        }
    }

    pub fn cache_manager(mut self, cache: Arc<dyn CacheManager>) -> Self {
        self.cache_manager = Some(cache);
        self
    }

    /// Defaults to an always-online [`ManualConnectivity`].
    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityManager>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn offline_behavior(mut self, behavior: OfflineBehavior) -> Self {
        self.offline_behavior = behavior;
        self
    }

    /// Override the identifier entries are cached under.
    pub fn cache_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.cache_identifier = Some(identifier.into());
        self
    }

    /// Reject with [`Error::Unchanged`] when the server payload matches the
    /// cached copy.
    pub fn cancel_when_remote_data_unchanged(mut self, enabled: bool) -> Self {
        self.cancel_when_unchanged = enabled;
        self
    }

    pub fn preflight(
        mut self,
        preflight: impl Fn(Request) -> Result<Request, String> + Send + Sync + 'static,
    ) -> Self {
        self.preflight = Some(Arc::new(preflight));
        self
    }

    /// Log request start and completion at info level. Failures are always
    /// logged.
    pub fn activity_logging(mut self, enabled: bool) -> Self {
        self.activity_logging = enabled;
        self
    }

    /// Where the request runs. Defaults to [`WorkQueue::common`].
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn post_processor(mut self, processor: impl PostProcessor + 'static) -> Self {
        self.pipeline.push(Arc::new(processor));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn build<T: Clone + Send + 'static>(self) -> Result<UrlRequestPromise<T>, BuildError> {
        if self.offline_behavior == OfflineBehavior::UseCache && self.cache_manager.is_none() {
            return Err(BuildError::CacheManagerRequired);
        }

        let cache_identifier = self
            .cache_identifier
            .unwrap_or_else(|| default_cache_identifier(&self.request));
        let name = self
            .name
            .unwrap_or_else(|| format!("{} {}", self.request.method, self.request.url));
        let source_url = self.request.url.to_string();

        let state = Arc::new(RequestState {
            request: self.request,
            transport: self.transport,
            cache_manager: self.cache_manager,
            connectivity: self
                .connectivity
                .unwrap_or_else(|| Arc::new(ManualConnectivity::new())),
            offline_behavior: self.offline_behavior,
            cache_identifier,
            cancel_when_unchanged: self.cancel_when_unchanged,
            preflight: self.preflight,
            activity_logging: self.activity_logging,
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(WorkQueue::common())),
            response: Mutex::new(None),
        });

        let hook_state = Arc::clone(&state);
        let promise = Promise::lazy_with_pipeline(self.pipeline, move |promise: Promise<T>| {
            let executor = Arc::clone(&hook_state.executor);
            executor.execute(Box::new(move || execute(&hook_state, &promise)));
        });
        promise.set_name(name);
        promise.set_source_url(source_url);
        if let Some(group) = self.group {
            promise.set_group(group);
        }

        Ok(UrlRequestPromise { promise, state })
    }
}

/// A lazily executed HTTP request resolving to a post-processed payload.
pub struct UrlRequestPromise<T> {
    promise: Promise<T>,
    state: Arc<RequestState>,
}

impl<T> Clone for UrlRequestPromise<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> UrlRequestPromise<T> {
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.state.request
    }

    #[must_use]
    pub fn cache_identifier(&self) -> &str {
        &self.state.cache_identifier
    }

    #[must_use]
    pub fn offline_behavior(&self) -> OfflineBehavior {
        self.state.offline_behavior
    }

    /// Response metadata, once the request has reached the network.
    #[must_use]
    pub fn response(&self) -> Option<ResponseInfo> {
        self.state.response.lock().clone()
    }

    #[must_use]
    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    #[must_use]
    pub fn into_promise(self) -> Promise<T> {
        self.promise
    }

    pub fn then(
        &self,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
    ) {
        self.promise.then(on_success, on_failure);
    }

    pub fn then_on(
        &self,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) {
        self.promise.then_on(on_success, on_failure, executor);
    }

    /// Block until the request resolves. Do not call from the request's own
    /// serial work queue.
    pub fn wait(&self) -> Result<T, Error> {
        self.promise.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
        self.promise.wait_timeout(timeout)
    }

    pub fn fire(&self) {
        self.promise.fire();
    }

    pub fn cancel(&self) {
        self.promise.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.promise.is_cancelled()
    }

    #[must_use]
    pub fn state(&self) -> PromiseState {
        self.promise.state()
    }

    pub fn add_post_processor(&self, processor: impl PostProcessor + 'static) {
        self.promise.add_post_processor(processor);
    }

    pub fn try_add_post_processor(
        &self,
        processor: Arc<dyn PostProcessor>,
    ) -> Result<(), IllegalState> {
        self.promise.try_add_post_processor(processor)
    }

    pub fn remove_all_post_processors(&self) {
        self.promise.remove_all_post_processors();
    }

    /// A lazy promise for whatever is cached for this request.
    ///
    /// It uses a copy of the current post-processors and ignores
    /// connectivity. A missing entry rejects with [`Error::CacheMiss`].
    #[must_use]
    pub fn cached_data(&self) -> Promise<T> {
        let state = Arc::clone(&self.state);
        let promise = Promise::lazy_with_pipeline(
            self.promise.post_processors(),
            move |promise: Promise<T>| {
                let executor = Arc::clone(&state.executor);
                executor.execute(Box::new(move || {
                    finish(&promise, read_cache_only(&state));
                }));
            },
        );
        promise.set_name(format!("{} (cached)", self.promise.name()));
        promise.set_source_url(self.state.request.url.to_string());
        promise
    }

    /// Cached data first, then the network result.
    ///
    /// When offline with [`OfflineBehavior::UseCache`] the request itself
    /// answers from the cache, so only the second part is delivered.
    #[must_use]
    pub fn progressive(&self) -> MultiPart<T> {
        let offline_from_cache = self.state.offline_behavior == OfflineBehavior::UseCache
            && !self.state.connectivity.is_reachable();
        if offline_from_cache {
            MultiPart::second_only(self.promise.clone())
        } else {
            MultiPart::new(self.cached_data(), self.promise.clone())
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for UrlRequestPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlRequestPromise")
            .field("method", &self.state.request.method)
            .field("url", &self.state.request.url.as_str())
            .field("cache_identifier", &self.state.cache_identifier)
            .field("offline_behavior", &self.state.offline_behavior)
            .field("state", &self.promise.state())
            .finish_non_exhaustive()
    }
}

/// Cache identifier derived from the request: the URL without fragment,
/// prefixed by the method for anything but GET and HEAD.
#[must_use]
pub fn default_cache_identifier(request: &Request) -> String {
    let mut url = request.url.clone();
    url.set_fragment(None);
    if request.method == Method::GET || request.method == Method::HEAD {
        url.to_string()
    } else {
        format!("{} {url}", request.method)
    }
}

#[must_use]
pub fn is_synthetic_revision(revision: &str) -> bool {
    revision.starts_with(SYNTHETIC_REVISION_PREFIX)
}

fn synthetic_revision() -> String {
    format!("{SYNTHETIC_REVISION_PREFIX}{}", uuid::Uuid::new_v4())
}

/// The server revision of a response: `ETag`, falling back to
/// `Last-Modified`.
fn revision_token(headers: &HeaderMap) -> Option<String> {
    [ETAG, LAST_MODIFIED].into_iter().find_map(|name| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn is_entity_tag(revision: &str) -> bool {
    revision.starts_with('"') || revision.starts_with("W/\"")
}

/// Offer the cached revision back to the server.
fn add_conditional_header(request: &mut Request, revision: &str) {
    if is_synthetic_revision(revision)
        || request.headers.contains_key(IF_NONE_MATCH)
        || request.headers.contains_key(IF_MODIFIED_SINCE)
    {
        return;
    }
    let Ok(value) = HeaderValue::from_str(revision) else {
        return;
    };
    let name = if is_entity_tag(revision) {
        IF_NONE_MATCH
    } else {
        IF_MODIFIED_SINCE
    };
    request.headers.insert(name, value);
}

fn execute<T: Clone + Send + 'static>(state: &RequestState, promise: &Promise<T>) {
    let result = fetch(state, promise);
    if let Err(err) = &result {
        if err.is_cancellation() {
            tracing::debug!(promise = %promise.name(), "Request stopped: {err}");
        } else {
            tracing::warn!(promise = %promise.name(), "Request failed: {err}");
        }
    }
    finish(promise, result);
}

fn finish<T: Clone + Send + 'static>(promise: &Promise<T>, result: Result<Vec<u8>, Error>) {
    let settled = match result {
        Ok(payload) => promise.try_accept_raw(payload),
        Err(err) => promise.try_reject(err),
    };
    if let Err(e) = settled {
        tracing::debug!(promise = %promise.name(), "Request result dropped: {e}");
    }
}

fn read_cache_only(state: &RequestState) -> Result<Vec<u8>, Error> {
    let identifier = &state.cache_identifier;
    let miss = || Error::CacheMiss {
        identifier: identifier.clone(),
    };
    let Some(cache) = &state.cache_manager else {
        return Err(miss());
    };
    match cache.cached_data_for_identifier(identifier) {
        Ok(Some(data)) => Ok(data),
        Ok(None) => Err(miss()),
        Err(e) => Err(Error::cache_read(identifier.clone(), e)),
    }
}

/// Remove an unreadable entry and build the rejection for it.
fn purge(cache: &dyn CacheManager, identifier: &str, cause: CacheError) -> Error {
    match cache.remove_cache_for_identifier(identifier) {
        Ok(()) => tracing::warn!(identifier, "Purged unreadable cache entry: {cause}"),
        Err(e) => tracing::warn!(identifier, "Failed to purge unreadable cache entry: {e}"),
    }
    Error::cache_read(identifier, cause)
}

fn fetch<T: Clone + Send + 'static>(
    state: &RequestState,
    promise: &Promise<T>,
) -> Result<Vec<u8>, Error> {
    if promise.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut request = state.request.clone();
    if let Some(preflight) = &state.preflight {
        request = preflight(request).map_err(Error::Preflight)?;
    }
    let identifier = state.cache_identifier.as_str();

    if !state.connectivity.is_reachable() {
        return match (state.offline_behavior, &state.cache_manager) {
            (OfflineBehavior::UseCache, Some(cache)) => {
                match cache.cached_data_for_identifier(identifier) {
                    Ok(Some(data)) => {
                        if state.activity_logging {
                            tracing::info!(identifier, "Offline; answering from cache");
                        }
                        Ok(data)
                    }
                    Ok(None) => Err(Error::NoConnection),
                    Err(e) => Err(purge(cache.as_ref(), identifier, e)),
                }
            }
            _ => Err(Error::NoConnection),
        };
    }

    let cached_revision = state
        .cache_manager
        .as_ref()
        .and_then(|cache| cache.revision_for_identifier(identifier));
    if let Some(revision) = &cached_revision {
        add_conditional_header(&mut request, revision);
    }

    if state.activity_logging {
        tracing::info!(method = %request.method, url = %request.url, "Request started");
    }
    let response = state.transport.send(&request).map_err(Error::transport)?;
    if state.activity_logging {
        tracing::info!(
            method = %request.method,
            url = %response.url,
            status = response.status.as_u16(),
            bytes = response.body.len(),
            "Request finished"
        );
    }
    *state.response.lock() = Some(ResponseInfo::from(&response));

    if promise.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if response.status.is_client_error() || response.status.is_server_error() {
        return Err(Error::HttpStatus {
            status: response.status.as_u16(),
        });
    }

    let Some(cache) = &state.cache_manager else {
        return Ok(response.body);
    };

    let revision = revision_token(&response.headers);
    let server_not_modified = response.status == StatusCode::NOT_MODIFIED;
    let revision_unchanged = revision.is_some() && revision == cached_revision;

    if server_not_modified || revision_unchanged {
        return match cache.cached_data_for_identifier(identifier) {
            Ok(Some(_)) if state.cancel_when_unchanged => {
                tracing::debug!(identifier, "Remote data unchanged");
                Err(Error::Unchanged)
            }
            Ok(Some(cached)) => Ok(cached),
            Ok(None) if !server_not_modified => {
                // The revision matched but the payload is gone; the body is
                // the fresh copy.
                store(cache.as_ref(), identifier, &response.body, revision.as_deref());
                Ok(response.body)
            }
            Ok(None) => Err(purge(
                cache.as_ref(),
                identifier,
                CacheError::MissingPayload {
                    identifier: identifier.to_string(),
                },
            )),
            Err(e) => Err(purge(cache.as_ref(), identifier, e)),
        };
    }

    let stored_revision = match revision {
        Some(revision) => revision,
        None if state.offline_behavior == OfflineBehavior::UseCache => synthetic_revision(),
        None => return Ok(response.body),
    };

    let unchanged = state.cancel_when_unchanged
        && match cache.cached_data_for_identifier(identifier) {
            Ok(previous) => previous.is_some_and(|previous| previous == response.body),
            Err(e) => {
                tracing::warn!(identifier, "Cache read failed; treating payload as changed: {e}");
                false
            }
        };
    store(cache.as_ref(), identifier, &response.body, Some(&stored_revision));
    if unchanged {
        tracing::debug!(identifier, "Remote data identical to cache");
        return Err(Error::Unchanged);
    }
    Ok(response.body)
}

/// Write a payload back. Failures are logged and never fail the request.
fn store(cache: &dyn CacheManager, identifier: &str, data: &[u8], revision: Option<&str>) {
    let Some(revision) = revision else {
        return;
    };
    if let Err(e) = cache.cache_data(data, identifier, revision) {
        let err = Error::cache_write(identifier, e);
        tracing::warn!(identifier, "{err}");
    }
}
