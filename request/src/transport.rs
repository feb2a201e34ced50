//! The network exchange behind request promises.
//!
//! [`Transport::send`] blocks the calling thread until the response body has
//! been read. Request promises call it from work queue threads.
//! [`HttpTransport`] drives `reqwest` on a tokio runtime, either its own or
//! one supplied through a [`Handle`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use url::Url;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// An HTTP request description.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// URL after redirects.
    pub url: Url,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to start HTTP runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Performs one request/response exchange.
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Client options for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub user_agent: String,
    pub timeout: Duration,
    pub default_headers: HeaderMap,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            user_agent: concat!("roundabout/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: DEFAULT_TIMEOUT,
            default_headers: HeaderMap::new(),
        }
    }
}

/// A [`Transport`] built on `reqwest`.
///
/// `send` blocks on the runtime handle, so it must not be called from inside
/// an async context.
pub struct HttpTransport {
    client: reqwest::Client,
    handle: Handle,
    // Held so an owned runtime lives as long as the transport.
    _runtime: Option<Arc<Runtime>>,
}

impl HttpTransport {
    /// A transport with its own small multi-threaded runtime.
    pub fn new(settings: &TransportSettings) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("roundabout-http")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;
        let handle = runtime.handle().clone();
        Ok(Self {
            client: build_client(settings)?,
            handle,
            _runtime: Some(Arc::new(runtime)),
        })
    }

    /// A transport driven by an existing runtime.
    pub fn with_handle(
        settings: &TransportSettings,
        handle: Handle,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(settings)?,
            handle,
            _runtime: None,
        })
    }
}

fn build_client(settings: &TransportSettings) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .user_agent(settings.user_agent.clone())
        .timeout(settings.timeout)
        .default_headers(settings.default_headers.clone())
        .build()
        .map_err(TransportError::Client)
}

impl Transport for HttpTransport {
    fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let http_error = |source| TransportError::Http {
            url: request.url.to_string(),
            source,
        };
        self.handle.block_on(async {
            let response = builder.send().await.map_err(http_error)?;
            let status = response.status();
            let headers = response.headers().clone();
            let url = response.url().clone();
            let body = response.bytes().await.map_err(http_error)?;
            Ok::<_, TransportError>(Response {
                status,
                headers,
                url,
                body: body.to_vec(),
            })
        })
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("owns_runtime", &self._runtime.is_some())
            .finish_non_exhaustive()
    }
}
