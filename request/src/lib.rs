//! HTTP request promises for roundabout.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `connectivity` | [`ConnectivityManager`] and the settable [`ManualConnectivity`] |
//! | `transport` | [`Transport`], [`Request`]/[`Response`], [`HttpTransport`] |
//! | `url_request` | [`UrlRequestPromise`] and its builder |
//!
//! Payloads leave the network as `Vec<u8>`; attach post-processors to turn
//! them into the promised type.

pub mod connectivity;
pub mod transport;
pub mod url_request;

pub use connectivity::{
    ConnectivityManager, ManualConnectivity, ReachabilityCallback, SubscriptionId,
};
pub use transport::{
    DEFAULT_TIMEOUT, HttpTransport, Request, Response, Transport, TransportError, TransportSettings,
};
pub use url_request::{
    BuildError, OfflineBehavior, Preflight, ResponseInfo, SYNTHETIC_REVISION_PREFIX,
    UrlRequestBuilder, UrlRequestPromise, default_cache_identifier, is_synthetic_revision,
};
