//! Rejection values and contract violations.
//!
//! [`Error`] is what a promise is rejected with. It is `Clone` because every
//! observer of a promise receives its own copy of the outcome; underlying
//! causes are shared behind an `Arc`.
//!
//! [`IllegalState`] is kept apart from [`Error`]: it reports a broken
//! exactly-once contract and is never delivered through `reject`.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Shared, type-erased cause attached to an [`Error`].
pub type Cause = Arc<dyn StdError + Send + Sync>;

/// The reasons a promise can be rejected.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Connectivity was reported offline and no cache could stand in.
    #[error("no network connection is available")]
    NoConnection,

    /// The transport could not complete the exchange.
    #[error("transport failure: {0}")]
    Transport(#[source] Cause),

    /// The server answered with a client or server error status.
    #[error("server responded with HTTP {status}")]
    HttpStatus { status: u16 },

    /// The cache manager failed while reading an entry that was needed.
    #[error("cache entry {identifier:?} could not be read: {cause}")]
    CacheRead {
        identifier: String,
        #[source]
        cause: Cause,
    },

    /// The cache manager failed while writing an entry.
    ///
    /// Request promises log this kind instead of rejecting with it.
    #[error("cache entry {identifier:?} could not be written: {cause}")]
    CacheWrite {
        identifier: String,
        #[source]
        cause: Cause,
    },

    /// No cached payload exists for the identifier.
    #[error("no cached data for {identifier:?}")]
    CacheMiss { identifier: String },

    /// The promise was cancelled before it produced a result.
    #[error("promise was cancelled")]
    Cancelled,

    /// Remote data matched the cache and the promise was asked to stop.
    #[error("remote data is unchanged from the cached copy")]
    Unchanged,

    /// A post-processor received a value of the wrong type.
    #[error("{processor} expected a value of type {expected}")]
    TypeMismatch {
        processor: String,
        expected: &'static str,
    },

    /// A post-processor rejected its input.
    #[error("post-processing failed: {message}")]
    Processing {
        message: String,
        source_url: Option<String>,
    },

    /// The pipeline finished with an empty possibility.
    #[error("promise resolved without a value")]
    EmptyResult,

    /// A request preflight refused to produce a request.
    #[error("request preflight failed: {0}")]
    Preflight(String),
}

impl Error {
    pub fn transport(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::Transport(Arc::new(cause))
    }

    pub fn cache_read(
        identifier: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::CacheRead {
            identifier: identifier.into(),
            cause: Arc::new(cause),
        }
    }

    pub fn cache_write(
        identifier: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::CacheWrite {
            identifier: identifier.into(),
            cause: Arc::new(cause),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
            source_url: None,
        }
    }

    /// Attach a source URL to a processing error. Other kinds are returned as-is.
    #[must_use]
    pub fn with_source_url(self, url: Option<&str>) -> Self {
        match self {
            Self::Processing {
                message,
                source_url: None,
            } => Self::Processing {
                message,
                source_url: url.map(str::to_string),
            },
            other => other,
        }
    }

    /// True for both explicit cancellation and the unchanged-data signal.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Unchanged)
    }
}

/// Violations of the resolve-exactly-once contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IllegalState {
    /// `accept` or `reject` was called on a promise that already resolved.
    #[error("promise has already been resolved")]
    AlreadyResolved,

    /// Post-processors were changed after resolution started.
    #[error("post-processors cannot be changed once a promise is resolving")]
    MutationAfterResolution,
}
