//! Reachability reporting.
//!
//! Request promises ask a [`ConnectivityManager`] whether the network is
//! reachable before deciding between the transport and the cache. Nothing in
//! this contract blocks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

pub type SubscriptionId = u64;

/// Callback receiving the new reachability after a change.
pub type ReachabilityCallback = Arc<dyn Fn(bool) + Send + Sync>;

pub trait ConnectivityManager: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// Register for change notifications.
    fn subscribe(&self, callback: ReachabilityCallback) -> SubscriptionId;

    /// Stop notifications. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Connectivity set explicitly by the application (online until told
/// otherwise).
pub struct ManualConnectivity {
    reachable: AtomicBool,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, ReachabilityCallback)>>,
}

impl ManualConnectivity {
    #[must_use]
    pub fn new() -> Self {
        Self::with_reachable(true)
    }

    #[must_use]
    pub fn with_reachable(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Update reachability, notifying subscribers when it changed.
    pub fn set_reachable(&self, reachable: bool) {
        if self.reachable.swap(reachable, Ordering::AcqRel) == reachable {
            return;
        }
        tracing::debug!(reachable, "Connectivity changed");
        let subscribers: Vec<_> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in subscribers {
            callback(reachable);
        }
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityManager for ManualConnectivity {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    fn subscribe(&self, callback: ReachabilityCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, callback));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(existing, _)| *existing != id);
    }
}

impl fmt::Debug for ManualConnectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualConnectivity")
            .field("reachable", &self.is_reachable())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}
