//! Cancel related promises together by group name.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::promise::Promise;

/// Something whose work can be cancelled cooperatively.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

/// Weak registry of promises keyed by their group name.
///
/// The registry never keeps a promise alive. Dropped promises are pruned
/// whenever their group is touched.
#[derive(Default)]
pub struct PromiseGroups {
    groups: Mutex<HashMap<String, Vec<Weak<dyn Cancellable>>>>,
}

impl PromiseGroups {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `promise` under its group. Returns false when it has no group.
    pub fn add<T: Clone + Send + 'static>(&self, promise: &Promise<T>) -> bool {
        let Some(group) = promise.group() else {
            return false;
        };
        self.add_to(&group, &promise.as_cancellable());
        true
    }

    /// Track any cancellable under `group`.
    pub fn add_to(&self, group: &str, member: &Arc<dyn Cancellable>) {
        let mut groups = self.groups.lock();
        let members = groups.entry(group.to_string()).or_default();
        members.retain(|weak| weak.strong_count() > 0);
        members.push(Arc::downgrade(member));
    }

    /// Cancel every live member of `group` and forget the group.
    ///
    /// Returns how many members were cancelled.
    pub fn cancel_group(&self, group: &str) -> usize {
        let members = self.groups.lock().remove(group).unwrap_or_default();
        let live: Vec<_> = members.iter().filter_map(Weak::upgrade).collect();
        for member in &live {
            member.cancel();
        }
        tracing::debug!(group, cancelled = live.len(), "Cancelled promise group");
        live.len()
    }

    /// Number of live members in `group`.
    #[must_use]
    pub fn live_count(&self, group: &str) -> usize {
        self.groups
            .lock()
            .get(group)
            .map_or(0, |members| members.iter().filter(|w| w.strong_count() > 0).count())
    }

    /// Drop bookkeeping for promises that no longer exist.
    pub fn prune(&self) {
        let mut groups = self.groups.lock();
        for members in groups.values_mut() {
            members.retain(|weak| weak.strong_count() > 0);
        }
        groups.retain(|_, members| !members.is_empty());
    }
}

impl std::fmt::Debug for PromiseGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let groups = self.groups.lock();
        f.debug_map()
            .entries(groups.iter().map(|(name, members)| (name, members.len())))
            .finish()
    }
}
