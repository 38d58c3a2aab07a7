//! Change cache: last-seen minified snapshot per entity
//!
//! The cache answers "is this new or different" for the diffing stage and
//! provides a point-in-time key set for removal detection. An entry exists
//! iff a notification for that snapshot was delivered or attempted; absence
//! means the entity was never seen or has since been removed.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::entity::{Minified, NodeMini, ServiceMini};

/// Keyed store of minified snapshots, safe for concurrent use
///
/// Every operation is atomic for its key. None of them fail: absence and
/// "unchanged" are ordinary outcomes.
#[derive(Debug)]
pub struct Cache<M: Minified> {
    entries: DashMap<String, M>,
}

pub type ServiceCache = Cache<ServiceMini>;
pub type NodeCache = Cache<NodeMini>;

/// Shared cache handle
pub type SharedCache<M> = Arc<Cache<M>>;

impl<M: Minified> Cache<M> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store `mini` under its id. Returns true if the id was absent or the
    /// stored value differed.
    pub fn upsert_and_check(&self, mini: M) -> bool {
        match self.entries.entry(mini.id().to_string()) {
            Entry::Occupied(mut existing) => {
                if *existing.get() == mini {
                    false
                } else {
                    existing.insert(mini);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(mini);
                true
            }
        }
    }

    /// Same comparison as [`Cache::upsert_and_check`], without writing.
    pub fn peek_changed(&self, mini: &M) -> bool {
        self.entries
            .get(mini.id())
            .map(|existing| *existing != *mini)
            .unwrap_or(true)
    }

    pub fn get(&self, id: &str) -> Option<M> {
        self.entries.get(id).map(|r| r.clone())
    }

    /// Remove and return the entry for `id`
    pub fn delete(&self, id: &str) -> Option<M> {
        self.entries.remove(id).map(|(_, m)| m)
    }

    /// Copy of all keys at this moment
    pub fn snapshot_keys(&self) -> HashSet<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<M: Minified> Default for Cache<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn service(id: &str, labels: &[(&str, &str)]) -> ServiceMini {
        ServiceMini {
            id: id.to_string(),
            name: format!("{}-name", id),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            replicas: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_twice_reports_change_once() {
        let cache = ServiceCache::new();
        let mini = service("s1", &[("com.df.a", "1")]);

        assert!(cache.upsert_and_check(mini.clone()));
        assert!(!cache.upsert_and_check(mini));
    }

    #[test]
    fn test_upsert_ignores_label_insertion_order() {
        let cache = ServiceCache::new();
        assert!(cache.upsert_and_check(service("s1", &[("com.df.a", "1"), ("com.df.b", "2")])));
        assert!(!cache.upsert_and_check(service("s1", &[("com.df.b", "2"), ("com.df.a", "1")])));
    }

    #[test]
    fn test_upsert_detects_difference() {
        let cache = ServiceCache::new();
        cache.upsert_and_check(service("s1", &[("com.df.a", "1")]));
        assert!(cache.upsert_and_check(service("s1", &[("com.df.a", "2")])));
        assert_eq!(cache.get("s1").unwrap().labels["com.df.a"], "2");
    }

    #[test]
    fn test_peek_does_not_write() {
        let cache = ServiceCache::new();
        let mini = service("s1", &[]);

        assert!(cache.peek_changed(&mini));
        assert!(cache.is_empty());

        cache.upsert_and_check(mini.clone());
        assert!(!cache.peek_changed(&mini));
    }

    #[test]
    fn test_delete_and_get() {
        let cache = ServiceCache::new();
        cache.upsert_and_check(service("s1", &[]));

        assert!(cache.get("s1").is_some());
        assert!(cache.delete("s1").is_some());
        assert!(cache.get("s1").is_none());
        assert!(cache.delete("s1").is_none());
    }

    #[test]
    fn test_snapshot_keys_is_a_copy() {
        let cache = ServiceCache::new();
        cache.upsert_and_check(service("s1", &[]));
        cache.upsert_and_check(service("s2", &[]));

        let keys = cache.snapshot_keys();
        cache.upsert_and_check(service("s3", &[]));

        assert_eq!(keys.len(), 2);
        assert!(keys.contains("s1") && keys.contains("s2"));
        assert_eq!(cache.len(), 3);
    }
}
