//! Per-entity cancellation of in-flight notifications
//!
//! When a newer change for an entity is admitted while an older one is still
//! being delivered, the older generation's scope is cancelled so every
//! recipient abandons it instead of racing the newer one out of order.
//!
//! Each admitted generation is reference counted by the fan-out width: the
//! entry lives until every recipient has reported completion, or until a
//! newer generation replaces it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct CancelEntry {
    token: CancellationToken,
    generation: i64,
    pending: usize,
}

/// Tracks the current cancellable scope for each entity id
#[derive(Debug)]
pub struct CancelManager {
    fanout_width: usize,
    entries: DashMap<String, CancelEntry>,
}

impl CancelManager {
    /// `fanout_width` is the number of recipients that will call
    /// [`CancelManager::complete`] for each admitted generation.
    pub fn new(fanout_width: usize) -> Self {
        Self {
            fanout_width,
            entries: DashMap::new(),
        }
    }

    pub fn fanout_width(&self) -> usize {
        self.fanout_width
    }

    /// Admit a new generation for `id`, cancelling any previous one.
    ///
    /// The returned token is shared by every recipient's delivery call.
    pub fn admit(&self, id: &str, generation: i64) -> CancellationToken {
        let token = CancellationToken::new();
        let entry = CancelEntry {
            token: token.clone(),
            generation,
            pending: self.fanout_width,
        };

        if let Some(previous) = self.entries.insert(id.to_string(), entry) {
            debug!(
                "Superseding {} generation {} with {}",
                id, previous.generation, generation
            );
            previous.token.cancel();
        }

        token
    }

    /// Record that one recipient finished `generation` of `id`.
    ///
    /// Stale generations are ignored and return false. Returns true when
    /// this was the last pending recipient and the entry was removed.
    pub fn complete(&self, id: &str, generation: i64) -> bool {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().generation != generation {
                    return false;
                }

                let current = entry.get_mut();
                current.pending = current.pending.saturating_sub(1);
                if current.pending > 0 {
                    return false;
                }

                let (_, finished) = entry.remove_entry();
                finished.token.cancel();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

}

#[cfg(test)]
impl CancelManager {
    /// Recipients still pending on the current generation of `id`
    pub fn pending(&self, id: &str) -> Option<usize> {
        self.entries.get(id).map(|e| e.pending)
    }

    pub fn generation(&self, id: &str) -> Option<i64> {
        self.entries.get(id).map(|e| e.generation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
