//! Keyed correlation table
//!
//! Maps a correlation key to the single registration waiting for it. Lookup
//! and removal are O(1) and lock-sharded through `DashMap`.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{ConversationError, Result};
use crate::protocol::Protocol;
use crate::registration::Registration;

pub(crate) struct CorrelationTable<P: Protocol> {
    entries: DashMap<P::Key, Arc<Registration<P>>>,
}

impl<P: Protocol> CorrelationTable<P> {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a registration under `key`
    ///
    /// Fails if a live registration already holds the key. A stale entry
    /// (already claimed by a timeout or cancellation) is replaced.
    pub(crate) fn insert(&self, key: P::Key, registration: Arc<Registration<P>>) -> Result<()> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Err(ConversationError::DuplicateKey(format!(
                        "{:?} held by {} {}",
                        key,
                        occupied.get().name(),
                        occupied.get().id()
                    )));
                }
                occupied.insert(registration);
            },
            Entry::Vacant(vacant) => {
                vacant.insert(registration);
            },
        }
        Ok(())
    }

    /// Remove and return whatever is registered under `key`
    pub(crate) fn remove(&self, key: &P::Key) -> Option<Arc<Registration<P>>> {
        self.entries.remove(key).map(|(_, registration)| registration)
    }

    /// Remove the entry only if it still points at `registration`
    pub(crate) fn remove_registration(&self, key: &P::Key, registration: &Arc<Registration<P>>) -> bool {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, registration))
            .is_some()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Registration<P>>> {
        let keys: Vec<P::Key> = self.entries.iter().map(|entry| *entry.key()).collect();
        keys.into_iter().filter_map(|key| self.remove(&key)).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
