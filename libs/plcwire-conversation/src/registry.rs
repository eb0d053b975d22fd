//! Ordered expectation registry
//!
//! Registrations without a correlation key live here and are scanned oldest
//! first. Registration ids are allocated in order, so a `BTreeMap` keyed by id
//! doubles as the FIFO.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::Protocol;
use crate::registration::{Registration, RegistrationId};

pub(crate) struct ExpectationRegistry<P: Protocol> {
    entries: Mutex<BTreeMap<RegistrationId, Arc<Registration<P>>>>,
}

impl<P: Protocol> ExpectationRegistry<P> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn insert(&self, registration: Arc<Registration<P>>) {
        self.entries.lock().insert(registration.id(), registration);
    }

    pub(crate) fn remove(&self, id: RegistrationId) -> Option<Arc<Registration<P>>> {
        self.entries.lock().remove(&id)
    }

    /// Registrations in registration order
    ///
    /// The lock is released before the caller runs any step chain, so
    /// predicates and consumers may register or cancel freely.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Registration<P>>> {
        self.entries.lock().values().cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Registration<P>>> {
        std::mem::take(&mut *self.entries.lock()).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
