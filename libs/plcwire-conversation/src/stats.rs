//! Conversation counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::registration::Outcome;

/// Live counters of a conversation context
#[derive(Debug, Default)]
pub struct ConversationStats {
    /// Requests handed to the wire sink
    pub requests_sent: AtomicU64,
    /// Registrations accepted (keyed and unkeyed)
    pub registrations: AtomicU64,
    /// Packets passed to the dispatcher
    pub packets_received: AtomicU64,
    /// Packets routed through the correlation table
    pub correlated: AtomicU64,
    /// Packets matched through the expectation registry
    pub matched: AtomicU64,
    /// Packets that matched nothing
    pub unsolicited: AtomicU64,
    /// Registrations that reached HANDLED
    pub handled: AtomicU64,
    /// Registrations that reached TIMED_OUT
    pub timed_out: AtomicU64,
    /// Registrations that reached CANCELLED
    pub cancelled: AtomicU64,
    /// Registrations that reached ERRORED
    pub errored: AtomicU64,
}

impl ConversationStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a terminal outcome
    pub(crate) fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Handled => &self.handled,
            Outcome::TimedOut => &self.timed_out,
            Outcome::Cancelled => &self.cancelled,
            Outcome::Errored(_) => &self.errored,
        };
        Self::incr(counter);
    }

    /// Get a snapshot of current stats
    pub fn snapshot(&self) -> ConversationStatsSnapshot {
        ConversationStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            correlated: self.correlated.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            unsolicited: self.unsolicited.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of conversation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationStatsSnapshot {
    pub requests_sent: u64,
    pub registrations: u64,
    pub packets_received: u64,
    pub correlated: u64,
    pub matched: u64,
    pub unsolicited: u64,
    pub handled: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub errored: u64,
}

impl ConversationStatsSnapshot {
    /// Registrations that reached any terminal state
    pub fn completed(&self) -> u64 {
        self.handled + self.timed_out + self.cancelled + self.errored
    }
}
