//! Inbound Dispatcher
//!
//! Routes each decoded packet to at most one pending registration:
//!
//! 1. Keyed packet with a table entry: the entry is removed and its chain run.
//!    A chain that rejects the packet leaves the registration to its timeout
//!    and the packet goes to the unsolicited sink.
//! 2. Otherwise the expectation registry is scanned oldest first and the
//!    first registration whose chain matches (and whose claim succeeds) wins.
//! 3. Nothing matched: the unsolicited sink gets the packet.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::context::Shared;
use crate::protocol::Protocol;
use crate::registration::RegistrationId;
use crate::stats::ConversationStats;

type UnsolicitedHandler<Pk> = Box<dyn FnMut(Pk) + Send>;

/// Where a dispatched packet ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered through the correlation table
    Correlated(RegistrationId),
    /// Delivered through the expectation registry
    Matched(RegistrationId),
    /// Matched no registration
    Unsolicited,
}

/// Inbound half of a conversation context
///
/// Owned by the single reader of a connection; `dispatch` runs the matched
/// consumer inline, so packets are handled strictly in arrival order.
pub struct Dispatcher<P: Protocol> {
    shared: Arc<Shared<P>>,
    unsolicited: Option<UnsolicitedHandler<P::Packet>>,
}

impl<P: Protocol> Dispatcher<P> {
    pub(crate) fn new(shared: Arc<Shared<P>>) -> Self {
        Self {
            shared,
            unsolicited: None,
        }
    }

    /// Route unmatched packets to `handler`
    pub fn on_unsolicited<F>(&mut self, handler: F)
    where
        F: FnMut(P::Packet) + Send + 'static,
    {
        self.unsolicited = Some(Box::new(handler));
    }

    /// Route unmatched packets to a channel
    pub fn unsolicited_channel(&mut self) -> mpsc::UnboundedReceiver<P::Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_unsolicited(move |packet| {
            if tx.send(packet).is_err() {
                trace!("{} unsolicited receiver dropped", P::NAME);
            }
        });
        rx
    }

    /// Offer one decoded packet to the pending registrations
    pub fn dispatch(&mut self, packet: P::Packet) -> DispatchOutcome {
        let shared = Arc::clone(&self.shared);
        ConversationStats::incr(&shared.stats.packets_received);

        if let Some(key) = P::correlation_key(&packet) {
            if let Some(registration) = shared.table.remove(&key) {
                match registration.try_match(&packet) {
                    Some(value) if registration.claim() => {
                        ConversationStats::incr(&shared.stats.correlated);
                        let id = registration.id();
                        trace!("{} key {:?} -> {}", P::NAME, key, id);
                        shared.deliver(&registration, value, packet);
                        return DispatchOutcome::Correlated(id);
                    },
                    Some(_) => {
                        trace!("{} key {:?} already completed", P::NAME, key);
                    },
                    None => {
                        debug!(
                            "{} packet with key {:?} rejected by {} {}",
                            P::NAME,
                            key,
                            registration.name(),
                            registration.id()
                        );
                    },
                }
                return self.unsolicited(packet);
            }
        }

        for registration in shared.registry.snapshot() {
            if !registration.is_live() {
                continue;
            }
            let Some(value) = registration.try_match(&packet) else {
                continue;
            };
            // Lost to a timeout or cancel in flight: keep scanning
            if !registration.claim() {
                continue;
            }
            shared.detach(&registration);
            ConversationStats::incr(&shared.stats.matched);
            let id = registration.id();
            trace!("{} matched {} {}", P::NAME, registration.name(), id);
            shared.deliver(&registration, value, packet);
            return DispatchOutcome::Matched(id);
        }

        self.unsolicited(packet)
    }

    fn unsolicited(&mut self, packet: P::Packet) -> DispatchOutcome {
        ConversationStats::incr(&self.shared.stats.unsolicited);
        match self.unsolicited.as_mut() {
            Some(handler) => handler(packet),
            None => debug!("{} dropping unsolicited packet: {:?}", P::NAME, packet),
        }
        DispatchOutcome::Unsolicited
    }
}
