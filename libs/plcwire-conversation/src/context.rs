//! Conversation Context
//!
//! Connection-scoped facade used by protocol logic. It owns the registration
//! stores, the timeout scheduler and the outbound sink, and hands out the
//! builder chains for requests and expectations.
//!
//! # Architecture
//!
//! ```text
//! protocol logic ──send_request()──► builder ──handle()──┐
//!                                                        ▼
//!                       ┌──────────── Shared ─────────────────────┐
//!                       │ CorrelationTable  (keyed, DashMap)      │
//!                       │ ExpectationRegistry (unkeyed, FIFO)     │
//!                       │ TimeoutScheduler  (DelayQueue task)     │
//!                       │ WireSink ──► outbound writer            │
//!                       └─────────────────────────────────────────┘
//!                                        ▲
//! codec ──decoded packet──► Dispatcher ──┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::builder::{ExpectRequestBuilder, SendRequestBuilder};
use crate::config::ConversationConfig;
use crate::correlation::CorrelationTable;
use crate::dispatcher::Dispatcher;
use crate::error::{ConversationError, Result};
use crate::events::{ConnectionEvent, DiscoveryInfo};
use crate::protocol::{KeyGenerator, Protocol};
use crate::registration::{
    Outcome, Registration, RegistrationHandle, RegistrationId, RegistrationSpec,
};
use crate::registry::ExpectationRegistry;
use crate::scheduler::TimeoutScheduler;
use crate::sink::WireSink;
use crate::stats::{ConversationStats, ConversationStatsSnapshot};

/// State shared by the context, its dispatcher and the scheduler task
pub(crate) struct Shared<P: Protocol> {
    pub(crate) config: ConversationConfig,
    pub(crate) registry: ExpectationRegistry<P>,
    pub(crate) table: CorrelationTable<P>,
    pub(crate) scheduler: TimeoutScheduler<P>,
    pub(crate) stats: ConversationStats,
    sink: Box<dyn WireSink<P::Packet>>,
    events: broadcast::Sender<ConnectionEvent>,
    keys: KeyGenerator<P::Key>,
    next_id: AtomicU64,
    closed: AtomicBool,
    disconnected: AtomicBool,
}

impl<P: Protocol> Shared<P> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConversationError::closed(format!(
                "{} conversation context",
                P::NAME
            )));
        }
        if self.disconnected.load(Ordering::Acquire) {
            return Err(ConversationError::connection_closed(format!(
                "{} connection is gone",
                P::NAME
            )));
        }
        Ok(())
    }

    fn write(&self, packet: P::Packet) -> Result<()> {
        self.sink.send_to_wire(packet)?;
        ConversationStats::incr(&self.stats.requests_sent);
        Ok(())
    }

    /// Remove a claimed registration from every store
    pub(crate) fn detach(&self, registration: &Arc<Registration<P>>) {
        match registration.key() {
            Some(key) => {
                self.table.remove_registration(&key, registration);
            },
            None => {
                self.registry.remove(registration.id());
            },
        }
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        spec: RegistrationSpec<P::Packet>,
        request: Option<P::Packet>,
    ) -> Result<RegistrationHandle<P>> {
        self.ensure_open()?;

        let key = request.as_ref().and_then(P::correlation_key);
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (registration, completion) = Registration::new(id, key, spec);
        let registration = Arc::new(registration);

        // Arm the deadline before the registration becomes visible to the dispatcher
        self.scheduler.schedule(&registration);
        let stored = match key {
            Some(key) => self.table.insert(key, Arc::clone(&registration)),
            None => {
                self.registry.insert(Arc::clone(&registration));
                Ok(())
            },
        };
        if let Err(e) = stored {
            self.scheduler.cancel(id);
            return Err(e);
        }
        ConversationStats::incr(&self.stats.registrations);

        // The deadline may have fired before the insert made it visible
        if !registration.is_live() {
            self.detach(&registration);
        }

        // close() may have drained the stores between the check above and the insert
        if let Err(e) = self.ensure_open() {
            self.cancel(&registration);
            return Err(e);
        }

        if let Some(request) = request {
            if let Err(e) = self.write(request) {
                if registration.claim() {
                    self.detach(&registration);
                    self.scheduler.cancel(id);
                    let outcome = registration.complete_errored(e.clone(), false);
                    self.stats.record(&outcome);
                }
                warn!("{} request {} not written: {}", P::NAME, registration.name(), e);
                return Err(e);
            }
        }

        debug!(
            "{} registered {} {} (key={:?}, timeout={:?})",
            P::NAME,
            registration.name(),
            id,
            key,
            registration.timeout()
        );
        Ok(RegistrationHandle::new(
            registration,
            Arc::downgrade(self),
            completion,
        ))
    }

    pub(crate) fn cancel(&self, registration: &Arc<Registration<P>>) -> bool {
        if !registration.claim() {
            return false;
        }
        self.detach(registration);
        self.scheduler.cancel(registration.id());
        let outcome = registration.complete_cancelled();
        self.stats.record(&outcome);
        true
    }

    /// Deadline elapsed (called from the scheduler task)
    pub(crate) fn expire(&self, registration: &Arc<Registration<P>>) {
        if !registration.claim() {
            trace!("{} deadline lost race for {}", P::NAME, registration.id());
            return;
        }
        self.detach(registration);
        let outcome = registration.complete_timed_out();
        self.stats.record(&outcome);
    }

    /// Deliver a matched value. Caller holds the claim and already detached.
    pub(crate) fn deliver(
        &self,
        registration: &Arc<Registration<P>>,
        value: crate::registration::Erased,
        packet: P::Packet,
    ) -> Outcome {
        self.scheduler.cancel(registration.id());
        let outcome = registration.complete_matched(value, packet);
        self.stats.record(&outcome);
        outcome
    }

    fn pending(&self) -> Vec<Arc<Registration<P>>> {
        let mut pending = self.table.drain();
        pending.extend(self.registry.drain());
        pending.sort_by_key(|registration| registration.id());
        pending
    }
}

/// Connection-scoped conversation context
///
/// Cheap to clone; all clones share the same registrations.
///
/// # Example
/// ```ignore
/// let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
/// let (ctx, dispatcher) = ConversationContext::<ModbusTcp>::new(ConversationConfig::default(), tx)?;
///
/// let key = ctx.next_key();
/// let response: ReadHoldingResponse = ctx
///     .send_request(ModbusTcpAdu::read_holding(key, 1, 0, 10))
///     .expect_response::<ModbusTcpAdu>(Duration::from_secs(1))
///     .check(move |adu| adu.transaction_id == key)
///     .unwrap(|adu| adu.pdu)
///     .response()
///     .await?;
/// ```
pub struct ConversationContext<P: Protocol> {
    pub(crate) shared: Arc<Shared<P>>,
}

impl<P: Protocol> Clone for ConversationContext<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Protocol> ConversationContext<P> {
    /// Create a context and the dispatcher feeding it
    ///
    /// Must be called within a Tokio runtime; the timeout scheduler is spawned
    /// onto the current one.
    pub fn new<S>(config: ConversationConfig, sink: S) -> Result<(Self, Dispatcher<P>)>
    where
        S: WireSink<P::Packet>,
    {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ConversationError::NoRuntime(e.to_string()))?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let keys = KeyGenerator::new(config.initial_key);
        let shared = Arc::new_cyclic(|weak| Shared {
            registry: ExpectationRegistry::new(),
            table: CorrelationTable::new(),
            scheduler: TimeoutScheduler::start(&runtime, weak.clone()),
            stats: ConversationStats::default(),
            sink: Box::new(sink),
            events,
            keys,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            config,
        });

        info!(
            "{} conversation context created (passive={}, timeout={:?})",
            P::NAME,
            shared.config.passive,
            shared.config.request_timeout()
        );
        let dispatcher = Dispatcher::new(Arc::clone(&shared));
        Ok((Self { shared }, dispatcher))
    }

    /// Write a packet without registering any expectation
    pub fn send_to_wire(&self, packet: P::Packet) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.write(packet)
    }

    /// Start a request chain; nothing is written until `handle`/`response`
    pub fn send_request(&self, request: P::Packet) -> SendRequestBuilder<P> {
        SendRequestBuilder::for_request(self.clone(), request)
    }

    /// Start a passive expectation chain for packets of type `T`
    pub fn expect_request<T>(&self, timeout: Duration) -> ExpectRequestBuilder<P, T>
    where
        T: TryFrom<P::Packet> + Send + 'static,
    {
        ExpectRequestBuilder::for_expectation(self.clone(), timeout)
    }

    /// Next correlation key for an outgoing request
    pub fn next_key(&self) -> P::Key {
        self.shared.keys.next_key()
    }

    pub fn default_timeout(&self) -> Duration {
        self.shared.config.request_timeout()
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.shared.config
    }

    pub fn is_passive(&self) -> bool {
        self.shared.config.passive
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Check if the transport under this context has gone away
    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn fire(&self, event: ConnectionEvent) {
        debug!("{} {}", P::NAME, event);
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    pub fn fire_connected(&self) {
        self.fire(ConnectionEvent::Connected);
    }

    pub fn fire_disconnected(&self) {
        self.fire(ConnectionEvent::Disconnected);
    }

    pub fn fire_discovered(&self, info: DiscoveryInfo) {
        self.fire(ConnectionEvent::Discovered(info));
    }

    /// Registrations still waiting for a packet
    pub fn pending_count(&self) -> usize {
        self.shared.table.len() + self.shared.registry.len()
    }

    pub fn stats(&self) -> ConversationStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Fail every pending registration, e.g. after the connection dropped
    ///
    /// Each registration ends ERRORED and its error handler receives `error`.
    /// Returns the number of registrations failed.
    pub fn fail_all(&self, error: ConversationError) -> usize {
        let mut failed = 0;
        for registration in self.shared.pending() {
            if registration.claim() {
                self.shared.scheduler.cancel(registration.id());
                let outcome = registration.complete_errored(error.clone(), true);
                self.shared.stats.record(&outcome);
                failed += 1;
            }
        }
        if failed > 0 {
            warn!("{} failed {} pending registrations: {}", P::NAME, failed, error);
        }
        failed
    }

    /// Mark the transport as gone and fail everything still pending
    ///
    /// Later sends and registrations fail with
    /// [`ConversationError::ConnectionClosed`] instead of waiting out their
    /// timeout. Returns the number of registrations failed.
    pub fn disconnect(&self, cause: ConversationError) -> usize {
        if !self.shared.disconnected.swap(true, Ordering::AcqRel) {
            debug!("{} marked disconnected: {}", P::NAME, cause);
        }
        self.fail_all(cause)
    }

    /// Close the context
    ///
    /// Pending registrations end CANCELLED and every later send or
    /// registration fails with [`ConversationError::Closed`]. Idempotent.
    pub fn close(&self) -> usize {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let cancelled = self
            .shared
            .pending()
            .iter()
            .filter(|registration| self.shared.cancel(registration))
            .count();
        info!(
            "{} conversation context closed ({} pending cancelled)",
            P::NAME,
            cancelled
        );
        cancelled
    }
}

impl<P: Protocol> fmt::Debug for ConversationContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationContext")
            .field("protocol", &P::NAME)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
