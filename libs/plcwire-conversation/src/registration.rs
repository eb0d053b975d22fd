//! Handler Registration
//!
//! One pending expectation: the expected packet type, an ordered step chain of
//! predicates and unwraps, the terminal consumer and its failure callbacks.
//!
//! ```text
//!                 ┌──────────► HANDLED
//!                 │
//! REGISTERED ──claim──┬──────► ERRORED
//!                     ├──────► TIMED_OUT
//!                     └──────► CANCELLED
//! ```
//!
//! Whoever wins the `claim` compare-exchange (dispatcher, timeout scheduler,
//! cancellation or connection teardown) owns the callbacks and performs the
//! single terminal transition. Every other contender sees the claim fail and
//! does nothing.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::context::Shared;
use crate::error::ConversationError;
use crate::protocol::Protocol;

/// Type-erased value flowing through a step chain
pub(crate) type Erased = Box<dyn Any + Send>;

pub(crate) type Consumer = Box<dyn FnOnce(Erased) -> anyhow::Result<()> + Send>;
pub(crate) type TimeoutHandler = Box<dyn FnOnce(ConversationError) + Send>;
pub(crate) type ErrorHandler<Pk> = Box<dyn FnOnce(ConversationError, Option<Pk>) + Send>;

const REGISTERED: u8 = 0;
const CLAIMED: u8 = 1;
const HANDLED: u8 = 2;
const TIMED_OUT: u8 = 3;
const CANCELLED: u8 = 4;
const ERRORED: u8 = 5;

/// Identifier of a registration, unique per conversation context
///
/// Identifiers are allocated in registration order, which is also the scan
/// order of the expectation registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationId(pub(crate) u64);

impl RegistrationId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Waiting for a match (also reported while a consumer is still running)
    Registered,
    /// Matched and the consumer returned normally
    Handled,
    /// Deadline elapsed before a match
    TimedOut,
    /// Cancelled explicitly or by closing the context
    Cancelled,
    /// Consumer failed, the connection failed, or the request could not be written
    Errored,
}

impl RegistrationState {
    fn from_code(code: u8) -> Self {
        match code {
            HANDLED => RegistrationState::Handled,
            TIMED_OUT => RegistrationState::TimedOut,
            CANCELLED => RegistrationState::Cancelled,
            ERRORED => RegistrationState::Errored,
            _ => RegistrationState::Registered,
        }
    }

    /// Check if no further transition can happen
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RegistrationState::Registered)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Registered => write!(f, "REGISTERED"),
            RegistrationState::Handled => write!(f, "HANDLED"),
            RegistrationState::TimedOut => write!(f, "TIMED_OUT"),
            RegistrationState::Cancelled => write!(f, "CANCELLED"),
            RegistrationState::Errored => write!(f, "ERRORED"),
        }
    }
}

/// Terminal result of a registration, delivered exactly once
#[derive(Debug, Clone)]
pub enum Outcome {
    Handled,
    TimedOut,
    Cancelled,
    Errored(ConversationError),
}

impl Outcome {
    /// State the registration ended in
    pub fn state(&self) -> RegistrationState {
        match self {
            Outcome::Handled => RegistrationState::Handled,
            Outcome::TimedOut => RegistrationState::TimedOut,
            Outcome::Cancelled => RegistrationState::Cancelled,
            Outcome::Errored(_) => RegistrationState::Errored,
        }
    }
}

/// One link of the step chain
pub(crate) enum Step {
    /// The current value must satisfy the predicate
    Predicate(Box<dyn Fn(&(dyn Any + Send)) -> bool + Send + Sync>),
    /// Replace the current value with a narrower one
    Unwrap(Box<dyn Fn(Erased) -> Option<Erased> + Send + Sync>),
}

impl Step {
    pub(crate) fn predicate<T, F>(predicate: F) -> Self
    where
        T: Send + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Step::Predicate(Box::new(move |value| {
            value.downcast_ref::<T>().is_some_and(|v| predicate(v))
        }))
    }

    pub(crate) fn unwrap<T, U, F>(transform: F) -> Self
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Step::Unwrap(Box::new(move |value| {
            // A value of the wrong type is not unwrappable: the chain does not match
            value
                .downcast::<T>()
                .ok()
                .map(|v| Box::new(transform(*v)) as Erased)
        }))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Predicate(_) => write!(f, "Predicate"),
            Step::Unwrap(_) => write!(f, "Unwrap"),
        }
    }
}

/// Type gate at the head of the step chain
pub(crate) struct ExpectedType<Pk> {
    type_name: &'static str,
    convert: Box<dyn Fn(Pk) -> Option<Erased> + Send + Sync>,
}

impl<Pk: 'static> ExpectedType<Pk> {
    /// Accept packets convertible into `T`
    pub(crate) fn of<T>() -> Self
    where
        T: TryFrom<Pk> + Send + 'static,
    {
        Self {
            type_name: std::any::type_name::<T>(),
            convert: Box::new(|packet| T::try_from(packet).ok().map(|v| Box::new(v) as Erased)),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }
}

struct Callbacks<Pk> {
    consumer: Consumer,
    on_timeout: Option<TimeoutHandler>,
    on_error: Option<ErrorHandler<Pk>>,
    completion: oneshot::Sender<Outcome>,
}

/// Everything the builder hands over when a chain is terminated
pub(crate) struct RegistrationSpec<Pk> {
    pub name: String,
    pub expected: ExpectedType<Pk>,
    pub steps: Vec<Step>,
    pub timeout: Duration,
    pub consumer: Consumer,
    pub on_timeout: Option<TimeoutHandler>,
    pub on_error: Option<ErrorHandler<Pk>>,
}

pub(crate) struct Registration<P: Protocol> {
    id: RegistrationId,
    name: String,
    key: Option<P::Key>,
    expected: ExpectedType<P::Packet>,
    steps: Vec<Step>,
    timeout: Duration,
    state: AtomicU8,
    callbacks: Mutex<Option<Callbacks<P::Packet>>>,
}

impl<P: Protocol> Registration<P> {
    pub(crate) fn new(
        id: RegistrationId,
        key: Option<P::Key>,
        spec: RegistrationSpec<P::Packet>,
    ) -> (Self, oneshot::Receiver<Outcome>) {
        let (completion, receiver) = oneshot::channel();
        let registration = Self {
            id,
            name: spec.name,
            key,
            expected: spec.expected,
            steps: spec.steps,
            timeout: spec.timeout,
            state: AtomicU8::new(REGISTERED),
            callbacks: Mutex::new(Some(Callbacks {
                consumer: spec.consumer,
                on_timeout: spec.on_timeout,
                on_error: spec.on_error,
                completion,
            })),
        };
        (registration, receiver)
    }

    pub(crate) fn id(&self) -> RegistrationId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn key(&self) -> Option<P::Key> {
        self.key
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn state(&self) -> RegistrationState {
        RegistrationState::from_code(self.state.load(Ordering::Acquire))
    }

    /// Still waiting and not claimed by anyone
    pub(crate) fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == REGISTERED
    }

    /// Run the type gate and the step chain against a packet
    ///
    /// Returns the final (possibly unwrapped) value on a full match. The
    /// registration itself is not modified.
    pub(crate) fn try_match(&self, packet: &P::Packet) -> Option<Erased> {
        let mut value = (self.expected.convert)(packet.clone())?;
        for step in &self.steps {
            match step {
                Step::Predicate(predicate) => {
                    if !predicate(value.as_ref()) {
                        return None;
                    }
                },
                Step::Unwrap(transform) => {
                    value = transform(value)?;
                },
            }
        }
        Some(value)
    }

    /// Single atomic claim on the terminal transition; first caller wins
    pub(crate) fn claim(&self) -> bool {
        self.state
            .compare_exchange(REGISTERED, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_callbacks(&self) -> Option<Callbacks<P::Packet>> {
        let callbacks = self.callbacks.lock().take();
        if callbacks.is_none() {
            // Only reachable if a caller skipped `claim`
            warn!("{} {} completed twice", self.name, self.id);
        }
        callbacks
    }

    fn finish(&self, code: u8, completion: oneshot::Sender<Outcome>, outcome: Outcome) -> Outcome {
        self.state.store(code, Ordering::Release);
        // The handle may have been dropped; nobody is waiting then
        let _ = completion.send(outcome.clone());
        outcome
    }

    /// Deliver a matched value to the consumer. Caller must hold the claim.
    pub(crate) fn complete_matched(&self, value: Erased, packet: P::Packet) -> Outcome {
        let Some(callbacks) = self.take_callbacks() else {
            return Outcome::Handled;
        };
        let Callbacks {
            consumer,
            on_error,
            completion,
            ..
        } = callbacks;

        let result = panic::catch_unwind(AssertUnwindSafe(move || consumer(value)));
        let failure = match result {
            Ok(Ok(())) => {
                debug!("{} {} handled", self.name, self.id);
                return self.finish(HANDLED, completion, Outcome::Handled);
            },
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => format!("consumer panicked: {}", panic_message(payload.as_ref())),
        };

        let error = ConversationError::Consumer {
            name: self.name.clone(),
            message: failure,
        };
        match on_error {
            Some(handler) => {
                let signal = error.clone();
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(move || handler(signal, Some(packet))))
                {
                    warn!(
                        "{} {} error handler panicked: {}",
                        self.name,
                        self.id,
                        panic_message(payload.as_ref())
                    );
                }
            },
            None => warn!("{} {} consumer failed: {}", self.name, self.id, error),
        }
        self.finish(ERRORED, completion, Outcome::Errored(error))
    }

    /// Deadline elapsed. Caller must hold the claim.
    pub(crate) fn complete_timed_out(&self) -> Outcome {
        let Some(callbacks) = self.take_callbacks() else {
            return Outcome::TimedOut;
        };
        let signal = ConversationError::Timeout {
            name: self.name.clone(),
            timeout: self.timeout,
        };
        match callbacks.on_timeout {
            Some(handler) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || handler(signal)))
                {
                    warn!(
                        "{} {} timeout handler panicked: {}",
                        self.name,
                        self.id,
                        panic_message(payload.as_ref())
                    );
                }
            },
            None => warn!(
                "{} {} timed out after {:?} (no timeout handler)",
                self.name, self.id, self.timeout
            ),
        }
        self.finish(TIMED_OUT, callbacks.completion, Outcome::TimedOut)
    }

    /// Cancelled before a match. Caller must hold the claim.
    pub(crate) fn complete_cancelled(&self) -> Outcome {
        let Some(callbacks) = self.take_callbacks() else {
            return Outcome::Cancelled;
        };
        debug!("{} {} cancelled", self.name, self.id);
        self.finish(CANCELLED, callbacks.completion, Outcome::Cancelled)
    }

    /// Failed without a match. Caller must hold the claim.
    ///
    /// With `notify` the error handler (if any) is invoked, otherwise the
    /// failure is only reported through the outcome.
    pub(crate) fn complete_errored(&self, error: ConversationError, notify: bool) -> Outcome {
        let Some(callbacks) = self.take_callbacks() else {
            return Outcome::Errored(error);
        };
        match callbacks.on_error {
            Some(handler) if notify => {
                let signal = error.clone();
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(move || handler(signal, None)))
                {
                    warn!(
                        "{} {} error handler panicked: {}",
                        self.name,
                        self.id,
                        panic_message(payload.as_ref())
                    );
                }
            },
            _ if notify => warn!("{} {} failed: {}", self.name, self.id, error),
            _ => {},
        }
        self.finish(ERRORED, callbacks.completion, Outcome::Errored(error))
    }
}

impl<P: Protocol> fmt::Debug for Registration<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("key", &self.key)
            .field("expected", &self.expected.type_name)
            .field("steps", &self.steps)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Cancels a registration from anywhere, including while its handle is awaited
pub struct CancelHandle<P: Protocol> {
    registration: Arc<Registration<P>>,
    shared: Weak<Shared<P>>,
}

impl<P: Protocol> Clone for CancelHandle<P> {
    fn clone(&self) -> Self {
        Self {
            registration: Arc::clone(&self.registration),
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<P: Protocol> CancelHandle<P> {
    /// Cancel the registration
    ///
    /// Returns `true` if this call performed the transition; cancelling a
    /// registration that already reached a terminal state is a no-op.
    pub fn cancel(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.cancel(&self.registration),
            None => {
                if self.registration.claim() {
                    self.registration.complete_cancelled();
                    true
                } else {
                    false
                }
            },
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.registration.state()
    }
}

/// Handle returned by a terminated builder chain
pub struct RegistrationHandle<P: Protocol> {
    canceller: CancelHandle<P>,
    completion: oneshot::Receiver<Outcome>,
}

impl<P: Protocol> RegistrationHandle<P> {
    pub(crate) fn new(
        registration: Arc<Registration<P>>,
        shared: Weak<Shared<P>>,
        completion: oneshot::Receiver<Outcome>,
    ) -> Self {
        Self {
            canceller: CancelHandle {
                registration,
                shared,
            },
            completion,
        }
    }

    pub fn id(&self) -> RegistrationId {
        self.canceller.registration.id()
    }

    pub fn name(&self) -> &str {
        self.canceller.registration.name()
    }

    pub fn timeout(&self) -> Duration {
        self.canceller.registration.timeout()
    }

    pub fn state(&self) -> RegistrationState {
        self.canceller.registration.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// See [`CancelHandle::cancel`]
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    /// Detached canceller usable while [`completion`](Self::completion) is awaited
    pub fn cancel_handle(&self) -> CancelHandle<P> {
        self.canceller.clone()
    }

    /// Wait for the terminal outcome
    pub async fn completion(self) -> Outcome {
        // A dropped sender means the registration was discarded unfinished
        self.completion.await.unwrap_or(Outcome::Cancelled)
    }
}

impl<P: Protocol> fmt::Debug for RegistrationHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
