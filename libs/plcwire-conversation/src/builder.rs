//! Send/expect builder chains
//!
//! A chain declares the expected response type, narrows it with `check` and
//! `unwrap` steps, attaches optional timeout/error callbacks and is terminated
//! by `handle` (callback style) or `response` (awaitable style).
//!
//! Chain misuse is recorded when it happens and reported by the terminal
//! call; in that case nothing is registered and nothing is written.

use std::marker::PhantomData;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::context::ConversationContext;
use crate::error::{ConversationError, Result, WiringError};
use crate::protocol::Protocol;
use crate::registration::{
    Consumer, ErrorHandler, ExpectedType, Outcome, RegistrationHandle, RegistrationSpec, Step,
    TimeoutHandler,
};

/// Placeholder response type before `expect_response` was called
#[derive(Debug, Clone, Copy)]
pub struct Unexpected;

/// Submission mode: write a request, then wait for its response
pub struct Outbound<P: Protocol> {
    request: P::Packet,
}

/// Submission mode: only wait for an incoming packet
pub struct Inbound;

pub type SendRequestBuilder<P, T = Unexpected> = ConversationBuilder<P, T, Outbound<P>>;
pub type ExpectRequestBuilder<P, T> = ConversationBuilder<P, T, Inbound>;

struct Chain<P: Protocol> {
    name: Option<String>,
    expected: Option<ExpectedType<P::Packet>>,
    steps: Vec<Step>,
    timeout: Option<Duration>,
    on_timeout: Option<TimeoutHandler>,
    on_error: Option<ErrorHandler<P::Packet>>,
    wiring_error: Option<WiringError>,
}

impl<P: Protocol> Chain<P> {
    fn new() -> Self {
        Self {
            name: None,
            expected: None,
            steps: Vec::new(),
            timeout: None,
            on_timeout: None,
            on_error: None,
            wiring_error: None,
        }
    }

    /// Keep the first misuse only
    fn fail(&mut self, error: WiringError) {
        if self.wiring_error.is_none() {
            self.wiring_error = Some(error);
        }
    }

    fn into_spec(self, consumer: Consumer, default_timeout: Duration) -> Result<RegistrationSpec<P::Packet>> {
        if let Some(error) = self.wiring_error {
            return Err(error.into());
        }
        let expected = self.expected.ok_or(WiringError::MissingExpectation)?;
        let name = self
            .name
            .unwrap_or_else(|| short_type_name(expected.type_name()).to_string());
        Ok(RegistrationSpec {
            name,
            expected,
            steps: self.steps,
            timeout: self.timeout.unwrap_or(default_timeout),
            consumer,
            on_timeout: self.on_timeout,
            on_error: self.on_error,
        })
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    // "crate::module::Type" -> "Type"; generics are left as they are
    match full.find('<') {
        Some(_) => full,
        None => full.rsplit("::").next().unwrap_or(full),
    }
}

/// Builder chain shared by requests and passive expectations
///
/// `T` is the type the chain currently produces and `S` the submission mode.
#[must_use = "a conversation chain does nothing until `handle` or `response` is called"]
pub struct ConversationBuilder<P: Protocol, T, S> {
    context: ConversationContext<P>,
    submission: S,
    chain: Chain<P>,
    _produces: PhantomData<fn() -> T>,
}

impl<P: Protocol> ConversationBuilder<P, Unexpected, Outbound<P>> {
    pub(crate) fn for_request(context: ConversationContext<P>, request: P::Packet) -> Self {
        Self {
            context,
            submission: Outbound { request },
            chain: Chain::new(),
            _produces: PhantomData,
        }
    }
}

impl<P: Protocol, T> ConversationBuilder<P, T, Inbound>
where
    T: TryFrom<P::Packet> + Send + 'static,
{
    pub(crate) fn for_expectation(context: ConversationContext<P>, timeout: Duration) -> Self {
        let mut chain = Chain::new();
        chain.expected = Some(ExpectedType::of::<T>());
        chain.timeout = Some(timeout);
        Self {
            context,
            submission: Inbound,
            chain,
            _produces: PhantomData,
        }
    }
}

impl<P: Protocol, T, S> ConversationBuilder<P, T, S> {
    fn produce<U>(self) -> ConversationBuilder<P, U, S> {
        ConversationBuilder {
            context: self.context,
            submission: self.submission,
            chain: self.chain,
            _produces: PhantomData,
        }
    }

    /// Name used in logs and errors (defaults to the expected type's name)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        if self.chain.name.is_some() {
            self.chain.fail(WiringError::DuplicateName);
        } else {
            self.chain.name = Some(name.into());
        }
        self
    }

    /// Declare the response type and its timeout
    pub fn expect_response<U>(mut self, timeout: Duration) -> ConversationBuilder<P, U, S>
    where
        U: TryFrom<P::Packet> + Send + 'static,
    {
        if self.chain.expected.is_some() {
            self.chain.fail(WiringError::DuplicateExpectation);
        } else {
            self.chain.expected = Some(ExpectedType::of::<U>());
            self.chain.timeout = Some(timeout);
        }
        self.produce()
    }

    /// Only accept values satisfying `predicate`
    pub fn check<F>(mut self, predicate: F) -> Self
    where
        T: Send + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if self.chain.expected.is_none() {
            self.chain.fail(WiringError::CheckBeforeExpectation);
        } else {
            self.chain.steps.push(Step::predicate(predicate));
        }
        self
    }

    /// Narrow the current value; later steps and the consumer see the result
    pub fn unwrap<U, F>(mut self, transform: F) -> ConversationBuilder<P, U, S>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        if self.chain.expected.is_none() {
            self.chain.fail(WiringError::UnwrapBeforeExpectation);
        } else {
            self.chain.steps.push(Step::unwrap(transform));
        }
        self.produce()
    }

    /// Called once with [`ConversationError::Timeout`] if the deadline elapses
    pub fn on_timeout<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(ConversationError) + Send + 'static,
    {
        if self.chain.on_timeout.is_some() {
            self.chain.fail(WiringError::DuplicateTimeoutHandler);
        } else {
            self.chain.on_timeout = Some(Box::new(handler));
        }
        self
    }

    /// Called once if the consumer fails or the connection is torn down
    ///
    /// The packet is the one that matched, when there was one.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(ConversationError, Option<P::Packet>) + Send + 'static,
    {
        if self.chain.on_error.is_some() {
            self.chain.fail(WiringError::DuplicateErrorHandler);
        } else {
            self.chain.on_error = Some(Box::new(handler));
        }
        self
    }
}

fn erase_consumer<T, F>(consumer: F) -> Consumer
where
    T: Send + 'static,
    F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
{
    Box::new(move |value| match value.downcast::<T>() {
        Ok(value) => consumer(*value),
        Err(_) => Err(anyhow::anyhow!(
            "step chain produced a value that is not {}",
            std::any::type_name::<T>()
        )),
    })
}

async fn await_response<P: Protocol, T>(
    handle: RegistrationHandle<P>,
    value: oneshot::Receiver<T>,
) -> Result<T> {
    let name = handle.name().to_string();
    let timeout = handle.timeout();
    match handle.completion().await {
        Outcome::Handled => value
            .await
            .map_err(|_| ConversationError::Cancelled(name)),
        Outcome::TimedOut => Err(ConversationError::Timeout { name, timeout }),
        Outcome::Cancelled => Err(ConversationError::Cancelled(name)),
        Outcome::Errored(error) => Err(error),
    }
}

fn forward<T: Send + 'static>(tx: oneshot::Sender<T>) -> impl FnOnce(T) -> anyhow::Result<()> + Send {
    move |value| {
        tx.send(value)
            .map_err(|_| anyhow::anyhow!("response receiver dropped"))
    }
}

impl<P: Protocol, T: Send + 'static> ConversationBuilder<P, T, Outbound<P>> {
    /// Register the chain, then write the request
    ///
    /// Fails synchronously on chain misuse, a live duplicate correlation key,
    /// a closed context or a failed write. None of these invoke a callback.
    pub fn handle<F>(self, consumer: F) -> Result<RegistrationHandle<P>>
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        let spec = self
            .chain
            .into_spec(erase_consumer(consumer), self.context.default_timeout())?;
        self.context
            .shared
            .register(spec, Some(self.submission.request))
    }

    /// Send the request and wait for the (unwrapped) response
    pub async fn response(self) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        let handle = self.handle(forward(tx))?;
        await_response(handle, rx).await
    }
}

impl<P: Protocol, T: Send + 'static> ConversationBuilder<P, T, Inbound> {
    /// Register the expectation
    pub fn handle<F>(self, consumer: F) -> Result<RegistrationHandle<P>>
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        let spec = self
            .chain
            .into_spec(erase_consumer(consumer), self.context.default_timeout())?;
        self.context.shared.register(spec, None)
    }

    /// Wait for the next matching packet
    pub async fn response(self) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        let handle = self.handle(forward(tx))?;
        await_response(handle, rx).await
    }
}
