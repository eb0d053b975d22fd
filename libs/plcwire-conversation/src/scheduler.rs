//! Timeout scheduler
//!
//! One background task per conversation context drives a `DelayQueue` of
//! registration deadlines. Registrations are held weakly: a registration that
//! completed and was dropped simply expires into nothing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace, Instrument};

use crate::context::Shared;
use crate::protocol::Protocol;
use crate::registration::{Registration, RegistrationId};

/// Longest deadline armed as requested; `DelayQueue` panics past about two years
pub(crate) const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

enum Command<P: Protocol> {
    Schedule {
        id: RegistrationId,
        timeout: Duration,
        registration: Weak<Registration<P>>,
    },
    Cancel(RegistrationId),
}

pub(crate) struct TimeoutScheduler<P: Protocol> {
    commands: mpsc::UnboundedSender<Command<P>>,
}

impl<P: Protocol> TimeoutScheduler<P> {
    /// Spawn the scheduler task on `runtime`
    ///
    /// The task stops once the scheduler (and with it the command sender) is
    /// dropped together with the owning context. Deadline handling runs in
    /// the span that was current when the context was created.
    pub(crate) fn start(runtime: &Handle, shared: Weak<Shared<P>>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        runtime.spawn(run(rx, shared).in_current_span());
        Self { commands }
    }

    pub(crate) fn schedule(&self, registration: &Arc<Registration<P>>) {
        let mut timeout = registration.timeout();
        if timeout > MAX_DEADLINE {
            debug!(
                "{} deadline of {} capped at {:?} (requested {:?})",
                P::NAME,
                registration.id(),
                MAX_DEADLINE,
                timeout
            );
            timeout = MAX_DEADLINE;
        }
        let _ = self.commands.send(Command::Schedule {
            id: registration.id(),
            timeout,
            registration: Arc::downgrade(registration),
        });
    }

    pub(crate) fn cancel(&self, id: RegistrationId) {
        let _ = self.commands.send(Command::Cancel(id));
    }
}

async fn run<P: Protocol>(
    mut commands: mpsc::UnboundedReceiver<Command<P>>,
    shared: Weak<Shared<P>>,
) {
    let mut deadlines: DelayQueue<(RegistrationId, Weak<Registration<P>>)> = DelayQueue::new();
    let mut keys: HashMap<RegistrationId, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Schedule { id, timeout, registration }) => {
                    let key = deadlines.insert((id, registration), timeout);
                    keys.insert(id, key);
                },
                Some(Command::Cancel(id)) => {
                    // Absent when the deadline already fired
                    if let Some(key) = keys.remove(&id) {
                        deadlines.remove(&key);
                    }
                },
                None => break,
            },
            Some(expired) = deadlines.next(), if !deadlines.is_empty() => {
                let (id, registration) = expired.into_inner();
                keys.remove(&id);
                match (shared.upgrade(), registration.upgrade()) {
                    (Some(shared), Some(registration)) => shared.expire(&registration),
                    _ => trace!("deadline {} fired for a dropped registration", id),
                }
            },
        }
    }

    debug!("{} timeout scheduler stopped", P::NAME);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use crate::config::ConversationConfig;
    use crate::context::ConversationContext;
    use crate::dispatcher::DispatchOutcome;
    use crate::error::ConversationError;
    use crate::registration::{Outcome, RegistrationState};
    use crate::testing::{PlainProtocol, RecordingSink, TestPacket, TypeA};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn plain() -> (
        ConversationContext<PlainProtocol>,
        crate::dispatcher::Dispatcher<PlainProtocol>,
    ) {
        ConversationContext::new(ConversationConfig::default(), RecordingSink::default()).unwrap()
    }

    #[tokio::test]
    async fn test_unanswered_registration_times_out_once() {
        let (ctx, mut dispatcher) = plain();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let consumed = Arc::new(AtomicUsize::new(0));

        let timeouts_clone = Arc::clone(&timeouts);
        let consumed_clone = Arc::clone(&consumed);
        let handle = ctx
            .expect_request::<TypeA>(Duration::from_millis(50))
            .on_timeout(move |err| {
                assert!(matches!(err, ConversationError::Timeout { .. }));
                timeouts_clone.fetch_add(1, Ordering::SeqCst);
            })
            .handle(move |_| {
                consumed_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.state(), RegistrationState::TimedOut);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.pending_count(), 0);

        // A late packet no longer matches anything
        assert_eq!(
            dispatcher.dispatch(TestPacket::A(TypeA { id: 1 })),
            DispatchOutcome::Unsolicited
        );
        assert_eq!(consumed.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.stats().timed_out, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_timeout_without_handler_is_logged() {
        let (ctx, _dispatcher) = plain();
        let handle = ctx
            .expect_request::<TypeA>(Duration::from_millis(10))
            .name("read-state")
            .handle(|_| Ok(()))
            .unwrap();

        assert!(matches!(handle.completion().await, Outcome::TimedOut));
        assert!(logs_contain("read-state"));
        assert!(logs_contain("no timeout handler"));
    }

    #[tokio::test]
    async fn test_cancel_disarms_deadline() {
        let (ctx, mut dispatcher) = plain();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let timeouts_clone = Arc::clone(&timeouts);
        let handle = ctx
            .expect_request::<TypeA>(Duration::from_millis(20))
            .on_timeout(move |_| {
                timeouts_clone.fetch_add(1, Ordering::SeqCst);
            })
            .handle(|_| Ok(()))
            .unwrap();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.state(), RegistrationState::Cancelled);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(
            dispatcher.dispatch(TestPacket::A(TypeA { id: 1 })),
            DispatchOutcome::Unsolicited
        );
        assert_eq!(handle.state(), RegistrationState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_completion() {
        let (ctx, _dispatcher) = plain();
        let handle = ctx
            .expect_request::<TypeA>(Duration::from_secs(5))
            .handle(|_| Ok(()))
            .unwrap();
        let canceller = handle.cancel_handle();

        let waiter = tokio::spawn(handle.completion());
        tokio::task::yield_now().await;
        assert!(canceller.cancel());
        assert!(matches!(waiter.await.unwrap(), Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_huge_timeout_keeps_scheduler_running() {
        let (ctx, _dispatcher) = plain();
        let forever = ctx
            .expect_request::<TypeA>(Duration::from_secs(10 * 365 * 24 * 60 * 60))
            .handle(|_| Ok(()))
            .unwrap();
        let unbounded = ctx
            .expect_request::<TypeA>(Duration::MAX)
            .handle(|_| Ok(()))
            .unwrap();

        let timeouts = Arc::new(AtomicUsize::new(0));
        let timeouts_clone = Arc::clone(&timeouts);
        let short = ctx
            .expect_request::<TypeA>(Duration::from_millis(20))
            .on_timeout(move |_| {
                timeouts_clone.fetch_add(1, Ordering::SeqCst);
            })
            .handle(|_| Ok(()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(short.state(), RegistrationState::TimedOut);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);

        // Long deadlines stay armed and still cancel cleanly
        assert_eq!(forever.state(), RegistrationState::Registered);
        assert!(forever.cancel());
        assert!(unbounded.cancel());
        assert_eq!(ctx.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_response_racing_deadline_completes_once() {
        let (ctx, dispatcher) = plain();
        let dispatcher = Arc::new(parking_lot::Mutex::new(dispatcher));

        for round in 0..50u32 {
            let fired = Arc::new(AtomicUsize::new(0));
            let on_timeout = Arc::clone(&fired);
            let on_handle = Arc::clone(&fired);
            let handle = ctx
                .expect_request::<TypeA>(Duration::from_millis(5))
                .on_timeout(move |_| {
                    on_timeout.fetch_add(1, Ordering::SeqCst);
                })
                .handle(move |_| {
                    on_handle.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();

            let dispatcher = Arc::clone(&dispatcher);
            let responder = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                dispatcher.lock().dispatch(TestPacket::A(TypeA { id: round }));
            });

            let outcome = handle.completion().await;
            responder.await.unwrap();
            assert!(matches!(outcome, Outcome::Handled | Outcome::TimedOut));
            assert_eq!(fired.load(Ordering::SeqCst), 1, "round {}", round);
        }
        assert_eq!(ctx.pending_count(), 0);
    }
}
