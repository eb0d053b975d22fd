//! Request Transaction Manager
//!
//! Bounds how many requests a connection keeps in flight. Each request takes
//! a slot before it is sent and gives it back when it ends, fails or is
//! dropped. Waiters are served in FIFO order (Tokio's semaphore is fair).

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{ConversationError, Result};

#[derive(Debug)]
struct Inner {
    semaphore: Arc<Semaphore>,
    max_concurrent: AtomicUsize,
    active: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    idle: Notify,
}

/// Per-connection limiter for in-flight requests
#[derive(Clone)]
pub struct RequestTransactionManager {
    inner: Arc<Inner>,
}

impl RequestTransactionManager {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent: AtomicUsize::new(max_concurrent),
                active: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    fn closed_error() -> ConversationError {
        ConversationError::closed("request transaction manager")
    }

    /// Wait for a free slot and open a transaction
    pub async fn start_request(&self) -> Result<RequestTransaction> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Self::closed_error())?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = self.inner.active.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Transaction {} started ({} active)", id, active);
        Ok(RequestTransaction {
            id,
            permit: Some(permit),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Run `operation` inside a transaction, ending or failing it by its result
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let transaction = self.start_request().await?;
        match operation().await {
            Ok(value) => {
                transaction.end_request();
                Ok(value)
            },
            Err(e) => {
                transaction.fail_request(&e);
                Err(e)
            },
        }
    }

    pub fn active_requests(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Change the slot count
    ///
    /// Growing takes effect immediately. Shrinking retires slots as running
    /// transactions end, so it needs a Tokio runtime.
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<()> {
        if max_concurrent == 0 {
            return Err(ConversationError::config("max_concurrent must be > 0"));
        }
        let previous = self.inner.max_concurrent.swap(max_concurrent, Ordering::AcqRel);
        if max_concurrent > previous {
            self.inner.semaphore.add_permits(max_concurrent - previous);
        } else if max_concurrent < previous {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| ConversationError::NoRuntime(e.to_string()))?;
            let retire = (previous - max_concurrent) as u32;
            let semaphore = Arc::clone(&self.inner.semaphore);
            runtime.spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(retire).await {
                    permits.forget();
                }
            });
        }
        info!("Max concurrent requests: {} -> {}", previous, max_concurrent);
        Ok(())
    }

    /// Close immediately: waiting and future `start_request` calls fail
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.semaphore.close();
            info!(
                "Transaction manager closed ({} still active)",
                self.active_requests()
            );
        }
    }

    /// Stop accepting requests and wait for running ones to end
    ///
    /// Returns `true` if every transaction ended within `timeout`.
    pub async fn close_graceful(&self, timeout: Duration) -> bool {
        self.close();
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.inner.idle.notified();
                if self.active_requests() == 0 {
                    break;
                }
                idle.await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                "Graceful close timed out after {:?} ({} still active)",
                timeout,
                self.active_requests()
            );
        }
        drained
    }
}

impl std::fmt::Debug for RequestTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTransactionManager")
            .field("max_concurrent", &self.max_concurrent())
            .field("active", &self.active_requests())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One occupied slot; dropping it frees the slot
#[derive(Debug)]
pub struct RequestTransaction {
    id: u64,
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl RequestTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn end_request(self) {
        debug!("Transaction {} ended", self.id);
    }

    pub fn fail_request(self, error: &ConversationError) {
        debug!("Transaction {} failed: {}", self.id, error);
    }
}

impl Drop for RequestTransaction {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            let remaining = self.inner.active.fetch_sub(1, Ordering::AcqRel) - 1;
            drop(permit);
            if remaining == 0 {
                self.inner.idle.notify_waiters();
            }
        }
    }
}
