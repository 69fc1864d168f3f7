//! Single-flight refresh coordination for rejected requests.
//!
//! The first caller to find no refresh in flight becomes the owner: it sets
//! the in-flight flag and starts the refresh on its own task, so abandoning
//! the owner's request cannot abort it. Every caller, the owner included,
//! then waits on a oneshot continuation in a FIFO queue. When the refresh
//! finishes, all queued continuations receive the same outcome and the flag
//! clears in the same critical section.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::session::SessionManager;

/// How long a caller waits for someone else's refresh by default.
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed,
}

/// The caller gave up waiting for the refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimedOut;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<RefreshOutcome>,
}

#[derive(Default)]
struct Queue {
    in_flight: bool,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

/// Removes a waiter that stops waiting before it was released.
struct WaiterGuard<'a> {
    queue: &'a Mutex<Queue>,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut queue = self.queue.lock();
        if let Some(pos) = queue.waiters.iter().position(|w| w.id == self.id) {
            queue.waiters.remove(pos);
            debug!(waiter = self.id, "Removed abandoned refresh waiter");
        }
    }
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    session: SessionManager,
    queue: Arc<Mutex<Queue>>,
    wait_timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(session: SessionManager) -> Self {
        Self {
            session,
            queue: Arc::new(Mutex::new(Queue::default())),
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn is_in_flight(&self) -> bool {
        self.queue.lock().in_flight
    }

    pub fn pending_waiters(&self) -> usize {
        self.queue.lock().waiters.len()
    }

    /// Refresh the session, or join the refresh already underway.
    pub async fn recover(&self) -> Result<RefreshOutcome, WaitTimedOut> {
        self.recover_within(self.wait_timeout).await
    }

    pub async fn recover_within(&self, timeout: Duration) -> Result<RefreshOutcome, WaitTimedOut> {
        let (id, rx, owner) = {
            let mut queue = self.queue.lock();
            let id = queue.next_id;
            queue.next_id += 1;
            let (tx, rx) = oneshot::channel();
            queue.waiters.push_back(Waiter { id, tx });
            let owner = !queue.in_flight;
            queue.in_flight = true;
            (id, rx, owner)
        };

        if owner {
            debug!(waiter = id, "No refresh in flight, starting one");
            self.start_refresh();
        } else {
            debug!(waiter = id, "Refresh already in flight, waiting for it");
        }

        let _guard = WaiterGuard {
            queue: &self.queue,
            id,
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // The refresh task went away without reporting.
            Ok(Err(_)) => Ok(RefreshOutcome::Failed),
            Err(_) => {
                warn!(waiter = id, "Timed out waiting for token refresh");
                Err(WaitTimedOut)
            }
        }
    }

    fn start_refresh(&self) {
        let session = self.session.clone();
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            let outcome = if session.refresh().await {
                RefreshOutcome::Refreshed
            } else {
                RefreshOutcome::Failed
            };
            let waiters = {
                let mut queue = queue.lock();
                queue.in_flight = false;
                std::mem::take(&mut queue.waiters)
            };
            debug!(waiters = waiters.len(), ?outcome, "Releasing refresh waiters");
            for waiter in waiters {
                // A waiter that has already given up is fine to skip.
                let _ = waiter.tx.send(outcome);
            }
        });
    }
}
