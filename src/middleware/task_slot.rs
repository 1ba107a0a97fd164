// At-most-one-in-flight slot for cancellable work
//
// Starting new work in a slot cancels whatever the slot was running. Work
// finishes through `finish`, which only runs the commit closure while the
// ticket is still the current one, so superseded work can never publish.

use parking_lot::Mutex;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::core::errors::{CoreError, CoreResult};

/// Handle held by one unit of work
#[derive(Debug, Clone)]
pub struct TaskTicket {
    generation: u64,
    token: CancellationToken,
}

impl TaskTicket {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Await `fut` unless the ticket is cancelled first. Cancellation drops
    /// the future, so any late response is discarded.
    pub async fn run<F, T>(&self, fut: F) -> CoreResult<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CoreError::Cancelled),
            value = fut => Ok(value),
        }
    }

    /// Like `run` for fallible futures
    pub async fn run_result<F, T>(&self, fut: F) -> CoreResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        self.run(fut).await?
    }
}

#[derive(Default)]
struct SlotInner {
    generation: u64,
    current: Option<CancellationToken>,
}

impl SlotInner {
    fn owned_by(&self, ticket: &TaskTicket) -> bool {
        self.generation == ticket.generation
            && self.current.is_some()
            && !ticket.token.is_cancelled()
    }
}

#[derive(Default)]
pub struct TaskSlot {
    inner: Mutex<SlotInner>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the running work, if any, and hand out a fresh ticket
    pub fn begin(&self) -> TaskTicket {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.current.take() {
            previous.cancel();
        }
        inner.generation += 1;
        let token = CancellationToken::new();
        inner.current = Some(token.clone());
        TaskTicket {
            generation: inner.generation,
            token,
        }
    }

    /// Cancel the running work. Returns whether anything was running.
    pub fn cancel(&self) -> bool {
        self.cancel_with(|| ())
    }

    /// `cancel`, running `then` under the slot lock afterwards
    pub fn cancel_with(&self, then: impl FnOnce()) -> bool {
        let mut inner = self.inner.lock();
        let was_running = match inner.current.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        then();
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    /// Run `f` under the slot lock if `ticket` still owns the slot, keeping
    /// the work running
    pub fn update<T>(&self, ticket: &TaskTicket, f: impl FnOnce() -> T) -> Option<T> {
        let inner = self.inner.lock();
        inner.owned_by(ticket).then(f)
    }

    /// Run `commit` and free the slot if `ticket` still owns it. The slot
    /// lock is held across `commit`, so `begin` cannot interleave with it.
    pub fn finish<T>(&self, ticket: &TaskTicket, commit: impl FnOnce() -> T) -> Option<T> {
        let mut inner = self.inner.lock();
        if !inner.owned_by(ticket) {
            return None;
        }
        inner.current = None;
        Some(commit())
    }

    /// Free the slot without committing anything (failed work)
    pub fn release(&self, ticket: &TaskTicket) {
        let mut inner = self.inner.lock();
        if inner.generation == ticket.generation {
            inner.current = None;
        }
    }
}
