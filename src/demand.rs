//! Consumer driven row demand.
//!
//! The consumer side grants row credit (or cancels) from wherever it
//! drains events; the fetch loop suspends on the counter and is woken
//! by the grant, so waiting never burns a timer or a poll interval.
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
struct Shared {
    count: u64,
    cancelled: bool,
    waker: Option<Waker>,
}

/// Outcome of waiting on [`Demand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandState {
    /// Positive credit available.
    Ready,
    /// The consumer cancelled, no more rows wanted.
    Cancelled,
}

/// Shared row-credit counter.
///
/// Cloned handles observe the same counter. Delivered rows consume
/// credit one-for-one; the executor never requests rows beyond the
/// outstanding credit.
#[derive(Debug, Clone)]
pub struct Demand {
    shared: Arc<Mutex<Shared>>,
}

impl Demand {
    /// A counter starting at zero credit.
    pub fn new() -> Self {
        Self::with(0)
    }

    /// A counter that never runs out in practice.
    pub fn unbounded() -> Self {
        Self::with(u64::MAX)
    }

    fn with(count: u64) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared { count, cancelled: false, waker: None })),
        }
    }

    /// Grant `n` more rows of credit, waking a suspended fetch loop.
    pub fn grant(&self, n: u64) {
        let mut shared = self.lock();
        shared.count = shared.count.saturating_add(n);
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }

    /// Stop fetching. Wakes a suspended fetch loop so it can wind down.
    pub fn cancel(&self) {
        let mut shared = self.lock();
        shared.cancelled = true;
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }

    /// Credit not yet consumed by delivered rows.
    pub fn outstanding(&self) -> u64 {
        self.lock().count
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Wait until credit is positive or the consumer cancelled.
    ///
    /// Cancellation wins over remaining credit.
    pub(crate) fn poll_ready(&self, cx: &mut Context) -> Poll<DemandState> {
        let mut shared = self.lock();
        if shared.cancelled {
            return Poll::Ready(DemandState::Cancelled);
        }
        if shared.count > 0 {
            return Poll::Ready(DemandState::Ready);
        }
        match &mut shared.waker {
            Some(waker) => waker.clone_from(cx.waker()),
            None => shared.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    /// Consume credit for `n` delivered rows.
    pub(crate) fn consume(&self, n: u64) {
        let mut shared = self.lock();
        shared.count = shared.count.saturating_sub(n);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Demand {
    fn default() -> Self {
        Self::new()
    }
}
