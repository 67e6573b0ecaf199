//! Pool bookkeeping owned by the controller task.
//!
//! Every method runs to completion on the controller, so no two operations
//! interleave and nothing here needs a lock. `ready` and `waiters` are never
//! both non-empty once a method returns.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::bridge::protocol::JobId;

/// A `pop` observing this many ready artifacts or fewer counts as demand.
pub const DEMAND_THRESHOLD: usize = 2;

/// The regulator never cuts capacity below this.
pub const CAPACITY_FLOOR: usize = 2;

pub(crate) type Waiter<A> = oneshot::Sender<A>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PopOutcome {
    /// Handed the oldest ready artifact.
    Served,
    /// No artifact ready; the waiter joined the queue.
    Queued,
    /// The caller was gone before it could be served.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Waiter,
    Ready,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub pending: usize,
    pub ready: usize,
    pub waiting: usize,
    pub terminated: bool,
    pub launched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
}

pub(crate) struct PoolState<A> {
    capacity: usize,
    pending: usize,
    ready: VecDeque<A>,
    waiters: VecDeque<Waiter<A>>,
    terminated: bool,
    dynamic: bool,
    cutback_min_ratio: f64,
    launched: u64,
    succeeded: u64,
    failed: u64,
    abandoned: u64,
}

impl<A> PoolState<A> {
    pub fn new(initial_capacity: usize, dynamic: bool, cutback_min_ratio: f64) -> Self {
        Self {
            capacity: initial_capacity,
            pending: 0,
            ready: VecDeque::new(),
            waiters: VecDeque::new(),
            terminated: false,
            dynamic,
            cutback_min_ratio,
            launched: 0,
            succeeded: 0,
            failed: 0,
            abandoned: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Serve `waiter` from `ready`, or queue it.
    ///
    /// Demand is measured before dequeueing, so a pop served from a short
    /// ready queue still raises capacity.
    pub fn pop(&mut self, waiter: Waiter<A>) -> PopOutcome {
        if self.dynamic && self.ready.len() <= DEMAND_THRESHOLD {
            self.capacity += 1;
        }

        match self.ready.pop_front() {
            Some(artifact) => match waiter.send(artifact) {
                Ok(()) => PopOutcome::Served,
                Err(artifact) => {
                    self.ready.push_front(artifact);
                    self.abandoned += 1;
                    PopOutcome::Abandoned
                }
            },
            None => {
                self.waiters.retain(|w| !w.is_closed());
                self.waiters.push_back(waiter);
                PopOutcome::Queued
            }
        }
    }

    /// Launches needed to bring in-flight plus ready up to capacity.
    pub fn deficit(&self) -> usize {
        self.capacity
            .saturating_sub(self.pending + self.ready.len())
    }

    /// Account for one task about to launch.
    pub fn reserve_launch(&mut self) -> JobId {
        self.pending += 1;
        self.launched += 1;
        JobId::new()
    }

    /// Settle a successful task: the oldest live waiter gets the artifact,
    /// otherwise it joins `ready`.
    pub fn on_success(&mut self, artifact: A) -> Delivery {
        self.release_pending();
        self.succeeded += 1;

        let mut artifact = artifact;
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(artifact) {
                Ok(()) => return Delivery::Waiter,
                Err(returned) => {
                    self.abandoned += 1;
                    artifact = returned;
                }
            }
        }
        self.ready.push_back(artifact);
        Delivery::Ready
    }

    pub fn on_failure(&mut self) {
        self.release_pending();
        self.failed += 1;
    }

    fn release_pending(&mut self) {
        match self.pending.checked_sub(1) {
            Some(pending) => self.pending = pending,
            None => tracing::error!("Task settled with no pending tasks recorded"),
        }
    }

    /// One regulator pass. Returns the new capacity when it was lowered.
    pub fn cut_back(&mut self) -> Option<usize> {
        if self.capacity <= CAPACITY_FLOOR {
            return None;
        }
        let ratio = self.ready.len() as f64 / self.capacity as f64;
        if ratio > self.cutback_min_ratio {
            self.capacity -= 1;
            Some(self.capacity)
        } else {
            None
        }
    }

    /// Returns false when the pool was already terminated.
    pub fn terminate(&mut self) -> bool {
        !std::mem::replace(&mut self.terminated, true)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            pending: self.pending,
            ready: self.ready.len(),
            waiting: self.waiters.iter().filter(|w| !w.is_closed()).count(),
            terminated: self.terminated,
            launched: self.launched,
            succeeded: self.succeeded,
            failed: self.failed,
            abandoned: self.abandoned,
        }
    }
}
