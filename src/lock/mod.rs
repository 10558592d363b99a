//! # Lock Manager
//!
//! Transaction-duration logical locks on tables and rows.
//!
//! ## Modes
//!
//! Four modes with the usual multi-granularity compatibility matrix:
//!
//! ```text
//!        IS   IX   S    X
//!   IS   ok   ok   ok   --
//!   IX   ok   ok   --   --
//!   S    ok   --   ok   --
//!   X    --   --   --   --
//! ```
//!
//! Re-requesting a lock already held in a covering mode returns
//! [`LockGrant::AlreadyHeld`]. Otherwise the request is converted to the
//! supremum of the held and requested modes (`IX + S = X`; there is no
//! SIX mode).
//!
//! ## Waiting
//!
//! - [`LockWait::NoWait`] never blocks and reports [`LockError::WouldBlock`].
//! - [`LockWait::Timeout`] queues the request FIFO and blocks on the
//!   resource's condition variable. Every wake-up re-checks, in order:
//!   the interrupt flag, grantability, a waits-for cycle (deadlock), and
//!   the deadline.
//!
//! ## Deadlock detection
//!
//! A global waits-for graph is rebuilt for the waiter on each wake-up.
//! When the requester finds itself on a cycle it withdraws its request
//! and receives [`LockError::Deadlock`]; the other participants keep
//! waiting.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::page::{RowId, TableId};

/// Longest single sleep while waiting for a lock.
const LOCK_POLL_SLICE: Duration = Duration::from_millis(10);

/// Transaction identifier as seen by the lock manager.
pub type TxnId = u64;

// ------------------------------------------------------------------------------------------------
// Public types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    /// Whether a holder in `self` is compatible with another holder in `other`.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IntentShared, IntentShared)
                | (IntentShared, IntentExclusive)
                | (IntentShared, Shared)
                | (IntentExclusive, IntentShared)
                | (IntentExclusive, IntentExclusive)
                | (Shared, IntentShared)
                | (Shared, Shared)
        )
    }

    /// Whether holding `self` implies holding `other`.
    pub fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            Shared => matches!(other, Shared | IntentShared),
            IntentExclusive => matches!(other, IntentExclusive | IntentShared),
            IntentShared => other == IntentShared,
        }
    }

    /// Weakest mode covering both.
    pub fn supremum(self, other: LockMode) -> LockMode {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            LockMode::Exclusive
        }
    }
}

/// Lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Table(TableId),
    Row(TableId, RowId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    NoWait,
    Timeout(Duration),
}

/// Successful outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// Newly granted without waiting.
    Granted,
    /// Newly granted after blocking.
    GrantedAfterWait,
    /// The transaction already held a covering lock.
    AlreadyHeld,
}

impl LockGrant {
    /// Whether this request added a lock the transaction did not hold before.
    pub fn is_new(self) -> bool {
        !matches!(self, LockGrant::AlreadyHeld)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock on {0:?} not available without waiting")]
    WouldBlock(LockTarget),

    #[error("timed out after {waited:?} waiting for lock on {target:?}")]
    Timeout { target: LockTarget, waited: Duration },

    #[error("deadlock detected while waiting for lock on {0:?}")]
    Deadlock(LockTarget),

    #[error("interrupted while waiting for lock on {0:?}")]
    Interrupted(LockTarget),
}

// ------------------------------------------------------------------------------------------------
// Lock table internals
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct LockRequest {
    txn: TxnId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockQueue {
    granted: HashMap<TxnId, LockMode>,
    waiting: VecDeque<LockRequest>,
}

impl LockQueue {
    /// Holders whose mode conflicts with `mode` for `txn`.
    fn conflicting_holders(&self, txn: TxnId, mode: LockMode) -> Vec<TxnId> {
        self.granted
            .iter()
            .filter(|(holder, held)| **holder != txn && !mode.compatible_with(**held))
            .map(|(holder, _)| *holder)
            .collect()
    }

    /// Waiters queued ahead of `txn` whose requests conflict with `mode`.
    fn conflicting_waiters_ahead(&self, txn: TxnId, mode: LockMode) -> Vec<TxnId> {
        self.waiting
            .iter()
            .take_while(|req| req.txn != txn)
            .filter(|req| !mode.compatible_with(req.mode))
            .map(|req| req.txn)
            .collect()
    }

    fn grantable(&self, txn: TxnId, mode: LockMode, respect_queue: bool) -> bool {
        if !self.conflicting_holders(txn, mode).is_empty() {
            return false;
        }
        // Conversions jump the queue; fresh requests wait their turn.
        let converting = self.granted.contains_key(&txn);
        !respect_queue || converting || self.conflicting_waiters_ahead(txn, mode).is_empty()
    }

    fn withdraw(&mut self, txn: TxnId) {
        self.waiting.retain(|req| req.txn != txn);
    }

    fn is_idle(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Debug, Default)]
struct WaitQueue {
    queue: Mutex<LockQueue>,
    cvar: Condvar,
}

// ------------------------------------------------------------------------------------------------
// Lock manager
// ------------------------------------------------------------------------------------------------

/// Shared lock table. All operations are thread-safe.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<LockTarget, Arc<WaitQueue>>>,
    waits_for: Mutex<HashMap<TxnId, Vec<TxnId>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests `mode` on `target` for `txn`.
    ///
    /// `interrupt` is polled while blocked; raising it makes the call
    /// return [`LockError::Interrupted`].
    pub fn lock(
        &self,
        txn: TxnId,
        target: LockTarget,
        mode: LockMode,
        wait: LockWait,
        interrupt: &AtomicBool,
    ) -> Result<LockGrant, LockError> {
        let wait_queue = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(target).or_default())
        };

        let mut guard = wait_queue.queue.lock();

        let held = guard.granted.get(&txn).copied();
        if let Some(held) = held {
            if held.covers(mode) {
                return Ok(LockGrant::AlreadyHeld);
            }
        }
        let wanted = held.map_or(mode, |held| held.supremum(mode));

        if guard.grantable(txn, wanted, true) {
            guard.granted.insert(txn, wanted);
            trace!(txn, ?target, ?wanted, "lock granted");
            return Ok(LockGrant::Granted);
        }

        let timeout = match wait {
            LockWait::NoWait => return Err(LockError::WouldBlock(target)),
            LockWait::Timeout(timeout) => timeout,
        };

        debug!(txn, ?target, ?wanted, "lock wait");
        guard.waiting.push_back(LockRequest { txn, mode: wanted });
        let started = Instant::now();

        loop {
            if interrupt.load(Ordering::Acquire) {
                guard.withdraw(txn);
                self.clear_waits_for(txn);
                wait_queue.cvar.notify_all();
                return Err(LockError::Interrupted(target));
            }

            if guard.grantable(txn, wanted, true) {
                guard.withdraw(txn);
                guard.granted.insert(txn, wanted);
                self.clear_waits_for(txn);
                debug!(txn, ?target, waited = ?started.elapsed(), "lock granted after wait");
                return Ok(LockGrant::GrantedAfterWait);
            }

            let mut blockers = guard.conflicting_holders(txn, wanted);
            blockers.extend(guard.conflicting_waiters_ahead(txn, wanted));
            if self.record_wait_and_detect(txn, blockers) {
                guard.withdraw(txn);
                wait_queue.cvar.notify_all();
                warn!(txn, ?target, "deadlock detected, requester chosen as victim");
                return Err(LockError::Deadlock(target));
            }

            let waited = started.elapsed();
            if waited >= timeout {
                guard.withdraw(txn);
                self.clear_waits_for(txn);
                wait_queue.cvar.notify_all();
                debug!(txn, ?target, ?waited, "lock wait timed out");
                return Err(LockError::Timeout { target, waited });
            }

            let slice = (timeout - waited).min(LOCK_POLL_SLICE);
            wait_queue.cvar.wait_for(&mut guard, slice);
        }
    }

    /// Releases one lock held by `txn`, if any.
    pub fn unlock(&self, txn: TxnId, target: LockTarget) {
        let wait_queue = match self.table.lock().get(&target) {
            Some(wq) => Arc::clone(wq),
            None => return,
        };
        let released = wait_queue.queue.lock().granted.remove(&txn).is_some();
        if released {
            trace!(txn, ?target, "lock released");
            wait_queue.cvar.notify_all();
        }
        self.prune(target);
    }

    /// Releases every lock held by `txn` and withdraws any pending request.
    pub fn unlock_all(&self, txn: TxnId) {
        let queues: Vec<(LockTarget, Arc<WaitQueue>)> = self
            .table
            .lock()
            .iter()
            .map(|(target, wq)| (*target, Arc::clone(wq)))
            .collect();

        {
            let mut waits_for = self.waits_for.lock();
            waits_for.remove(&txn);
            for blockers in waits_for.values_mut() {
                blockers.retain(|b| *b != txn);
            }
        }

        let mut touched = Vec::new();
        for (target, wq) in queues {
            let mut queue = wq.queue.lock();
            let had = queue.granted.remove(&txn).is_some();
            let before = queue.waiting.len();
            queue.withdraw(txn);
            if had || queue.waiting.len() != before {
                drop(queue);
                wq.cvar.notify_all();
                touched.push(target);
            }
        }

        for target in touched {
            self.prune(target);
        }
        trace!(txn, "all locks released");
    }

    /// Number of requests currently blocked anywhere in the lock table.
    pub fn waiting_count(&self) -> usize {
        let queues: Vec<Arc<WaitQueue>> = self.table.lock().values().cloned().collect();
        queues.iter().map(|wq| wq.queue.lock().waiting.len()).sum()
    }

    /// Current holders of `target` and their modes.
    #[cfg(test)]
    pub fn holders(&self, target: LockTarget) -> Vec<(TxnId, LockMode)> {
        let Some(wq) = self.table.lock().get(&target).cloned() else {
            return Vec::new();
        };
        let queue = wq.queue.lock();
        queue.granted.iter().map(|(t, m)| (*t, *m)).collect()
    }

    /// Whether `txn` holds a lock on `target` covering `mode`.
    #[cfg(test)]
    pub fn holds(&self, txn: TxnId, target: LockTarget, mode: LockMode) -> bool {
        self.holders(target)
            .iter()
            .any(|(holder, held)| *holder == txn && held.covers(mode))
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Drops an idle queue from the table.
    fn prune(&self, target: LockTarget) {
        let mut table = self.table.lock();
        let idle = table
            .get(&target)
            .map(|wq| Arc::strong_count(wq) == 1 && wq.queue.lock().is_idle())
            .unwrap_or(false);
        if idle {
            table.remove(&target);
        }
    }

    fn clear_waits_for(&self, txn: TxnId) {
        self.waits_for.lock().remove(&txn);
    }

    /// Records that `txn` waits for `blockers`; returns true if that closes a cycle.
    fn record_wait_and_detect(&self, txn: TxnId, blockers: Vec<TxnId>) -> bool {
        let mut waits_for = self.waits_for.lock();
        if blockers.is_empty() {
            waits_for.remove(&txn);
            return false;
        }
        waits_for.insert(txn, blockers);

        let mut visited = HashSet::new();
        let mut stack: Vec<TxnId> = waits_for.get(&txn).cloned().unwrap_or_default();
        while let Some(next) = stack.pop() {
            if next == txn {
                waits_for.remove(&txn);
                return true;
            }
            if visited.insert(next) {
                if let Some(more) = waits_for.get(&next) {
                    stack.extend(more.iter().copied());
                }
            }
        }
        false
    }
}
