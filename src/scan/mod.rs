//! # Index Scans
//!
//! Two cursor types read an index while other threads split, purge and
//! compress it:
//!
//! - [`ForwardScan`] returns qualifying rows in ascending order between
//!   a start and a stop position.
//! - [`MaxScan`] returns the greatest qualifying row by walking backwards
//!   from the rightmost leaf.
//!
//! ## Positions and repositioning
//!
//! A scan never keeps a latch between calls. Before letting go it saves
//! a [`ScanPosition`]: the last row it looked at, whether to resume *at*
//! that row (after a lock wait) or strictly *after* it (once returned),
//! and the leaf id and page version it was found on.
//!
//! On resumption the saved leaf is latched again. If it is still a live
//! leaf with the same version, nothing has moved off it and a binary
//! search finds the resume slot. Otherwise the scan descends from the
//! root with the saved row, which works whatever happened in between:
//! splits, root growth or shrink, purge, compress, commit.
//!
//! ## Row locks
//!
//! Rows are locked while their leaf is latched, but only with `NoWait`.
//! If that fails the scan saves its position, drops the latch, waits for
//! the lock, and repositions. After the grant the row is checked again;
//! it may have been deleted, or purged from under the cursor, in which
//! case the scan simply continues with the next row.

mod forward;
mod max;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::btree::TreeError;
use crate::lock::{LockError, LockMode};
use crate::page::{IndexRow, PageId};
use crate::txn::TxnError;

pub use forward::ForwardScan;
pub use max::MaxScan;

// ------------------------------------------------------------------------------------------------
// Scan specification
// ------------------------------------------------------------------------------------------------

/// Where a forward scan begins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanStart {
    #[default]
    Beginning,
    AtOrAfter(Vec<u8>),
    After(Vec<u8>),
}

/// Where a forward scan ends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanStop {
    #[default]
    End,
    AtOrBefore(Vec<u8>),
    Before(Vec<u8>),
}

impl ScanStop {
    /// Whether `key` lies beyond the stop position.
    fn is_past(&self, key: &[u8]) -> bool {
        match self {
            ScanStop::End => false,
            ScanStop::AtOrBefore(stop) => key > stop.as_slice(),
            ScanStop::Before(stop) => key >= stop.as_slice(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A predicate on the key bytes: `key <op> value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualifier {
    pub op: CompareOp,
    pub value: Vec<u8>,
}

impl Qualifier {
    pub fn new(op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op,
            value: value.into(),
        }
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        let value = self.value.as_slice();
        match self.op {
            CompareOp::Eq => key == value,
            CompareOp::Ne => key != value,
            CompareOp::Lt => key < value,
            CompareOp::Le => key <= value,
            CompareOp::Gt => key > value,
            CompareOp::Ge => key >= value,
        }
    }
}

pub(crate) fn qualifies(qualifiers: &[Qualifier], key: &[u8]) -> bool {
    qualifiers.iter().all(|q| q.matches(key))
}

/// Row lock a scan takes on the rows it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanLock {
    #[default]
    Shared,
    /// For scans that go on to modify the rows they return.
    Exclusive,
}

impl ScanLock {
    pub(crate) fn row_mode(self) -> LockMode {
        match self {
            ScanLock::Shared => LockMode::Shared,
            ScanLock::Exclusive => LockMode::Exclusive,
        }
    }

    pub(crate) fn table_mode(self) -> LockMode {
        match self {
            ScanLock::Shared => LockMode::IntentShared,
            ScanLock::Exclusive => LockMode::IntentExclusive,
        }
    }
}

/// Everything a forward scan needs to know up front.
///
/// ```rust
/// use ferrodex::{ScanSpec, ScanStart, ScanStop};
///
/// let spec = ScanSpec::all()
///     .start(ScanStart::AtOrAfter(b"k10".to_vec()))
///     .stop(ScanStop::Before(b"k20".to_vec()))
///     .holdable(true);
/// assert!(spec.holdable);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanSpec {
    pub start: ScanStart,
    pub stop: ScanStop,
    pub qualifiers: Vec<Qualifier>,
    /// Whether the scan stays usable after its transaction commits.
    pub holdable: bool,
    pub lock: ScanLock,
}

impl ScanSpec {
    /// The whole index, non-holdable, shared row locks.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every entry with exactly `key`.
    pub fn key(key: &[u8]) -> Self {
        Self {
            start: ScanStart::AtOrAfter(key.to_vec()),
            stop: ScanStop::AtOrBefore(key.to_vec()),
            ..Self::default()
        }
    }

    pub fn start(mut self, start: ScanStart) -> Self {
        self.start = start;
        self
    }

    pub fn stop(mut self, stop: ScanStop) -> Self {
        self.stop = stop;
        self
    }

    pub fn qualify(mut self, qualifier: Qualifier) -> Self {
        self.qualifiers.push(qualifier);
        self
    }

    pub fn holdable(mut self, holdable: bool) -> Self {
        self.holdable = holdable;
        self
    }

    pub fn lock(mut self, lock: ScanLock) -> Self {
        self.lock = lock;
        self
    }
}

// ------------------------------------------------------------------------------------------------
// Scan state
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Opened, not yet positioned.
    Init,
    /// Positioned; the next call resumes from the saved position.
    InProgress,
    /// Reached the stop position or the end of the index.
    Done,
    Closed,
}

/// Resume point saved whenever a scan lets go of its latch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPosition {
    pub row: IndexRow,
    /// Resume at `row` (true) or strictly after it (false).
    pub inclusive: bool,
    pub leaf: PageId,
    pub version: u64,
}

/// Counters describing how much work a scan did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub rows_returned: usize,
    pub pages_visited: usize,
    /// Resumptions satisfied by the saved leaf.
    pub repositions_in_page: usize,
    /// Resumptions that had to descend from the root again.
    pub repositions_by_key: usize,
    pub lock_waits: usize,
}

/// Counters for a [`MaxScan`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaxScanStats {
    pub pages_visited: usize,
    pub lock_waits: usize,
    /// Times the scan started over from the rightmost leaf.
    pub restarts: usize,
    /// Times the answer came from a forward scan from the beginning.
    pub forward_fallbacks: usize,
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by scans.
///
/// `LockTimeout` and `Deadlock` end the current statement only; the
/// transaction stays usable. `Interrupted` ends the transaction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("lock wait timed out")]
    LockTimeout,

    #[error("deadlock detected")]
    Deadlock,

    #[error("interrupted")]
    Interrupted,

    #[error("no current cursor")]
    NoCurrentCursor,

    #[error("transaction has been terminated")]
    TransactionTerminated,

    #[error("tree error: {0}")]
    Tree(TreeError),
}

impl ScanError {
    /// Whether the error ended the whole transaction rather than one statement.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ScanError::Interrupted | ScanError::TransactionTerminated)
    }
}

impl From<LockError> for ScanError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { .. } => ScanError::LockTimeout,
            LockError::Deadlock(_) => ScanError::Deadlock,
            LockError::Interrupted(_) => ScanError::Interrupted,
            // NoWait failures are absorbed by the scans themselves.
            other => ScanError::Tree(TreeError::Lock(other)),
        }
    }
}

impl From<TreeError> for ScanError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::Lock(lock) => lock.into(),
            e if e.is_interrupt() => ScanError::Interrupted,
            e => ScanError::Tree(e),
        }
    }
}

impl From<crate::page::LatchError> for ScanError {
    fn from(e: crate::page::LatchError) -> Self {
        TreeError::Latch(e).into()
    }
}

impl From<TxnError> for ScanError {
    fn from(e: TxnError) -> Self {
        match e {
            TxnError::Terminated => ScanError::TransactionTerminated,
            TxnError::Lock(lock) => lock.into(),
            TxnError::Undo { source, .. } => ScanError::Tree(source),
        }
    }
}
