//! Page store and latching.
//!
//! A [`PageStore`] owns every page of one index. Pages are shared as
//! [`PageHandle`]s. A handle can be latched shared or exclusive and yields
//! an owned guard ([`SharedLatch`] / [`ExclusiveLatch`]) that may be held
//! across function boundaries and moved between positions, which is what
//! latch coupling needs.
//!
//! Latch waits are always bounded. A bounded wait is sliced into short
//! polls so that a pending interrupt is observed promptly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use thiserror::Error;
use tracing::trace;

use super::{Node, PageBody, PageId};

/// Owned shared latch on a page.
pub type SharedLatch = ArcRwLockReadGuard<RawRwLock, PageBody>;

/// Owned exclusive latch on a page.
pub type ExclusiveLatch = ArcRwLockWriteGuard<RawRwLock, PageBody>;

/// Longest single sleep while polling for a latch.
const LATCH_POLL_SLICE: Duration = Duration::from_millis(5);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Why a latch could not be obtained.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LatchError {
    /// `NoWait` request and the latch is held incompatibly.
    #[error("latch on page {0} not available without waiting")]
    WouldBlock(PageId),

    /// Bounded wait expired.
    #[error("timed out after {waited:?} waiting for latch on page {page}")]
    Timeout { page: PageId, waited: Duration },

    /// The waiting thread's interrupt flag was raised.
    #[error("interrupted while waiting for latch on page {0}")]
    Interrupted(PageId),
}

/// How long a latch request may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchWait {
    NoWait,
    Bounded(Duration),
}

// ------------------------------------------------------------------------------------------------
// Page handle
// ------------------------------------------------------------------------------------------------

/// Shared reference to a page. Cloning is cheap.
#[derive(Clone)]
pub struct PageHandle {
    id: PageId,
    body: Arc<RwLock<PageBody>>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl PageHandle {
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Latches the page in shared mode.
    pub fn latch_shared(
        &self,
        wait: LatchWait,
        interrupt: &AtomicBool,
    ) -> Result<SharedLatch, LatchError> {
        if let Some(guard) = self.body.try_read_arc() {
            return Ok(guard);
        }
        self.wait_for(wait, interrupt, |slice| self.body.try_read_arc_for(slice))
    }

    /// Latches the page in exclusive mode.
    pub fn latch_exclusive(
        &self,
        wait: LatchWait,
        interrupt: &AtomicBool,
    ) -> Result<ExclusiveLatch, LatchError> {
        if let Some(guard) = self.body.try_write_arc() {
            return Ok(guard);
        }
        self.wait_for(wait, interrupt, |slice| self.body.try_write_arc_for(slice))
    }

    fn wait_for<G>(
        &self,
        wait: LatchWait,
        interrupt: &AtomicBool,
        mut attempt: impl FnMut(Duration) -> Option<G>,
    ) -> Result<G, LatchError> {
        let timeout = match wait {
            LatchWait::NoWait => return Err(LatchError::WouldBlock(self.id)),
            LatchWait::Bounded(timeout) => timeout,
        };

        trace!(page = %self.id, "waiting for latch");
        let started = Instant::now();
        loop {
            if interrupt.load(Ordering::Acquire) {
                return Err(LatchError::Interrupted(self.id));
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LatchError::Timeout {
                    page: self.id,
                    waited,
                });
            }
            let slice = (timeout - waited).min(LATCH_POLL_SLICE);
            if let Some(guard) = attempt(slice) {
                return Ok(guard);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Page store
// ------------------------------------------------------------------------------------------------

/// Owns the pages of one index.
///
/// Freed pages are removed from the directory, so [`PageStore::get`]
/// returns `None` for them; holders of an old handle find a bumped
/// version and no node once they latch it.
pub struct PageStore {
    pages: RwLock<HashMap<PageId, PageHandle>>,
    next_id: AtomicU64,
    page_size: usize,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("page_size", &self.page_size)
            .field("pages", &self.page_count())
            .finish()
    }
}

impl PageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocates a fresh page holding `node`.
    pub fn allocate(&self, node: Node) -> PageHandle {
        let id = PageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = PageHandle {
            id,
            body: Arc::new(RwLock::new(PageBody::new(id, self.page_size, node))),
        };
        self.pages.write().insert(id, handle.clone());
        trace!(page = %id, "page allocated");
        handle
    }

    /// Looks up a live page.
    pub fn get(&self, id: PageId) -> Option<PageHandle> {
        self.pages.read().get(&id).cloned()
    }

    /// Frees a page whose exclusive latch the caller holds.
    pub fn free(&self, body: &mut PageBody) {
        body.mark_freed();
        self.pages.write().remove(&body.id());
        trace!(page = %body.id(), "page freed");
    }

    /// Number of live pages.
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }
}
