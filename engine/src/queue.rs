//! Claimable, cancellable queue of work items.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::item::WorkItem;

#[derive(Debug, Default)]
struct Cursor {
    next: usize,
    cancelled: bool,
}

/// Ordered, immutable list of items handed out one claim at a time.
///
/// Every item is returned by at most one `claim`. Once `cancel` has been
/// called, `claim` returns `None` no matter how many items remain.
#[derive(Debug)]
pub struct TaskQueue {
    items: Vec<WorkItem>,
    cursor: Mutex<Cursor>,
}

impl TaskQueue {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Take the next unclaimed item, or `None` when drained or cancelled.
    pub fn claim(&self) -> Option<WorkItem> {
        let mut cursor = self.lock();
        if cursor.cancelled {
            return None;
        }
        let item = self.items.get(cursor.next)?.clone();
        cursor.next += 1;
        Some(item)
    }

    /// Stop handing out items. Idempotent.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
    }

    /// True once every item has been claimed.
    pub fn is_drained(&self) -> bool {
        self.lock().next >= self.items.len()
    }

    /// Number of items handed out so far.
    pub fn claimed(&self) -> usize {
        self.lock().next
    }

    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
