use std::collections::VecDeque;

use crate::cell::{CellId, CellPool, Frame, PoolKind, PoolStats};

/// In-flight cells of one stream, sorted by presentation timestamp.
///
/// Equal timestamps keep their arrival order.
#[derive(Debug, Default)]
pub(crate) struct OrderedQueue {
    entries: VecDeque<(i64, CellId)>,
}

impl OrderedQueue {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, pts: i64, id: CellId) {
        let at = self.entries.partition_point(|(existing, _)| *existing <= pts);
        self.entries.insert(at, (pts, id));
    }

    pub fn peek_pts(&self) -> Option<i64> {
        self.entries.front().map(|(pts, _)| *pts)
    }

    pub fn pop_front(&mut self) -> Option<CellId> {
        self.entries.pop_front().map(|(_, id)| id)
    }

    pub fn remove_where(&mut self, mut pred: impl FnMut(CellId) -> bool) -> Option<CellId> {
        let at = self.entries.iter().position(|(_, id)| pred(*id))?;
        self.entries.remove(at).map(|(_, id)| id)
    }
}

/// A cell pool together with the queue its cells are parked in.
///
/// Both live behind the same mutex so a cell is always either free or queued.
#[derive(Debug)]
pub(crate) struct Lane {
    pool: CellPool,
    queue: OrderedQueue,
}

impl Lane {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        Self {
            pool: CellPool::new(kind, capacity),
            queue: OrderedQueue::default(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.pool.kind()
    }

    /// Moves `frame` into a free cell and queues it in timestamp order.
    ///
    /// Hands the frame back when no cell is free.
    pub fn push(&mut self, frame: Frame) -> Result<(), Frame> {
        let pts = frame.pts;
        let id = self.pool.acquire(frame)?;
        self.queue.insert(pts, id);
        Ok(())
    }

    pub fn peek_pts(&self) -> Option<i64> {
        self.queue.peek_pts()
    }

    /// Removes the earliest frame. Its cell goes straight back to the free list.
    pub fn pop_lowest(&mut self) -> Option<Frame> {
        let id = self.queue.pop_front()?;
        self.pool.release(id)
    }

    /// Discards one queued non-key video frame to make room for a newer one.
    pub fn drop_one_non_key_frame(&mut self) -> bool {
        if self.pool.kind() != PoolKind::Video {
            return false;
        }

        let pool = &self.pool;
        let Some(id) = self.queue.remove_where(|id| !pool.is_key_frame(id)) else {
            return false;
        };

        self.pool.release(id).is_some()
    }

    /// Returns every queued cell to the free list. Returns how many were discarded.
    pub fn drain_to_free_pool(&mut self) -> usize {
        let mut drained = 0;
        while let Some(id) = self.queue.pop_front() {
            if self.pool.release(id).is_some() {
                drained += 1;
            }
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
