//! Fixed-capacity cell arena.
//!
//! Every pool is a `Vec<Cell>` allocated once when its worker is created. A cell
//! is identified by its index, so moving a frame between the free list and a
//! queue is just moving a [`CellId`].

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Video,
    Audio,
    Thumbnail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CellId(u32);

impl CellId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// An encoded payload travelling from a producer thread to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds.
    pub pts: i64,
    pub key_frame: bool,
}

impl Frame {
    pub fn video(data: impl Into<Vec<u8>>, pts: i64, key_frame: bool) -> Self {
        Self {
            data: data.into(),
            pts,
            key_frame,
        }
    }

    pub fn audio(data: impl Into<Vec<u8>>, pts: i64) -> Self {
        Self {
            data: data.into(),
            pts,
            key_frame: false,
        }
    }
}

#[derive(Debug, Default)]
struct Cell {
    data: Vec<u8>,
    pts: i64,
    key_frame: bool,
    in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub in_flight: usize,
}

#[derive(Debug)]
pub(crate) struct CellPool {
    kind: PoolKind,
    cells: Vec<Cell>,
    free: Vec<CellId>,
}

impl CellPool {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        let cells = (0..capacity).map(|_| Cell::default()).collect();
        // reversed so acquire hands out slot 0 first
        let free = (0..capacity as u32).rev().map(CellId).collect();

        Self { kind, cells, free }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            free: self.free_count(),
            in_flight: self.capacity() - self.free_count(),
        }
    }

    /// Moves `frame` into a free cell. Hands the frame back if the pool is exhausted.
    pub fn acquire(&mut self, frame: Frame) -> Result<CellId, Frame> {
        let Some(id) = self.free.pop() else {
            return Err(frame);
        };

        let cell = &mut self.cells[id.index()];
        debug_assert!(!cell.in_flight, "{:?} cell {} acquired twice", self.kind, id.0);

        cell.data = frame.data;
        cell.pts = frame.pts;
        cell.key_frame = frame.key_frame;
        cell.in_flight = true;

        Ok(id)
    }

    /// Returns the cell to the free list, handing its payload to the caller.
    ///
    /// Returns `None` without touching the free list if the cell was not in flight.
    pub fn release(&mut self, id: CellId) -> Option<Frame> {
        let cell = self.cells.get_mut(id.index())?;
        if !cell.in_flight {
            return None;
        }

        let frame = Frame {
            data: std::mem::take(&mut cell.data),
            pts: cell.pts,
            key_frame: cell.key_frame,
        };
        cell.pts = 0;
        cell.key_frame = false;
        cell.in_flight = false;

        self.free.push(id);

        Some(frame)
    }

    pub fn is_key_frame(&self, id: CellId) -> bool {
        self.cells[id.index()].key_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let mut pool = CellPool::new(PoolKind::Video, 2);

        let a = pool.acquire(Frame::video(vec![1], 10, true)).unwrap();
        let b = pool.acquire(Frame::video(vec![2], 20, false)).unwrap();
        assert_ne!(a, b);

        let rejected = pool.acquire(Frame::video(vec![3], 30, false)).unwrap_err();
        assert_eq!(rejected.data, vec![3]);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn release_returns_payload_and_clears_cell() {
        let mut pool = CellPool::new(PoolKind::Audio, 1);
        let id = pool.acquire(Frame::audio(vec![9, 9], 42)).unwrap();

        let frame = pool.release(id).unwrap();
        assert_eq!(frame, Frame::audio(vec![9, 9], 42));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn double_release_is_rejected() {
        let mut pool = CellPool::new(PoolKind::Thumbnail, 2);
        let id = pool.acquire(Frame::video(vec![0], 0, false)).unwrap();

        assert!(pool.release(id).is_some());
        assert!(pool.release(id).is_none());
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn stats_conserve_capacity() {
        let mut pool = CellPool::new(PoolKind::Video, 20);
        let mut held = vec![];

        for i in 0..13 {
            held.push(pool.acquire(Frame::video(vec![], i, false)).unwrap());
            let stats = pool.stats();
            assert_eq!(stats.free + stats.in_flight, stats.capacity);
        }

        for id in held.drain(..7) {
            pool.release(id);
        }

        assert_eq!(
            pool.stats(),
            PoolStats {
                capacity: 20,
                free: 14,
                in_flight: 6
            }
        );
    }
}
