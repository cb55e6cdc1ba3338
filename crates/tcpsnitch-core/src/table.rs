//! Process-wide descriptor table
//!
//! Growable vector of slots keyed by file descriptor. A coarse `RwLock`
//! guards the vector itself and is write-locked only to grow it; each
//! slot carries its own mutex protecting the optional connection record.
//!
//! Lock discipline: a thread holds at most one slot lock at a time, and
//! never across a call that may re-enter the interposed entry points.
//! The [`DescriptorTable::with`] closure is the acquire/mutate/release
//! helper enforcing the first half of that rule; the recorder enforces
//! the second.

use crate::conn::Connection;
use parking_lot::{Mutex, RwLock};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use thiserror::Error;

type Slot = Arc<Mutex<Option<Connection>>>;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("descriptor {0} already has a connection")]
    Occupied(RawFd),

    #[error("negative descriptor {0}")]
    Negative(RawFd),
}

/// Descriptor -> connection mapping. Slots are never shrunk.
#[derive(Default)]
pub struct DescriptorTable {
    slots: RwLock<Vec<Slot>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record for `fd`. Fails if the slot is occupied.
    pub fn put(&self, fd: RawFd, conn: Connection) -> Result<(), TableError> {
        let slot = self.slot_grow(fd)?;
        let mut guard = slot.lock();
        if guard.is_some() {
            return Err(TableError::Occupied(fd));
        }
        *guard = Some(conn);
        Ok(())
    }

    /// Run `f` on the record for `fd` under its slot lock.
    ///
    /// Returns `None` when no record exists. The closure must not call
    /// back into interposed entry points for the same descriptor.
    pub fn with<R>(&self, fd: RawFd, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let slot = self.slot(fd)?;
        let mut guard = slot.lock();
        guard.as_mut().map(f)
    }

    /// Snapshot existence test. No lock is held on return.
    pub fn contains(&self, fd: RawFd) -> bool {
        match self.slot(fd) {
            Some(slot) => slot.lock().is_some(),
            None => false,
        }
    }

    /// Extract the record for `fd`, leaving the slot empty.
    pub fn remove(&self, fd: RawFd) -> Option<Connection> {
        let slot = self.slot(fd)?;
        let mut guard = slot.lock();
        guard.take()
    }

    /// Upper bound (exclusive) on the largest descriptor ever seen.
    pub fn size(&self) -> usize {
        self.slots.read().len()
    }

    /// Drop every record. Used by the post-fork reset; the records own
    /// no resources that need teardown, so plain drops are safe in the
    /// single-threaded child.
    pub fn reset(&self) {
        let slots = self.slots.write();
        for slot in slots.iter() {
            slot.lock().take();
        }
    }

    fn slot(&self, fd: RawFd) -> Option<Slot> {
        if fd < 0 {
            return None;
        }
        self.slots.read().get(fd as usize).cloned()
    }

    /// Slot for `fd`, growing the table when the descriptor is beyond
    /// the current capacity. Amortized: capacity at least doubles.
    fn slot_grow(&self, fd: RawFd) -> Result<Slot, TableError> {
        if fd < 0 {
            return Err(TableError::Negative(fd));
        }
        let index = fd as usize;
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(index) {
                return Ok(slot.clone());
            }
        }
        let mut slots = self.slots.write();
        if index >= slots.len() {
            let target = (index + 1).max(slots.len() * 2);
            slots.resize_with(target, Slot::default);
        }
        Ok(slots[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64) -> Connection {
        Connection::new(id, None)
    }

    #[test]
    fn test_put_with_remove() {
        let table = DescriptorTable::new();
        table.put(5, conn(0)).unwrap();
        assert!(table.contains(5));
        assert_eq!(table.with(5, |c| c.id), Some(0));

        let removed = table.remove(5).unwrap();
        assert_eq!(removed.id, 0);
        assert!(!table.contains(5));
        assert_eq!(table.with(5, |c| c.id), None);
    }

    #[test]
    fn test_double_put_is_rejected() {
        let table = DescriptorTable::new();
        table.put(3, conn(0)).unwrap();
        assert!(matches!(table.put(3, conn(1)), Err(TableError::Occupied(3))));
        // The original record survives the failed insert.
        assert_eq!(table.with(3, |c| c.id), Some(0));
    }

    #[test]
    fn test_negative_descriptor() {
        let table = DescriptorTable::new();
        assert!(matches!(table.put(-1, conn(0)), Err(TableError::Negative(-1))));
        assert!(!table.contains(-1));
        assert!(table.remove(-1).is_none());
    }

    #[test]
    fn test_growth_is_monotone() {
        let table = DescriptorTable::new();
        table.put(0, conn(0)).unwrap();
        let after_first = table.size();
        table.put(100, conn(1)).unwrap();
        assert!(table.size() > after_first);
        assert!(table.size() >= 101);

        table.remove(100);
        // remove() never shrinks.
        assert!(table.size() >= 101);
    }

    #[test]
    fn test_reset_clears_all_slots() {
        let table = DescriptorTable::new();
        table.put(1, conn(0)).unwrap();
        table.put(9, conn(1)).unwrap();
        table.reset();
        assert!(!table.contains(1));
        assert!(!table.contains(9));
    }

    #[test]
    fn test_concurrent_distinct_slots() {
        let table = Arc::new(DescriptorTable::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let fd = i as RawFd;
                    table.put(fd, Connection::new(i, None)).unwrap();
                    for _ in 0..100 {
                        table.with(fd, |c| c.bytes_sent += 1);
                    }
                    table.with(fd, |c| c.bytes_sent)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(100));
        }
    }
}
