//! Register and stack-slot allocation.
//!
//! Tracks which general-purpose registers and stack-local slots are free,
//! with highest-index-first allocation and expiry by scan index. One
//! allocator exists per function body; running out of storage is a fatal
//! compiler error, not a recoverable one.

use std::fmt;

use crate::instr::{regs, Reg};

/// Fatal allocation failures: too many simultaneously live bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    OutOfRegisters,
    OutOfLocals,
    /// `make_available`/`make_unavailable` called against the free list's
    /// current state; indicates a pass bug.
    InconsistentFreeList,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::OutOfRegisters => write!(f, "out of storage: no free register"),
            StorageError::OutOfLocals => write!(f, "out of storage: no free local slot"),
            StorageError::InconsistentFreeList => {
                write!(f, "allocator free list is inconsistent")
            }
        }
    }
}

/// A register or local slot handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Register(Reg),
    Local(u16),
}

#[derive(Debug, Clone)]
pub struct Allocator {
    /// Free register indices, sorted ascending; allocation pops the back.
    free_regs: Vec<u8>,
    /// Free local slots, sorted ascending; allocation pops the back.
    free_locals: Vec<u16>,
    /// Outstanding allocations awaiting expiry: (last scan index, storage).
    expiries: Vec<(u32, Storage)>,
}

impl Allocator {
    /// A fresh per-function allocator: the whole general-purpose pool and
    /// `locals_count` stack slots are available.
    pub fn new(locals_count: u16) -> Allocator {
        Allocator {
            free_regs: (regs::GPR_FIRST..=regs::GPR_LAST).collect(),
            free_locals: (0..locals_count).collect(),
            expiries: Vec::new(),
        }
    }

    /// Pop the highest-indexed free register.
    pub fn next_available_register(&mut self) -> Result<Reg, StorageError> {
        self.free_regs
            .pop()
            .map(Reg)
            .ok_or(StorageError::OutOfRegisters)
    }

    /// Pop the highest-indexed free local slot.
    pub fn next_available_local(&mut self) -> Result<u16, StorageError> {
        self.free_locals.pop().ok_or(StorageError::OutOfLocals)
    }

    pub fn is_free(&self, storage: Storage) -> bool {
        match storage {
            Storage::Register(r) => self.free_regs.binary_search(&r.0).is_ok(),
            Storage::Local(slot) => self.free_locals.binary_search(&slot).is_ok(),
        }
    }

    /// Return a resource to the free pool.
    pub fn make_available(&mut self, storage: Storage) -> Result<(), StorageError> {
        match storage {
            Storage::Register(r) => insert_sorted(&mut self.free_regs, r.0),
            Storage::Local(slot) => insert_sorted(&mut self.free_locals, slot),
        }
    }

    /// Reserve a specific resource without allocating it, used to seed
    /// parameter registers and overflow-argument slots.
    pub fn make_unavailable(&mut self, storage: Storage) -> Result<(), StorageError> {
        match storage {
            Storage::Register(r) => remove_sorted(&mut self.free_regs, r.0),
            Storage::Local(slot) => remove_sorted(&mut self.free_locals, slot),
        }
    }

    /// Record that `storage` may be reclaimed once the scan passes `last`.
    pub fn record_expiry(&mut self, storage: Storage, last: u32) {
        self.expiries.push((last, storage));
    }

    /// Free every allocation whose live range ended before `scan`.
    /// Returns the storage that was released.
    pub fn release_dead(&mut self, scan: u32) -> Vec<Storage> {
        let mut released = Vec::new();
        let mut index = 0;
        while index < self.expiries.len() {
            if self.expiries[index].0 < scan {
                let (_, storage) = self.expiries.swap_remove(index);
                // A pass never releases twice; liveness ranges are disjoint
                // per resource by construction.
                self.make_available(storage)
                    .expect("expiry released a resource that was already free");
                released.push(storage);
            } else {
                index += 1;
            }
        }
        released
    }

    pub fn free_register_count(&self) -> usize {
        self.free_regs.len()
    }

    pub fn free_local_count(&self) -> usize {
        self.free_locals.len()
    }
}

fn insert_sorted<T: Ord + Copy>(list: &mut Vec<T>, value: T) -> Result<(), StorageError> {
    match list.binary_search(&value) {
        Ok(_) => Err(StorageError::InconsistentFreeList),
        Err(at) => {
            list.insert(at, value);
            Ok(())
        }
    }
}

fn remove_sorted<T: Ord + Copy>(list: &mut Vec<T>, value: T) -> Result<(), StorageError> {
    match list.binary_search(&value) {
        Ok(at) => {
            list.remove(at);
            Ok(())
        }
        Err(_) => Err(StorageError::InconsistentFreeList),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_highest_first() {
        let mut alloc = Allocator::new(4);
        let r = alloc.next_available_register().unwrap();
        assert_eq!(r.0, regs::GPR_LAST);
        let s = alloc.next_available_local().unwrap();
        assert_eq!(s, 3);
    }

    #[test]
    fn test_no_double_assignment() {
        let mut alloc = Allocator::new(2);
        let a = alloc.next_available_register().unwrap();
        let b = alloc.next_available_register().unwrap();
        assert_ne!(a, b);
        assert!(!alloc.is_free(Storage::Register(a)));
        assert!(!alloc.is_free(Storage::Register(b)));
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let mut alloc = Allocator::new(1);
        assert!(alloc.next_available_local().is_ok());
        assert_eq!(
            alloc.next_available_local(),
            Err(StorageError::OutOfLocals)
        );
        while alloc.next_available_register().is_ok() {}
        assert_eq!(
            alloc.next_available_register(),
            Err(StorageError::OutOfRegisters)
        );
    }

    #[test]
    fn test_make_available_round_trip() {
        let mut alloc = Allocator::new(1);
        let r = alloc.next_available_register().unwrap();
        alloc.make_available(Storage::Register(r)).unwrap();
        assert!(alloc.is_free(Storage::Register(r)));
        // LIFO bias: the same register comes back first.
        assert_eq!(alloc.next_available_register().unwrap(), r);
    }

    #[test]
    fn test_make_unavailable_seeds_parameters() {
        let mut alloc = Allocator::new(8);
        alloc.make_unavailable(Storage::Local(0)).unwrap();
        assert!(!alloc.is_free(Storage::Local(0)));
        // Reserving twice is a pass bug.
        assert_eq!(
            alloc.make_unavailable(Storage::Local(0)),
            Err(StorageError::InconsistentFreeList)
        );
    }

    #[test]
    fn test_release_dead_by_scan_index() {
        let mut alloc = Allocator::new(4);
        let r = alloc.next_available_register().unwrap();
        let s = alloc.next_available_local().unwrap();
        alloc.record_expiry(Storage::Register(r), 10);
        alloc.record_expiry(Storage::Local(s), 20);
        assert!(alloc.release_dead(10).is_empty());
        let released = alloc.release_dead(11);
        assert_eq!(released, vec![Storage::Register(r)]);
        assert!(alloc.is_free(Storage::Register(r)));
        assert!(!alloc.is_free(Storage::Local(s)));
        assert_eq!(alloc.release_dead(21), vec![Storage::Local(s)]);
    }
}
