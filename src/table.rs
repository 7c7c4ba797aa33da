//! C4: the in-memory remap table and its lookup cache.
//!
//! Grounded on the "vector plus a map under a single mutex" strategy spec
//! §9 names for list/registry bookkeeping, and on the teacher's own
//! single-critical-section style (`Device` methods take `&self` and rely
//! on the OS file descriptor for concurrency; here the table provides its
//! own short critical section instead, since multiple threads share it).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::codec::PersistedEntry;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapState {
    Pending,
    Active,
}

#[derive(Debug, Clone)]
pub struct RemapEntry {
    pub main_sector: u64,
    pub spare_sector: u64,
    pub created_at: u64,
    pub error_count: u32,
    pub reason: u16,
    pub state: RemapState,
}

/// Opaque handle into the table's entry vector, returned by
/// `insert_pending` and consumed by `activate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle(usize);

struct Inner {
    entries: Vec<RemapEntry>,
    /// main_sector -> index into `entries`.
    index: HashMap<u64, usize>,
    /// spare_sector -> index into `entries`, to enforce uniqueness.
    spare_index: HashMap<u64, usize>,
    next_spare: u64,
}

/// Direct-mapped lookup cache keyed by the low bits of `main_sector`.
/// An accelerator only: a miss always falls through to the table, and a
/// hit is only ever populated from an ACTIVE entry (spec §4.4).
struct Cache {
    mask: u64,
    /// `(main_sector, spare_sector)` per slot; `main_sector == u64::MAX`
    /// means empty.
    slots: Vec<(AtomicU64, AtomicU64)>,
    hits: AtomicU64,
    misses: AtomicU64,
}

const EMPTY: u64 = u64::MAX;

impl Cache {
    fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "cache size must be a power of two");
        let slots = (0..size)
            .map(|_| (AtomicU64::new(EMPTY), AtomicU64::new(0)))
            .collect();
        Self {
            mask: (size - 1) as u64,
            slots,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn slot_for(&self, main_sector: u64) -> usize {
        (main_sector & self.mask) as usize
    }

    fn get(&self, main_sector: u64) -> Option<u64> {
        let slot = &self.slots[self.slot_for(main_sector)];
        let stored_main = slot.0.load(Ordering::Acquire);
        if stored_main == main_sector {
            let spare = slot.1.load(Ordering::Acquire);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(spare)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn insert(&self, main_sector: u64, spare_sector: u64) {
        let slot = &self.slots[self.slot_for(main_sector)];
        slot.1.store(spare_sector, Ordering::Release);
        slot.0.store(main_sector, Ordering::Release);
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: self.slots.len(),
        }
    }

    fn clear_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
}

/// The remap table: an insertion-ordered collection of entries with
/// unique `main_sector`, unique `spare_sector`, and a fixed capacity
/// (spec §3).
pub struct Table {
    inner: Mutex<Inner>,
    cache: Cache,
    capacity: usize,
    /// Exclusive upper bound on allocatable spare sectors — a device
    /// offset, not a count, so it naturally stays clear of any reserved
    /// region the allocator was seeded past (see `with_spare_base`).
    spare_capacity: u64,
}

impl Table {
    /// Spare sectors are allocated starting at 0. Only correct when the
    /// spare device has no reserved region at its head; production
    /// construction goes through `with_spare_base` instead.
    pub fn new(capacity: usize, cache_size: usize, spare_region_sectors: u64) -> Self {
        Self::with_spare_base(capacity, cache_size, 0, spare_region_sectors)
    }

    /// Like `new`, but allocates spare sectors starting at `spare_base`
    /// rather than 0. The redundant metadata copies occupy the first
    /// `config.metadata_reservation_sectors(..)` sectors of the spare
    /// device (spec §6); passing that value as `spare_base` keeps the
    /// allocator, and therefore every `spare_sector` the dispatcher ever
    /// hands back, out of that reservation (spec §3's allocation-region
    /// invariant).
    pub fn with_spare_base(
        capacity: usize,
        cache_size: usize,
        spare_base: u64,
        spare_region_sectors: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::with_capacity(capacity),
                index: HashMap::new(),
                spare_index: HashMap::new(),
                next_spare: spare_base,
            }),
            cache: Cache::new(cache_size),
            capacity,
            spare_capacity: spare_base.saturating_add(spare_region_sectors),
        }
    }

    /// `lookup` returns `Some(spare)` only for ACTIVE entries (spec §4.4).
    /// Consults the cache first; on miss, falls through to the table and,
    /// on an ACTIVE hit, populates the cache.
    pub fn lookup(&self, main_sector: u64) -> Option<u64> {
        if let Some(spare) = self.cache.get(main_sector) {
            return Some(spare);
        }

        let inner = self.inner.lock().unwrap();
        let idx = *inner.index.get(&main_sector)?;
        let entry = &inner.entries[idx];
        if entry.state == RemapState::Active {
            self.cache.insert(main_sector, entry.spare_sector);
            Some(entry.spare_sector)
        } else {
            None
        }
    }

    /// Allocate the next spare sector and install a PENDING entry for
    /// `main_sector`, under a single critical section (spec §4.4). The
    /// entry's spare-sector claim is never released short of `activate` —
    /// a PENDING entry that fails its durability write stays exactly where
    /// it is so the next failure report for the same sector can retry it
    /// via `pending_handle` (spec §4.6 step 5: "the next failure for S
    /// will retry").
    pub fn insert_pending(&self, main_sector: u64, reason: u16) -> Result<(EntryHandle, u64)> {
        let mut inner = self.inner.lock().unwrap();

        if inner.index.contains_key(&main_sector) {
            return Err(Error::Duplicate(main_sector));
        }
        if inner.entries.len() >= self.capacity {
            return Err(Error::TableFull(self.capacity));
        }
        if inner.next_spare >= self.spare_capacity {
            return Err(Error::TableFull(self.capacity));
        }

        let spare_sector = inner.next_spare;
        inner.next_spare += 1;

        let idx = inner.entries.len();
        inner.entries.push(RemapEntry {
            main_sector,
            spare_sector,
            created_at: crate::metadata_store::now_ns(),
            error_count: 1,
            reason,
            state: RemapState::Pending,
        });
        inner.index.insert(main_sector, idx);
        inner.spare_index.insert(spare_sector, idx);

        Ok((EntryHandle(idx), spare_sector))
    }

    /// Flip an entry from PENDING to ACTIVE and populate the cache. Must
    /// only be called after the durability barrier in spec §4.6 completes.
    pub fn activate(&self, handle: EntryHandle) {
        let (main_sector, spare_sector) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = &mut inner.entries[handle.0];
            entry.state = RemapState::Active;
            (entry.main_sector, entry.spare_sector)
        };
        self.cache.insert(main_sector, spare_sector);
    }

    /// Clone out the entry a handle refers to, for the caller to persist.
    pub fn entry(&self, handle: EntryHandle) -> RemapEntry {
        self.inner.lock().unwrap().entries[handle.0].clone()
    }

    /// Look up the still-PENDING entry a repeat failure report for
    /// `main_sector` collided with, so the pipeline can re-drive its
    /// persist-and-activate instead of dropping the report. Returns `None`
    /// for an ACTIVE entry — a duplicate report against an already-active
    /// remap is a genuine no-op. Bumps `error_count` to record the repeat
    /// observation.
    pub fn pending_handle(&self, main_sector: u64) -> Option<EntryHandle> {
        let mut inner = self.inner.lock().unwrap();
        let idx = *inner.index.get(&main_sector)?;
        let entry = &mut inner.entries[idx];
        if entry.state == RemapState::Pending {
            entry.error_count += 1;
            Some(EntryHandle(idx))
        } else {
            None
        }
    }

    /// Bulk install ACTIVE entries from a persisted metadata record (spec
    /// §4.4/§4.7). Runs exclusively during construction's deferred load.
    pub fn restore_active(&self, persisted: &[PersistedEntry]) {
        let mut inner = self.inner.lock().unwrap();
        for p in persisted {
            if inner.index.contains_key(&p.original_sector) {
                continue;
            }
            let idx = inner.entries.len();
            inner.entries.push(RemapEntry {
                main_sector: p.original_sector,
                spare_sector: p.spare_sector,
                created_at: p.created_at,
                error_count: p.error_count,
                reason: p.reason,
                state: RemapState::Active,
            });
            inner.index.insert(p.original_sector, idx);
            inner.spare_index.insert(p.spare_sector, idx);
            if p.spare_sector + 1 > inner.next_spare {
                inner.next_spare = p.spare_sector + 1;
            }
            self.cache.insert(p.original_sector, p.spare_sector);
        }
    }

    /// Snapshot all entries for serialization (spec §4.4 `iter`).
    pub fn snapshot(&self) -> Vec<RemapEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.state == RemapState::Active)
            .count()
    }

    pub fn next_spare(&self) -> u64 {
        self.inner.lock().unwrap().next_spare
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache_stats(&self) {
        self.cache.clear_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_entry_is_invisible_to_lookup() {
        let table = Table::new(16, 8, 100);
        let (_handle, spare) = table.insert_pending(42, 0).unwrap();
        assert_eq!(table.lookup(42), None);
        assert_eq!(spare, 0);
    }

    #[test]
    fn spare_base_keeps_allocations_out_of_the_reserved_region() {
        let table = Table::with_spare_base(16, 8, 8192, 4);
        let (_handle, first) = table.insert_pending(1, 0).unwrap();
        assert_eq!(first, 8192, "allocation must start past the reserved region");

        for i in 2..5u64 {
            table.insert_pending(i, 0).unwrap();
        }
        assert!(matches!(table.insert_pending(999, 0), Err(Error::TableFull(16))));
    }

    #[test]
    fn activate_makes_entry_visible() {
        let table = Table::new(16, 8, 100);
        let (handle, spare) = table.insert_pending(42, 0).unwrap();
        table.activate(handle);
        assert_eq!(table.lookup(42), Some(spare));
    }

    #[test]
    fn duplicate_main_sector_rejected() {
        let table = Table::new(16, 8, 100);
        let (handle, _) = table.insert_pending(42, 0).unwrap();
        table.activate(handle);
        assert!(matches!(
            table.insert_pending(42, 0),
            Err(Error::Duplicate(42))
        ));
    }

    #[test]
    fn table_full_after_capacity_reached() {
        let table = Table::new(2, 8, 100);
        table.insert_pending(1, 0).unwrap();
        table.insert_pending(2, 0).unwrap();
        assert!(matches!(table.insert_pending(3, 0), Err(Error::TableFull(2))));
    }

    #[test]
    fn spare_exhaustion_after_capacity_sectors_allocated() {
        let table = Table::new(16, 8, 4);
        for i in 0..4 {
            table.insert_pending(i, 0).unwrap();
        }
        assert!(matches!(table.insert_pending(999, 0), Err(Error::TableFull(16))));
    }

    #[test]
    fn restore_active_advances_next_spare() {
        let table = Table::new(16, 8, 100);
        table.restore_active(&[PersistedEntry {
            original_sector: 5,
            spare_sector: 9,
            created_at: 1,
            access_count: 0,
            error_count: 1,
            reason: 0,
            flags: 0,
        }]);
        assert_eq!(table.lookup(5), Some(9));
        assert_eq!(table.next_spare(), 10);
    }

    #[test]
    fn cache_hit_after_first_table_lookup() {
        let table = Table::new(16, 8, 100);
        let (handle, spare) = table.insert_pending(7, 0).unwrap();
        table.activate(handle);
        table.clear_cache_stats();

        for _ in 0..1000 {
            assert_eq!(table.lookup(7), Some(spare));
        }

        let stats = table.cache_stats();
        assert_eq!(stats.hits, 999);
        assert_eq!(stats.misses, 1);
        assert!(stats.hit_rate >= 0.999);
    }

    #[test]
    fn pending_handle_finds_existing_pending_entry_and_bumps_error_count() {
        let table = Table::new(16, 8, 100);
        let (handle, _) = table.insert_pending(1, 0).unwrap();
        let found = table.pending_handle(1).unwrap();
        assert_eq!(found, handle);
        assert_eq!(table.entry(handle).error_count, 2);
    }

    #[test]
    fn pending_handle_ignores_active_entries() {
        let table = Table::new(16, 8, 100);
        let (handle, _) = table.insert_pending(1, 0).unwrap();
        table.activate(handle);
        assert!(table.pending_handle(1).is_none());
    }
}
