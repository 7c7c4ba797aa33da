//! C5: the I/O dispatcher. Consults the cache, then the table, and
//! forwards or redirects each request (spec §4.5's five-step
//! algorithm). Grounded on the teacher's request-trail style of
//! returning a result plus a running tally, generalized here into
//! atomic per-direction counters since the dispatcher is on the hot
//! path and must not take the table lock to count.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::io::{Direction, DispatchResult, IoKind, IoRequest};
use crate::table::Table;

/// Snapshot-readable counters that don't require the table lock
/// (spec §9).
#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub reads_forwarded: AtomicU64,
    pub writes_forwarded: AtomicU64,
    pub reads_redirected: AtomicU64,
    pub writes_redirected: AtomicU64,
    pub rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchStats {
    pub reads_forwarded: u64,
    pub writes_forwarded: u64,
    pub reads_redirected: u64,
    pub writes_redirected: u64,
    pub rejected: u64,
}

impl DispatchCounters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            reads_forwarded: self.reads_forwarded.load(Ordering::Relaxed),
            writes_forwarded: self.writes_forwarded.load(Ordering::Relaxed),
            reads_redirected: self.reads_redirected.load(Ordering::Relaxed),
            writes_redirected: self.writes_redirected.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn clear(&self) {
        self.reads_forwarded.store(0, Ordering::Relaxed);
        self.writes_forwarded.store(0, Ordering::Relaxed);
        self.reads_redirected.store(0, Ordering::Relaxed);
        self.writes_redirected.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }
}

/// Dispatches host I/O requests against a remap table for a single
/// main device of `main_sectors` total sectors.
pub struct Dispatcher {
    main_sectors: u64,
    counters: DispatchCounters,
}

impl Dispatcher {
    pub fn new(main_sectors: u64) -> Self {
        Self {
            main_sectors,
            counters: DispatchCounters::default(),
        }
    }

    /// Five-step algorithm from spec §4.5: reject out-of-range, count,
    /// cache hit, table hit, forward.
    pub fn handle_io(&self, table: &Table, request: &IoRequest) -> DispatchResult {
        let end = request.sector.saturating_add(request.count as u64);
        if request.sector >= self.main_sectors || end > self.main_sectors {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return DispatchResult::Rejected;
        }

        let is_write = matches!(
            request.kind,
            IoKind::Write | IoKind::WriteZeroes | IoKind::Discard
        );

        match table.lookup(request.sector) {
            Some(spare_sector) => {
                if is_write {
                    self.counters.writes_redirected.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.reads_redirected.fetch_add(1, Ordering::Relaxed);
                }
                DispatchResult::Submitted { spare_sector }
            }
            None => {
                if is_write {
                    self.counters.writes_forwarded.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.reads_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                DispatchResult::Forwarded(Direction::Main)
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Zero all dispatch counters (spec §6 `clear_stats`).
    pub fn clear_stats(&self) {
        self.counters.clear();
    }
}
