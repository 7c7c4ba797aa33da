//! The failure pipeline: implements the write-ahead remap protocol that
//! makes a remap durable before any I/O is ever redirected to it.
//!
//! A dedicated worker thread drains failure reports off an `mpsc`
//! channel (the enqueue side is what must never block, which is all
//! `Sender::send` needs to guarantee). A separate metadata-executor
//! thread does the actual redundant-copy write, woken by a `Condvar`
//! over a small shared slot rather than polling — a persistent,
//! always-on version of the same wake-on-flag-or-stop shape a one-shot
//! deferred task would use.
//!
//! Grounded on a "detect incomplete work, recover or initialize"
//! sequencing applied per failure report instead of once at startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::codec::{DeviceIdentity, HealthSummary, MetadataRecord, PersistedEntry};
use crate::device::Device;
use crate::metadata_store::{self, Durability};
use crate::table::{EntryHandle, RemapEntry, RemapState, Table};

/// A single bad-sector report handed to the pipeline by a host or by
/// the lifecycle controller's health-scan stub.
#[derive(Debug, Clone, Copy)]
pub struct FailureReport {
    pub sector: u64,
    pub reason: u16,
}

struct ExecutorJob {
    handle: EntryHandle,
    record: MetadataRecord,
}

struct ExecutorSlot {
    write_requested: bool,
    stop: bool,
    job: Option<ExecutorJob>,
    outcome: Option<Result<(), String>>,
}

struct ExecutorShared {
    slot: Mutex<ExecutorSlot>,
    cond: Condvar,
}

fn metadata_executor_loop(shared: Arc<ExecutorShared>, spare: Arc<Device>) {
    loop {
        let job = {
            let mut slot = shared.slot.lock().unwrap();
            loop {
                if slot.job.is_some() {
                    break;
                }
                if slot.stop {
                    return;
                }
                slot = shared.cond.wait(slot).unwrap();
            }
            slot.write_requested = false;
            slot.job.take().unwrap()
        };

        let outcome = metadata_store::write(&spare, &job.record, Durability::FirstAck)
            .map_err(|e| e.to_string());

        if let Err(e) = &outcome {
            log::error!("metadata executor: durability write failed: {e}");
        }

        let mut slot = shared.slot.lock().unwrap();
        slot.outcome = Some(outcome);
        shared.cond.notify_all();
    }
}

/// Runs the failure-handling worker thread and the metadata-executor
/// thread, and exposes the enqueue side of the pipeline.
pub struct Pipeline {
    sender: Option<mpsc::Sender<FailureReport>>,
    worker: Option<JoinHandle<()>>,
    executor_shared: Arc<ExecutorShared>,
    executor: Option<JoinHandle<()>>,
}

struct WorkerContext {
    table: Arc<Table>,
    spare: Arc<Device>,
    identity: DeviceIdentity,
    capacity: usize,
    sequence: AtomicU64,
    total_errors: AtomicU64,
}

impl Pipeline {
    /// Start the pipeline. `initial_sequence` should be the sequence
    /// number of the metadata record last read from the spare device
    /// (0 on a cold start with no prior metadata).
    pub fn start(
        table: Arc<Table>,
        spare: Arc<Device>,
        identity: DeviceIdentity,
        capacity: usize,
        initial_sequence: u64,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<FailureReport>();

        let executor_shared = Arc::new(ExecutorShared {
            slot: Mutex::new(ExecutorSlot {
                write_requested: false,
                stop: false,
                job: None,
                outcome: None,
            }),
            cond: Condvar::new(),
        });

        let exec_shared_for_thread = Arc::clone(&executor_shared);
        let spare_for_executor = Arc::clone(&spare);
        let executor = thread::spawn(move || {
            metadata_executor_loop(exec_shared_for_thread, spare_for_executor);
        });

        let ctx = Arc::new(WorkerContext {
            table,
            spare,
            identity,
            capacity,
            sequence: AtomicU64::new(initial_sequence),
            total_errors: AtomicU64::new(0),
        });
        let exec_shared_for_worker = Arc::clone(&executor_shared);

        let worker = thread::spawn(move || {
            worker_loop(receiver, ctx, exec_shared_for_worker);
        });

        Self {
            sender: Some(sender),
            worker: Some(worker),
            executor_shared,
            executor: Some(executor),
        }
    }

    /// Enqueue a failure report. Never blocks on the worker thread.
    pub fn report_failure(&self, sector: u64, reason: u16) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(FailureReport { sector, reason });
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        {
            let mut slot = self.executor_shared.slot.lock().unwrap();
            slot.stop = true;
            self.executor_shared.cond.notify_all();
        }
        if let Some(executor) = self.executor.take() {
            let _ = executor.join();
        }
    }
}

fn worker_loop(
    receiver: mpsc::Receiver<FailureReport>,
    ctx: Arc<WorkerContext>,
    exec_shared: Arc<ExecutorShared>,
) {
    while let Ok(report) = receiver.recv() {
        ctx.total_errors.fetch_add(1, Ordering::Relaxed);

        let handle = match ctx.table.insert_pending(report.sector, report.reason) {
            Ok((handle, _spare_sector)) => handle,
            Err(crate::error::Error::Duplicate(sector)) => match ctx.table.pending_handle(sector) {
                // The earlier attempt for this sector never reached
                // durability (or is still in flight); re-drive it rather
                // than silently dropping the new report.
                Some(handle) => handle,
                None => {
                    log::debug!("sector {} already remapped, ignoring report", report.sector);
                    continue;
                }
            },
            Err(e) => {
                log::error!("cannot allocate remap for sector {}: {e}", report.sector);
                continue;
            }
        };

        let entry = ctx.table.entry(handle);
        let record = build_record(&ctx, &entry);

        if !submit_write(&exec_shared, handle, record) {
            log::warn!(
                "remap for sector {} still pending: metadata did not become durable, will retry on the next failure report",
                report.sector
            );
            continue;
        }

        crate::fault::maybe_crash_at("before_activate");
        ctx.table.activate(handle);
        log::info!(
            "sector {} remapped to spare sector {}",
            entry.main_sector,
            entry.spare_sector
        );
    }
}

fn build_record(ctx: &WorkerContext, new_entry: &RemapEntry) -> MetadataRecord {
    let sequence_number = ctx.sequence.fetch_add(1, Ordering::Relaxed) + 1;

    let mut entries: Vec<PersistedEntry> = ctx
        .table
        .snapshot()
        .into_iter()
        .filter(|e| e.state == RemapState::Active)
        .map(persisted_from_entry)
        .collect();
    entries.push(persisted_from_entry(new_entry.clone()));

    MetadataRecord {
        sequence_number,
        timestamp: metadata_store::now_ns(),
        copy_index: 0,
        identity: ctx.identity.clone(),
        health: HealthSummary {
            total_errors: ctx.total_errors.load(Ordering::Relaxed),
            ..HealthSummary::default()
        },
        capacity: ctx.capacity,
        entries,
    }
}

fn persisted_from_entry(entry: RemapEntry) -> PersistedEntry {
    PersistedEntry {
        original_sector: entry.main_sector,
        spare_sector: entry.spare_sector,
        created_at: entry.created_at,
        access_count: 0,
        error_count: entry.error_count,
        reason: entry.reason,
        flags: 0,
    }
}

/// Hand a record to the metadata executor and block until its
/// durability outcome is known. Returns `true` on success.
fn submit_write(exec_shared: &Arc<ExecutorShared>, handle: EntryHandle, record: MetadataRecord) -> bool {
    {
        let mut slot = exec_shared.slot.lock().unwrap();
        slot.job = Some(ExecutorJob { handle, record });
        slot.write_requested = true;
        slot.outcome = None;
        exec_shared.cond.notify_all();
    }

    let mut slot = exec_shared.slot.lock().unwrap();
    loop {
        if let Some(outcome) = slot.outcome.take() {
            return outcome.is_ok();
        }
        slot = exec_shared.cond.wait(slot).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeviceIdentity;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn spare_device() -> (NamedTempFile, Arc<Device>) {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 16 * 1024 * 1024]).unwrap();
        let dev = Device::open_default(file.path()).unwrap();
        (file, Arc::new(dev))
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            main_uuid: 1,
            spare_uuid: 2,
            main_size_sectors: 1000,
            spare_size_sectors: 32768,
            sector_size: 512,
            capacity: 8,
            fingerprint: 0,
        }
    }

    #[test]
    fn reported_failure_becomes_active_remap() {
        let (_f, spare) = spare_device();
        let table = Arc::new(Table::new(8, 4, 100));

        let pipeline = Pipeline::start(Arc::clone(&table), Arc::clone(&spare), identity(), 8, 0);
        pipeline.report_failure(42, 1);

        let mut spare_sector = None;
        for _ in 0..200 {
            if let Some(s) = table.lookup(42) {
                spare_sector = Some(s);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(spare_sector.is_some());

        drop(pipeline);
        let record = metadata_store::read(&spare, 8).unwrap();
        assert_eq!(record.entries.len(), 1);
        assert_eq!(record.entries[0].original_sector, 42);
    }

    #[test]
    fn duplicate_report_is_ignored() {
        let (_f, spare) = spare_device();
        let table = Arc::new(Table::new(8, 4, 100));
        let pipeline = Pipeline::start(Arc::clone(&table), Arc::clone(&spare), identity(), 8, 0);

        pipeline.report_failure(7, 1);
        for _ in 0..200 {
            if table.lookup(7).is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let first = table.lookup(7).unwrap();

        pipeline.report_failure(7, 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(table.lookup(7), Some(first));
    }

    #[test]
    fn reported_reason_is_persisted() {
        let (_f, spare) = spare_device();
        let table = Arc::new(Table::new(8, 4, 100));
        let pipeline = Pipeline::start(Arc::clone(&table), Arc::clone(&spare), identity(), 8, 0);

        pipeline.report_failure(9, 42);
        for _ in 0..200 {
            if table.lookup(9).is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        drop(pipeline);
        let record = metadata_store::read(&spare, 8).unwrap();
        assert_eq!(record.entries[0].reason, 42);
    }

    #[test]
    fn failed_durability_write_leaves_entry_pending_for_retry() {
        let (_f, spare_rw) = spare_device();
        let spare_ro = Arc::new(
            Device::open_readonly(spare_rw.path(), spare_rw.sector_size()).unwrap(),
        );
        let table = Arc::new(Table::new(8, 4, 100));

        let pipeline = Pipeline::start(Arc::clone(&table), spare_ro, identity(), 8, 0);
        pipeline.report_failure(5, 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(table.active_count(), 0, "a read-only spare can't durably write the record");
        assert_eq!(table.snapshot().len(), 1, "the entry must stay pending, not get dropped");

        // A second report for the same sector must retry the existing
        // pending entry instead of being ignored as an already-remapped
        // duplicate.
        pipeline.report_failure(5, 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(table.active_count(), 0);
        assert_eq!(table.snapshot().len(), 1, "the retry must reuse the same entry, not allocate a new one");
        assert!(table.pending_handle(5).is_some());
    }
}
