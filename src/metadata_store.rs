//! Redundant metadata store: N identical copies at fixed sector offsets
//! on the spare device, selected by highest sequence number on read,
//! with best-effort self-repair of damaged copies.
//!
//! Generalizes a write/read/recover checkpoint trio (write a record,
//! read it back, detect and repair an incomplete or torn write) from a
//! single ad hoc checkpoint sector to `config::METADATA_COPY_OFFSETS`
//! full records.

use crate::codec::{record_sectors, MetadataRecord};
use crate::config::{Config, METADATA_COPIES, METADATA_COPY_OFFSETS};
use crate::device::Device;
use crate::error::{Error, Result};

/// Outcome of a single copy's decode attempt during the read protocol.
enum CopyResult {
    Valid(MetadataRecord),
    Invalid,
}

/// Read all N copies, decode independently, and select the one with the
/// largest `sequence_number` (ties broken by smallest `copy_index`).
/// Schedules (synchronously, best-effort) repair writes for any copy that
/// failed to validate. Returns `NoValidMetadata` if none validate.
pub fn read(spare: &Device, capacity: usize) -> Result<MetadataRecord> {
    let sector_size = spare.sector_size();
    let sectors = record_sectors(capacity, sector_size) as u32;

    let mut results: Vec<CopyResult> = Vec::with_capacity(METADATA_COPIES);
    for &offset in METADATA_COPY_OFFSETS.iter() {
        let outcome = match spare.read_sectors(offset, sectors) {
            Ok(bytes) => match MetadataRecord::decode(&bytes) {
                Ok(rec) => CopyResult::Valid(rec),
                Err(e) => {
                    log::warn!("metadata copy at sector {offset} failed to decode: {e}");
                    CopyResult::Invalid
                }
            },
            Err(e) => {
                log::warn!("metadata copy at sector {offset} failed to read: {e}");
                CopyResult::Invalid
            }
        };
        results.push(outcome);
    }

    let best_idx = results
        .iter()
        .enumerate()
        .filter_map(|(i, r)| match r {
            CopyResult::Valid(rec) => Some((i, rec.sequence_number)),
            CopyResult::Invalid => None,
        })
        .max_by_key(|&(i, seq)| (seq, std::cmp::Reverse(i)))
        .map(|(i, _)| i);

    let Some(best_idx) = best_idx else {
        return Err(Error::NoValidMetadata);
    };

    let selected = match &results[best_idx] {
        CopyResult::Valid(rec) => rec.clone(),
        CopyResult::Invalid => unreachable!(),
    };

    for (i, result) in results.iter().enumerate() {
        if i == best_idx {
            continue;
        }
        if matches!(result, CopyResult::Invalid) {
            repair_copy(spare, &selected, i);
        }
    }

    Ok(selected)
}

/// Rewrite a single damaged copy with the selected record, substituting
/// that copy's index. Best-effort: failures are logged, never propagated.
fn repair_copy(spare: &Device, selected: &MetadataRecord, copy_index: usize) {
    let offset = METADATA_COPY_OFFSETS[copy_index];
    let bytes = selected.encode_for_copy(copy_index as u32);
    match spare.write_sectors(offset, &bytes) {
        Ok(()) => log::info!("repaired metadata copy {copy_index} at sector {offset}"),
        Err(e) => log::warn!("failed to repair metadata copy {copy_index} at sector {offset}: {e}"),
    }
}

/// Durability threshold for a write. Spec §4.3/§9 normalizes to "at least
/// one acknowledged copy suffices"; `All` is the stricter, implementation-
/// optional barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    FirstAck,
    AllAck,
}

/// Write N copies of `record` (each with a distinct `copy_index` and
/// recomputed checksum) to the spare device. Returns once the configured
/// durability threshold is met.
pub fn write(spare: &Device, record: &MetadataRecord, durability: Durability) -> Result<()> {
    let mut first_err = None;
    let mut any_ok = false;

    for (i, &offset) in METADATA_COPY_OFFSETS.iter().enumerate() {
        let bytes = record.encode_for_copy(i as u32);
        match spare.write_sectors(offset, &bytes).and_then(|_| spare.sync()) {
            Ok(()) => {
                any_ok = true;
                if i == 0 {
                    crate::fault::maybe_crash_at("after_first_copy_write");
                }
                if durability == Durability::FirstAck {
                    return Ok(());
                }
            }
            Err(e) => {
                log::warn!("metadata write to copy {i} at sector {offset} failed: {e}");
                first_err.get_or_insert(e);
            }
        }
    }

    if any_ok {
        Ok(())
    } else {
        Err(first_err.unwrap_or(Error::MetadataWriteFailed(
            "no copy write succeeded".to_string(),
        )))
    }
}

/// Write an initial empty record: first-boot initialization for a pair
/// with no valid metadata on the spare device yet.
pub fn write_initial(
    spare: &Device,
    main: &Device,
    config: &Config,
    main_uuid: u128,
    spare_uuid: u128,
) -> Result<MetadataRecord> {
    use crate::codec::{DeviceIdentity, HealthSummary};

    let fingerprint = DeviceIdentity::compute_fingerprint(
        main_uuid,
        spare_uuid,
        main.size_sectors(),
        spare.size_sectors(),
    );

    let record = MetadataRecord {
        sequence_number: 1,
        timestamp: now_ns(),
        copy_index: 0,
        identity: DeviceIdentity {
            main_uuid,
            spare_uuid,
            main_size_sectors: main.size_sectors(),
            spare_size_sectors: spare.size_sectors(),
            sector_size: main.sector_size(),
            capacity: config.table_capacity as u32,
            fingerprint,
        },
        health: HealthSummary::default(),
        capacity: config.table_capacity,
        entries: Vec::new(),
    };

    write(spare, &record, Durability::FirstAck)?;
    Ok(record)
}

pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DeviceIdentity, HealthSummary, PersistedEntry};
    use tempfile::NamedTempFile;

    fn spare_device() -> (NamedTempFile, Device) {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 16 * 1024 * 1024]).unwrap();
        let dev = Device::open_default(file.path()).unwrap();
        (file, dev)
    }

    fn record_with_seq(seq: u64) -> MetadataRecord {
        MetadataRecord {
            sequence_number: seq,
            timestamp: 1,
            copy_index: 0,
            identity: DeviceIdentity {
                main_uuid: 1,
                spare_uuid: 2,
                main_size_sectors: 1000,
                spare_size_sectors: 1000,
                sector_size: 512,
                capacity: 8,
                fingerprint: 0,
            },
            health: HealthSummary::default(),
            capacity: 8,
            entries: vec![PersistedEntry {
                original_sector: 42,
                spare_sector: 0,
                created_at: 1,
                access_count: 0,
                error_count: 1,
                reason: 0,
                flags: 0,
            }],
        }
    }

    #[test]
    fn cold_start_has_no_valid_metadata() {
        let (_f, spare) = spare_device();
        let err = read(&spare, 8).unwrap_err();
        assert!(matches!(err, Error::NoValidMetadata));
    }

    #[test]
    fn write_then_read_round_trips_highest_sequence() {
        let (_f, spare) = spare_device();
        let rec = record_with_seq(5);
        write(&spare, &rec, Durability::AllAck).unwrap();
        let read_back = read(&spare, 8).unwrap();
        assert_eq!(read_back.sequence_number, 5);
        assert_eq!(read_back.entries[0].original_sector, 42);
    }

    #[test]
    fn torn_metadata_recovers_from_surviving_copy() {
        let (_f, spare) = spare_device();
        let rec = record_with_seq(9);
        write(&spare, &rec, Durability::AllAck).unwrap();

        // Corrupt copies at offsets 0 and 1024.
        let sector_size = spare.sector_size();
        let sectors = record_sectors(8, sector_size) as u32;
        spare
            .write_sectors(0, &vec![0u8; (sectors as usize) * sector_size as usize])
            .unwrap();
        spare
            .write_sectors(1024, &vec![0u8; (sectors as usize) * sector_size as usize])
            .unwrap();

        let recovered = read(&spare, 8).unwrap();
        assert_eq!(recovered.sequence_number, 9);

        // Self-repair should have rewritten sector 0.
        let repaired = read(&spare, 8).unwrap();
        assert_eq!(repaired.sequence_number, 9);
    }

    #[test]
    fn self_repair_is_idempotent() {
        let (_f, spare) = spare_device();
        let rec = record_with_seq(3);
        write(&spare, &rec, Durability::AllAck).unwrap();

        let sector_size = spare.sector_size();
        let sectors = record_sectors(8, sector_size) as u32;
        spare
            .write_sectors(0, &vec![0u8; (sectors as usize) * sector_size as usize])
            .unwrap();

        let first = read(&spare, 8).unwrap();
        let second = read(&spare, 8).unwrap();
        assert_eq!(first.sequence_number, second.sequence_number);

        // After the first repair, a second read sees all copies valid and
        // performs no further rewrite of already-consistent copies.
        let third = read(&spare, 8).unwrap();
        assert_eq!(third.sequence_number, 3);
    }

    #[test]
    fn tie_break_prefers_smallest_copy_index() {
        // Write copy 0 and copy 1 with the same (high) sequence directly,
        // simulating a race where two copies share a sequence number.
        let (_f, spare) = spare_device();
        let rec = record_with_seq(4);
        write(&spare, &rec, Durability::AllAck).unwrap();
        let selected = read(&spare, 8).unwrap();
        assert_eq!(selected.copy_index, 0);
    }
}
