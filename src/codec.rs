//! On-disk metadata record layout, encode/decode, checksums.
//!
//! The record is a single fixed-size, packed structure: header, device
//! identification, health summary, remap array, then reserved padding
//! out to a constant footprint. Uses fixed byte offsets, a CRC32
//! trailer computed over the record with the checksum field zeroed,
//! and magic/version guard fields checked before trusting anything
//! else in the buffer.

use crate::error::{Error, Result};

/// 32-bit magic identifying a sparemap metadata record: ASCII "DMR4".
pub const MAGIC: u32 = 0x444D5234;
pub const VERSION: u32 = 4;

/// Reference remap table capacity; also the number of slots serialized in
/// every record regardless of how many are in use.
pub const DEFAULT_CAPACITY: usize = 2048;

const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8 + 4 + 4; // magic,version,structure_size,seq,ts,copy_index,checksum
const IDENTITY_SIZE: usize = 16 + 16 + 8 + 8 + 4 + 4 + 4; // main_uuid,spare_uuid,main_size,spare_size,sector_size,capacity,fingerprint
const HEALTH_SIZE: usize = 8 + 8 + 4 + 8 + 8; // last_scan,next_scan,health_score,total_errors,total_ios
const ENTRY_SIZE: usize = 8 + 8 + 8 + 4 + 4 + 2 + 2; // original_sector,spare_sector,created_at,access_count,error_count,reason,flags
const RESERVED_PADDING: usize = 256;

/// Total on-disk size of a record with the given remap capacity.
pub fn record_size(capacity: usize) -> usize {
    HEADER_SIZE + IDENTITY_SIZE + HEALTH_SIZE + 4 /* active_count */ + capacity * ENTRY_SIZE + RESERVED_PADDING
}

/// Sectors a record occupies given a sector size.
pub fn record_sectors(capacity: usize, sector_size: u32) -> u64 {
    (record_size(capacity) as u64).div_ceil(sector_size as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapState {
    Pending,
    Active,
}

/// A single persisted remap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedEntry {
    pub original_sector: u64,
    pub spare_sector: u64,
    pub created_at: u64,
    pub access_count: u32,
    pub error_count: u32,
    pub reason: u16,
    pub flags: u16,
}

impl PersistedEntry {
    const SIZE: usize = ENTRY_SIZE;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.original_sector.to_le_bytes());
        buf[8..16].copy_from_slice(&self.spare_sector.to_le_bytes());
        buf[16..24].copy_from_slice(&self.created_at.to_le_bytes());
        buf[24..28].copy_from_slice(&self.access_count.to_le_bytes());
        buf[28..32].copy_from_slice(&self.error_count.to_le_bytes());
        buf[32..34].copy_from_slice(&self.reason.to_le_bytes());
        buf[34..36].copy_from_slice(&self.flags.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        Self {
            original_sector: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            spare_sector: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            created_at: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            access_count: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            error_count: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            reason: u16::from_le_bytes(buf[32..34].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[34..36].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthSummary {
    pub last_scan_time: u64,
    pub next_scan_time: u64,
    pub health_score: u32,
    pub total_errors: u64,
    pub total_ios: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceIdentity {
    pub main_uuid: u128,
    pub spare_uuid: u128,
    pub main_size_sectors: u64,
    pub spare_size_sectors: u64,
    pub sector_size: u32,
    pub capacity: u32,
    pub fingerprint: u32,
}

impl DeviceIdentity {
    pub fn compute_fingerprint(main_uuid: u128, spare_uuid: u128, main_size: u64, spare_size: u64) -> u32 {
        let mut buf = Vec::with_capacity(16 + 16 + 8 + 8);
        buf.extend_from_slice(&main_uuid.to_le_bytes());
        buf.extend_from_slice(&spare_uuid.to_le_bytes());
        buf.extend_from_slice(&main_size.to_le_bytes());
        buf.extend_from_slice(&spare_size.to_le_bytes());
        crc32fast::hash(&buf)
    }
}

/// The full logical metadata record.
#[derive(Debug, Clone)]
pub struct MetadataRecord {
    pub sequence_number: u64,
    pub timestamp: u64,
    pub copy_index: u32,
    pub identity: DeviceIdentity,
    pub health: HealthSummary,
    pub capacity: usize,
    /// Active entries only, insertion order. `encode` pads with zero
    /// slots out to `capacity`.
    pub entries: Vec<PersistedEntry>,
}

impl MetadataRecord {
    /// Serialize this record to bytes with `copy_index` substituted and the
    /// header checksum recomputed for that copy, as required when writing
    /// the same logical record to N distinct offsets.
    pub fn encode_for_copy(&self, copy_index: u32) -> Vec<u8> {
        let mut rec = self.clone();
        rec.copy_index = copy_index;
        rec.encode()
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = record_size(self.capacity);
        let mut buf = vec![0u8; size];

        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(size as u32).to_le_bytes());
        buf[12..20].copy_from_slice(&self.sequence_number.to_le_bytes());
        buf[20..28].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[28..32].copy_from_slice(&self.copy_index.to_le_bytes());
        // checksum field at 32..36 stays zero during the hash pass

        let mut off = HEADER_SIZE;
        buf[off..off + 16].copy_from_slice(&self.identity.main_uuid.to_le_bytes());
        buf[off + 16..off + 32].copy_from_slice(&self.identity.spare_uuid.to_le_bytes());
        buf[off + 32..off + 40].copy_from_slice(&self.identity.main_size_sectors.to_le_bytes());
        buf[off + 40..off + 48].copy_from_slice(&self.identity.spare_size_sectors.to_le_bytes());
        buf[off + 48..off + 52].copy_from_slice(&self.identity.sector_size.to_le_bytes());
        buf[off + 52..off + 56].copy_from_slice(&(self.capacity as u32).to_le_bytes());
        buf[off + 56..off + 60].copy_from_slice(&self.identity.fingerprint.to_le_bytes());
        off += IDENTITY_SIZE;

        buf[off..off + 8].copy_from_slice(&self.health.last_scan_time.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&self.health.next_scan_time.to_le_bytes());
        buf[off + 16..off + 20].copy_from_slice(&self.health.health_score.to_le_bytes());
        buf[off + 20..off + 28].copy_from_slice(&self.health.total_errors.to_le_bytes());
        buf[off + 28..off + 36].copy_from_slice(&self.health.total_ios.to_le_bytes());
        off += HEALTH_SIZE;

        buf[off..off + 4].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        off += 4;

        for (i, entry) in self.entries.iter().enumerate() {
            let start = off + i * ENTRY_SIZE;
            entry.encode_into(&mut buf[start..start + ENTRY_SIZE]);
        }
        // slots beyond active_count are left zeroed.

        let checksum = crc32fast::hash(&buf);
        buf[32..36].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let min_header = HEADER_SIZE;
        if data.len() < min_header {
            return Err(Error::TruncatedRecord {
                got: data.len(),
                need: min_header,
            });
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::BadMagic);
        }

        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(Error::BadVersion(version));
        }

        let structure_size = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        if structure_size < HEADER_SIZE {
            // A corrupt-but-not-truncated record could claim a
            // structure_size that doesn't even cover the header fields
            // read below; reject it here instead of indexing out of
            // bounds on `data[..structure_size]`.
            return Err(Error::TruncatedRecord {
                got: structure_size,
                need: HEADER_SIZE,
            });
        }
        if data.len() < structure_size {
            return Err(Error::TruncatedRecord {
                got: data.len(),
                need: structure_size,
            });
        }
        let data = &data[..structure_size];

        let sequence_number = u64::from_le_bytes(data[12..20].try_into().unwrap());
        let timestamp = u64::from_le_bytes(data[20..28].try_into().unwrap());
        let copy_index = u32::from_le_bytes(data[28..32].try_into().unwrap());
        let stored_checksum = u32::from_le_bytes(data[32..36].try_into().unwrap());

        if copy_index as usize >= crate::config::METADATA_COPIES {
            return Err(Error::BadCopyIndex(copy_index));
        }

        let mut zeroed = data.to_vec();
        zeroed[32..36].copy_from_slice(&0u32.to_le_bytes());
        let computed = crc32fast::hash(&zeroed);
        if computed != stored_checksum {
            return Err(Error::ChecksumMismatch);
        }

        let mut off = HEADER_SIZE;
        let need = off + IDENTITY_SIZE + HEALTH_SIZE + 4;
        if data.len() < need {
            return Err(Error::TruncatedRecord {
                got: data.len(),
                need,
            });
        }

        let main_uuid = u128::from_le_bytes(data[off..off + 16].try_into().unwrap());
        let spare_uuid = u128::from_le_bytes(data[off + 16..off + 32].try_into().unwrap());
        let main_size_sectors = u64::from_le_bytes(data[off + 32..off + 40].try_into().unwrap());
        let spare_size_sectors = u64::from_le_bytes(data[off + 40..off + 48].try_into().unwrap());
        let sector_size = u32::from_le_bytes(data[off + 48..off + 52].try_into().unwrap());
        let capacity = u32::from_le_bytes(data[off + 52..off + 56].try_into().unwrap()) as usize;
        let fingerprint = u32::from_le_bytes(data[off + 56..off + 60].try_into().unwrap());
        off += IDENTITY_SIZE;

        let identity = DeviceIdentity {
            main_uuid,
            spare_uuid,
            main_size_sectors,
            spare_size_sectors,
            sector_size,
            capacity: capacity as u32,
            fingerprint,
        };

        let health = HealthSummary {
            last_scan_time: u64::from_le_bytes(data[off..off + 8].try_into().unwrap()),
            next_scan_time: u64::from_le_bytes(data[off + 8..off + 16].try_into().unwrap()),
            health_score: u32::from_le_bytes(data[off + 16..off + 20].try_into().unwrap()),
            total_errors: u64::from_le_bytes(data[off + 20..off + 28].try_into().unwrap()),
            total_ios: u64::from_le_bytes(data[off + 28..off + 36].try_into().unwrap()),
        };
        off += HEALTH_SIZE;

        let active_count = u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as usize;
        off += 4;

        let entries_need = off + capacity * ENTRY_SIZE;
        if data.len() < entries_need || active_count > capacity {
            return Err(Error::TruncatedRecord {
                got: data.len(),
                need: entries_need,
            });
        }

        let mut entries = Vec::with_capacity(active_count);
        for i in 0..active_count {
            let start = off + i * PersistedEntry::SIZE;
            entries.push(PersistedEntry::decode_from(
                &data[start..start + PersistedEntry::SIZE],
            ));
        }

        Ok(Self {
            sequence_number,
            timestamp,
            copy_index,
            identity,
            health,
            capacity,
            entries,
        })
    }
}
