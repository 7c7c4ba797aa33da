use thiserror::Error;

/// All errors that can occur while operating the remap engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Device '{0}' not found or cannot be opened")]
    DeviceNotFound(String),

    #[error("Device '{0}' is currently mounted at '{1}'")]
    DeviceMounted(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device sector size {0} is not supported")]
    UnsupportedSectorSize(u32),

    // --- C1: device compatibility (construction-time, fatal) ---
    #[error("Main and spare devices report different logical sector sizes ({main} vs {spare})")]
    SectorSizeMismatch { main: u32, spare: u32 },

    #[error("Main device has {actual} sectors, which is below the minimum of {minimum}")]
    MainDeviceTooSmall { actual: u64, minimum: u64 },

    #[error("Spare device has {actual} sectors, needs at least {required} for metadata plus the configured spare allocation")]
    SpareTooSmall { actual: u64, required: u64 },

    // --- C2: metadata codec errors, internal to C3's read protocol ---
    #[error("Metadata record has bad magic bytes")]
    BadMagic,

    #[error("Metadata record version {0} is not supported")]
    BadVersion(u32),

    #[error("Metadata record header checksum does not validate")]
    ChecksumMismatch,

    #[error("Metadata record is truncated (got {got} bytes, need {need})")]
    TruncatedRecord { got: usize, need: usize },

    #[error("Metadata record copy_index {0} is out of range")]
    BadCopyIndex(u32),

    // --- C3: redundant metadata store ---
    #[error("No valid metadata copy could be read from the spare device")]
    NoValidMetadata,

    #[error("Metadata write did not become durable: {0}")]
    MetadataWriteFailed(String),

    // --- C4/C6: remap table and failure pipeline ---
    #[error("Remap table is full (capacity {0} reached)")]
    TableFull(usize),

    #[error("A remap entry for main sector {0} already exists")]
    Duplicate(u64),

    // --- C5: dispatcher ---
    #[error("I/O at sector {sector} is out of range (main device has {limit} sectors)")]
    OutOfRange { sector: u64, limit: u64 },

    // --- C7: lifecycle ---
    #[error("Instance is shutting down; no further I/O can be serviced")]
    ShutdownInProgress,

    #[error("Instance is not in the required state for this operation (expected {expected}, was {actual})")]
    WrongState {
        expected: &'static str,
        actual: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
