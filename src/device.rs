use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::system::get_block_device_size;

/// Wrapper around a block device or image file for sector-based I/O.
///
/// The main and spare roles in the remap engine are both represented by
/// this same type, opened with whichever logical sector size the host
/// reported for that device.
pub struct Device {
    file: File,
    path: PathBuf,
    sector_size: u32,
    total_sectors: u64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("sector_size", &self.sector_size)
            .field("total_sectors", &self.total_sectors)
            .finish_non_exhaustive()
    }
}

impl Device {
    const DEFAULT_SECTOR_SIZE: u32 = 512;

    /// Internal helper to open a device with specified mode and sector size.
    fn open_impl<P: AsRef<Path>>(path: P, writable: bool, sector_size: u32) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let path_display = path_buf.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path_buf)
            .map_err(|_| Error::DeviceNotFound(path_display))?;

        let metadata = file.metadata()?;
        let size = if metadata.is_file() {
            metadata.len()
        } else {
            get_block_device_size(&path_buf).unwrap_or(0)
        };
        let size = if size == 0 {
            let mut f = file.try_clone()?;
            f.seek(SeekFrom::End(0))?
        } else {
            size
        };

        if sector_size == 0 {
            return Err(Error::UnsupportedSectorSize(sector_size));
        }

        let total_sectors = size / sector_size as u64;

        Ok(Self {
            file,
            path: path_buf,
            sector_size,
            total_sectors,
        })
    }

    /// Open a device or image file for read/write access with a given
    /// logical sector size.
    pub fn open<P: AsRef<Path>>(path: P, sector_size: u32) -> Result<Self> {
        Self::open_impl(path, true, sector_size)
    }

    /// Open a device or image file for read/write access, assuming the
    /// reference 512-byte sector size.
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path, true, Self::DEFAULT_SECTOR_SIZE)
    }

    /// Open a device in read-only mode.
    pub fn open_readonly<P: AsRef<Path>>(path: P, sector_size: u32) -> Result<Self> {
        Self::open_impl(path, false, sector_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Physical sector size in bytes, as configured at open time.
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Logical sector size. For plain files and most block devices this is
    /// the same as the physical sector size; kept distinct so main/spare
    /// compatibility checks can validate logical sizes even where physical
    /// sizes (e.g. 4Kn drives reporting 512e) differ.
    pub fn logical_sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn size_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Alias kept for readability at call sites that think in "total sectors".
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn file_size(&self) -> Result<u64> {
        let metadata = self.file.metadata()?;
        if metadata.is_file() {
            Ok(metadata.len())
        } else {
            let mut f = self.file.try_clone()?;
            Ok(f.seek(SeekFrom::End(0))?)
        }
    }

    pub fn size_bytes(&self) -> Result<u64> {
        self.file_size()
    }

    /// Read sectors starting at the given sector number.
    pub fn read_sectors(&self, start_sector: u64, count: u32) -> Result<Vec<u8>> {
        let offset = start_sector * self.sector_size as u64;
        let size = count as usize * self.sector_size as usize;
        let mut buffer = vec![0u8; size];

        self.file.read_exact_at(&mut buffer, offset)?;
        Ok(buffer)
    }

    pub fn read_sector(&self, sector: u64) -> Result<Vec<u8>> {
        self.read_sectors(sector, 1)
    }

    /// Write sectors starting at the given sector number.
    pub fn write_sectors(&self, start_sector: u64, data: &[u8]) -> Result<()> {
        let offset = start_sector * self.sector_size as u64;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn write_sector(&self, sector: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.sector_size as usize {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "Data size {} does not match sector size {}",
                    data.len(),
                    self.sector_size
                ),
            )));
        }
        self.write_sectors(sector, data)
    }

    /// Flush all writes to disk. A copy is only durable once this has
    /// returned successfully for the write that produced it.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn read_bytes_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        self.file.read_exact_at(&mut buffer, offset)?;
        Ok(buffer)
    }

    pub fn write_bytes_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }
}

/// Construction-time compatibility validation between main and spare
/// devices: equal logical sector sizes, a minimum main size, and a spare
/// size sufficient for metadata plus the configured spare allocation,
/// expanded by a safety margin.
pub fn validate_pair(
    main: &Device,
    spare: &Device,
    config: &crate::config::Config,
    record_sectors: u64,
) -> Result<()> {
    if main.logical_sector_size() != spare.logical_sector_size() {
        return Err(Error::SectorSizeMismatch {
            main: main.logical_sector_size(),
            spare: spare.logical_sector_size(),
        });
    }

    const MIN_MAIN_SECTORS: u64 = 1;
    if main.size_sectors() < MIN_MAIN_SECTORS {
        return Err(Error::MainDeviceTooSmall {
            actual: main.size_sectors(),
            minimum: MIN_MAIN_SECTORS,
        });
    }

    let required = config.minimum_spare_sectors(main.size_sectors(), record_sectors);
    if spare.size_sectors() < required {
        return Err(Error::SpareTooSmall {
            actual: spare.size_sectors(),
            required,
        });
    }

    if config.strict_size_mode {
        let strict_min = (main.size_sectors() as f64 * 1.05).ceil() as u64;
        if spare.size_sectors() < strict_min {
            return Err(Error::SpareTooSmall {
                actual: spare.size_sectors(),
                required: strict_min,
            });
        }
    }

    Ok(())
}
