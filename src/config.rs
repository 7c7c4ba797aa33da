//! Policy knobs for the remap engine, gathered in one place.
//!
//! There is no on-disk config file; a host embeds `Config` directly, or
//! the CLI builds one from `clap` flags and passes it straight to the
//! library entry point.

/// Fixed sector offsets for the N redundant metadata copies.
pub const METADATA_COPY_OFFSETS: [u64; 5] = [0, 1024, 2048, 4096, 8192];

/// Number of redundant metadata copies.
pub const METADATA_COPIES: usize = METADATA_COPY_OFFSETS.len();

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of remap entries the table can hold.
    pub table_capacity: usize,
    /// Size of the direct-mapped lookup cache; must be a power of two.
    pub cache_size: usize,
    /// Fraction of the main device expected to go bad, used to size the
    /// spare allocation region. Clamped to [0.0, 0.20] by `validate`.
    pub expected_bad_fraction: f64,
    /// Expected count of bad sectors, used in the spare-size formula
    /// alongside `expected_bad_fraction`.
    pub expected_bad_count: u64,
    /// Per-entry overhead (bytes) budgeted into the spare-size formula.
    pub per_entry_overhead: u64,
    /// Safety margin multiplier applied to the computed minimum spare size.
    pub safety_margin: f64,
    /// When set, construction requires `spare_size >= main_size * 1.05`.
    pub strict_size_mode: bool,
    /// Fraction of the spare device, after the metadata reservation, made
    /// available for replacement sectors (reference: first half).
    pub spare_region_fraction: f64,
    /// Delay before the deferred metadata load runs after construction
    /// returns, so construction itself stays fast.
    pub deferred_load_delay: std::time::Duration,
    /// Interval between background health-scan ticks (spec §4.7). The
    /// scanner's scoring policy is out of scope; this only paces how
    /// often the stub tick runs.
    pub health_scan_interval: std::time::Duration,
}

impl Config {
    /// Minimum sectors reserved for metadata at the head of the spare device:
    /// the last copy offset plus one full record's worth of sectors.
    pub fn metadata_reservation_sectors(&self, record_sectors: u64) -> u64 {
        METADATA_COPY_OFFSETS[METADATA_COPIES - 1] + record_sectors
    }

    /// Spare-size formula, expanded by `safety_margin`.
    pub fn minimum_spare_sectors(&self, main_size_sectors: u64, record_sectors: u64) -> u64 {
        let metadata_base = self.metadata_reservation_sectors(record_sectors);
        let bad_fraction_cost = (main_size_sectors as f64 * self.expected_bad_fraction) as u64;
        let per_entry_cost = self.per_entry_overhead * self.expected_bad_count;
        let base = metadata_base + bad_fraction_cost + per_entry_cost;
        (base as f64 * self.safety_margin).ceil() as u64
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_capacity: 2048,
            cache_size: 256,
            expected_bad_fraction: 0.02,
            expected_bad_count: 64,
            per_entry_overhead: 64,
            safety_margin: 1.10,
            strict_size_mode: false,
            spare_region_fraction: 0.5,
            deferred_load_delay: std::time::Duration::from_millis(100),
            health_scan_interval: std::time::Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bad_fraction_within_max() {
        let cfg = Config::default();
        assert!(cfg.expected_bad_fraction <= 0.20);
    }

    #[test]
    fn minimum_spare_sectors_grows_with_main_size() {
        let cfg = Config::default();
        let small = cfg.minimum_spare_sectors(1_000_000, 48);
        let large = cfg.minimum_spare_sectors(10_000_000, 48);
        assert!(large > small);
    }
}
