//! Fault injection for crash-recovery testing.
//!
//! Only available when compiled with `--features fault-injection`. Set
//! `SPAREMAP_CRASH_AT` to the name of one of the points below to have the
//! process killed at that point, so a test harness can kill the process
//! mid-operation and then verify recovery on restart:
//!
//!   - "after_first_copy_write" - after the first redundant metadata copy
//!     lands durably, before the remaining copies are written
//!   - "before_activate" - after the metadata write returns durable,
//!     before the table entry flips from PENDING to ACTIVE
//!
//! Usage: `SPAREMAP_CRASH_AT=before_activate sparemap simulate-failure ...`

#[cfg(feature = "fault-injection")]
pub fn maybe_crash_at(point: &str) {
    if let Ok(crash_point) = std::env::var("SPAREMAP_CRASH_AT") {
        if crash_point == point {
            eprintln!("FAULT INJECTION: simulating crash at '{point}'");
            std::process::exit(137);
        }
    }
}

#[cfg(not(feature = "fault-injection"))]
#[inline(always)]
pub fn maybe_crash_at(_point: &str) {}
