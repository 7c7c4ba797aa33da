//! Textual control-interface commands from spec §6: `status`, `stats`,
//! `clear_stats`, `health`, `cache_stats`. Exposed to a human operator
//! through CLI subcommands in `main.rs`, the same way the teacher's
//! `Info`/`Version` subcommands format a small report against a live
//! value rather than returning raw structs to a terminal.

use crate::lifecycle::{Instance, LifecycleState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Stats,
    ClearStats,
    Health,
    CacheStats,
}

pub fn handle(instance: &Instance, command: Command) -> String {
    match command {
        Command::Status => status(instance),
        Command::Stats => stats(instance),
        Command::ClearStats => clear_stats(instance),
        Command::Health => health(instance),
        Command::CacheStats => cache_stats(instance),
    }
}

fn state_name(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Constructing => "constructing",
        LifecycleState::Active => "active",
        LifecycleState::Suspending => "suspending",
        LifecycleState::Destroyed => "destroyed",
    }
}

fn status(instance: &Instance) -> String {
    format!(
        "state: {}\nmain_sectors: {}\nactive_remaps: {}\nmain_uuid: {:032x}\nspare_uuid: {:032x}",
        state_name(instance.state()),
        instance.main_sectors(),
        instance.active_remap_count(),
        instance.identity().main_uuid,
        instance.identity().spare_uuid,
    )
}

fn stats(instance: &Instance) -> String {
    let s = instance.dispatch_stats();
    format!(
        "reads_forwarded: {}\nwrites_forwarded: {}\nreads_redirected: {}\nwrites_redirected: {}\nrejected: {}\ntotal_errors_seen: {}",
        s.reads_forwarded,
        s.writes_forwarded,
        s.reads_redirected,
        s.writes_redirected,
        s.rejected,
        instance.total_errors_seen(),
    )
}

fn clear_stats(instance: &Instance) -> String {
    instance.clear_stats();
    "stats cleared".to_string()
}

fn health(instance: &Instance) -> String {
    let h = instance.health_snapshot();
    format!(
        "health_score: {}\nscan_count: {}\nhotspot_count: {}\nconsecutive_error_count: {}",
        h.health_score, h.scan_count, h.hotspot_count, h.consecutive_error_count,
    )
}

fn cache_stats(instance: &Instance) -> String {
    let s = instance.cache_stats();
    format!(
        "size: {}\nhits: {}\nmisses: {}\nhit_rate: {:.4}",
        s.size, s.hits, s.misses, s.hit_rate,
    )
}
