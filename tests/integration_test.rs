use std::os::unix::fs::FileExt;
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;

use sparemap::config::METADATA_COPY_OFFSETS;
use sparemap::io::{IoKind, IoRequest};
use sparemap::{Config, Direction, DispatchResult, Instance, LifecycleState};

fn image(mb: u64) -> NamedTempFile {
    let file = NamedTempFile::new().expect("failed to create temp file");
    std::fs::write(file.path(), vec![0u8; (mb * 1024 * 1024) as usize]).expect("failed to size image");
    file
}

fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.deferred_load_delay = Duration::from_millis(20);
    cfg.table_capacity = 32;
    cfg.cache_size = 16;
    cfg
}

fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn cold_start_has_no_remaps_and_services_reads_directly() {
    let main = image(8);
    let spare = image(8);
    let instance = Instance::construct(main.path(), spare.path(), fast_config()).unwrap();

    assert!(wait_for(|| instance.state() == LifecycleState::Active, Duration::from_secs(2)));
    assert_eq!(instance.active_remap_count(), 0);

    let req = IoRequest::new(IoKind::Read, 5, 1);
    assert_eq!(
        instance.dispatch(&req).unwrap(),
        DispatchResult::Forwarded(Direction::Main)
    );
}

#[test]
fn reported_failure_becomes_an_active_redirect() {
    let main = image(8);
    let spare = image(8);
    let instance = Instance::construct(main.path(), spare.path(), fast_config()).unwrap();
    assert!(wait_for(|| instance.state() == LifecycleState::Active, Duration::from_secs(2)));

    instance.report_failure(200, 1).unwrap();
    assert!(wait_for(|| instance.active_remap_count() == 1, Duration::from_secs(2)));

    let req = IoRequest::new(IoKind::Write, 200, 1);
    match instance.dispatch(&req).unwrap() {
        DispatchResult::Submitted { .. } => {}
        other => panic!("expected redirect, got {other:?}"),
    }
}

#[test]
fn out_of_range_request_is_rejected_not_redirected() {
    let main = image(1);
    let spare = image(8);
    let instance = Instance::construct(main.path(), spare.path(), fast_config()).unwrap();
    assert!(wait_for(|| instance.state() == LifecycleState::Active, Duration::from_secs(2)));

    let past_end = instance.main_sectors() + 10;
    let req = IoRequest::new(IoKind::Read, past_end, 1);
    assert_eq!(instance.dispatch(&req).unwrap(), DispatchResult::Rejected);
}

#[test]
fn cache_absorbs_repeated_lookups_of_an_active_remap() {
    let main = image(8);
    let spare = image(8);
    let instance = Instance::construct(main.path(), spare.path(), fast_config()).unwrap();
    assert!(wait_for(|| instance.state() == LifecycleState::Active, Duration::from_secs(2)));

    instance.report_failure(50, 1).unwrap();
    assert!(wait_for(|| instance.active_remap_count() == 1, Duration::from_secs(2)));

    instance.clear_cache_stats();
    for _ in 0..500 {
        let req = IoRequest::new(IoKind::Read, 50, 1);
        instance.dispatch(&req).unwrap();
    }

    let stats = instance.cache_stats();
    assert_eq!(stats.misses, 1, "only the first lookup after clearing should miss the cache");
    assert_eq!(stats.hits, 499);
}

#[test]
fn remaps_survive_suspend_destroy_and_reattach() {
    let main = image(8);
    let spare = image(8);
    let cfg = fast_config();

    {
        let instance = Instance::construct(main.path(), spare.path(), cfg.clone()).unwrap();
        assert!(wait_for(|| instance.state() == LifecycleState::Active, Duration::from_secs(2)));
        instance.report_failure(9, 1).unwrap();
        assert!(wait_for(|| instance.active_remap_count() == 1, Duration::from_secs(2)));
        instance.suspend().unwrap();
        instance.destroy().unwrap();
    }

    let instance = Instance::construct(main.path(), spare.path(), cfg).unwrap();
    assert!(wait_for(|| instance.active_remap_count() == 1, Duration::from_secs(2)));

    let req = IoRequest::new(IoKind::Read, 9, 1);
    match instance.dispatch(&req).unwrap() {
        DispatchResult::Submitted { .. } => {}
        other => panic!("expected the reattached instance to still redirect sector 9, got {other:?}"),
    }
}

#[test]
fn torn_leading_metadata_copy_does_not_lose_the_remap_table() {
    let main = image(8);
    let spare = image(8);
    let cfg = fast_config();

    {
        let instance = Instance::construct(main.path(), spare.path(), cfg.clone()).unwrap();
        assert!(wait_for(|| instance.state() == LifecycleState::Active, Duration::from_secs(2)));
        instance.report_failure(77, 1).unwrap();
        assert!(wait_for(|| instance.active_remap_count() == 1, Duration::from_secs(2)));
        instance.suspend().unwrap();
        instance.destroy().unwrap();
    }

    // Corrupt the first redundant metadata copy directly on disk, simulating
    // a torn write to that sector range.
    let spare_file = std::fs::OpenOptions::new().write(true).open(spare.path()).unwrap();
    let offset = METADATA_COPY_OFFSETS[0] * 512;
    spare_file.write_all_at(&[0u8; 512], offset).unwrap();

    let instance = Instance::construct(main.path(), spare.path(), cfg).unwrap();
    assert!(wait_for(|| instance.active_remap_count() == 1, Duration::from_secs(2)));
}

#[test]
fn spare_region_exhaustion_caps_active_remaps() {
    let main = image(1);
    let spare = image(8);
    let mut cfg = fast_config();
    // Leave the table capacity well above what the spare region can back,
    // and shrink spare_region_fraction so only 4 replacement sectors are
    // actually available once the metadata reservation is carved out.
    // That way the cap under test is the spare region, not table_capacity.
    cfg.table_capacity = 64;
    cfg.spare_region_fraction = 0.0005;

    let instance = Instance::construct(main.path(), spare.path(), cfg).unwrap();
    assert!(wait_for(|| instance.state() == LifecycleState::Active, Duration::from_secs(2)));

    for sector in 0..8 {
        instance.report_failure(sector, 1).unwrap();
    }
    thread::sleep(Duration::from_millis(500));

    let remapped = instance.active_remap_count();
    assert!(remapped > 0, "at least some sectors should have been remapped");
    assert!(remapped <= 4, "spare region only backs 4 replacement sectors");
}
