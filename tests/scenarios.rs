use std::{env, process::Command, ptr::NonNull};

use memtrace::{
    allocate, call_site, AllocKind, Attribution, CallSite, ErrorPolicy, HeapStatus, Tracker,
};

fn alloc(tracker: &Tracker, size: usize, kind: AllocKind) -> NonNull<u8> {
    allocate!(tracker, size, kind, ErrorPolicy::Strict)
        .expect("allocation failed")
        .expect("strict allocations never come back empty")
}

fn labels(tracker: &Tracker) -> Vec<(&'static str, usize, usize)> {
    tracker
        .type_usage()
        .rows
        .iter()
        .map(|row| (row.label, row.blocks, row.bytes))
        .collect()
}

#[test]
fn unreleased_blocks_are_reported_as_leaks() {
    let tracker = Tracker::new();
    for _ in 0..3 {
        alloc(&tracker, 64, AllocKind::Single);
    }

    let report = tracker.shutdown().expect("first shutdown sweeps");
    assert_eq!(report.groups.len(), 1);
    let group = &report.groups[0];
    assert_eq!((group.count, group.size, group.kind), (3, 64, AllocKind::Single));
    assert_eq!(group.records.len(), 3);
    assert!(group.records.iter().all(|r| r.file.ends_with("scenarios.rs")));
    assert_eq!(report.total_leaked_count, 3);
    assert_eq!(report.total_leaked_bytes, 192);
    assert!(report.to_string().contains("3 memory leak(s) detected of size 64 and type non-array"));
}

#[test]
fn attributions_accumulate_per_type() {
    let tracker = Tracker::new();
    let first = alloc(&tracker, 16, AllocKind::Single);
    let other = alloc(&tracker, 32, AllocKind::Single);
    assert_eq!(
        tracker.attribute(first.as_ptr(), call_site!(), "Widget", None),
        Attribution::Fallback
    );
    unsafe { tracker.deallocate(other.as_ptr(), AllocKind::Single) };
    let second = alloc(&tracker, 16, AllocKind::Single);
    assert_eq!(
        tracker.attribute(second.as_ptr(), call_site!(), "Widget", Some(16)),
        Attribution::FastPath
    );

    assert_eq!(labels(&tracker), [("Widget", 2, 32)]);
    let table = tracker.type_usage();
    assert_eq!(table.rows[0].byte_percent, 100.0);
    assert_eq!(table.rows[0].block_percent, 100.0);

    unsafe {
        tracker.deallocate(first.as_ptr(), AllocKind::Single);
        tracker.deallocate(second.as_ptr(), AllocKind::Single);
    }
    assert!(tracker.type_usage().rows.is_empty());
    assert!(tracker.shutdown().unwrap().is_clean());
}

#[test]
fn stale_recent_record_falls_back_to_a_scan() {
    let tracker = Tracker::new();
    let a = alloc(&tracker, 8, AllocKind::Single);
    let b = alloc(&tracker, 8, AllocKind::Single);

    let site = CallSite::new("gadget.rs", 99);
    assert_eq!(tracker.attribute(a.as_ptr(), site, "Gadget", None), Attribution::Fallback);

    let live = tracker.live_allocations(false, true);
    let records = &live.section(AllocKind::Single).buckets[0].records;
    let a_record = records.iter().find(|r| r.address == a.as_ptr() as usize).unwrap();
    let b_record = records.iter().find(|r| r.address == b.as_ptr() as usize).unwrap();
    assert_eq!((a_record.type_label, a_record.file, a_record.line), ("Gadget", "gadget.rs", 99));
    assert_eq!(b_record.type_label, memtrace::UNKNOWN);
    assert_ne!(b_record.file, "gadget.rs");

    // `a` is now the recent record
    assert_eq!(tracker.attribute(a.as_ptr(), site, "Gadget", None), Attribution::FastPath);
    assert_eq!(labels(&tracker), [("Gadget", 1, 8)]);

    unsafe {
        tracker.deallocate(a.as_ptr(), AllocKind::Single);
        tracker.deallocate(b.as_ptr(), AllocKind::Single);
    }
}

#[test]
fn equal_totals_keep_first_seen_order() {
    let tracker = Tracker::new();
    let foo = alloc(&tracker, 100, AllocKind::Bulk);
    tracker.attribute(foo.as_ptr(), call_site!(), "Foo", Some(100));
    let bar = alloc(&tracker, 100, AllocKind::Single);
    tracker.attribute(bar.as_ptr(), call_site!(), "Bar", Some(100));
    let big = alloc(&tracker, 10, AllocKind::Single);
    let _ = tracker.attribute(big.as_ptr(), call_site!(), "Small", None);

    let first = labels(&tracker);
    assert_eq!(first, [("Foo", 1, 100), ("Bar", 1, 100), ("Small", 1, 10)]);
    assert_eq!(labels(&tracker), first);
    assert_eq!(tracker.type_usage().to_string(), tracker.type_usage().to_string());

    unsafe {
        tracker.deallocate(foo.as_ptr(), AllocKind::Bulk);
        tracker.deallocate(bar.as_ptr(), AllocKind::Single);
        tracker.deallocate(big.as_ptr(), AllocKind::Single);
    }
}

#[test]
fn round_trip_restores_counters_but_keeps_the_bucket() {
    let tracker = Tracker::new();
    let keep = alloc(&tracker, 48, AllocKind::Single);
    let (bytes, blocks) = (tracker.current_bytes(), tracker.current_blocks());

    let p = alloc(&tracker, 200, AllocKind::Bulk);
    unsafe { tracker.deallocate(p.as_ptr(), AllocKind::Bulk) };
    assert_eq!((tracker.current_bytes(), tracker.current_blocks()), (bytes, blocks));
    assert_eq!(tracker.peak_bytes(), 248);
    assert_eq!(tracker.peak_blocks(), 2);

    let live = tracker.live_allocations(true, false);
    assert!(live.section(AllocKind::Bulk).buckets.is_empty());
    assert_eq!(tracker.heap_check(), HeapStatus::Ok);

    unsafe { tracker.deallocate(keep.as_ptr(), AllocKind::Single) };
    assert_eq!(tracker.heap_check(), HeapStatus::Empty);
}

#[test]
fn unknown_addresses_are_not_attributed() {
    let tracker = Tracker::new();
    let p = alloc(&tracker, 8, AllocKind::Single);
    let foreign = Box::new(0u64);

    let outcome = tracker.attribute_value(&foreign, call_site!());
    assert_eq!(outcome, Attribution::NotTracked);
    assert!(!outcome.is_applied());
    assert!(tracker.type_usage().rows.is_empty());

    unsafe { tracker.deallocate(p.as_ptr(), AllocKind::Single) };
}

#[test]
fn leak_log_receives_the_shutdown_report() {
    let path = env::temp_dir().join(format!("memtrace-{}-scenarios.log", std::process::id()));
    let config = memtrace::Config {
        dump_leaks: true,
        leak_log: path.clone(),
        ..Default::default()
    };
    let tracker = Tracker::new();
    tracker.configure(&config).unwrap();
    alloc(&tracker, 12, AllocKind::Bulk);

    let report = tracker.shutdown().unwrap();
    let logged = std::fs::read_to_string(&path).unwrap();
    assert_eq!(logged, report.to_string());
    assert!(logged.contains("1 memory leak(s) detected of size 12 and type array"));
    std::fs::remove_file(&path).unwrap();
}

const FATAL_CHILD: &str = "MEMTRACE_FATAL_CHILD";

/// Does nothing unless spawned by one of the abort tests below
#[test]
fn fatal_child() {
    let Ok(case) = env::var(FATAL_CHILD) else {
        return;
    };
    let tracker = Tracker::new();
    match case.as_str() {
        "foreign" => {
            let mut foreign = Box::new([0u8; 64]);
            let handle = unsafe { foreign.as_mut_ptr().add(32) };
            unsafe { tracker.deallocate(handle, AllocKind::Single) };
        }
        "mismatch" => {
            let p = alloc(&tracker, 24, AllocKind::Single);
            unsafe { tracker.deallocate(p.as_ptr(), AllocKind::Bulk) };
        }
        other => panic!("unknown case {other}"),
    }
    unreachable!("the tracker should have aborted");
}

fn run_fatal_child(case: &str) -> (bool, String) {
    let output = Command::new(env::current_exe().unwrap())
        .args(["fatal_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(FATAL_CHILD, case)
        .output()
        .unwrap();
    (output.status.success(), String::from_utf8_lossy(&output.stderr).into_owned())
}

#[test]
fn releasing_a_foreign_pointer_aborts() {
    let (success, stderr) = run_fatal_child("foreign");
    assert!(!success);
    assert!(stderr.contains("memtrace: fatal: untracked pointer"), "{stderr}");
    assert!(stderr.contains("damaged or foreign"), "{stderr}");
}

#[test]
fn releasing_as_the_wrong_kind_aborts() {
    let (success, stderr) = run_fatal_child("mismatch");
    assert!(!success);
    assert!(stderr.contains("no array bucket holds allocations of size 24"), "{stderr}");
}
