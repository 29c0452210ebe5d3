//! End-to-end PIT ingest and world-state validation.

use std::io::Write;
use std::path::PathBuf;

use finagent_backend::data::{import_ohlcv_file, ImportResult};
use finagent_backend::storage::{AnalyticsStore, StateStore};
use finagent_backend::world_state::{
    build_world_state_manifest, validate_world_state_pit,
};

fn write_abc_csv(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("abc.csv");
    let mut handle = std::fs::File::create(&path).unwrap();
    writeln!(handle, "timestamp,symbol,open,high,low,close,volume").unwrap();
    for day in 1..=10 {
        writeln!(
            handle,
            "2025-01-{:02},ABC,{},{},{},{},1000",
            day,
            100 + day,
            101 + day,
            99 + day,
            100 + day
        )
        .unwrap();
    }
    path
}

fn stores() -> (AnalyticsStore, StateStore) {
    (
        AnalyticsStore::in_memory().unwrap(),
        StateStore::in_memory().unwrap(),
    )
}

#[test]
fn import_then_validate_then_leak() {
    let dir = tempfile::tempdir().unwrap();
    let (analytics, state) = stores();
    let csv_path = write_abc_csv(dir.path());

    let result: ImportResult = import_ohlcv_file(&analytics, &state, &csv_path).unwrap();
    assert_eq!(result.rows_inserted, 10);

    let universe = vec!["ABC".to_string()];
    let report =
        validate_world_state_pit(&analytics, &universe, "2025-01-01", "2025-01-10", true).unwrap();
    assert!(report.valid);
    assert_eq!(report.leak_rows, 0);

    // Shift publication a day into the future: strict validation must raise.
    analytics
        .admin_execute("UPDATE market_ohlcv SET published_at = timestamp + INTERVAL 1 DAY")
        .unwrap();
    let err = validate_world_state_pit(&analytics, &universe, "2025-01-01", "2025-01-10", true)
        .unwrap_err();
    assert!(err.to_string().contains("future publication leaks detected"));

    let lax = validate_world_state_pit(&analytics, &universe, "2025-01-01", "2025-01-10", false)
        .unwrap();
    assert!(!lax.valid);
    assert_eq!(lax.leak_rows, 10);
}

#[test]
fn manifest_is_deterministic_and_counts_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (analytics, state) = stores();
    let csv_path = write_abc_csv(dir.path());
    import_ohlcv_file(&analytics, &state, &csv_path).unwrap();

    let universe = vec!["ABC".to_string()];
    let first = build_world_state_manifest(
        &analytics, &state, &universe, "2025-01-01", "2025-01-10", "none",
    )
    .unwrap();
    let second = build_world_state_manifest(
        &analytics, &state, &universe, "2025-01-01", "2025-01-10", "none",
    )
    .unwrap();
    assert_eq!(first.row_count, 10);
    assert_eq!(first.data_hash, second.data_hash);
    assert_eq!(first.adjustment_policy, "none");

    // Narrowing the range changes the hash.
    let narrower = build_world_state_manifest(
        &analytics, &state, &universe, "2025-01-01", "2025-01-05", "none",
    )
    .unwrap();
    assert_ne!(first.data_hash, narrower.data_hash);
    assert_eq!(narrower.row_count, 5);
}

#[test]
fn manifest_rejects_unknown_symbol() {
    let dir = tempfile::tempdir().unwrap();
    let (analytics, state) = stores();
    let csv_path = write_abc_csv(dir.path());
    import_ohlcv_file(&analytics, &state, &csv_path).unwrap();

    let err = build_world_state_manifest(
        &analytics,
        &state,
        &["ABC".to_string(), "GHOST".to_string()],
        "2025-01-01",
        "2025-01-10",
        "none",
    )
    .unwrap_err();
    assert!(err.to_string().contains("GHOST"));
}
