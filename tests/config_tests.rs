//! Layered configuration: defaults, TOML file and `KVTSDB_*` environment overrides.

use std::io::Write;
use std::time::Duration;

use kvtsdb::{TsdbConfig, TsdbError};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("tempfile");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn file_values_override_defaults() {
    let file = write_config(
        r#"
table_path = "metrics/prod"
hours_per_chunk = 2
days_per_partition = 3
max_late_write_secs = 600
"#,
    );
    let cfg = TsdbConfig::load(Some(file.path())).expect("load");
    assert_eq!(cfg.table_path, "metrics/prod");
    assert_eq!(cfg.hours_per_chunk, 2);
    assert_eq!(cfg.days_per_partition, 3);
    assert_eq!(cfg.max_late_write, Duration::from_secs(600));
    assert_eq!(cfg.retention_days, TsdbConfig::default().retention_days);
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = TsdbConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, TsdbError::Config(_)), "{:?}", err);
}

#[test]
fn invalid_values_fail_validation() {
    let file = write_config("hours_per_chunk = 7\n");
    let err = TsdbConfig::load(Some(file.path())).unwrap_err();
    assert!(matches!(err, TsdbError::Config(msg) if msg.contains("hours_per_chunk")));
}

// All environment manipulation lives in one test so parallel tests never observe it.
#[test]
fn environment_overrides_file() {
    let file = write_config("collector_workers = 2\nretention_days = 3\n");
    std::env::set_var("KVTSDB_COLLECTOR_WORKERS", "8");
    let loaded = TsdbConfig::load(Some(file.path()));
    std::env::remove_var("KVTSDB_COLLECTOR_WORKERS");

    let cfg = loaded.expect("load");
    assert_eq!(cfg.collector_workers, 8);
    assert_eq!(cfg.retention_days, 3);
}
