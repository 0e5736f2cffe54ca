//! Engine configuration: defaults, an optional TOML file and `KVTSDB_*` environment variables,
//! merged in that order.

use crate::error::TsdbError;
use crate::telemetry::{noop_event_listener, TsdbEventListener};

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable prefix for configuration overrides (e.g. `KVTSDB_HOURS_PER_CHUNK`).
pub const ENV_PREFIX: &str = "KVTSDB";

/// Default maximum look-back for late samples (59 minutes).
pub const DEFAULT_MAX_LATE_WRITE: Duration = Duration::from_secs(59 * 60);

/// Configuration options for the append engine and the query collector.
#[derive(Debug, Clone)]
pub struct TsdbConfig {
    /// Remote table path; items are written under `<table_path>/<metric>.<hash>`.
    pub table_path: String,
    /// Days folded into one cyclic partition.
    pub days_per_partition: u32,
    /// Width of one chunk in hours. Must divide 24.
    pub hours_per_chunk: u32,
    /// Rolling retention used to clamp query ranges. The ring only holds
    /// `days_per_partition` days, so older data is addressable only up to that span.
    pub retention_days: u32,
    /// How far behind the newest sample a late write may land.
    pub max_late_write: Duration,
    /// Capacity of one chunk array attribute in 8-byte words.
    pub max_array_size: usize,
    /// Number of collector workers on the read path.
    pub collector_workers: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn TsdbEventListener>,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        TsdbConfig {
            table_path: "tsdb".to_string(),
            days_per_partition: 2,
            hours_per_chunk: 1,
            retention_days: 7,
            max_late_write: DEFAULT_MAX_LATE_WRITE,
            max_array_size: 1024,
            collector_workers: 4,
            event_listener: noop_event_listener(),
        }
    }
}

/// File/env form of [`TsdbConfig`]. Every field optional for layering.
#[derive(Debug, Default, Deserialize)]
pub struct TsdbFileConfig {
    pub table_path: Option<String>,
    pub days_per_partition: Option<u32>,
    pub hours_per_chunk: Option<u32>,
    pub retention_days: Option<u32>,
    pub max_late_write_secs: Option<u64>,
    pub max_array_size: Option<usize>,
    pub collector_workers: Option<usize>,
}

impl TsdbConfig {
    /// Loads defaults, then `path` (if given), then `KVTSDB_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, TsdbError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(TsdbError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );
        let partial: TsdbFileConfig = builder.build()?.try_deserialize()?;

        let mut cfg = TsdbConfig::default();
        cfg.merge(&partial);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overwrites the fields that are `Some` in `partial`.
    pub fn merge(&mut self, partial: &TsdbFileConfig) {
        if let Some(p) = &partial.table_path {
            self.table_path = p.clone();
        }
        if let Some(d) = partial.days_per_partition {
            self.days_per_partition = d;
        }
        if let Some(h) = partial.hours_per_chunk {
            self.hours_per_chunk = h;
        }
        if let Some(d) = partial.retention_days {
            self.retention_days = d;
        }
        if let Some(secs) = partial.max_late_write_secs {
            self.max_late_write = Duration::from_secs(secs);
        }
        if let Some(n) = partial.max_array_size {
            self.max_array_size = n;
        }
        if let Some(n) = partial.collector_workers {
            self.collector_workers = n;
        }
    }

    pub fn validate(&self) -> Result<(), TsdbError> {
        if self.hours_per_chunk == 0 || self.hours_per_chunk > 24 || 24 % self.hours_per_chunk != 0 {
            return Err(TsdbError::Config(format!(
                "hours_per_chunk must divide 24, got {}",
                self.hours_per_chunk
            )));
        }
        if self.days_per_partition == 0 {
            return Err(TsdbError::Config("days_per_partition must be >= 1".to_string()));
        }
        if self.retention_days == 0 {
            return Err(TsdbError::Config("retention_days must be >= 1".to_string()));
        }
        if self.collector_workers == 0 {
            return Err(TsdbError::Config("collector_workers must be >= 1".to_string()));
        }
        // chunk byte length is a u16 in the metadata word
        if self.max_array_size == 0 || self.max_array_size * 8 > u16::MAX as usize {
            return Err(TsdbError::Config(format!(
                "max_array_size must be in 1..={}, got {}",
                u16::MAX as usize / 8,
                self.max_array_size
            )));
        }
        Ok(())
    }

    /// Late-write look-back in milliseconds.
    pub fn max_late_write_millis(&self) -> i64 {
        self.max_late_write.as_millis() as i64
    }
}
