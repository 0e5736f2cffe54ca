use std::collections::BTreeMap;

use crate::error::TsdbError;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// Label set of a metric. Ordered so the hash and the `_lset` key are stable.
pub type Labels = BTreeMap<String, String>;

/// Label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

pub const MILLIS_PER_HOUR: i64 = 3600 * 1000;
pub const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// A single (timestamp, value) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub t: Timestamp,
    pub v: Value,
}

impl Sample {
    pub fn new(t: Timestamp, v: Value) -> Self {
        Self { t, v }
    }
}

impl From<(Timestamp, Value)> for Sample {
    fn from((t, v): (Timestamp, Value)) -> Self {
        Sample { t, v }
    }
}

/// Identity of one metric series: name, labels and the derived key and hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricIdentity {
    pub name: String,
    pub labels: Labels,
    /// Canonical label string, persisted as `_lset`.
    pub key: String,
    pub hash: u64,
}

impl MetricIdentity {
    pub fn new(name: &str, mut labels: Labels) -> Self {
        labels.insert(METRIC_NAME_LABEL.to_string(), name.to_string());
        let key = labels_key(&labels);
        let hash = labels_hash(&labels);
        MetricIdentity {
            name: name.to_string(),
            labels,
            key,
            hash,
        }
    }

    /// Remote item holding this metric's chunks: `<table>/<name>.<hash>`.
    pub fn item_path(&self, table_path: &str) -> String {
        format!("{}/{}.{}", table_path, self.name, self.hash)
    }
}

/// Canonical `k=v,k=v` rendering of a label set (excluding the metric name).
pub fn labels_key(labels: &Labels) -> String {
    labels
        .iter()
        .filter(|(k, _)| k.as_str() != METRIC_NAME_LABEL)
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Label names become attribute names on the remote item: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn check_label_name(name: &str) -> Result<(), TsdbError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TsdbError::InvalidLabel(name.to_string()))
    }
}

/// Hash of the label set without the metric name; metrics sharing it land in one frame.
///
/// FNV-1a over the canonical key, so it is stable across processes and can be part of
/// a persisted item path.
pub fn labels_hash(labels: &Labels) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    labels_key(labels)
        .bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
}
