//! Aggregation functions, per-bucket accumulator state and downsampling interpolation.

use crate::error::TsdbError;
use crate::types::{Sample, Timestamp};

use std::fmt;
use std::str::FromStr;

/// Aggregation function of a query column.
///
/// Concrete functions are accumulated directly (and stored by the server as `_v_<fn>`
/// arrays); derived ones are computed from `count`, `sum` and `sqr` when the bucket is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFn {
    Count,
    Sum,
    Sqr,
    Max,
    Min,
    Last,
    Avg,
    Stddev,
    Stdvar,
}

impl AggregateFn {
    pub const ALL: [AggregateFn; 9] = [
        AggregateFn::Count,
        AggregateFn::Sum,
        AggregateFn::Sqr,
        AggregateFn::Max,
        AggregateFn::Min,
        AggregateFn::Last,
        AggregateFn::Avg,
        AggregateFn::Stddev,
        AggregateFn::Stdvar,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AggregateFn::Count => "count",
            AggregateFn::Sum => "sum",
            AggregateFn::Sqr => "sqr",
            AggregateFn::Max => "max",
            AggregateFn::Min => "min",
            AggregateFn::Last => "last",
            AggregateFn::Avg => "avg",
            AggregateFn::Stddev => "stddev",
            AggregateFn::Stdvar => "stdvar",
        }
    }

    pub fn is_concrete(&self) -> bool {
        !matches!(self, AggregateFn::Avg | AggregateFn::Stddev | AggregateFn::Stdvar)
    }

    /// Count cells are stored as integers, every other function as f64 bits.
    pub fn is_count(&self) -> bool {
        matches!(self, AggregateFn::Count)
    }

    /// Concrete functions this one is computed from.
    pub fn components(&self) -> &'static [AggregateFn] {
        match self {
            AggregateFn::Count => &[AggregateFn::Count],
            AggregateFn::Sum => &[AggregateFn::Sum],
            AggregateFn::Sqr => &[AggregateFn::Sqr],
            AggregateFn::Max => &[AggregateFn::Max],
            AggregateFn::Min => &[AggregateFn::Min],
            AggregateFn::Last => &[AggregateFn::Last],
            AggregateFn::Avg => &[AggregateFn::Count, AggregateFn::Sum],
            AggregateFn::Stddev | AggregateFn::Stdvar => {
                &[AggregateFn::Count, AggregateFn::Sum, AggregateFn::Sqr]
            }
        }
    }

    /// Server-side aggregate array attribute, e.g. `_v_count`.
    pub fn attr_name(&self) -> String {
        format!("_v_{}", self.name())
    }
}

impl fmt::Display for AggregateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregateFn {
    type Err = TsdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        AggregateFn::ALL
            .iter()
            .copied()
            .find(|f| f.name() == lower)
            .ok_or_else(|| TsdbError::InvalidQuery(format!("unknown aggregate function '{}'", s)))
    }
}

/// Accumulator for one time bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    count: f64,
    sum: f64,
    sqr: f64,
    min: f64,
    max: f64,
    last: f64,
    has_data: bool,
}

impl Default for BucketState {
    fn default() -> Self {
        BucketState {
            count: 0.0,
            sum: 0.0,
            sqr: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: f64::NAN,
            has_data: false,
        }
    }
}

impl BucketState {
    /// Folds one raw sample into every concrete accumulator.
    pub fn add_sample(&mut self, v: f64) {
        self.count += 1.0;
        self.sum += v;
        self.sqr += v * v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.last = v;
        self.has_data = true;
    }

    /// Merges one pre-aggregated server cell for a concrete function.
    pub fn merge_component(&mut self, function: AggregateFn, v: f64) {
        match function {
            AggregateFn::Count => self.count += v,
            AggregateFn::Sum => self.sum += v,
            AggregateFn::Sqr => self.sqr += v,
            AggregateFn::Max => self.max = self.max.max(v),
            AggregateFn::Min => self.min = self.min.min(v),
            AggregateFn::Last => self.last = v,
            AggregateFn::Avg | AggregateFn::Stddev | AggregateFn::Stdvar => return,
        }
        self.has_data = true;
    }

    pub fn has_data(&self) -> bool {
        self.has_data
    }

    /// Final value of `function` for this bucket; NaN when the bucket is empty.
    pub fn value(&self, function: AggregateFn) -> f64 {
        if !self.has_data {
            return f64::NAN;
        }
        match function {
            AggregateFn::Count => self.count,
            AggregateFn::Sum => self.sum,
            AggregateFn::Sqr => self.sqr,
            AggregateFn::Max => self.max,
            AggregateFn::Min => self.min,
            AggregateFn::Last => self.last,
            AggregateFn::Avg => {
                if self.count == 0.0 {
                    f64::NAN
                } else {
                    self.sum / self.count
                }
            }
            AggregateFn::Stdvar => self.stdvar(),
            AggregateFn::Stddev => self.stdvar().sqrt(),
        }
    }

    // sample variance
    fn stdvar(&self) -> f64 {
        let n = self.count;
        if n < 2.0 {
            return f64::NAN;
        }
        ((n * self.sqr - self.sum * self.sum) / (n * (n - 1.0))).max(0.0)
    }
}

/// How a downsampled bucket with no exact sample is filled from its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpolationKind {
    None,
    #[default]
    Next,
    Prev,
    Linear,
}

impl InterpolationKind {
    pub fn name(&self) -> &'static str {
        match self {
            InterpolationKind::None => "none",
            InterpolationKind::Next => "next",
            InterpolationKind::Prev => "prev",
            InterpolationKind::Linear => "linear",
        }
    }

    /// Value at bucket time `t` between `prev` (if known) and `next`.
    pub fn interpolate(&self, prev: Option<Sample>, next: Sample, t: Timestamp) -> f64 {
        match (self, prev) {
            (InterpolationKind::None, _) => f64::NAN,
            (InterpolationKind::Next, _) => next.v,
            (InterpolationKind::Prev, Some(p)) => p.v,
            (InterpolationKind::Linear, Some(p)) => {
                if next.t == p.t {
                    return next.v;
                }
                let slope = (next.v - p.v) / (next.t - p.t) as f64;
                p.v + slope * (t - p.t) as f64
            }
            (InterpolationKind::Prev | InterpolationKind::Linear, None) => f64::NAN,
        }
    }
}

impl fmt::Display for InterpolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InterpolationKind {
    type Err = TsdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "nan" => Ok(InterpolationKind::None),
            "" | "next" => Ok(InterpolationKind::Next),
            "prev" => Ok(InterpolationKind::Prev),
            "linear" | "lin" => Ok(InterpolationKind::Linear),
            other => Err(TsdbError::InvalidQuery(format!(
                "unknown interpolation function '{}'",
                other
            ))),
        }
    }
}
