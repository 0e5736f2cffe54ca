//! Column frames built by the collector and the result sets handed to callers.

use crate::aggregate::{AggregateFn, BucketState, InterpolationKind};
use crate::types::{Labels, Sample, Timestamp, METRIC_NAME_LABEL};

use rayon::prelude::*;
use std::collections::HashMap;

/// One requested output column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub metric: String,
    pub function: Option<AggregateFn>,
    pub interpolation: InterpolationKind,
    /// Maximum gap (ms) to the previous sample for an interpolated bucket.
    pub tolerance: i64,
    pub alias: Option<String>,
}

impl ColumnSpec {
    pub fn raw(metric: &str) -> Self {
        ColumnSpec {
            metric: metric.to_string(),
            function: None,
            interpolation: InterpolationKind::default(),
            tolerance: i64::MAX,
            alias: None,
        }
    }

    pub fn aggregate(metric: &str, function: AggregateFn) -> Self {
        ColumnSpec {
            function: Some(function),
            ..ColumnSpec::raw(metric)
        }
    }

    pub fn with_interpolation(mut self, interpolation: InterpolationKind, tolerance: i64) -> Self {
        self.interpolation = interpolation;
        self.tolerance = tolerance;
        self
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// Output name: the alias, `fn(metric)` for aggregates, or the metric name.
    pub fn name(&self) -> String {
        match (&self.alias, self.function) {
            (Some(alias), _) => alias.clone(),
            (None, Some(f)) => format!("{}({})", f, self.metric),
            (None, None) => self.metric.clone(),
        }
    }
}

/// Time grid shared by every bucketed column of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketGrid {
    pub mint: Timestamp,
    pub step: i64,
    pub len: usize,
}

impl BucketGrid {
    /// Grid of `ceil((maxt - mint) / step)` buckets starting at `mint`.
    pub fn new(mint: Timestamp, maxt: Timestamp, step: i64) -> Self {
        let len = if step <= 0 || maxt <= mint {
            0
        } else {
            ((maxt - mint + step - 1) / step) as usize
        };
        BucketGrid { mint, step, len }
    }

    /// Bucket index of `t`, if it falls on the grid.
    pub fn cell(&self, t: Timestamp) -> Option<usize> {
        if self.step <= 0 || t < self.mint {
            return None;
        }
        let cell = ((t - self.mint) / self.step) as usize;
        (cell < self.len).then_some(cell)
    }

    pub fn bucket_time(&self, cell: usize) -> Timestamp {
        self.mint + cell as i64 * self.step
    }

    pub fn times(&self) -> Vec<Timestamp> {
        (0..self.len).map(|i| self.bucket_time(i)).collect()
    }
}

/// Decoded samples of one metric, spanning chunks of possibly many partitions.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSeries {
    name: String,
    samples: Vec<Sample>,
}

impl RawSeries {
    pub fn new(name: &str, samples: Vec<Sample>) -> Self {
        let mut series = RawSeries {
            name: name.to_string(),
            samples: Vec::new(),
        };
        series.add_chunks(samples);
        series
    }

    /// Appends another partition's samples, keeping time order.
    pub fn add_chunks(&mut self, samples: Vec<Sample>) {
        let needs_sort = matches!(
            (self.samples.last(), samples.first()),
            (Some(last), Some(first)) if first.t < last.t
        );
        self.samples.extend(samples);
        if needs_sort {
            self.samples.sort_by_key(|s| s.t);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter()
    }
}

/// Aggregated buckets of one metric for one function.
#[derive(Debug, Clone)]
pub struct AggregateColumn {
    spec: ColumnSpec,
    function: AggregateFn,
    buckets: Vec<BucketState>,
}

impl AggregateColumn {
    fn add_sample(&mut self, cell: usize, v: f64) {
        if let Some(b) = self.buckets.get_mut(cell) {
            b.add_sample(v);
        }
    }

    fn merge_component(&mut self, cell: usize, component: AggregateFn, v: f64) {
        if let Some(b) = self.buckets.get_mut(cell) {
            b.merge_component(component, v);
        }
    }

    pub fn function(&self) -> AggregateFn {
        self.function
    }
}

/// Raw samples resampled onto the bucket grid.
#[derive(Debug, Clone)]
pub struct DownsampleColumn {
    spec: ColumnSpec,
    values: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum Column {
    Aggregate(AggregateColumn),
    Downsample(DownsampleColumn),
}

impl Column {
    pub fn spec(&self) -> &ColumnSpec {
        match self {
            Column::Aggregate(c) => &c.spec,
            Column::Downsample(c) => &c.spec,
        }
    }

    pub fn name(&self) -> String {
        self.spec().name()
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Aggregate(c) => c.buckets.len(),
            Column::Downsample(c) => c.values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Final bucket values; NaN marks a bucket without data.
    pub fn values(&self) -> Vec<f64> {
        match self {
            Column::Aggregate(c) => c.buckets.iter().map(|b| b.value(c.function)).collect(),
            Column::Downsample(c) => c.values.clone(),
        }
    }
}

/// Columns sharing one label set (and one time index).
#[derive(Debug, Clone)]
pub struct DataFrame {
    key: u64,
    labels: Labels,
    grid: BucketGrid,
    columns: Vec<Column>,
    raw_columns: Vec<RawSeries>,
    raw_by_name: HashMap<String, usize>,
}

impl DataFrame {
    /// New frame with one bucketed column per spec; raw queries (empty grid) get none.
    pub fn new(key: u64, mut labels: Labels, grid: BucketGrid, specs: &[ColumnSpec]) -> Self {
        labels.remove(METRIC_NAME_LABEL);
        let columns = if grid.len == 0 {
            Vec::new()
        } else {
            specs
                .iter()
                .map(|spec| match spec.function {
                    Some(function) => Column::Aggregate(AggregateColumn {
                        spec: spec.clone(),
                        function,
                        buckets: vec![BucketState::default(); grid.len],
                    }),
                    None => Column::Downsample(DownsampleColumn {
                        spec: spec.clone(),
                        values: vec![f64::NAN; grid.len],
                    }),
                })
                .collect()
        };
        DataFrame {
            key,
            labels,
            grid,
            columns,
            raw_columns: Vec::new(),
            raw_by_name: HashMap::new(),
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn grid(&self) -> &BucketGrid {
        &self.grid
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn raw_columns(&self) -> &[RawSeries] {
        &self.raw_columns
    }

    pub fn raw_column(&self, metric: &str) -> Option<&RawSeries> {
        self.raw_by_name.get(metric).map(|&i| &self.raw_columns[i])
    }

    /// Adds raw samples to the metric's series, creating it on first sight.
    pub fn add_raw(&mut self, metric: &str, samples: Vec<Sample>) {
        match self.raw_by_name.get(metric) {
            Some(&i) => self.raw_columns[i].add_chunks(samples),
            None => {
                self.raw_columns.push(RawSeries::new(metric, samples));
                self.raw_by_name.insert(metric.to_string(), self.raw_columns.len() - 1);
            }
        }
    }

    /// Folds one raw sample into every aggregate column of `metric`.
    pub fn add_sample(&mut self, metric: &str, cell: usize, v: f64) {
        for col in self.columns.iter_mut() {
            if let Column::Aggregate(c) = col {
                if c.spec.metric == metric {
                    c.add_sample(cell, v);
                }
            }
        }
    }

    /// Aggregate columns of `metric` whose function uses `component`.
    pub fn merge_component(&mut self, metric: &str, cell: usize, component: AggregateFn, v: f64) {
        for col in self.columns.iter_mut() {
            if let Column::Aggregate(c) = col {
                if c.spec.metric == metric && c.function.components().contains(&component) {
                    c.merge_component(cell, component, v);
                }
            }
        }
    }

    pub(crate) fn aggregate_columns_of(&self, metric: &str) -> Vec<AggregateFn> {
        self.columns
            .iter()
            .filter_map(|col| match col {
                Column::Aggregate(c) if c.spec.metric == metric => Some(c.function),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn downsample_columns_mut<'a>(&'a mut self, metric: &'a str) -> impl Iterator<Item = &'a mut DownsampleColumn> + 'a {
        self.columns.iter_mut().filter_map(move |col| match col {
            Column::Downsample(c) if c.spec.metric == metric => Some(c),
            _ => None,
        })
    }
}

impl DownsampleColumn {
    pub fn spec(&self) -> &ColumnSpec {
        &self.spec
    }

    pub(crate) fn set(&mut self, cell: usize, v: f64) {
        if let Some(slot) = self.values.get_mut(cell) {
            *slot = v;
        }
    }
}

/// Frames of a query, ordered by first appearance of their label set.
#[derive(Debug, Clone, Default)]
pub struct FrameSet {
    frames: Vec<DataFrame>,
}

impl FrameSet {
    pub fn new(frames: Vec<DataFrame>) -> Self {
        FrameSet { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[DataFrame] {
        &self.frames
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataFrame> {
        self.frames.iter()
    }

    /// Flattens frames to one series per column.
    pub fn into_series_set(self) -> SeriesSet {
        let series = self
            .frames
            .par_iter()
            .flat_map_iter(frame_to_series)
            .collect();
        SeriesSet { series }
    }
}

/// A single named series with its labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

impl Series {
    pub fn name(&self) -> Option<&str> {
        self.labels.get(METRIC_NAME_LABEL).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesSet {
    series: Vec<Series>,
}

impl SeriesSet {
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Series> {
        self.series.iter()
    }
}

impl IntoIterator for SeriesSet {
    type Item = Series;
    type IntoIter = std::vec::IntoIter<Series>;

    fn into_iter(self) -> Self::IntoIter {
        self.series.into_iter()
    }
}

fn frame_to_series(frame: &DataFrame) -> Vec<Series> {
    let with_name = |metric: &str, function: Option<AggregateFn>| {
        let mut labels = frame.labels.clone();
        labels.insert(METRIC_NAME_LABEL.to_string(), metric.to_string());
        if let Some(f) = function {
            labels.insert("aggregate".to_string(), f.to_string());
        }
        labels
    };

    let mut out: Vec<Series> = frame
        .raw_columns
        .iter()
        .map(|raw| Series {
            labels: with_name(raw.name(), None),
            samples: raw.samples().to_vec(),
        })
        .collect();

    for col in &frame.columns {
        let samples = col
            .values()
            .into_iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .map(|(i, v)| Sample::new(frame.grid.bucket_time(i), v))
            .collect();
        let spec = col.spec();
        out.push(Series {
            labels: with_name(&spec.metric, spec.function),
            samples,
        });
    }
    out
}
