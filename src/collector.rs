//! Read-side collector: merges asynchronous per-partition query results into frames.
//!
//! Results are routed to a fixed pool of worker threads by frame key, so every frame (and
//! every bucket in it) is owned by exactly one worker and no locking is needed on frames.
//! Dropping the senders ends the drain loops; [`Collector::wait`] is the completion barrier.

use crate::aggregate::AggregateFn;
use crate::client::ItemAttrs;
use crate::encoding::{decode_all, XorChunk};
use crate::error::TsdbError;
use crate::frame::{BucketGrid, ColumnSpec, DataFrame, FrameSet};
use crate::partition::Partition;
use crate::store::VALUE_COLUMN;
use crate::telemetry::{noop_event_listener, tsdb_metrics, TsdbEvent, TsdbEventListener};
use crate::types::{labels_hash, Labels, Sample, Timestamp};

use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

/// Bytes preceding the first cell of a server aggregate array.
pub const AGGR_ARRAY_HEADER_LEN: usize = 8;

/// Query window and requested columns shared by all workers.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub mint: Timestamp,
    pub maxt: Timestamp,
    /// Bucket width in ms; `0` for a raw query.
    pub step: i64,
    pub columns: Vec<ColumnSpec>,
    pub workers: usize,
}

impl QueryContext {
    pub fn new(mint: Timestamp, maxt: Timestamp, step: i64, columns: Vec<ColumnSpec>) -> Result<Self, TsdbError> {
        if maxt <= mint {
            return Err(TsdbError::InvalidTimeRange { start: mint, end: maxt });
        }
        if step < 0 {
            return Err(TsdbError::InvalidQuery(format!("negative step {}", step)));
        }
        Ok(QueryContext {
            mint,
            maxt,
            step,
            columns,
            workers: 1,
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn is_raw(&self) -> bool {
        self.step == 0
    }

    pub fn grid(&self) -> BucketGrid {
        BucketGrid::new(self.mint, self.maxt, self.step)
    }
}

/// How a result must be processed. Flags combine: an aggregate result may also ask for
/// downsampling of its raw chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultKind {
    pub raw: bool,
    pub server_aggregates: bool,
    pub client_aggregates: bool,
    pub downsample: bool,
}

impl ResultKind {
    pub const RAW: ResultKind = ResultKind {
        raw: true,
        server_aggregates: false,
        client_aggregates: false,
        downsample: false,
    };
    pub const SERVER_AGGREGATES: ResultKind = ResultKind {
        raw: false,
        server_aggregates: true,
        client_aggregates: false,
        downsample: false,
    };
    pub const CLIENT_AGGREGATES: ResultKind = ResultKind {
        raw: false,
        server_aggregates: false,
        client_aggregates: true,
        downsample: false,
    };
    pub const DOWNSAMPLE: ResultKind = ResultKind {
        raw: false,
        server_aggregates: false,
        client_aggregates: false,
        downsample: true,
    };

    pub fn with_downsample(mut self) -> Self {
        self.downsample = true;
        self
    }
}

/// Attributes read from one (metric, partition) item.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub name: String,
    pub labels: Labels,
    pub partition: Arc<Partition>,
    pub kind: ResultKind,
    pub fields: ItemAttrs,
    /// Width of one server aggregate cell in ms.
    pub rollup_interval: i64,
}

impl QueryResult {
    pub fn new(name: &str, labels: Labels, partition: Arc<Partition>, kind: ResultKind, fields: ItemAttrs) -> Self {
        QueryResult {
            name: name.to_string(),
            labels,
            partition,
            kind,
            fields,
            rollup_interval: 0,
        }
    }

    pub fn with_rollup(mut self, rollup_interval: i64) -> Self {
        self.rollup_interval = rollup_interval;
        self
    }

    /// Frame identity: the label set without the metric name.
    pub fn frame_key(&self) -> u64 {
        labels_hash(&self.labels)
    }

    /// Decodes the chunk attributes of this result oldest window first, keeping `[mint, maxt)`.
    ///
    /// A ring slot may still hold a chunk of an earlier cycle; samples outside the window the
    /// slot stands for in this range are skipped, so the output is in time order.
    pub fn raw_samples(&self, mint: Timestamp, maxt: Timestamp) -> Result<Vec<Sample>, TsdbError> {
        let part = &self.partition;
        let Some(meta) = self.fields.get(&part.meta_attr(VALUE_COLUMN)) else {
            return Ok(Vec::new());
        };
        let meta = meta.to_words()?;
        let mut out = Vec::new();
        for (id, window) in part.range_to_windows(mint, maxt) {
            let attr = part.chunk_id_to_attr(VALUE_COLUMN, id);
            let Some(value) = self.fields.get(&attr) else {
                continue;
            };
            let word = meta.get(id).copied().unwrap_or(0);
            if word == 0 {
                continue;
            }
            let bytes = value
                .as_bytes()
                .ok_or_else(|| TsdbError::corrupt(format!("attribute {} is not an array", attr)))?;
            let chunk = XorChunk::from_buffer(word, bytes)?;
            out.extend(
                decode_all(&chunk)?
                    .into_iter()
                    .filter(|s| s.t >= mint && s.t < maxt && part.in_chunk_range(window, s.t)),
            );
        }
        Ok(out)
    }
}

type WorkerOutput = (Vec<DataFrame>, Option<TsdbError>);

/// Running collector: per-worker channels plus the worker threads draining them.
pub struct Collector {
    senders: Vec<mpsc::Sender<QueryResult>>,
    handles: Vec<JoinHandle<WorkerOutput>>,
    order: Vec<u64>,
    seen: HashSet<u64>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("workers", &self.handles.len())
            .field("frames", &self.order.len())
            .finish()
    }
}

impl Collector {
    pub fn start(ctx: QueryContext) -> Result<Self, TsdbError> {
        Self::start_with_events(ctx, noop_event_listener())
    }

    pub fn start_with_events(ctx: QueryContext, events: Arc<dyn TsdbEventListener>) -> Result<Self, TsdbError> {
        let ctx = Arc::new(ctx);
        let workers = ctx.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel::<QueryResult>();
            let ctx = Arc::clone(&ctx);
            let events = Arc::clone(&events);
            let handle = thread::Builder::new()
                .name(format!("kvtsdb-collector-{}", index))
                .spawn(move || run_worker(index, &ctx, rx, events.as_ref()))
                .map_err(|e| TsdbError::BackgroundTaskError(e.to_string()))?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(Collector {
            senders,
            handles,
            order: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// Routes a result to the worker owning its frame.
    pub fn submit(&mut self, res: QueryResult) -> Result<(), TsdbError> {
        let key = res.frame_key();
        if self.seen.insert(key) {
            self.order.push(key);
        }
        let index = (key % self.senders.len() as u64) as usize;
        self.senders[index]
            .send(res)
            .map_err(|_| TsdbError::ChannelClosed(format!("collector worker {} exited", index)))
    }

    /// Closes the channels and waits for every worker. Frames come back in order of first
    /// submission; the first worker error wins.
    pub fn wait(mut self) -> Result<FrameSet, TsdbError> {
        self.senders.clear();
        let mut by_key: HashMap<u64, DataFrame> = HashMap::new();
        let mut first_err = None;
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok((frames, err)) => {
                    by_key.extend(frames.into_iter().map(|f| (f.key(), f)));
                    if let Some(e) = err {
                        first_err.get_or_insert(e);
                    }
                }
                Err(_) => {
                    first_err.get_or_insert(TsdbError::BackgroundTaskError(
                        "collector worker panicked".to_string(),
                    ));
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        let frames = self.order.iter().filter_map(|k| by_key.remove(k)).collect();
        Ok(FrameSet::new(frames))
    }

    /// Abandons the query: closes the channels and discards whatever was collected.
    pub fn cancel(self) {
        if let Err(e) = self.wait() {
            tracing::debug!(error = %e, "cancelled collector discarded a worker error");
        }
    }
}

fn run_worker(index: usize, ctx: &QueryContext, rx: mpsc::Receiver<QueryResult>, events: &dyn TsdbEventListener) -> WorkerOutput {
    events.on_event(TsdbEvent::CollectorStarted { worker: index });
    let grid = ctx.grid();
    let mut frames: Vec<DataFrame> = Vec::new();
    let mut frame_index: HashMap<u64, usize> = HashMap::new();
    // last raw sample per (frame, metric), carried into the next partition for interpolation
    let mut carry: HashMap<(u64, String), Sample> = HashMap::new();
    let mut first_err = None;
    let mut results = 0usize;

    for res in rx {
        results += 1;
        let key = res.frame_key();
        let idx = *frame_index.entry(key).or_insert_with(|| {
            frames.push(DataFrame::new(key, res.labels.clone(), grid, &ctx.columns));
            frames.len() - 1
        });
        let frame = &mut frames[idx];
        if let Err(e) = collect_result(ctx, frame, &mut carry, &res, events) {
            events.on_event(TsdbEvent::CollectorFailed {
                worker: index,
                error: e.to_string(),
            });
            first_err.get_or_insert(e);
        }
    }

    tsdb_metrics::record_collector_results(results as u64);
    events.on_event(TsdbEvent::CollectorFinished {
        worker: index,
        results,
    });
    (frames, first_err)
}

fn collect_result(
    ctx: &QueryContext,
    frame: &mut DataFrame,
    carry: &mut HashMap<(u64, String), Sample>,
    res: &QueryResult,
    events: &dyn TsdbEventListener,
) -> Result<(), TsdbError> {
    if res.kind.raw || ctx.is_raw() {
        frame.add_raw(&res.name, res.raw_samples(ctx.mint, ctx.maxt)?);
        return Ok(());
    }

    let needs_raw = res.kind.downsample || (res.kind.client_aggregates && !res.kind.server_aggregates);
    let samples = if needs_raw {
        res.raw_samples(ctx.mint, ctx.maxt)?
    } else {
        Vec::new()
    };

    if res.kind.server_aggregates {
        aggregate_server(ctx, frame, res, events)?;
    } else if res.kind.client_aggregates {
        let grid = *frame.grid();
        for s in &samples {
            if let Some(cell) = grid.cell(s.t) {
                frame.add_sample(&res.name, cell, s.v);
            }
        }
    }

    if res.kind.downsample {
        let series = (frame.key(), res.name.clone());
        let prev = carry.get(&series).copied();
        if let Some(last) = downsample(frame, &res.name, &samples, prev) {
            carry.insert(series, last);
        }
    }
    Ok(())
}

/// Decodes each requested server aggregate array into the frame's buckets.
fn aggregate_server(ctx: &QueryContext, frame: &mut DataFrame, res: &QueryResult, events: &dyn TsdbEventListener) -> Result<(), TsdbError> {
    if res.rollup_interval <= 0 {
        return Err(TsdbError::InvalidQuery(format!(
            "server aggregate result for {} has no rollup interval",
            res.name
        )));
    }
    let grid = *frame.grid();
    let mut components: Vec<AggregateFn> = Vec::new();
    for f in frame.aggregate_columns_of(&res.name) {
        for c in f.components() {
            if !components.contains(c) {
                components.push(*c);
            }
        }
    }

    let start = res.partition.start_time();
    for component in components {
        let attr = component.attr_name();
        let Some(value) = res.fields.get(&attr) else {
            events.on_event(TsdbEvent::AggregateFieldMissing {
                metric: res.name.clone(),
                attr,
            });
            continue;
        };
        let bytes = value
            .as_bytes()
            .ok_or_else(|| TsdbError::corrupt(format!("aggregate attribute {} is not an array", attr)))?;
        let cells = bytes.get(AGGR_ARRAY_HEADER_LEN..).unwrap_or_default();
        for (i, cell) in cells.chunks_exact(8).enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(cell);
            let raw = u64::from_le_bytes(word);
            let t = start + (i as i64 + 1) * res.rollup_interval;
            if t >= ctx.maxt {
                break;
            }
            let Some(bucket) = grid.cell(t) else {
                continue;
            };
            let v = if component.is_count() {
                raw as f64
            } else {
                f64::from_bits(raw)
            };
            frame.merge_component(&res.name, bucket, component, v);
        }
    }
    Ok(())
}

/// Resamples one partition's raw samples onto the frame's grid. Returns the last sample,
/// which anchors interpolation in the next partition.
fn downsample(frame: &mut DataFrame, metric: &str, samples: &[Sample], carry: Option<Sample>) -> Option<Sample> {
    let grid = *frame.grid();
    for col in frame.downsample_columns_mut(metric) {
        let interpolation = col.spec().interpolation;
        let tolerance = col.spec().tolerance;
        let mut pos = 0;
        for cell in 0..grid.len {
            let bucket_t = grid.bucket_time(cell);
            while pos < samples.len() && samples[pos].t < bucket_t {
                pos += 1;
            }
            let Some(next) = samples.get(pos).copied() else {
                break;
            };
            if next.t == bucket_t {
                col.set(cell, next.v);
                continue;
            }
            if grid.cell(next.t) != Some(cell) {
                continue;
            }
            let prev = if pos > 0 { Some(samples[pos - 1]) } else { carry };
            let v = match prev {
                Some(p) if next.t - p.t > tolerance => f64::NAN,
                _ => interpolation.interpolate(prev, next, bucket_t),
            };
            col.set(cell, v);
        }
    }
    samples.last().copied().or(carry)
}
