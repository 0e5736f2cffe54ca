//! Per-metric chunk store: two chunk buffers (current and previous), a state machine tracking
//! the remote copy, and the builder of the update expressions that ship unflushed bytes.

use crate::client::{AttrValue, GetItemSpec, ItemAttrs, UpdateItem};
use crate::config::TsdbConfig;
use crate::encoding::{decode_all, to_u64_words, XorAppender, XorChunk, MAX_SAMPLE_BYTES};
use crate::error::TsdbError;
use crate::partition::Partition;
use crate::telemetry::{tsdb_metrics, TsdbEvent, TsdbEventListener};
use crate::types::{check_label_name, MetricIdentity, Sample, Timestamp, Value, METRIC_NAME_LABEL};

use std::collections::HashSet;
use std::sync::Arc;

/// Column name of the value chunks (`_v<hour>` attributes, `_meta_v` metadata array).
pub const VALUE_COLUMN: &str = "v";

/// Scalar attribute holding the newest flushed timestamp.
pub const MAXTIME_ATTR: &str = "_maxtime";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// No remote state known yet.
    Init,
    /// A state request is outstanding.
    FetchingState,
    Ready,
    /// A flush is outstanding.
    Updating,
}

impl StoreState {
    pub fn name(&self) -> &'static str {
        match self {
            StoreState::Init => "init",
            StoreState::FetchingState => "fetching_state",
            StoreState::Ready => "ready",
            StoreState::Updating => "updating",
        }
    }
}

/// One in-memory chunk buffer and its flush bookkeeping.
#[derive(Debug, Clone)]
pub struct ChunkAppender {
    appender: Option<XorAppender>,
    mint: Timestamp,
    maxt: Timestamp,
    last_t: Timestamp,
    /// Byte offset and sample count acknowledged by the store.
    upd_marker: usize,
    upd_count: usize,
    /// True while a flush covering this buffer is outstanding.
    writing: bool,
    flight_marker: usize,
    flight_count: usize,
    /// Whether the remote array attribute for this window exists.
    array_initialized: bool,
}

impl Default for ChunkAppender {
    fn default() -> Self {
        ChunkAppender {
            appender: None,
            mint: Timestamp::MIN,
            maxt: Timestamp::MIN,
            last_t: Timestamp::MIN,
            upd_marker: 0,
            upd_count: 0,
            writing: false,
            flight_marker: 0,
            flight_count: 0,
            array_initialized: false,
        }
    }
}

impl ChunkAppender {
    fn reset(&mut self, mint: Timestamp, maxt: Timestamp) -> Result<(), TsdbError> {
        *self = ChunkAppender {
            appender: Some(XorChunk::new().appender()?),
            mint,
            maxt,
            ..Default::default()
        };
        Ok(())
    }

    fn in_window(&self, t: Timestamp) -> bool {
        self.appender.is_some() && t >= self.mint && t < self.maxt
    }

    pub fn mint(&self) -> Timestamp {
        self.mint
    }

    pub fn maxt(&self) -> Timestamp {
        self.maxt
    }

    pub fn last_t(&self) -> Timestamp {
        self.last_t
    }

    pub fn upd_marker(&self) -> usize {
        self.upd_marker
    }

    pub fn upd_count(&self) -> usize {
        self.upd_count
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn chunk(&self) -> Option<&XorChunk> {
        self.appender.as_ref().map(|a| a.chunk())
    }

    pub fn num_samples(&self) -> usize {
        self.chunk().map_or(0, |c| c.num_samples())
    }

    /// Samples accepted but not yet acknowledged by the store.
    pub fn unflushed(&self) -> usize {
        self.num_samples().saturating_sub(self.upd_count)
    }

    /// Decodes the buffer's samples.
    pub fn samples(&self) -> Result<Vec<Sample>, TsdbError> {
        match self.chunk() {
            Some(c) => decode_all(c),
            None => Ok(Vec::new()),
        }
    }
}

/// Per-metric append engine.
///
/// `append` never blocks: before the remote state is known samples are queued in `pending`
/// and replayed, in arrival order, on the transition to [`StoreState::Ready`].
#[derive(Debug)]
pub struct ChunkStore {
    metric: String,
    state: StoreState,
    cur: usize,
    chunks: [ChunkAppender; 2],
    pending: Vec<Sample>,
    partition: Arc<Partition>,
    /// Partitions whose item has its labels and metadata array in place.
    initialized_parts: HashSet<u32>,
    init_in_flight: Option<u32>,
    fetch_window: Option<(Timestamp, Timestamp)>,
    /// `_maxtime` acknowledged by the store; it never moves backwards.
    flushed_max_t: Timestamp,
    flight_max_t: Timestamp,
    max_late_write: i64,
    max_array_size: usize,
    late_dropped: u64,
    out_of_order_dropped: u64,
    events: Arc<dyn TsdbEventListener>,
}

impl ChunkStore {
    pub fn new(metric: &str, partition: Arc<Partition>, cfg: &TsdbConfig) -> Self {
        ChunkStore {
            metric: metric.to_string(),
            state: StoreState::Init,
            cur: 0,
            chunks: [ChunkAppender::default(), ChunkAppender::default()],
            pending: Vec::new(),
            partition,
            initialized_parts: HashSet::new(),
            init_in_flight: None,
            fetch_window: None,
            flushed_max_t: Timestamp::MIN,
            flight_max_t: Timestamp::MIN,
            max_late_write: cfg.max_late_write_millis(),
            max_array_size: cfg.max_array_size,
            late_dropped: 0,
            out_of_order_dropped: 0,
            events: cfg.event_listener.clone(),
        }
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == StoreState::Ready
    }

    pub fn current(&self) -> &ChunkAppender {
        &self.chunks[self.cur]
    }

    pub fn previous(&self) -> &ChunkAppender {
        &self.chunks[self.cur ^ 1]
    }

    pub fn pending(&self) -> &[Sample] {
        &self.pending
    }

    /// Samples dropped for arriving behind the late-write window.
    pub fn late_writes_dropped(&self) -> u64 {
        self.late_dropped
    }

    pub fn out_of_order_dropped(&self) -> u64 {
        self.out_of_order_dropped
    }

    /// Samples not yet acknowledged by the store, pending ones included.
    pub fn updates_behind(&self) -> usize {
        self.pending.len() + self.chunks.iter().map(|c| c.unflushed()).sum::<usize>()
    }

    /// Routes one sample to the buffer owning its time window.
    pub fn append(&mut self, t: Timestamp, v: Value) -> Result<(), TsdbError> {
        if matches!(self.state, StoreState::Init | StoreState::FetchingState) {
            self.pending.push(Sample::new(t, v));
            return Ok(());
        }

        let cur = self.cur;
        if self.chunks[cur].in_window(t) {
            return self.append_to(cur, t, v);
        }

        if t >= self.chunks[cur].maxt {
            let next = cur ^ 1;
            let busy = &self.chunks[next];
            let unflushed = busy.unflushed();
            if busy.writing || unflushed > 0 {
                tsdb_metrics::record_advance_conflict();
                self.events.on_event(TsdbEvent::AdvanceConflict {
                    metric: self.metric.clone(),
                    t,
                });
                let metric = self.metric.clone();
                return Err(if busy.writing {
                    TsdbError::AdvanceConflict { metric, t }
                } else {
                    TsdbError::UnflushedChunk { metric, t, unflushed }
                });
            }
            let (mint, maxt) = self.partition.chunk_window(t);
            self.chunks[next].reset(mint, maxt)?;
            self.cur = next;
            return self.append_to(next, t, v);
        }

        // behind the current window: only the previous buffer, within the late-write window
        let prev = cur ^ 1;
        let cur_last = self.chunks[cur].last_t;
        if self.chunks[prev].in_window(t) && t > cur_last.saturating_sub(self.max_late_write) {
            return self.append_to(prev, t, v);
        }

        self.late_dropped += 1;
        tsdb_metrics::record_late_write_dropped();
        self.events.on_event(TsdbEvent::LateWriteDropped {
            metric: self.metric.clone(),
            t,
            last_t: cur_last,
        });
        Ok(())
    }

    fn append_to(&mut self, idx: usize, t: Timestamp, v: Value) -> Result<(), TsdbError> {
        let max_bytes = self.max_array_size * 8;
        let slot = &mut self.chunks[idx];
        if slot.num_samples() > 0 && t <= slot.last_t {
            if t < slot.last_t {
                self.out_of_order_dropped += 1;
                tsdb_metrics::record_out_of_order_dropped();
                self.events.on_event(TsdbEvent::OutOfOrderDropped {
                    metric: self.metric.clone(),
                    t,
                    last_t: slot.last_t,
                });
            }
            // equal timestamps are duplicates
            return Ok(());
        }
        let app = slot
            .appender
            .as_mut()
            .ok_or_else(|| TsdbError::Encoding("chunk buffer has no appender".to_string()))?;
        if app.chunk().bytes().len() + MAX_SAMPLE_BYTES > max_bytes {
            return Err(TsdbError::Encoding(format!(
                "chunk [{}, {}) reached the array capacity of {} bytes",
                slot.mint, slot.maxt, max_bytes
            )));
        }
        app.append(t, v)?;
        slot.last_t = t;
        tsdb_metrics::record_appended(1);
        Ok(())
    }

    /// Starts the state fetch for a new store; `t` selects the chunk to restore.
    pub fn get_chunks_state(&mut self, path: &str, t: Timestamp) -> Result<GetItemSpec, TsdbError> {
        if self.state != StoreState::Init {
            return Err(TsdbError::InvalidState {
                expected: StoreState::Init.name(),
                actual: self.state.name(),
            });
        }
        let id = self.partition.time_to_chunk_id(t);
        self.fetch_window = Some(self.partition.chunk_window(t));
        self.state = StoreState::FetchingState;
        Ok(GetItemSpec {
            path: path.to_string(),
            attrs: vec![
                MAXTIME_ATTR.to_string(),
                self.partition.meta_attr(VALUE_COLUMN),
                self.partition.chunk_id_to_attr(VALUE_COLUMN, id),
            ],
        })
    }

    /// Returns to `Init` after the state request could not be submitted. Pending samples stay.
    pub fn cancel_fetch(&mut self) {
        if self.state == StoreState::FetchingState {
            self.state = StoreState::Init;
            self.fetch_window = None;
        }
    }

    /// Skips the state fetch for a metric known to have no remote item.
    pub fn mark_new(&mut self) -> Result<(), TsdbError> {
        self.process_get_resp(None)
    }

    /// Applies the state-fetch response: restores the current buffer from the remote copy
    /// (when it holds the same window) and replays pending samples.
    pub fn process_get_resp(&mut self, item: Option<&ItemAttrs>) -> Result<(), TsdbError> {
        if !matches!(self.state, StoreState::Init | StoreState::FetchingState) {
            return Err(TsdbError::InvalidState {
                expected: StoreState::FetchingState.name(),
                actual: self.state.name(),
            });
        }
        let restored = match item {
            Some(attrs) => {
                self.initialized_parts.insert(self.partition.id());
                if let Some(max_t) = item_max_time(attrs) {
                    self.flushed_max_t = self.flushed_max_t.max(max_t);
                }
                self.restore_current(attrs)
            }
            None => Ok(()),
        };
        self.state = StoreState::Ready;
        let replayed = self.replay_pending();
        restored.and(replayed)
    }

    fn restore_current(&mut self, attrs: &ItemAttrs) -> Result<(), TsdbError> {
        let Some((mint, maxt)) = self.fetch_window else {
            return Ok(());
        };
        if item_max_time(attrs).is_some_and(|max_t| max_t < mint) {
            return Ok(());
        }
        let id = self.partition.time_to_chunk_id(mint);
        let meta_attr = self.partition.meta_attr(VALUE_COLUMN);
        let chunk_attr = self.partition.chunk_id_to_attr(VALUE_COLUMN, id);
        let (Some(meta), Some(data)) = (attrs.get(&meta_attr), attrs.get(&chunk_attr)) else {
            return Ok(());
        };
        let meta_word = meta.to_words()?.get(id).copied().unwrap_or(0);
        if meta_word == 0 {
            return Ok(());
        }
        let bytes = data
            .as_bytes()
            .ok_or_else(|| TsdbError::corrupt(format!("attribute {} is not an array", chunk_attr)))?;
        let chunk = XorChunk::from_buffer(meta_word, bytes)?;
        let samples = decode_all(&chunk)?;
        let Some(last) = samples.last() else {
            return Ok(());
        };
        // the ring slot may still hold a previous cycle's chunk
        if self.partition.get_chunk_mint(last.t) != mint {
            return Ok(());
        }
        let len = chunk.bytes().len();
        let count = chunk.num_samples();
        let mut app = chunk.appender()?;
        let marker = len.saturating_sub(1) / 8 * 8;
        app.chunk_mut().move_offset(marker)?;

        let slot = &mut self.chunks[self.cur];
        *slot = ChunkAppender {
            appender: Some(app),
            mint,
            maxt,
            last_t: last.t,
            upd_marker: marker,
            upd_count: count,
            array_initialized: true,
            ..Default::default()
        };
        self.events.on_event(TsdbEvent::StateRestored {
            metric: self.metric.clone(),
            samples: count,
        });
        Ok(())
    }

    /// Builds the update for every buffer with unflushed samples and marks them `writing`.
    ///
    /// Returns `None` when nothing needs shipping or the store is not `Ready` (one flush
    /// outstanding at a time).
    pub fn write_chunks(&mut self, identity: &MetricIdentity, path: &str) -> Result<Option<UpdateItem>, TsdbError> {
        if self.state != StoreState::Ready {
            return Ok(None);
        }

        let part = Arc::clone(&self.partition);
        let init = if self.initialized_parts.contains(&part.id()) {
            None
        } else {
            Some(init_stmts(identity, part.chunk_count())?)
        };
        let mut chunk_stmts: Vec<String> = Vec::new();
        let mut max_t = self.flushed_max_t;

        for idx in [self.cur ^ 1, self.cur] {
            let slot = &self.chunks[idx];
            let Some(chunk) = slot.chunk() else {
                continue;
            };
            let samples = chunk.num_samples();
            if samples <= slot.upd_count {
                continue;
            }
            let (meta, offset, tail) = chunk.get_chunk_buffer();
            let id = part.time_to_chunk_id(slot.mint);
            let attr = part.chunk_id_to_attr(VALUE_COLUMN, id);
            if !slot.array_initialized {
                chunk_stmts.push(format!("{}=init_array({},'int')", attr, self.max_array_size));
            }
            chunk_stmts.extend(chunk_to_stmts(&part.meta_attr(VALUE_COLUMN), &attr, id, meta, offset, tail));
            // the last word may be partial; it is resent with the next flush
            let marker = if tail.is_empty() {
                offset
            } else {
                (offset + tail.len() - 1) / 8 * 8
            };
            max_t = max_t.max(slot.last_t);

            let slot = &mut self.chunks[idx];
            slot.flight_marker = marker;
            slot.flight_count = samples;
            slot.writing = true;
        }

        if chunk_stmts.is_empty() {
            return Ok(None);
        }

        let mut stmts = Vec::new();
        if let Some(init) = init {
            stmts.extend(init);
            self.init_in_flight = Some(part.id());
        }
        stmts.extend(chunk_stmts);
        stmts.push(format!("{}={}", MAXTIME_ATTR, max_t));

        self.flight_max_t = max_t;
        self.state = StoreState::Updating;
        Ok(Some(UpdateItem {
            path: path.to_string(),
            expression: join_stmts(&stmts),
        }))
    }

    /// Acknowledges the outstanding flush: commits offsets, returns to `Ready` and replays
    /// pending samples.
    pub fn process_write_resp(&mut self) -> Result<(), TsdbError> {
        if self.state != StoreState::Updating {
            return Err(TsdbError::InvalidState {
                expected: StoreState::Updating.name(),
                actual: self.state.name(),
            });
        }
        let mut committed = Ok(());
        for slot in self.chunks.iter_mut().filter(|s| s.writing) {
            if let Some(app) = slot.appender.as_mut() {
                if let Err(e) = app.chunk_mut().move_offset(slot.flight_marker) {
                    committed = committed.and(Err(e));
                }
            }
            slot.upd_marker = slot.flight_marker;
            slot.upd_count = slot.flight_count;
            slot.array_initialized = true;
            slot.writing = false;
        }
        if let Some(part_id) = self.init_in_flight.take() {
            self.initialized_parts.insert(part_id);
        }
        self.flushed_max_t = self.flushed_max_t.max(self.flight_max_t);
        self.state = StoreState::Ready;
        let replayed = self.replay_pending();
        committed.and(replayed)
    }

    /// Abandons the outstanding flush without committing anything, so the next flush
    /// resends the same bytes. Used for failed responses and as the retry path after a
    /// rejected submission.
    pub fn reset_in_flight(&mut self) -> Result<(), TsdbError> {
        if self.state != StoreState::Updating {
            return Err(TsdbError::InvalidState {
                expected: StoreState::Updating.name(),
                actual: self.state.name(),
            });
        }
        for slot in self.chunks.iter_mut() {
            slot.writing = false;
        }
        self.init_in_flight = None;
        self.state = StoreState::Ready;
        self.replay_pending()
    }

    fn replay_pending(&mut self) -> Result<(), TsdbError> {
        let pending = std::mem::take(&mut self.pending);
        let mut first_err = None;
        for s in pending {
            if let Err(e) = self.append(s.t, s.v) {
                self.events.on_event(TsdbEvent::PendingReplayFailed {
                    metric: self.metric.clone(),
                    error: e.to_string(),
                });
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Label and metadata-array initialisation for a (metric, partition) item's first write.
fn init_stmts(identity: &MetricIdentity, chunk_count: usize) -> Result<Vec<String>, TsdbError> {
    let mut stmts = Vec::with_capacity(identity.labels.len() + 2);
    for (name, value) in &identity.labels {
        if name == METRIC_NAME_LABEL {
            stmts.push(format!("_name={}", quote(value)));
        } else {
            check_label_name(name)?;
            stmts.push(format!("{}={}", name, quote(value)));
        }
    }
    stmts.push(format!("_lset={}", quote(&identity.key)));
    stmts.push(format!(
        "_meta_{}=init_array({},'int')",
        VALUE_COLUMN, chunk_count
    ));
    Ok(stmts)
}

/// Single-quoted string literal; `\` and `'` are backslash-escaped.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Statements writing a chunk's metadata word and its byte tail starting at `offset`.
pub fn chunk_to_stmts(meta_attr: &str, attr: &str, id: usize, meta: u64, offset: usize, tail: &[u8]) -> Vec<String> {
    let first_word = offset / 8;
    let mut stmts = Vec::with_capacity(1 + tail.len() / 8 + 1);
    stmts.push(format!("{}[{}]={}", meta_attr, id, meta as i64));
    for (i, word) in to_u64_words(tail).into_iter().enumerate() {
        stmts.push(format!("{}[{}]={}", attr, first_word + i, word as i64));
    }
    stmts
}

fn join_stmts(stmts: &[String]) -> String {
    stmts
        .iter()
        .map(|s| format!("{};", s))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads `_maxtime` from a fetched item, if present.
pub fn item_max_time(attrs: &ItemAttrs) -> Option<Timestamp> {
    attrs.get(MAXTIME_ATTR).and_then(AttrValue::as_int)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionManager;
    use crate::types::{Labels, MILLIS_PER_HOUR};

    const H: i64 = MILLIS_PER_HOUR;
    const MIN: i64 = 60 * 1000;

    fn ready_store() -> ChunkStore {
        let cfg = TsdbConfig::default();
        let part = PartitionManager::new(&cfg).head();
        let mut store = ChunkStore::new("cpu", part, &cfg);
        store.mark_new().unwrap();
        store
    }

    fn identity() -> MetricIdentity {
        let mut labels = Labels::new();
        labels.insert("host".to_string(), "a".to_string());
        MetricIdentity::new("cpu", labels)
    }

    fn times(slot: &ChunkAppender) -> Vec<Timestamp> {
        slot.samples().unwrap().iter().map(|s| s.t).collect()
    }

    #[test]
    fn appends_in_window_then_advances() {
        let mut store = ready_store();
        store.append(10 * H + 1, 1.0).unwrap();
        store.append(10 * H + 2, 2.0).unwrap();
        assert_eq!(store.current().mint(), 10 * H);
        assert_eq!(store.current().maxt(), 11 * H);
        assert_eq!(store.current().last_t(), 10 * H + 2);

        store.append(11 * H, 3.0).unwrap();
        assert_eq!(store.current().mint(), 11 * H);
        assert_eq!(times(store.previous()), vec![10 * H + 1, 10 * H + 2]);
        assert_eq!(times(store.current()), vec![11 * H]);
    }

    #[test]
    fn duplicate_and_out_of_order_samples_are_dropped() {
        let mut store = ready_store();
        store.append(5 * H + 100, 1.0).unwrap();
        store.append(5 * H + 100, 9.0).unwrap();
        store.append(5 * H + 50, 2.0).unwrap();
        assert_eq!(times(store.current()), vec![5 * H + 100]);
        assert_eq!(store.out_of_order_dropped(), 1);
    }

    #[test]
    fn late_write_lands_in_previous_buffer_within_window() {
        let mut store = ready_store();
        store.append(10 * H - 30 * MIN, 1.0).unwrap();
        store.append(10 * H + 20 * MIN, 2.0).unwrap();
        let late = 10 * H - 10 * MIN;
        store.append(late, 3.0).unwrap();
        assert_eq!(times(store.previous()), vec![10 * H - 30 * MIN, late]);
        assert_eq!(store.late_writes_dropped(), 0);
    }

    #[test]
    fn write_chunks_builds_expression_and_gates_second_flush() {
        let mut store = ready_store();
        store.append(3 * H + 1000, 1.5).unwrap();
        store.append(3 * H + 2000, 1.5).unwrap();
        let id = identity();

        let req = store.write_chunks(&id, "tsdb/cpu.1").unwrap().expect("update");
        assert_eq!(req.path, "tsdb/cpu.1");
        let expr = &req.expression;
        assert!(expr.starts_with("_name='cpu'; host='a'; _lset='host=a'; _meta_v=init_array(48,'int');"), "{}", expr);
        assert!(expr.contains("_v3=init_array(1024,'int');"), "{}", expr);
        assert!(expr.contains("_meta_v[3]="), "{}", expr);
        assert!(expr.contains("_v3[0]="), "{}", expr);
        assert!(expr.ends_with(&format!("_maxtime={};", 3 * H + 2000)), "{}", expr);
        assert_eq!(store.state(), StoreState::Updating);
        assert!(store.current().is_writing());

        store.append(3 * H + 3000, 2.0).unwrap();
        assert!(store.write_chunks(&id, "tsdb/cpu.1").unwrap().is_none());

        store.process_write_resp().unwrap();
        assert_eq!(store.state(), StoreState::Ready);
        assert!(!store.current().is_writing());
        assert_eq!(store.current().upd_count(), 2);

        let second = store.write_chunks(&id, "tsdb/cpu.1").unwrap().expect("update");
        assert!(!second.expression.contains("init_array"), "{}", second.expression);
        assert!(second.expression.contains("_v3[0]="), "{}", second.expression);
    }

    #[test]
    fn late_only_flush_keeps_maxtime_at_newest_sample() {
        let mut store = ready_store();
        let id = identity();
        store.append(10 * H - 30 * MIN, 1.0).unwrap();
        store.append(10 * H + 10 * MIN, 2.0).unwrap();
        store.append(10 * H + 20 * MIN, 3.0).unwrap();
        store.write_chunks(&id, "p").unwrap().unwrap();
        store.process_write_resp().unwrap();

        store.append(10 * H - 10 * MIN, 4.0).unwrap();
        let late = store.write_chunks(&id, "p").unwrap().unwrap();
        assert!(late.expression.contains("_v9["), "{}", late.expression);
        assert!(!late.expression.contains("_v10["), "{}", late.expression);
        assert!(late.expression.ends_with(&format!("_maxtime={};", 10 * H + 20 * MIN)), "{}", late.expression);
    }

    #[test]
    fn restored_maxtime_bounds_later_flushes() {
        let cfg = TsdbConfig::default();
        let part = PartitionManager::new(&cfg).head();
        let mut store = ChunkStore::new("cpu", part, &cfg);
        store.get_chunks_state("p", 4 * H).unwrap();
        let mut attrs = ItemAttrs::new();
        attrs.insert("_maxtime".to_string(), AttrValue::Int(5 * H));
        store.process_get_resp(Some(&attrs)).unwrap();

        store.append(4 * H + 1, 1.0).unwrap();
        let req = store.write_chunks(&identity(), "p").unwrap().unwrap();
        assert!(req.expression.ends_with(&format!("_maxtime={};", 5 * H)), "{}", req.expression);
    }

    #[test]
    fn label_values_are_quoted_and_names_checked() {
        let mut store = ready_store();
        store.append(H, 1.0).unwrap();
        let mut labels = Labels::new();
        labels.insert("host".to_string(), "x'; _maxtime=0; y='z\\".to_string());
        let req = store.write_chunks(&MetricIdentity::new("cpu", labels), "p").unwrap().unwrap();
        assert!(
            req.expression.starts_with(r"_name='cpu'; host='x\'; _maxtime=0; y=\'z\\'; _lset='host=x\'; _maxtime=0; y=\'z\\';"),
            "{}",
            req.expression
        );

        let mut store = ready_store();
        store.append(H, 1.0).unwrap();
        let mut labels = Labels::new();
        labels.insert("bad-name".to_string(), "a".to_string());
        let err = store.write_chunks(&MetricIdentity::new("cpu", labels), "p").unwrap_err();
        assert!(matches!(err, TsdbError::InvalidLabel(ref n) if n == "bad-name"));
        assert_eq!(store.state(), StoreState::Ready);
        assert!(!store.current().is_writing());
    }

    #[test]
    fn nothing_to_flush_yields_no_request() {
        let mut store = ready_store();
        assert!(store.write_chunks(&identity(), "p").unwrap().is_none());
        assert_eq!(store.state(), StoreState::Ready);
    }

    #[test]
    fn aborted_write_resends_same_tail() {
        let mut store = ready_store();
        store.append(H, 1.0).unwrap();
        let id = identity();
        let first = store.write_chunks(&id, "p").unwrap().unwrap();
        store.reset_in_flight().unwrap();
        assert_eq!(store.current().upd_count(), 0);
        let again = store.write_chunks(&id, "p").unwrap().unwrap();
        assert_eq!(first.expression, again.expression);
    }

    #[test]
    fn updates_behind_counts_pending_and_unflushed() {
        let cfg = TsdbConfig::default();
        let part = PartitionManager::new(&cfg).head();
        let mut store = ChunkStore::new("cpu", part, &cfg);
        store.append(H, 1.0).unwrap();
        store.append(H + 1, 1.0).unwrap();
        assert_eq!(store.updates_behind(), 2);
        store.mark_new().unwrap();
        assert_eq!(store.updates_behind(), 2);
        assert!(store.pending().is_empty());
    }

    /// Applies `attr[i]=v` statements of one expression to a word array, like the store does.
    fn apply_words(words: &mut Vec<u64>, meta: &mut Vec<u64>, expr: &str, attr: &str) {
        for stmt in expr.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((lhs, rhs)) = stmt.split_once('=') else { continue };
            let Some((name, index)) = lhs.split_once('[') else { continue };
            let index: usize = index.trim_end_matches(']').parse().unwrap();
            let value = rhs.parse::<i64>().unwrap() as u64;
            let target = if name == attr {
                &mut *words
            } else if name == "_meta_v" {
                &mut *meta
            } else {
                continue;
            };
            if target.len() <= index {
                target.resize(index + 1, 0);
            }
            target[index] = value;
        }
    }

    fn words_to_bytes(words: &[u64]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn late_write_beyond_window_is_dropped() {
        let mut store = ready_store();
        store.append(10 * H - 50 * MIN, 1.0).unwrap();
        store.append(10 * H + 30 * MIN, 2.0).unwrap();
        // exactly max_late_write behind the newest sample
        store.append(10 * H + 30 * MIN - 59 * MIN, 3.0).unwrap();
        assert_eq!(store.late_writes_dropped(), 1);
        // one millisecond inside the window
        store.append(10 * H + 30 * MIN - 59 * MIN + 1, 4.0).unwrap();
        assert_eq!(store.late_writes_dropped(), 1);
        assert_eq!(store.previous().num_samples(), 2);

        // older than the previous buffer altogether
        store.append(8 * H, 5.0).unwrap();
        assert_eq!(store.late_writes_dropped(), 2);
    }

    #[test]
    fn advance_into_buffer_with_write_in_flight_conflicts() {
        let mut store = ready_store();
        let id = identity();
        store.append(H + 1, 1.0).unwrap();
        store.append(2 * H + 1, 2.0).unwrap();
        store.write_chunks(&id, "p").unwrap().unwrap();
        assert!(store.previous().is_writing());

        let err = store.append(3 * H + 1, 3.0).unwrap_err();
        assert!(matches!(err, TsdbError::AdvanceConflict { t, .. } if t == 3 * H + 1));
        assert_eq!(store.current().mint(), 2 * H);

        store.process_write_resp().unwrap();
        store.append(3 * H + 1, 3.0).unwrap();
        assert_eq!(store.current().mint(), 3 * H);
    }

    #[test]
    fn advance_into_unflushed_buffer_is_its_own_error() {
        let mut store = ready_store();
        store.append(H + 1, 1.0).unwrap();
        store.append(2 * H + 1, 2.0).unwrap();
        assert!(!store.previous().is_writing());

        let err = store.append(3 * H + 1, 3.0).unwrap_err();
        assert!(matches!(err, TsdbError::UnflushedChunk { unflushed: 1, t, .. } if t == 3 * H + 1));
        assert_eq!(times(store.previous()), vec![H + 1]);
        assert_eq!(store.current().mint(), 2 * H);
    }

    #[test]
    fn pending_samples_replay_in_arrival_order() {
        let cfg = TsdbConfig::default();
        let part = PartitionManager::new(&cfg).head();
        let mut store = ChunkStore::new("cpu", part, &cfg);
        let spec = store.get_chunks_state("tsdb/cpu.1", 4 * H + 5).unwrap();
        assert_eq!(spec.attrs, vec!["_maxtime", "_meta_v", "_v4"]);
        assert_eq!(store.state(), StoreState::FetchingState);

        for (i, t) in [4 * H + 5, 4 * H + 7, 4 * H + 6, 4 * H + 9].iter().enumerate() {
            store.append(*t, i as f64).unwrap();
        }
        assert_eq!(store.pending().len(), 4);
        store.process_get_resp(None).unwrap();
        assert!(store.is_ready());
        assert_eq!(times(store.current()), vec![4 * H + 5, 4 * H + 7, 4 * H + 9]);
        assert_eq!(store.out_of_order_dropped(), 1);
    }

    #[test]
    fn partial_flushes_rebuild_the_full_chunk_remotely() {
        let mut store = ready_store();
        let id = identity();
        let mut remote = Vec::new();
        let mut meta = Vec::new();
        let mut expected = Vec::new();

        let mut t = 6 * H;
        for round in 0..5 {
            for i in 0..(7 + round * 3) {
                let v = (round * 100 + i) as f64 * 0.37;
                store.append(t, v).unwrap();
                expected.push(Sample::new(t, v));
                t += 1000 + (i as i64 % 3) * 17;
            }
            let req = store.write_chunks(&id, "p").unwrap().unwrap();
            apply_words(&mut remote, &mut meta, &req.expression, "_v6");
            store.process_write_resp().unwrap();
            assert_eq!(store.current().upd_marker() % 8, 0);
        }

        let chunk = XorChunk::from_buffer(meta[6], &words_to_bytes(&remote)).unwrap();
        assert_eq!(decode_all(&chunk).unwrap(), expected);
    }

    #[test]
    fn restores_current_chunk_and_continues_appending() {
        let mut writer = ready_store();
        let id = identity();
        writer.append(7 * H + 10, 1.0).unwrap();
        writer.append(7 * H + 20, 2.0).unwrap();
        let req = writer.write_chunks(&id, "p").unwrap().unwrap();
        let mut remote = Vec::new();
        let mut meta = Vec::new();
        apply_words(&mut remote, &mut meta, &req.expression, "_v7");

        let cfg = TsdbConfig::default();
        let part = PartitionManager::new(&cfg).head();
        let mut store = ChunkStore::new("cpu", part, &cfg);
        store.get_chunks_state("p", 7 * H + 30).unwrap();
        store.append(7 * H + 30, 3.0).unwrap();

        let mut attrs = ItemAttrs::new();
        attrs.insert("_maxtime".to_string(), AttrValue::Int(7 * H + 20));
        attrs.insert("_meta_v".to_string(), AttrValue::Bytes(words_to_bytes(&meta)));
        attrs.insert("_v7".to_string(), AttrValue::Bytes(words_to_bytes(&remote)));
        assert_eq!(item_max_time(&attrs), Some(7 * H + 20));
        store.process_get_resp(Some(&attrs)).unwrap();

        assert_eq!(times(store.current()), vec![7 * H + 10, 7 * H + 20, 7 * H + 30]);
        assert_eq!(store.current().upd_count(), 2);
        assert_eq!(store.updates_behind(), 1);

        // partition already initialized remotely: no label statements
        let next = store.write_chunks(&id, "p").unwrap().unwrap();
        assert!(!next.expression.contains("_lset"), "{}", next.expression);
        assert!(!next.expression.contains("init_array"), "{}", next.expression);
    }

    #[test]
    fn stale_ring_slot_is_not_restored() {
        let mut writer = ready_store();
        let id = identity();
        writer.append(7 * H + 10, 1.0).unwrap();
        let req = writer.write_chunks(&id, "p").unwrap().unwrap();
        let mut remote = Vec::new();
        let mut meta = Vec::new();
        apply_words(&mut remote, &mut meta, &req.expression, "_v7");

        let cfg = TsdbConfig::default();
        let part = PartitionManager::new(&cfg).head();
        let mut store = ChunkStore::new("cpu", part, &cfg);
        // same chunk id (7), one ring cycle later
        let later = 7 * H + 30 + 2 * crate::types::MILLIS_PER_DAY;
        store.get_chunks_state("p", later).unwrap();
        let mut attrs = ItemAttrs::new();
        attrs.insert("_meta_v".to_string(), AttrValue::Bytes(words_to_bytes(&meta)));
        attrs.insert("_v7".to_string(), AttrValue::Bytes(words_to_bytes(&remote)));
        store.process_get_resp(Some(&attrs)).unwrap();
        assert_eq!(store.current().num_samples(), 0);

        store.append(later, 3.0).unwrap();
        let next = store.write_chunks(&id, "p").unwrap().unwrap();
        assert!(next.expression.contains("_v7=init_array(1024,'int')"), "{}", next.expression);
    }
}
