//! Fans chunk-store flushes of many metrics into one [`StoreClient`] and routes the
//! asynchronous responses back to the metric that issued each request.
//!
//! Lock discipline: a metric lock may be held while taking the request table lock, never the
//! other way round. The table lock is not held across a client submission. A response that
//! overtakes the registration of its request is parked in the table and applied by the
//! submitting thread, which still holds the metric lock. The response path removes its entry
//! and releases the table before locking the metric.

use crate::client::{ResponseBody, RequestId, StoreClient, StoreResponse};
use crate::config::TsdbConfig;
use crate::error::TsdbError;
use crate::partition::PartitionManager;
use crate::store::{ChunkStore, StoreState};
use crate::telemetry::{tsdb_metrics, TsdbEvent, TsdbEventListener};
use crate::types::{check_label_name, Labels, MetricIdentity, Timestamp, Value, METRIC_NAME_LABEL};

use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// One metric's identity, remote item path and chunk store.
#[derive(Debug)]
pub struct MetricState {
    pub identity: MetricIdentity,
    pub path: String,
    pub store: ChunkStore,
}

/// Shared handle to a registered metric.
pub type MetricRef = Arc<Mutex<MetricState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    GetState,
    Update,
}

#[derive(Debug)]
struct InFlight {
    metric: MetricRef,
    kind: RequestKind,
    submitted: Instant,
}

#[derive(Debug, Default)]
struct RequestTable {
    in_flight: HashMap<RequestId, InFlight>,
    /// Responses that arrived before their request was registered.
    early: HashMap<RequestId, StoreResponse>,
    /// Submissions between the client call and registration.
    submitting: usize,
}

/// Metric write coordinator.
pub struct WriteCoordinator<C: StoreClient> {
    client: C,
    partitions: PartitionManager,
    config: TsdbConfig,
    metrics: Mutex<HashMap<String, MetricRef>>,
    requests: Mutex<RequestTable>,
    events: Arc<dyn TsdbEventListener>,
}

impl<C: StoreClient> std::fmt::Debug for WriteCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoordinator")
            .field("partitions", &self.partitions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: StoreClient> WriteCoordinator<C> {
    pub fn new(client: C, config: TsdbConfig) -> Result<Self, TsdbError> {
        config.validate()?;
        Ok(WriteCoordinator {
            client,
            partitions: PartitionManager::new(&config),
            events: config.event_listener.clone(),
            config,
            metrics: Mutex::new(HashMap::new()),
            requests: Mutex::new(RequestTable::default()),
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    /// Registers a metric series, or returns the existing handle for the same identity.
    pub fn add_metric(&self, name: &str, labels: Labels) -> Result<MetricRef, TsdbError> {
        for label in labels.keys().filter(|k| k.as_str() != METRIC_NAME_LABEL) {
            check_label_name(label)?;
        }
        let identity = MetricIdentity::new(name, labels);
        let path = identity.item_path(&self.config.table_path);
        let mut metrics = self.metrics.lock()?;
        let handle = metrics.entry(path.clone()).or_insert_with(|| {
            let store = ChunkStore::new(name, self.partitions.head(), &self.config);
            Arc::new(Mutex::new(MetricState {
                identity,
                path,
                store,
            }))
        });
        Ok(Arc::clone(handle))
    }

    /// Number of registered metrics.
    pub fn metric_count(&self) -> Result<usize, TsdbError> {
        Ok(self.metrics.lock()?.len())
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> Result<usize, TsdbError> {
        Ok(self.requests.lock()?.in_flight.len())
    }

    /// Appends one sample. The first append of a new metric submits its state fetch; the
    /// sample waits in the store's pending list until the response arrives.
    pub fn append(&self, metric: &MetricRef, t: Timestamp, v: Value) -> Result<(), TsdbError> {
        let mut guard = metric.lock()?;
        let state = &mut *guard;
        if state.store.state() == StoreState::Init {
            let spec = state.store.get_chunks_state(&state.path, t)?;
            match self.submit(metric, RequestKind::GetState, || self.client.get_item(&spec)) {
                Ok((request_id, early)) => {
                    self.events.on_event(TsdbEvent::StateFetchSubmitted {
                        metric: state.identity.name.clone(),
                        request_id,
                    });
                    if let Some(resp) = early {
                        // pending samples replay before this one
                        if let Err(e) = self.apply_response(RequestKind::GetState, Instant::now(), state, resp) {
                            tracing::debug!(request_id, error = %e, "early state response not applied");
                        }
                    }
                }
                Err(e) => {
                    state.store.cancel_fetch();
                    return Err(e);
                }
            }
        }
        state.store.append(t, v)
    }

    /// Submits the unflushed bytes of one metric. Returns `None` when there is nothing to
    /// send or a flush for this metric is still outstanding.
    ///
    /// A rejected submission leaves the store `Updating`; call [`WriteCoordinator::retry`].
    pub fn flush(&self, metric: &MetricRef) -> Result<Option<RequestId>, TsdbError> {
        let mut guard = metric.lock()?;
        let state = &mut *guard;
        let Some(update) = state.store.write_chunks(&state.identity, &state.path)? else {
            return Ok(None);
        };

        let submitted = Instant::now();
        match self.submit(metric, RequestKind::Update, || self.client.update_item(&update)) {
            Ok((request_id, early)) => {
                let bytes = update.expression.len();
                tracing::debug!(
                    metric = %state.identity.name,
                    request_id,
                    bytes,
                    "submitted chunk update"
                );
                tracing::trace!(expression = %update.expression);
                tsdb_metrics::record_flush_submitted(bytes as u64);
                self.events.on_event(TsdbEvent::WriteSubmitted {
                    metric: state.identity.name.clone(),
                    request_id,
                    bytes,
                });
                if let Some(resp) = early {
                    self.apply_response(RequestKind::Update, submitted, state, resp)?;
                }
                Ok(Some(request_id))
            }
            Err(e) => {
                tsdb_metrics::record_flush_failure();
                self.events.on_event(TsdbEvent::WriteFailed {
                    metric: state.identity.name.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Runs one client submission without holding the request table, then registers the
    /// request. Returns the response instead when it already arrived.
    fn submit<F>(&self, metric: &MetricRef, kind: RequestKind, send: F) -> Result<(RequestId, Option<StoreResponse>), TsdbError>
    where
        F: FnOnce() -> Result<RequestId, TsdbError>,
    {
        self.requests.lock()?.submitting += 1;
        let submitted = Instant::now();
        let sent = send();

        let mut table = self.requests.lock()?;
        table.submitting -= 1;
        let registered = sent.map(|request_id| {
            let early = table.early.remove(&request_id);
            if early.is_none() {
                table.in_flight.insert(
                    request_id,
                    InFlight {
                        metric: Arc::clone(metric),
                        kind,
                        submitted,
                    },
                );
            }
            (request_id, early)
        });
        // with no submission left in progress, parked responses belong to nobody
        let orphans: Vec<RequestId> = if table.submitting == 0 {
            table.early.drain().map(|(id, _)| id).collect()
        } else {
            Vec::new()
        };
        drop(table);
        for request_id in orphans {
            self.events.on_event(TsdbEvent::UnknownResponse { request_id });
        }
        registered
    }

    /// Flushes every registered metric in parallel. Returns how many updates were submitted,
    /// or the first error after all metrics were attempted.
    pub fn flush_all(&self) -> Result<usize, TsdbError> {
        let metrics: Vec<MetricRef> = self.metrics.lock()?.values().cloned().collect();
        let results: Vec<Result<Option<RequestId>, TsdbError>> =
            metrics.par_iter().map(|m| self.flush(m)).collect();
        let mut submitted = 0;
        let mut first_err = None;
        for r in results {
            match r {
                Ok(Some(_)) => submitted += 1,
                Ok(None) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(submitted), Err)
    }

    /// Retry path after a rejected submission: forgets the failed flush and submits again.
    pub fn retry(&self, metric: &MetricRef) -> Result<Option<RequestId>, TsdbError> {
        {
            let table = self.requests.lock()?;
            let outstanding = table
                .in_flight
                .values()
                .any(|r| r.kind == RequestKind::Update && Arc::ptr_eq(&r.metric, metric));
            if outstanding {
                return Err(TsdbError::InvalidState {
                    expected: StoreState::Ready.name(),
                    actual: StoreState::Updating.name(),
                });
            }
        }
        {
            let mut guard = metric.lock()?;
            if guard.store.state() == StoreState::Updating {
                guard.store.reset_in_flight()?;
            }
        }
        self.flush(metric)
    }

    /// Routes one response to its metric and advances that metric's store.
    pub fn process_response(&self, resp: StoreResponse) -> Result<(), TsdbError> {
        let in_flight = {
            let mut table = self.requests.lock()?;
            match table.in_flight.remove(&resp.request_id) {
                Some(in_flight) => in_flight,
                None if table.submitting > 0 => {
                    table.early.insert(resp.request_id, resp);
                    return Ok(());
                }
                None => {
                    drop(table);
                    self.events.on_event(TsdbEvent::UnknownResponse {
                        request_id: resp.request_id,
                    });
                    return Err(TsdbError::UnknownRequest(resp.request_id));
                }
            }
        };

        let mut guard = in_flight.metric.lock()?;
        self.apply_response(in_flight.kind, in_flight.submitted, &mut guard, resp)
    }

    fn apply_response(&self, kind: RequestKind, submitted: Instant, state: &mut MetricState, resp: StoreResponse) -> Result<(), TsdbError> {
        let metric = state.identity.name.clone();
        match (kind, resp.result) {
            (RequestKind::Update, Ok(_)) => {
                tsdb_metrics::record_flush_roundtrip(submitted.elapsed());
                self.events.on_event(TsdbEvent::WriteAcked {
                    metric,
                    request_id: resp.request_id,
                });
                self.replay_result(state, |store| store.process_write_resp())
            }
            (RequestKind::Update, Err(message)) => {
                tsdb_metrics::record_flush_failure();
                self.events.on_event(TsdbEvent::WriteFailed {
                    metric,
                    error: message.clone(),
                });
                state.store.reset_in_flight()?;
                Err(TsdbError::Remote {
                    request_id: resp.request_id,
                    message,
                })
            }
            (RequestKind::GetState, Ok(ResponseBody::Item(attrs))) => {
                self.replay_result(state, |store| store.process_get_resp(attrs.as_ref()))
            }
            (RequestKind::GetState, Ok(ResponseBody::Updated)) => {
                state.store.cancel_fetch();
                Err(TsdbError::corrupt(format!(
                    "request {} answered a state fetch with an update ack",
                    resp.request_id
                )))
            }
            (RequestKind::GetState, Err(message)) => {
                state.store.cancel_fetch();
                Err(TsdbError::Remote {
                    request_id: resp.request_id,
                    message,
                })
            }
        }
    }

    fn replay_result<F>(&self, state: &mut MetricState, f: F) -> Result<(), TsdbError>
    where
        F: FnOnce(&mut ChunkStore) -> Result<(), TsdbError>,
    {
        let res = f(&mut state.store);
        if let Err(e) = &res {
            tracing::warn!(metric = %state.identity.name, error = %e, "failed to apply store response");
        }
        res
    }
}

impl<C: StoreClient + 'static> WriteCoordinator<C> {
    /// Spawns a thread that applies responses until every sender of `rx` is dropped.
    pub fn spawn_response_loop(self: &Arc<Self>, rx: mpsc::Receiver<StoreResponse>) -> Result<JoinHandle<()>, TsdbError> {
        let coordinator = Arc::clone(self);
        thread::Builder::new()
            .name("kvtsdb-responses".to_string())
            .spawn(move || {
                for resp in rx {
                    let request_id = resp.request_id;
                    if let Err(e) = coordinator.process_response(resp) {
                        tracing::debug!(request_id, error = %e, "store response not applied");
                    }
                }
            })
            .map_err(|e| TsdbError::BackgroundTaskError(e.to_string()))
    }
}
