//! In-memory stand-in for the remote object store used by the integration tests.
//!
//! Applies update expressions (`attr=init_array(n,'int')`, `attr[i]=word`, `attr='s'` with
//! backslash escapes, `attr=number`) to items and queues one response per submission for the test to deliver.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kvtsdb::collector::{QueryResult, ResultKind};
use kvtsdb::coordinator::WriteCoordinator;
use kvtsdb::partition::Partition;
use kvtsdb::{AttrValue, GetItemSpec, ItemAttrs, Labels, RequestId, StoreClient, StoreResponse, TsdbError, UpdateItem};

#[derive(Default)]
struct Inner {
    items: Mutex<HashMap<String, ItemAttrs>>,
    responses: Mutex<Vec<StoreResponse>>,
    expressions: Mutex<Vec<String>>,
    next_id: AtomicU64,
    reject_submissions: AtomicBool,
}

/// Cloning shares the same backing items.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.inner.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Responses queued since the last call, in submission order.
    pub fn take_responses(&self) -> Vec<StoreResponse> {
        std::mem::take(&mut *self.inner.responses.lock().unwrap())
    }

    pub fn expressions(&self) -> Vec<String> {
        self.inner.expressions.lock().unwrap().clone()
    }

    pub fn item(&self, path: &str) -> Option<ItemAttrs> {
        self.inner.items.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.items.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn next_id(&self) -> RequestId {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn apply(&self, path: &str, expression: &str) -> Result<(), String> {
        let mut items = self.inner.items.lock().unwrap();
        let item = items.entry(path.to_string()).or_default();
        for stmt in split_statements(expression).iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let (lhs, rhs) = stmt.split_once('=').ok_or_else(|| format!("bad statement '{}'", stmt))?;
            let (lhs, rhs) = (lhs.trim(), rhs.trim());
            if let Some((name, index)) = lhs.split_once('[') {
                let index: usize = index.trim_end_matches(']').parse().map_err(|e| format!("{}", e))?;
                let word: i64 = rhs.parse().map_err(|e| format!("{}: {}", stmt, e))?;
                let entry = item
                    .entry(name.to_string())
                    .or_insert_with(|| AttrValue::Bytes(Vec::new()));
                let AttrValue::Bytes(bytes) = entry else {
                    return Err(format!("{} is not an array", name));
                };
                let end = (index + 1) * 8;
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[index * 8..end].copy_from_slice(&(word as u64).to_le_bytes());
            } else if let Some(args) = rhs.strip_prefix("init_array(") {
                let len: usize = args
                    .split(',')
                    .next()
                    .and_then(|n| n.trim().parse().ok())
                    .ok_or_else(|| format!("bad init_array in '{}'", stmt))?;
                item.insert(lhs.to_string(), AttrValue::Bytes(vec![0; len * 8]));
            } else if let Some(s) = rhs.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
                item.insert(lhs.to_string(), AttrValue::Str(unescape(s)));
            } else if let Ok(i) = rhs.parse::<i64>() {
                item.insert(lhs.to_string(), AttrValue::Int(i));
            } else {
                let f: f64 = rhs.parse().map_err(|_| format!("bad value in '{}'", stmt))?;
                item.insert(lhs.to_string(), AttrValue::Float(f));
            }
        }
        Ok(())
    }

    /// Builds a query result from everything stored for `path`.
    pub fn query_result(&self, path: &str, name: &str, labels: Labels, partition: Arc<Partition>, kind: ResultKind) -> QueryResult {
        let fields = self.item(path).unwrap_or_default();
        QueryResult::new(name, labels, partition, kind, fields)
    }
}

impl StoreClient for MemStore {
    fn update_item(&self, req: &UpdateItem) -> Result<RequestId, TsdbError> {
        if self.inner.reject_submissions.load(Ordering::SeqCst) {
            return Err(TsdbError::Submit("store unavailable".to_string()));
        }
        let id = self.next_id();
        self.inner.expressions.lock().unwrap().push(req.expression.clone());
        let resp = match self.apply(&req.path, &req.expression) {
            Ok(()) => StoreResponse::updated(id),
            Err(e) => StoreResponse::failed(id, e),
        };
        self.inner.responses.lock().unwrap().push(resp);
        Ok(id)
    }

    fn get_item(&self, spec: &GetItemSpec) -> Result<RequestId, TsdbError> {
        if self.inner.reject_submissions.load(Ordering::SeqCst) {
            return Err(TsdbError::Submit("store unavailable".to_string()));
        }
        let id = self.next_id();
        let attrs = self.item(&spec.path).map(|item| {
            item.into_iter()
                .filter(|(k, _)| spec.attrs.iter().any(|a| a == k))
                .collect::<ItemAttrs>()
        });
        self.inner.responses.lock().unwrap().push(StoreResponse::item(id, attrs));
        Ok(id)
    }
}

/// Splits on `;` outside single-quoted literals.
fn split_statements(expression: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut chars = expression.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                cur.push(c);
                if let Some(next) = chars.next() {
                    cur.push(next);
                }
            }
            '\'' => {
                quoted = !quoted;
                cur.push(c);
            }
            ';' if !quoted => out.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    out.push(cur);
    out
}

fn unescape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.extend(chars.next());
        } else {
            out.push(c);
        }
    }
    out
}

/// Delivers every queued response; returns how many were applied without error.
pub fn pump(coordinator: &WriteCoordinator<MemStore>) -> usize {
    let mut applied = 0;
    loop {
        let responses = coordinator.client().take_responses();
        if responses.is_empty() {
            return applied;
        }
        for r in responses {
            if coordinator.process_response(r).is_ok() {
                applied += 1;
            }
        }
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
