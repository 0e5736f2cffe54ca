use thiserror::Error;

use crate::client::RequestId;
use crate::types::Timestamp;

/// Error type for the append engine, addressing and query collector.
#[derive(Error, Debug)]
pub enum TsdbError {
    /// The codec could not produce an appender for a chunk.
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Unknown chunk encoding: {0}")]
    UnknownEncoding(u8),

    #[error("Corrupt chunk data: {details}")]
    Corrupt { details: String },

    /// A forward advance needs the alternate buffer while a flush to it is still in flight.
    #[error("Append at {t} beyond current chunk while a write to the previous chunk is in flight (metric={metric})")]
    AdvanceConflict { metric: String, t: Timestamp },

    /// A forward advance needs the alternate buffer while it still holds samples that were
    /// never sent to the store.
    #[error("Append at {t} beyond current chunk while the previous chunk has {unflushed} unflushed samples (metric={metric})")]
    UnflushedChunk {
        metric: String,
        t: Timestamp,
        unflushed: usize,
    },

    #[error("Invalid label name: {0:?}")]
    InvalidLabel(String),

    #[error("Store rejected request: {0}")]
    Submit(String),

    #[error("Request {request_id} failed: {message}")]
    Remote { request_id: RequestId, message: String },

    #[error("No in-flight request with id {0}")]
    UnknownRequest(RequestId),

    #[error("Invalid store state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Offset {offset} out of range for chunk of {len} bytes")]
    OffsetOutOfRange { offset: usize, len: usize },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: Timestamp, end: Timestamp },

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),
}

impl TsdbError {
    pub(crate) fn corrupt(details: impl Into<String>) -> Self {
        TsdbError::Corrupt {
            details: details.into(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TsdbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TsdbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<config::ConfigError> for TsdbError {
    fn from(err: config::ConfigError) -> Self {
        TsdbError::Config(err.to_string())
    }
}
