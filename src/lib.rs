//! Chunked time-series storage engine on top of a remote key-value object store.
//!
//! The write path compresses samples into XOR chunks ([`encoding`]), routes them to a
//! per-metric double-buffered [`store::ChunkStore`] addressed by a cyclic partition
//! ([`partition`]), and ships only the unsent byte tail of each chunk as an update
//! expression through the [`coordinator::WriteCoordinator`]. The read path
//! ([`collector`]) merges asynchronous per-partition results into column frames with
//! raw, aggregated or downsampled columns.
//!
//! The remote store itself is abstracted by [`client::StoreClient`]: submissions return a
//! request id immediately and responses are delivered later, in any order.

pub mod aggregate;
pub mod client;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod encoding;
pub mod error;
pub mod frame;
pub mod partition;
pub mod store;
pub mod telemetry;
pub mod types;

/// Engine configuration.
pub use crate::config::TsdbConfig;
/// Error type for all fallible operations.
pub use crate::error::TsdbError;
/// Structured event hook for observability.
pub use crate::telemetry::{TsdbEvent, TsdbEventListener};
pub use crate::types::{Labels, MetricIdentity, Sample, Timestamp, Value};

pub use crate::client::{AttrValue, GetItemSpec, ItemAttrs, RequestId, StoreClient, StoreResponse, UpdateItem};
pub use crate::collector::{Collector, QueryContext, QueryResult, ResultKind};
pub use crate::coordinator::{MetricRef, WriteCoordinator};
pub use crate::encoding::{XorAppender, XorChunk};
pub use crate::frame::{ColumnSpec, DataFrame, FrameSet, SeriesSet};
pub use crate::partition::{Partition, PartitionManager};
pub use crate::store::{ChunkStore, StoreState};
