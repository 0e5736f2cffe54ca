//! Partition and chunk addressing.
//!
//! Absolute time is folded into a cyclic partition: the day index wraps every
//! `days_per_partition` days, so chunk ids (and the remote attribute names derived from
//! them) are reused across retention cycles instead of growing without bound.
//! All windows are half-open `[mint, maxt)`.

use crate::config::TsdbConfig;
use crate::types::{Timestamp, MILLIS_PER_DAY, MILLIS_PER_HOUR};

use std::sync::Arc;

/// Splits a millisecond timestamp into (days since epoch, hour of day).
pub fn time_to_dhm(t: Timestamp) -> (i64, i64) {
    let hours = t.div_euclid(MILLIS_PER_HOUR);
    (hours.div_euclid(24), hours.rem_euclid(24))
}

/// One retention window of absolute time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    part_id: u32,
    start_time: Timestamp,
    days_per_partition: u32,
    hours_per_chunk: u32,
    retention_days: u32,
}

impl Partition {
    pub fn new(part_id: u32, start_time: Timestamp, cfg: &TsdbConfig) -> Self {
        Partition {
            part_id,
            start_time,
            days_per_partition: cfg.days_per_partition,
            hours_per_chunk: cfg.hours_per_chunk,
            retention_days: cfg.retention_days,
        }
    }

    pub fn id(&self) -> u32 {
        self.part_id
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn hours_per_chunk(&self) -> u32 {
        self.hours_per_chunk
    }

    pub fn days_per_partition(&self) -> u32 {
        self.days_per_partition
    }

    /// Width of one chunk window in milliseconds.
    pub fn chunk_span(&self) -> i64 {
        self.hours_per_chunk as i64 * MILLIS_PER_HOUR
    }

    /// Number of chunk ids in the ring.
    pub fn chunk_count(&self) -> usize {
        let days = self.days_per_partition.max(1) as usize;
        days * 24 / self.hours_per_chunk as usize
    }

    /// Start of the chunk window containing `t`.
    pub fn get_chunk_mint(&self, t: Timestamp) -> Timestamp {
        t.div_euclid(self.chunk_span()) * self.chunk_span()
    }

    /// Half-open `[mint, maxt)` chunk window containing `t`.
    pub fn chunk_window(&self, t: Timestamp) -> (Timestamp, Timestamp) {
        let mint = self.get_chunk_mint(t);
        (mint, mint + self.chunk_span())
    }

    pub fn in_chunk_range(&self, mint: Timestamp, t: Timestamp) -> bool {
        t >= mint && t < mint + self.chunk_span()
    }

    pub fn is_ahead_of_chunk(&self, mint: Timestamp, t: Timestamp) -> bool {
        t >= mint + self.chunk_span()
    }

    /// Chunk id of `t` within the cyclic ring, in `0..chunk_count()`.
    pub fn time_to_chunk_id(&self, t: Timestamp) -> usize {
        let (d, h) = time_to_dhm(t - self.start_time);
        let hpc = self.hours_per_chunk as i64;
        if self.days_per_partition <= 1 {
            return (h / hpc) as usize;
        }
        let day_index = d.rem_euclid(self.days_per_partition as i64);
        ((day_index * 24 + h) / hpc) as usize
    }

    /// Ordered chunk ids covering `[mint, maxt)`, wrapping around the end of the ring.
    pub fn range_to_chunk_ids(&self, mint: Timestamp, maxt: Timestamp) -> Vec<usize> {
        if maxt <= mint {
            return Vec::new();
        }
        let count = self.chunk_count();
        let start = self.time_to_chunk_id(mint);
        let ring_span = count as i64 * self.chunk_span();
        if maxt - self.get_chunk_mint(mint) >= ring_span {
            // the range covers the whole ring; every id once, in wrap order
            return (start..count).chain(0..start).collect();
        }
        let end = self.time_to_chunk_id(maxt - 1);
        if end < start {
            (start..count).chain(0..=end).collect()
        } else {
            (start..=end).collect()
        }
    }

    /// Remote attribute name of chunk `id` for column `col`.
    pub fn chunk_id_to_attr(&self, col: &str, id: usize) -> String {
        format!("_{}{}", col, id * self.hours_per_chunk as usize)
    }

    /// Attribute names and chunk ids covering `[mint, maxt)`.
    pub fn range_to_attrs(&self, col: &str, mint: Timestamp, maxt: Timestamp) -> (Vec<String>, Vec<usize>) {
        let ids = self.range_to_chunk_ids(mint, maxt);
        let attrs = ids.iter().map(|&id| self.chunk_id_to_attr(col, id)).collect();
        (attrs, ids)
    }

    /// Chunk windows covering `[mint, maxt)` as `(ring id, window start)`, oldest first.
    ///
    /// The ring holds one window per id, so only the newest `chunk_count()` windows of a
    /// longer range are listed; older ones share their slot with newer data.
    pub fn range_to_windows(&self, mint: Timestamp, maxt: Timestamp) -> Vec<(usize, Timestamp)> {
        if maxt <= mint {
            return Vec::new();
        }
        let span = self.chunk_span();
        let last = self.get_chunk_mint(maxt - 1);
        let oldest = last - (self.chunk_count() as i64 - 1) * span;
        let mut window = self.get_chunk_mint(mint).max(oldest);
        let mut out = Vec::new();
        while window <= last {
            out.push((self.time_to_chunk_id(window), window));
            window += span;
        }
        out
    }

    /// Name of the metadata array attribute for column `col`.
    pub fn meta_attr(&self, col: &str) -> String {
        format!("_meta_{}", col)
    }

    /// Absolute time span addressed by this partition.
    pub fn time_range(&self) -> (Timestamp, Timestamp) {
        (
            self.start_time,
            self.start_time + self.days_per_partition as i64 * MILLIS_PER_DAY,
        )
    }

    /// Earliest time inside the rolling retention window ending at `maxt`, clamped to `mint`.
    ///
    /// The window starts on the hour after `maxt - retention_days`.
    pub fn cyclic_min_time(&self, mint: Timestamp, maxt: Timestamp) -> Timestamp {
        let max_hour = maxt.div_euclid(MILLIS_PER_HOUR);
        let window_start = (max_hour - self.retention_days as i64 * 24 + 1) * MILLIS_PER_HOUR;
        mint.max(window_start)
    }
}

/// Maps time to partitions. Cyclic mode keeps one head partition for all time.
#[derive(Debug)]
pub struct PartitionManager {
    head: Arc<Partition>,
    cyclic: bool,
}

impl PartitionManager {
    pub fn new(cfg: &TsdbConfig) -> Self {
        PartitionManager {
            head: Arc::new(Partition::new(1, 0, cfg)),
            cyclic: true,
        }
    }

    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    pub fn head(&self) -> Arc<Partition> {
        Arc::clone(&self.head)
    }

    pub fn time_to_part(&self, _t: Timestamp) -> Arc<Partition> {
        self.head()
    }

    /// Partitions overlapping `[mint, maxt)`, oldest first.
    pub fn parts_for_range(&self, mint: Timestamp, maxt: Timestamp) -> Vec<Arc<Partition>> {
        if maxt <= mint {
            return Vec::new();
        }
        vec![self.head()]
    }

    /// Clamps a query range to what the cyclic window still holds.
    ///
    /// Ranges longer than the retention window only return the part inside the current window.
    /// The ring itself spans `days_per_partition` days, so a retention longer than that is
    /// bounded by the ring.
    pub fn clamp_query_range(&self, mint: Timestamp, maxt: Timestamp) -> (Timestamp, Timestamp) {
        if self.cyclic {
            let ring_start = maxt - self.head.days_per_partition().max(1) as i64 * MILLIS_PER_DAY;
            (self.head.cyclic_min_time(mint, maxt).max(ring_start), maxt)
        } else {
            (mint, maxt)
        }
    }
}
