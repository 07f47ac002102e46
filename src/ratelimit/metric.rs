//! Rolling pass/block/success/rt statistics.

use serde::{Deserialize, Serialize};

use super::cell::{StatKind, StatisticCell};
use super::window::{Bucket, BucketStrategy, SlidingWindow, WindowShape};
use crate::clock::current_time_millis;
use crate::error::Result;

/// Fills a [`SlidingWindow`] with [`StatisticCell`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticCellStrategy;

impl BucketStrategy for StatisticCellStrategy {
    type Value = StatisticCell;

    fn new_empty_value(&self, _time_ms: u64) -> StatisticCell {
        StatisticCell::new()
    }

    fn reset_to(&self, bucket: &Bucket<StatisticCell>, start_ms: u64) {
        bucket.value().reset();
        bucket.reset_start(start_ms);
    }
}

/// Counters of a single live bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticDetail {
    /// Start of the bucket in milliseconds since the epoch
    pub timestamp_ms: u64,
    pub pass: u64,
    pub block: u64,
    pub success: u64,
    pub rt: u64,
}

/// Rolling statistics over a sliding window.
///
/// Every read aggregates the live buckets afresh, so results trail real time
/// by at most one bucket width. Every write lands in the bucket for "now".
#[derive(Debug)]
pub struct StatisticMetric {
    data: SlidingWindow<StatisticCellStrategy>,
}

impl StatisticMetric {
    /// Create a metric with `bucket_count` buckets spanning `interval_ms`.
    pub fn new(bucket_count: u32, interval_ms: u64) -> Result<Self> {
        Ok(Self::with_shape(WindowShape::new(bucket_count, interval_ms)?))
    }

    /// Create a metric from an already validated shape.
    pub fn with_shape(shape: WindowShape) -> Self {
        Self {
            data: SlidingWindow::new(shape, StatisticCellStrategy),
        }
    }

    pub fn window(&self) -> &SlidingWindow<StatisticCellStrategy> {
        &self.data
    }

    pub fn pass(&self) -> u64 {
        self.pass_at(current_time_millis())
    }

    pub fn pass_at(&self, now_ms: u64) -> u64 {
        self.event_count_at(StatKind::Pass, now_ms)
    }

    pub fn block(&self) -> u64 {
        self.block_at(current_time_millis())
    }

    pub fn block_at(&self, now_ms: u64) -> u64 {
        self.event_count_at(StatKind::Block, now_ms)
    }

    pub fn success(&self) -> u64 {
        self.success_at(current_time_millis())
    }

    pub fn success_at(&self, now_ms: u64) -> u64 {
        self.event_count_at(StatKind::Success, now_ms)
    }

    pub fn rt(&self) -> u64 {
        self.rt_at(current_time_millis())
    }

    pub fn rt_at(&self, now_ms: u64) -> u64 {
        self.event_count_at(StatKind::Rt, now_ms)
    }

    pub fn max_success(&self) -> u64 {
        self.max_success_at(current_time_millis())
    }

    /// Highest per-bucket success count among the live buckets.
    pub fn max_success_at(&self, now_ms: u64) -> u64 {
        let _ = self.data.current_bucket_at(now_ms);
        self.data
            .values_at(now_ms)
            .into_iter()
            .map(StatisticCell::success)
            .max()
            .unwrap_or(0)
    }

    pub fn details(&self) -> Vec<StatisticDetail> {
        self.details_at(current_time_millis())
    }

    /// Per-bucket counters of the live buckets, in slot order.
    pub fn details_at(&self, now_ms: u64) -> Vec<StatisticDetail> {
        let _ = self.data.current_bucket_at(now_ms);
        self.data
            .list_at(now_ms)
            .into_iter()
            .map(|bucket| {
                let cell = bucket.value();
                StatisticDetail {
                    timestamp_ms: bucket.start_ms(),
                    pass: cell.pass(),
                    block: cell.block(),
                    success: cell.success(),
                    rt: cell.rt(),
                }
            })
            .collect()
    }

    pub fn add_pass(&self, n: u64) {
        self.add_pass_at(n, current_time_millis());
    }

    pub fn add_pass_at(&self, n: u64, now_ms: u64) {
        self.add_count_at(StatKind::Pass, n, now_ms);
    }

    pub fn add_block(&self, n: u64) {
        self.add_block_at(n, current_time_millis());
    }

    pub fn add_block_at(&self, n: u64, now_ms: u64) {
        self.add_count_at(StatKind::Block, n, now_ms);
    }

    pub fn add_success(&self, n: u64) {
        self.add_success_at(n, current_time_millis());
    }

    pub fn add_success_at(&self, n: u64, now_ms: u64) {
        self.add_count_at(StatKind::Success, n, now_ms);
    }

    pub fn add_rt(&self, n: u64) {
        self.add_rt_at(n, current_time_millis());
    }

    pub fn add_rt_at(&self, n: u64, now_ms: u64) {
        self.add_count_at(StatKind::Rt, n, now_ms);
    }

    pub fn interval_ms(&self) -> u64 {
        self.data.interval_ms()
    }

    pub fn interval_secs(&self) -> f64 {
        self.data.interval_secs()
    }

    /// Width of a single bucket.
    pub fn bucket_width_ms(&self) -> u64 {
        self.data.bucket_width_ms()
    }

    pub fn bucket_count(&self) -> u32 {
        self.data.bucket_count()
    }

    fn event_count_at(&self, kind: StatKind, now_ms: u64) -> u64 {
        let _ = self.data.current_bucket_at(now_ms);
        self.data
            .values_at(now_ms)
            .into_iter()
            .map(|cell| cell.get(kind))
            .sum()
    }

    fn add_count_at(&self, kind: StatKind, n: u64, now_ms: u64) {
        self.data.current_bucket_at(now_ms).value().add(kind, n);
    }
}
