//! Rolling time window made of fixed-width buckets.
//!
//! The window partitions time into `bucket_count` slots of equal width and
//! hands out the live bucket for a timestamp, creating it on first use and
//! rotating it in place once time has moved past it. Writers coordinate
//! through two narrowly scoped try-locks: one for creating a slot and one for
//! rotating an existing slot. Everything else is lock-free.

use std::fmt;
use std::hint;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::clock::{current_time_millis, millis_to_secs};
use crate::error::{GateError, Result};

/// Spin rounds (doubling each time) before a contended writer starts yielding.
const SPIN_LIMIT: u32 = 6;
/// Rounds after which a contended writer stops retrying and waits on the lock.
const YIELD_LIMIT: u32 = 10;

/// The validated geometry of a window.
///
/// Holding a `WindowShape` means the interval splits evenly into a non-zero
/// number of non-empty buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShape {
    bucket_count: u32,
    interval_ms: u64,
    bucket_width_ms: u64,
}

impl WindowShape {
    /// Validate a bucket count and total interval.
    pub fn new(bucket_count: u32, interval_ms: u64) -> Result<Self> {
        if bucket_count == 0 {
            return Err(GateError::InvalidRule(format!(
                "bucket count is invalid: {}",
                bucket_count
            )));
        }
        if interval_ms == 0 {
            return Err(GateError::InvalidRule(
                "total time interval of the sliding window should be positive".to_string(),
            ));
        }
        if interval_ms % u64::from(bucket_count) != 0 {
            return Err(GateError::InvalidRule(format!(
                "interval of {}ms cannot be evenly divided into {} buckets",
                interval_ms, bucket_count
            )));
        }

        Ok(Self {
            bucket_count,
            interval_ms,
            bucket_width_ms: interval_ms / u64::from(bucket_count),
        })
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn bucket_width_ms(&self) -> u64 {
        self.bucket_width_ms
    }
}

/// One fixed-width time slot and the aggregate it carries.
#[derive(Debug)]
pub struct Bucket<T> {
    width_ms: u64,
    start_ms: AtomicU64,
    value: T,
}

impl<T> Bucket<T> {
    /// Create a bucket starting at `start_ms`.
    pub fn new(width_ms: u64, start_ms: u64, value: T) -> Self {
        Self {
            width_ms,
            start_ms: AtomicU64::new(start_ms),
            value,
        }
    }

    pub fn width_ms(&self) -> u64 {
        self.width_ms
    }

    /// Aligned start of the span this bucket currently covers.
    pub fn start_ms(&self) -> u64 {
        self.start_ms.load(Ordering::Acquire)
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Move the bucket to a new start.
    ///
    /// Strategies call this after clearing the payload so that a reader who
    /// observes the new start never sees the previous span's counts.
    pub fn reset_start(&self, start_ms: u64) {
        self.start_ms.store(start_ms, Ordering::Release);
    }

    /// Whether `time_ms` falls inside `[start, start + width]`.
    pub fn contains(&self, time_ms: u64) -> bool {
        let start = self.start_ms();
        start <= time_ms && time_ms <= start + self.width_ms
    }
}

/// How a window creates and recycles the payload of its buckets.
///
/// The payload type is fixed per window through [`BucketStrategy::Value`].
pub trait BucketStrategy: Send + Sync {
    /// The aggregate stored in every bucket.
    type Value: Send + Sync;

    /// A fresh payload for a bucket created at `time_ms`.
    fn new_empty_value(&self, time_ms: u64) -> Self::Value;

    /// Recycle `bucket` in place so it covers the span starting at `start_ms`.
    fn reset_to(&self, bucket: &Bucket<Self::Value>, start_ms: u64);
}

/// A bucket handed out by [`SlidingWindow::current_bucket_at`].
#[derive(Debug)]
pub enum BucketRef<'a, T> {
    /// The bucket stored in the window.
    Installed(&'a Bucket<T>),
    /// A throwaway bucket for a timestamp older than its slot's contents.
    /// It is never stored, so writes to it are dropped with it.
    Detached(Bucket<T>),
}

impl<T> BucketRef<'_, T> {
    pub fn is_detached(&self) -> bool {
        matches!(self, BucketRef::Detached(_))
    }
}

impl<T> Deref for BucketRef<'_, T> {
    type Target = Bucket<T>;

    fn deref(&self) -> &Bucket<T> {
        match self {
            BucketRef::Installed(bucket) => bucket,
            BucketRef::Detached(bucket) => bucket,
        }
    }
}

/// Bounded retry schedule for contended writers.
struct Backoff {
    step: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    fn is_completed(&self) -> bool {
        self.step > YIELD_LIMIT
    }
}

/// A fixed ring of buckets covering a trailing time interval.
pub struct SlidingWindow<S: BucketStrategy> {
    shape: WindowShape,
    slots: Box<[OnceLock<Bucket<S::Value>>]>,
    gen_lock: Mutex<()>,
    update_lock: Mutex<()>,
    strategy: S,
}

impl<S: BucketStrategy> SlidingWindow<S> {
    /// Create an empty window. Buckets are materialised on first use.
    pub fn new(shape: WindowShape, strategy: S) -> Self {
        let slots = (0..shape.bucket_count)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shape,
            slots,
            gen_lock: Mutex::new(()),
            update_lock: Mutex::new(()),
            strategy,
        }
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    pub fn bucket_width_ms(&self) -> u64 {
        self.shape.bucket_width_ms
    }

    pub fn bucket_count(&self) -> u32 {
        self.shape.bucket_count
    }

    pub fn interval_ms(&self) -> u64 {
        self.shape.interval_ms
    }

    pub fn interval_secs(&self) -> f64 {
        millis_to_secs(self.shape.interval_ms)
    }

    /// The bucket covering the current wall-clock time.
    pub fn current_bucket(&self) -> BucketRef<'_, S::Value> {
        self.current_bucket_at(current_time_millis())
    }

    /// The bucket covering `time_ms`, creating or rotating its slot if needed.
    ///
    /// If the slot already holds a newer span than `time_ms` (clock skew or a
    /// stale caller), a detached bucket is returned and the slot is left alone.
    pub fn current_bucket_at(&self, time_ms: u64) -> BucketRef<'_, S::Value> {
        let index = self.bucket_index(time_ms);
        let bucket_start = self.bucket_start(time_ms);
        let slot = &self.slots[index];
        let mut backoff = Backoff::new();

        loop {
            let old = match slot.get() {
                Some(bucket) => bucket,
                None => {
                    let Some(_guard) = self.acquire(&self.gen_lock, &mut backoff) else {
                        continue;
                    };
                    slot.get_or_init(|| {
                        trace!(index, start_ms = bucket_start, "Creating bucket");
                        Bucket::new(
                            self.shape.bucket_width_ms,
                            bucket_start,
                            self.strategy.new_empty_value(time_ms),
                        )
                    });
                    continue;
                }
            };

            let old_start = old.start_ms();
            if bucket_start == old_start {
                return BucketRef::Installed(old);
            }

            if bucket_start > old_start {
                let Some(_guard) = self.acquire(&self.update_lock, &mut backoff) else {
                    continue;
                };
                // Another writer may have rotated the slot before we got the lock.
                if bucket_start > old.start_ms() {
                    trace!(
                        index,
                        from_ms = old_start,
                        to_ms = bucket_start,
                        "Rotating bucket"
                    );
                    self.strategy.reset_to(old, bucket_start);
                }
                continue;
            }

            debug!(
                index,
                time_ms,
                slot_start_ms = old_start,
                "Timestamp is behind its slot, using a detached bucket"
            );
            return BucketRef::Detached(Bucket::new(
                self.shape.bucket_width_ms,
                bucket_start,
                self.strategy.new_empty_value(time_ms),
            ));
        }
    }

    /// The bucket for the span right before the current one.
    pub fn previous_bucket(&self) -> Option<&Bucket<S::Value>> {
        self.previous_bucket_at(current_time_millis())
    }

    /// The bucket for the span right before `time_ms`'s span, if it is still
    /// populated, live and adjacent.
    pub fn previous_bucket_at(&self, time_ms: u64) -> Option<&Bucket<S::Value>> {
        let previous_time = time_ms.checked_sub(self.shape.bucket_width_ms)?;
        let bucket = self.slots[self.bucket_index(previous_time)].get()?;

        if self.is_deprecated_at(bucket, time_ms) {
            return None;
        }
        if bucket.start_ms() + self.shape.bucket_width_ms < previous_time {
            return None;
        }
        Some(bucket)
    }

    /// Payload of the bucket holding `time_ms`, without creating or rotating.
    pub fn value_at(&self, time_ms: u64) -> Option<&S::Value> {
        self.slots[self.bucket_index(time_ms)]
            .get()
            .filter(|bucket| bucket.contains(time_ms))
            .map(Bucket::value)
    }

    pub fn is_deprecated(&self, bucket: &Bucket<S::Value>) -> bool {
        self.is_deprecated_at(bucket, current_time_millis())
    }

    /// A bucket is expired once its start is more than one full interval
    /// away from `time_ms`, in either direction.
    pub fn is_deprecated_at(&self, bucket: &Bucket<S::Value>, time_ms: u64) -> bool {
        time_ms.abs_diff(bucket.start_ms()) > self.shape.interval_ms
    }

    pub fn list(&self) -> Vec<&Bucket<S::Value>> {
        self.list_at(current_time_millis())
    }

    /// Populated, non-expired buckets in slot order.
    pub fn list_at(&self, time_ms: u64) -> Vec<&Bucket<S::Value>> {
        self.slots
            .iter()
            .filter_map(OnceLock::get)
            .filter(|bucket| !self.is_deprecated_at(bucket, time_ms))
            .collect()
    }

    /// Every populated bucket, expired or not.
    pub fn list_all(&self) -> Vec<&Bucket<S::Value>> {
        self.slots.iter().filter_map(OnceLock::get).collect()
    }

    pub fn values(&self) -> Vec<&S::Value> {
        self.values_at(current_time_millis())
    }

    /// Payloads of the populated, non-expired buckets in slot order.
    pub fn values_at(&self, time_ms: u64) -> Vec<&S::Value> {
        self.list_at(time_ms).into_iter().map(Bucket::value).collect()
    }

    fn bucket_index(&self, time_ms: u64) -> usize {
        ((time_ms / self.shape.bucket_width_ms) % u64::from(self.shape.bucket_count)) as usize
    }

    fn bucket_start(&self, time_ms: u64) -> u64 {
        time_ms - time_ms % self.shape.bucket_width_ms
    }

    /// Try a writer lock. A writer that has exhausted its backoff waits for the
    /// lock instead; the guarded sections are a single allocation or reset.
    fn acquire<'a>(
        &self,
        lock: &'a Mutex<()>,
        backoff: &mut Backoff,
    ) -> Option<MutexGuard<'a, ()>> {
        if let Some(guard) = lock.try_lock() {
            return Some(guard);
        }
        if backoff.is_completed() {
            return Some(lock.lock());
        }
        backoff.snooze();
        None
    }
}

impl<S: BucketStrategy> fmt::Debug for SlidingWindow<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("shape", &self.shape)
            .field("populated", &self.list_all().len())
            .finish_non_exhaustive()
    }
}
