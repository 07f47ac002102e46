//! Per-bucket statistic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// The events a [`StatisticCell`] keeps a counter for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    /// Admitted requests
    Pass,
    /// Rejected requests
    Block,
    /// Admitted requests that completed
    Success,
    /// Sum of response times of completed requests, in milliseconds
    Rt,
}

impl StatKind {
    /// Every kind, in counter order.
    pub const ALL: [StatKind; 4] = [
        StatKind::Pass,
        StatKind::Block,
        StatKind::Success,
        StatKind::Rt,
    ];

    fn index(self) -> usize {
        match self {
            StatKind::Pass => 0,
            StatKind::Block => 1,
            StatKind::Success => 2,
            StatKind::Rt => 3,
        }
    }

    /// Static label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatKind::Pass => "pass",
            StatKind::Block => "block",
            StatKind::Success => "success",
            StatKind::Rt => "rt",
        }
    }
}

/// A fixed set of independent atomic counters for one time bucket.
///
/// Counters only grow between resets. [`reset`](Self::reset) clears them one
/// by one, so a concurrent reader may see a partially reset cell.
#[derive(Debug, Default)]
pub struct StatisticCell {
    counters: [AtomicU64; 4],
}

impl StatisticCell {
    /// Create a cell with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the counter for `kind`.
    pub fn add(&self, kind: StatKind, delta: u64) {
        self.counters[kind.index()].fetch_add(delta, Ordering::SeqCst);
    }

    /// Read the counter for `kind`.
    pub fn get(&self, kind: StatKind) -> u64 {
        self.counters[kind.index()].load(Ordering::SeqCst)
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn pass(&self) -> u64 {
        self.get(StatKind::Pass)
    }

    pub fn block(&self) -> u64 {
        self.get(StatKind::Block)
    }

    pub fn success(&self) -> u64 {
        self.get(StatKind::Success)
    }

    pub fn rt(&self) -> u64 {
        self.get(StatKind::Rt)
    }

    pub fn add_pass(&self, n: u64) {
        self.add(StatKind::Pass, n);
    }

    pub fn add_block(&self, n: u64) {
        self.add(StatKind::Block, n);
    }

    pub fn add_success(&self, n: u64) {
        self.add(StatKind::Success, n);
    }

    pub fn add_rt(&self, n: u64) {
        self.add(StatKind::Rt, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_cell_is_zeroed() {
        let cell = StatisticCell::new();
        for kind in StatKind::ALL {
            assert_eq!(cell.get(kind), 0);
        }
    }

    #[test]
    fn test_counters_are_independent() {
        let cell = StatisticCell::new();
        cell.add_pass(3);
        cell.add_block(2);
        cell.add_success(1);
        cell.add_rt(40);

        assert_eq!(cell.pass(), 3);
        assert_eq!(cell.block(), 2);
        assert_eq!(cell.success(), 1);
        assert_eq!(cell.rt(), 40);
    }

    #[test]
    fn test_reset_zeroes_all_counters() {
        let cell = StatisticCell::new();
        for kind in StatKind::ALL {
            cell.add(kind, 7);
        }

        cell.reset();

        for kind in StatKind::ALL {
            assert_eq!(cell.get(kind), 0, "{} not reset", kind.as_str());
        }
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let cell = Arc::new(StatisticCell::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        cell.add_pass(1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cell.pass(), 8000);
    }
}
