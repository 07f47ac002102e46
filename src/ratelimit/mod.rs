//! Rolling-window statistics and the QPS admission gate built on them.

mod cell;
mod handle;
mod limiter;
mod metric;
mod rules;
mod window;

pub use cell::{StatKind, StatisticCell};
pub use handle::{GateHandle, GateRegistry};
pub use limiter::{EntryContext, EntryGuard, GateStats, RateLimiter};
pub use metric::{StatisticCellStrategy, StatisticDetail, StatisticMetric};
pub use rules::{Rule, RuleSet};
pub use window::{Bucket, BucketRef, BucketStrategy, SlidingWindow, WindowShape};
