//! qpsgate - in-process QPS admission control
//!
//! This crate tracks rolling pass/block/success/response-time counts over a
//! bucketed time window and uses them to admit or reject units of work so
//! that the admitted rate approximates a fixed queries-per-second ceiling.
//! Writers coordinate through per-counter atomics and two try-locks per
//! window; no external coordinator is involved.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{GateError, Result};
pub use ratelimit::{EntryContext, GateHandle, GateRegistry, RateLimiter, Rule};
