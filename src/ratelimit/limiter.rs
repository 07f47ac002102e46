//! QPS admission gate.

use serde::Serialize;
use std::ops::Deref;
use tracing::{debug, trace};

use super::metric::StatisticMetric;
use super::rules::Rule;
use super::window::WindowShape;
use crate::clock::current_time_millis;
use crate::error::Result;

/// Outcome of [`RateLimiter::entry`], to be handed back to
/// [`RateLimiter::exit`] once the guarded work is over.
#[must_use = "pass the context to `exit` so latency and success are recorded"]
#[derive(Debug, PartialEq, Eq)]
pub struct EntryContext {
    start_ms: u64,
    admitted: bool,
}

impl EntryContext {
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    /// When the entry decision was made.
    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }
}

/// Derived figures of a gate, all computed at the same instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateStats {
    pub rule: String,
    pub total_request: u64,
    pub pass: u64,
    pub block: u64,
    pub success: u64,
    pub rt: u64,
    pub pass_qps: f64,
    pub block_qps: f64,
    pub total_qps: f64,
    pub success_qps: f64,
    pub max_success_qps: f64,
    pub avg_rt: f64,
}

/// Admits work while the rolling pass rate stays under the rule's ceiling.
///
/// The check and the increment are not atomic together. Concurrent callers
/// can all pass the check before any of them is counted, so the gate may
/// briefly admit a few more than `limit_qps`.
#[derive(Debug)]
pub struct RateLimiter {
    metric: StatisticMetric,
    rule: Rule,
    shape: WindowShape,
}

impl RateLimiter {
    /// Build a gate for `rule`. Fails if the rule's window is invalid.
    pub fn new(rule: Rule) -> Result<Self> {
        let shape = rule.validate()?;
        debug!(
            rule = %rule.name,
            limit_qps = rule.limit_qps,
            interval_ms = rule.interval_ms,
            bucket_count = rule.bucket_count,
            "Creating rate limiter"
        );
        Ok(Self::with_shape(rule, shape))
    }

    fn with_shape(rule: Rule, shape: WindowShape) -> Self {
        Self {
            metric: StatisticMetric::with_shape(shape),
            rule,
            shape,
        }
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn metric(&self) -> &StatisticMetric {
        &self.metric
    }

    /// A brand-new gate for the same rule. Counters of `self` are left behind.
    pub fn reset(&self) -> Self {
        Self::with_shape(self.rule.clone(), self.shape)
    }

    /// Decide whether to admit one request now.
    pub fn entry(&self) -> EntryContext {
        self.entry_at(current_time_millis())
    }

    pub fn entry_at(&self, now_ms: u64) -> EntryContext {
        let admitted = self.check_pass_at(now_ms);
        if admitted {
            self.metric.add_pass_at(1, now_ms);
            trace!(rule = %self.rule.name, "Request admitted");
        } else {
            self.metric.add_block_at(1, now_ms);
            debug!(
                rule = %self.rule.name,
                limit_qps = self.rule.limit_qps,
                "Rate limit exceeded"
            );
        }

        EntryContext {
            start_ms: now_ms,
            admitted,
        }
    }

    /// Record completion of a request. Blocked contexts record nothing.
    pub fn exit(&self, context: EntryContext) {
        self.exit_at(context, current_time_millis());
    }

    pub fn exit_at(&self, context: EntryContext, now_ms: u64) {
        if context.admitted {
            let rt = now_ms.saturating_sub(context.start_ms);
            self.add_rt_and_success_at(rt, 1, now_ms);
        }
    }

    /// Enter the gate and record the exit when the returned guard drops.
    pub fn entry_guard(&self) -> EntryGuard<&Self> {
        EntryGuard::enter(self)
    }

    /// Run `work` only if admitted. Returns `None` when blocked.
    ///
    /// The exit is recorded even if `work` panics.
    pub fn run<F, R>(&self, work: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        let guard = self.entry_guard();
        if !guard.is_admitted() {
            return None;
        }
        Some(work())
    }

    fn check_pass_at(&self, now_ms: u64) -> bool {
        (self.pass_qps_at(now_ms) as u64) < self.rule.limit_qps
    }

    pub fn total_request(&self) -> u64 {
        self.total_request_at(current_time_millis())
    }

    pub fn total_request_at(&self, now_ms: u64) -> u64 {
        self.metric.pass_at(now_ms) + self.metric.block_at(now_ms)
    }

    pub fn total_pass(&self) -> u64 {
        self.metric.pass()
    }

    pub fn total_success(&self) -> u64 {
        self.metric.success()
    }

    pub fn block_request(&self) -> u64 {
        self.metric.block()
    }

    pub fn pass_qps(&self) -> f64 {
        self.pass_qps_at(current_time_millis())
    }

    pub fn pass_qps_at(&self, now_ms: u64) -> f64 {
        self.metric.pass_at(now_ms) as f64 / self.metric.interval_secs()
    }

    pub fn block_qps(&self) -> f64 {
        self.block_qps_at(current_time_millis())
    }

    pub fn block_qps_at(&self, now_ms: u64) -> f64 {
        self.metric.block_at(now_ms) as f64 / self.metric.interval_secs()
    }

    pub fn total_qps(&self) -> f64 {
        self.total_qps_at(current_time_millis())
    }

    pub fn total_qps_at(&self, now_ms: u64) -> f64 {
        self.pass_qps_at(now_ms) + self.block_qps_at(now_ms)
    }

    pub fn success_qps(&self) -> f64 {
        self.success_qps_at(current_time_millis())
    }

    pub fn success_qps_at(&self, now_ms: u64) -> f64 {
        self.metric.success_at(now_ms) as f64 / self.metric.interval_secs()
    }

    pub fn max_success_qps(&self) -> f64 {
        self.max_success_qps_at(current_time_millis())
    }

    /// Peak bucket success count scaled to a whole window.
    pub fn max_success_qps_at(&self, now_ms: u64) -> f64 {
        self.metric.max_success_at(now_ms) as f64 * f64::from(self.metric.bucket_count())
    }

    pub fn avg_rt(&self) -> f64 {
        self.avg_rt_at(current_time_millis())
    }

    /// Mean response time of completed requests; zero when nothing completed.
    pub fn avg_rt_at(&self, now_ms: u64) -> f64 {
        let success = self.metric.success_at(now_ms);
        if success == 0 {
            return 0.0;
        }
        self.metric.rt_at(now_ms) as f64 / success as f64
    }

    pub fn add_pass(&self, count: u64) {
        self.metric.add_pass(count);
    }

    pub fn add_block(&self, count: u64) {
        self.metric.add_block(count);
    }

    pub fn add_rt_and_success(&self, rt: u64, success: u64) {
        self.add_rt_and_success_at(rt, success, current_time_millis());
    }

    fn add_rt_and_success_at(&self, rt: u64, success: u64, now_ms: u64) {
        self.metric.add_success_at(success, now_ms);
        self.metric.add_rt_at(rt, now_ms);
    }

    pub fn stats(&self) -> GateStats {
        self.stats_at(current_time_millis())
    }

    pub fn stats_at(&self, now_ms: u64) -> GateStats {
        let pass = self.metric.pass_at(now_ms);
        let block = self.metric.block_at(now_ms);
        let success = self.metric.success_at(now_ms);
        let rt = self.metric.rt_at(now_ms);
        let secs = self.metric.interval_secs();

        GateStats {
            rule: self.rule.name.clone(),
            total_request: pass + block,
            pass,
            block,
            success,
            rt,
            pass_qps: pass as f64 / secs,
            block_qps: block as f64 / secs,
            total_qps: (pass + block) as f64 / secs,
            success_qps: success as f64 / secs,
            max_success_qps: self.max_success_qps_at(now_ms),
            avg_rt: if success == 0 { 0.0 } else { rt as f64 / success as f64 },
        }
    }
}

/// Scoped entry into a gate. Dropping the guard records the exit.
///
/// `G` is anything that derefs to the gate, so a guard can borrow a gate or
/// keep an `Arc` to it alive across an await point.
#[derive(Debug)]
pub struct EntryGuard<G: Deref<Target = RateLimiter>> {
    gate: G,
    context: Option<EntryContext>,
}

impl<G: Deref<Target = RateLimiter>> EntryGuard<G> {
    pub fn enter(gate: G) -> Self {
        let context = gate.entry();
        Self {
            gate,
            context: Some(context),
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.context.as_ref().is_some_and(EntryContext::is_admitted)
    }

    pub fn start_ms(&self) -> Option<u64> {
        self.context.as_ref().map(EntryContext::start_ms)
    }
}

impl<G: Deref<Target = RateLimiter>> Drop for EntryGuard<G> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.gate.exit(context);
        }
    }
}
