//! Shared, hot-swappable gates.
//!
//! A [`RateLimiter`] is immutable in its rule, so resetting or reconfiguring
//! a gate means building a new one. [`GateHandle`] publishes the current gate
//! through an atomic pointer swap so that every clone of the handle observes
//! the replacement. [`GateRegistry`] keys handles by rule name.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use super::limiter::{EntryContext, EntryGuard, GateStats, RateLimiter};
use super::rules::Rule;
use crate::error::{GateError, Result};

/// Thread-safe handle to the current gate for one rule.
///
/// Reads are lock-free via `ArcSwap::load()`; swaps never block readers.
/// Clones share the same underlying slot.
#[derive(Debug, Clone)]
pub struct GateHandle {
    inner: Arc<ArcSwap<RateLimiter>>,
}

impl GateHandle {
    /// Validate `rule` and build a handle around a fresh gate.
    pub fn load(rule: Rule) -> Result<Self> {
        let limiter = RateLimiter::new(rule)?;
        info!(
            rule = %limiter.rule().name,
            limit_qps = limiter.rule().limit_qps,
            "Gate loaded"
        );
        Ok(Self::from_limiter(limiter))
    }

    pub fn from_limiter(limiter: RateLimiter) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(limiter)),
        }
    }

    /// The gate currently published by this handle.
    ///
    /// The returned `Arc` stays valid across later swaps.
    pub fn current(&self) -> Arc<RateLimiter> {
        self.inner.load_full()
    }

    pub fn rule(&self) -> Rule {
        self.inner.load().rule().clone()
    }

    /// Replace the gate with an empty one for the same rule.
    pub fn reset(&self) {
        let fresh = self.inner.load().reset();
        info!(rule = %fresh.rule().name, "Gate reset");
        self.inner.store(Arc::new(fresh));
    }

    /// Replace the gate with one for `rule`. The rule must keep the same
    /// name; the current gate is untouched if validation fails.
    pub fn reload(&self, rule: Rule) -> Result<()> {
        let current_name = self.inner.load().rule().name.clone();
        if rule.name != current_name {
            return Err(GateError::Config(format!(
                "cannot reload gate '{}' with rule '{}'",
                current_name, rule.name
            )));
        }

        let limiter = RateLimiter::new(rule)?;
        info!(
            rule = %limiter.rule().name,
            limit_qps = limiter.rule().limit_qps,
            interval_ms = limiter.rule().interval_ms,
            bucket_count = limiter.rule().bucket_count,
            "Gate reloaded"
        );
        self.inner.store(Arc::new(limiter));
        Ok(())
    }

    /// Enter the current gate.
    pub fn entry(&self) -> EntryContext {
        self.inner.load().entry()
    }

    /// Record an exit on the current gate, which may have been swapped since
    /// the matching [`entry`](Self::entry).
    pub fn exit(&self, context: EntryContext) {
        self.inner.load().exit(context);
    }

    /// Enter the current gate and pin it until the guard drops, so the exit
    /// lands on the same gate as the entry.
    pub fn entry_guard(&self) -> EntryGuard<Arc<RateLimiter>> {
        EntryGuard::enter(self.current())
    }

    /// Run `work` if the current gate admits it.
    pub fn run<F, R>(&self, work: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        self.current().run(work)
    }

    pub fn stats(&self) -> GateStats {
        self.inner.load().stats()
    }
}

/// Gates keyed by rule name.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: DashMap<String, GateHandle>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding one gate per rule.
    pub fn from_rules<I>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = Rule>,
    {
        let registry = Self::new();
        for rule in rules {
            registry.load(rule)?;
        }
        Ok(registry)
    }

    /// Install a gate for `rule`, or reload the existing gate of that name.
    ///
    /// Reloading keeps handles already given out pointing at the new gate.
    pub fn load(&self, rule: Rule) -> Result<GateHandle> {
        match self.gates.entry(rule.name.clone()) {
            Entry::Occupied(entry) => {
                entry.get().reload(rule)?;
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let handle = GateHandle::load(rule)?;
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<GateHandle> {
        self.gates.get(name).map(|handle| handle.clone())
    }

    pub fn remove(&self, name: &str) -> Option<GateHandle> {
        let removed = self.gates.remove(name).map(|(_, handle)| handle);
        if removed.is_some() {
            info!(rule = %name, "Gate removed");
        }
        removed
    }

    /// Names of all registered gates, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gates.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, limit_qps: u64) -> Rule {
        Rule::new(name, 1000, 2, limit_qps)
    }

    #[test]
    fn test_handle_load_rejects_invalid_rule() {
        assert!(GateHandle::load(Rule::new("bad", 1000, 3, 1)).is_err());
    }

    #[test]
    fn test_reset_is_visible_to_all_clones() {
        let handle = GateHandle::load(rule("api", 2)).unwrap();
        let other = handle.clone();

        for _ in 0..5 {
            let ctx = handle.entry();
            handle.exit(ctx);
        }
        assert_eq!(other.stats().pass, 2);
        assert_eq!(other.stats().block, 3);

        other.reset();

        let stats = handle.stats();
        assert_eq!(stats.pass, 0);
        assert_eq!(stats.block, 0);
        assert_eq!(stats.success, 0);
    }

    #[test]
    fn test_reload_swaps_rule() {
        let handle = GateHandle::load(rule("api", 1)).unwrap();
        assert!(handle.run(|| ()).is_some());
        assert!(handle.run(|| ()).is_none());

        handle.reload(rule("api", 100)).unwrap();

        assert_eq!(handle.rule().limit_qps, 100);
        assert!(handle.run(|| ()).is_some());
    }

    #[test]
    fn test_reload_keeps_gate_on_error() {
        let handle = GateHandle::load(rule("api", 1)).unwrap();

        assert!(handle.reload(Rule::new("api", 1000, 3, 5)).is_err());
        assert!(handle.reload(rule("other", 5)).is_err());
        assert_eq!(handle.rule(), rule("api", 1));
    }

    #[test]
    fn test_guard_pins_gate_across_reset() {
        let handle = GateHandle::load(rule("api", 10)).unwrap();

        let guard = handle.entry_guard();
        assert!(guard.is_admitted());
        let pinned = handle.current();
        handle.reset();
        drop(guard);

        assert_eq!(pinned.total_success(), 1);
        assert_eq!(handle.stats().success, 0);
    }

    #[test]
    fn test_registry_load_and_get() {
        let registry =
            GateRegistry::from_rules(vec![rule("search", 10), rule("login", 1)]).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["login".to_string(), "search".to_string()]);
        assert_eq!(registry.get("login").unwrap().rule().limit_qps, 1);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_registry_reload_updates_existing_handles() {
        let registry = GateRegistry::new();
        let handle = registry.load(rule("search", 10)).unwrap();

        registry.load(rule("search", 50)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(handle.rule().limit_qps, 50);
    }

    #[test]
    fn test_registry_remove() {
        let registry = GateRegistry::from_rules(vec![rule("search", 10)]).unwrap();

        assert!(registry.remove("search").is_some());
        assert!(registry.remove("search").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_rejects_invalid_rule() {
        let result = GateRegistry::from_rules(vec![rule("ok", 1), Rule::new("bad", 0, 2, 1)]);
        assert!(result.is_err());
    }
}
