//! Cooldown bookkeeping shared by alerting and cycle triggering.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::clock::Clock;

/// Condition name used by the orchestrator for post-cycle cooldowns.
pub const OPTIMIZATION_CONDITION: &str = "optimization";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub component_id: String,
    pub condition: String,
}

impl CooldownKey {
    pub fn new(component_id: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            condition: condition.into(),
        }
    }
}

impl std::fmt::Display for CooldownKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.component_id, self.condition)
    }
}

/// Expiry times keyed by `(component_id, condition)`.
pub struct CooldownRegistry {
    entries: DashMap<CooldownKey, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl CooldownRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Atomically checks the key and, when it is not cooling down, arms it for
    /// `window`. Returns `true` if the caller may proceed.
    pub fn try_arm(&self, key: CooldownKey, window: Duration) -> bool {
        let now = self.clock.now();
        let mut entry = self.entries.entry(key).or_insert(now);
        if *entry > now {
            return false;
        }
        *entry = now + window;
        true
    }

    /// Arms unconditionally, extending any running window.
    pub fn arm(&self, key: CooldownKey, window: Duration) {
        let until = self.clock.now() + window;
        self.entries
            .entry(key)
            .and_modify(|e| {
                if *e < until {
                    *e = until;
                }
            })
            .or_insert(until);
    }

    #[must_use]
    pub fn is_active(&self, key: &CooldownKey) -> bool {
        self.remaining(key).is_some()
    }

    /// Time left on the key's window, if it is still running.
    #[must_use]
    pub fn remaining(&self, key: &CooldownKey) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .map(|until| *until - now)
            .filter(|left| *left > Duration::zero())
    }

    pub fn clear(&self, key: &CooldownKey) {
        self.entries.remove(key);
    }

    /// Drops expired entries to keep the map bounded.
    pub fn cleanup(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, until| *until > now);
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_try_arm_suppresses_within_window() {
        let clock = Arc::new(ManualClock::default());
        let registry = CooldownRegistry::new(clock.clone());
        let key = CooldownKey::new("summarizer", "tier_critical");

        assert!(registry.try_arm(key.clone(), Duration::minutes(15)));
        assert!(!registry.try_arm(key.clone(), Duration::minutes(15)));

        clock.advance(Duration::minutes(14));
        assert!(!registry.try_arm(key.clone(), Duration::minutes(15)));

        clock.advance(Duration::minutes(1));
        assert!(registry.try_arm(key, Duration::minutes(15)));
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = CooldownRegistry::new(Arc::new(ManualClock::default()));
        assert!(registry.try_arm(CooldownKey::new("a", "trend"), Duration::minutes(15)));
        assert!(registry.try_arm(CooldownKey::new("a", "variance"), Duration::minutes(15)));
        assert!(registry.try_arm(CooldownKey::new("b", "trend"), Duration::minutes(15)));
    }

    #[test]
    fn test_remaining_and_cleanup() {
        let clock = Arc::new(ManualClock::default());
        let registry = CooldownRegistry::new(clock.clone());
        let key = CooldownKey::new("a", OPTIMIZATION_CONDITION);
        registry.arm(key.clone(), Duration::hours(2));
        assert_eq!(registry.remaining(&key), Some(Duration::hours(2)));

        clock.advance(Duration::hours(2));
        assert!(!registry.is_active(&key));
        registry.cleanup();
        assert_eq!(registry.tracked(), 0);
    }
}
