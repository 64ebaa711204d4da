//! Runtime configuration for the transaction manager and garbage collector.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Isolation level applied to transactions begun after it is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Snapshot isolation: write-write conflicts only.
    Snapshot,
    /// Serializable snapshot isolation: SI plus rw-antidependency tracking.
    #[default]
    Serializable,
}

/// Commit-time rule used to break dangerous SSI structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SsiPolicy {
    /// Abort a committing transaction that has both a live incoming and a
    /// live outgoing rw-antidependency.
    PivotFlags,
    /// Abort a committing transaction with a live incoming edge only when
    /// some outgoing edge already points at a committed transaction.
    #[default]
    CommitOrdered,
}

/// When the garbage collector runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Nothing is retired or reclaimed.
    Off,
    /// Passes run inline on the committing thread when the scheduler fires.
    Cooperative,
    /// A background thread runs passes on an interval or when woken.
    #[default]
    Periodic,
}

/// Default maximum versions examined per GC pass.
pub const GC_VERSIONS_BUDGET: usize = 4096;

/// Garbage collector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub mode: GcMode,
    /// Upper bound between two passes.
    pub interval: Duration,
    /// Retired-queue length that triggers an early pass.
    pub queue_threshold: usize,
    pub versions_budget: usize,
    /// Age at which an active transaction pinning the watermark is reported.
    pub stale_snapshot_warn: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mode: GcMode::default(),
            interval: Duration::from_millis(100),
            queue_threshold: 1024,
            versions_budget: GC_VERSIONS_BUDGET,
            stale_snapshot_warn: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration of a [`TransactionManager`](crate::TransactionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MvccConfig {
    pub isolation: IsolationLevel,
    pub ssi_policy: SsiPolicy,
    pub gc: GcConfig,
    /// Chain-head CAS attempts before a write reports contention.
    pub max_install_retries: u32,
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            ssi_policy: SsiPolicy::default(),
            gc: GcConfig::default(),
            max_install_retries: 16,
        }
    }
}

impl MvccConfig {
    /// Configuration with GC disabled. Useful for deterministic tests.
    #[must_use]
    pub fn without_gc() -> Self {
        Self {
            gc: GcConfig {
                mode: GcMode::Off,
                ..GcConfig::default()
            },
            ..Self::default()
        }
    }

    /// Configuration with cooperative GC on the committing thread.
    #[must_use]
    pub fn cooperative_gc(queue_threshold: usize) -> Self {
        Self {
            gc: GcConfig {
                mode: GcMode::Cooperative,
                queue_threshold,
                ..GcConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_serializable_and_periodic() {
        let cfg = MvccConfig::default();
        assert_eq!(cfg.isolation, IsolationLevel::Serializable);
        assert_eq!(cfg.ssi_policy, SsiPolicy::CommitOrdered);
        assert_eq!(cfg.gc.mode, GcMode::Periodic);
        assert_eq!(cfg.gc.versions_budget, GC_VERSIONS_BUDGET);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: MvccConfig =
            serde_json::from_str(r#"{"isolation":"snapshot","gc":{"mode":"off"}}"#).unwrap();
        assert_eq!(cfg.isolation, IsolationLevel::Snapshot);
        assert_eq!(cfg.gc.mode, GcMode::Off);
        assert_eq!(cfg.gc.queue_threshold, 1024);
        assert_eq!(cfg.max_install_retries, 16);
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = MvccConfig::cooperative_gc(8);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MvccConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
