//! Substrate-wide configuration
//!
//! A single caller-supplied struct carrying every tunable named in the
//! external interface contract: pool sizes, batching, timeouts, and
//! background-worker intervals. Mirrors the teacher crate's per-engine
//! config structs (`GraniteConfig`, `SandstoneConfig`), generalized to the
//! whole substrate and passed explicitly into `Substrate::mount` rather than
//! read from the environment.

use crate::txn::IsolationLevel;

/// Configuration for every subsystem the substrate owns.
#[derive(Debug, Clone)]
pub struct SubstrateConfig {
    /// Ceiling on the number of simultaneously active transactions (ATM + C9).
    pub max_concurrent_transactions: usize,
    /// Ceiling on the number of operations a single transaction may enqueue
    /// before `add_operation` starts returning `Busy`.
    pub max_operations_per_transaction: usize,
    /// Group-commit batch target for the write-ahead journal.
    pub batch_size: usize,
    /// Maximum time a commit waits on a durability latch before failing with `Timeout`.
    pub commit_timeout_ms: u64,
    /// Interval between automatic full checkpoints.
    pub checkpoint_interval_seconds: u64,
    /// Minimum operation count in a replay range before the recovery engine
    /// switches from single-threaded to parallel replay.
    pub parallel_recovery_threshold: usize,
    /// Upper bound on replay worker count, further clamped by online CPUs.
    pub max_recovery_workers: usize,
    /// Interval between allocation-group and cross-layer consistency scans.
    pub consistency_check_interval_ms: u64,
    /// Interval between cross-layer deadlock-detection sweeps.
    pub deadlock_check_interval_ms: u64,
    /// Interval between orphan-block/inode sweeps.
    pub orphan_sweep_interval_ms: u64,
    /// Maximum resident entry count for the metadata cache.
    pub metadata_cache_capacity: usize,
    /// Default isolation level for transactions that don't specify one.
    pub isolation_default: IsolationLevel,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transactions: 256,
            max_operations_per_transaction: 4_096,
            batch_size: 64,
            commit_timeout_ms: 10_000,
            checkpoint_interval_seconds: 300,
            parallel_recovery_threshold: 10_000,
            max_recovery_workers: 8,
            consistency_check_interval_ms: 30_000,
            deadlock_check_interval_ms: 5_000,
            orphan_sweep_interval_ms: 60_000,
            metadata_cache_capacity: 10_000,
            isolation_default: IsolationLevel::ReadCommitted,
        }
    }
}

impl SubstrateConfig {
    /// A config tuned for low-latency interactive workloads: smaller batches,
    /// tighter consistency-check cadence.
    pub fn low_latency() -> Self {
        Self {
            batch_size: 8,
            commit_timeout_ms: 2_000,
            consistency_check_interval_ms: 5_000,
            ..Default::default()
        }
    }

    /// A config tuned for bulk ingestion: larger batches, relaxed checkpoint
    /// cadence, more recovery workers.
    pub fn high_throughput() -> Self {
        Self {
            batch_size: 512,
            checkpoint_interval_seconds: 900,
            max_recovery_workers: 16,
            ..Default::default()
        }
    }

    /// Recovery worker count clamped by the number of online CPUs.
    pub fn effective_recovery_workers(&self) -> usize {
        let online = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.max_recovery_workers.min(online).max(1)
    }
}
