//! End-to-end scenarios against the public `Substrate` API.

use std::collections::HashMap;
use std::sync::Mutex;

use vexfs_core::allocation::AllocationStrategy;
use vexfs_core::coordinator::LayerMask;
use vexfs_core::semantic::{replay_flags, EventClass, ReplayContext};
use vexfs_core::txn::{IsolationLevel, RollbackEntry};
use vexfs_core::{GroupLayout, SubstrateConfig};

fn mount_fresh(block_count: u64, inode_count: u64) -> (tempfile::TempDir, vexfs_core::Substrate) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let layout = vec![GroupLayout {
        start_block: 8,
        block_count,
        inode_count,
        strategy: AllocationStrategy::FirstFit,
    }];
    vexfs_core::Substrate::format(dir.path().join("device.img"), 512, block_count + 64, 16, &layout).unwrap();
    let substrate = vexfs_core::Substrate::mount(dir.path(), 512, SubstrateConfig::low_latency()).unwrap();
    (dir, substrate)
}

/// S1 — single-block allocation and free.
#[test]
fn s1_single_block_allocation_and_free() {
    let (_dir, substrate) = mount_fresh(1024, 128);
    let allocation = substrate.allocation();

    let allocated = allocation.alloc_blocks(0, 1, 1, 1_000).unwrap();
    assert_eq!(allocated, vec![0]);
    assert_eq!(allocation.group(0).unwrap().free_blocks(), 1023);

    let report = allocation.free_blocks(0, 0, 1, 1_001).unwrap();
    assert_eq!(report.freed_count, 1);
    assert_eq!(allocation.group(0).unwrap().free_blocks(), 1024);
    assert_eq!(allocation.group(0).unwrap().block_bitmap.popcount(), 0);

    substrate.shutdown();
}

/// S2 — rollback on abort: an outer operation records an undo entry
/// describing an allocation it made, then aborts; the ATM hands the
/// rollback log back to the caller, who applies it as a compensating
/// free. The bitmap returns to its pre-transaction state.
#[test]
fn s2_rollback_on_abort() {
    let (_dir, substrate) = mount_fresh(1024, 128);
    let allocation = substrate.allocation();
    let atm = substrate.transactions();

    let txn = atm.begin(IsolationLevel::ReadCommitted).unwrap();
    let allocated = allocation.alloc_blocks(0, 8, 8, 2_000).unwrap();
    assert_eq!(allocated, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(allocation.group(0).unwrap().free_blocks(), 1016);

    atm.add_rollback_entry(
        txn,
        RollbackEntry {
            target_kind: "allocation_group_blocks".to_string(),
            target_id: 0,
            original_bytes: allocated.iter().flat_map(|b| b.to_le_bytes()).collect(),
        },
    )
    .unwrap();

    let undo_log = atm.abort(txn).unwrap();
    assert_eq!(undo_log.len(), 1);
    for entry in &undo_log {
        let group_id = entry.target_id as u32;
        let blocks: Vec<u64> = entry
            .original_bytes
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        for block in blocks {
            allocation.free_blocks(group_id, block, 1, 2_001).unwrap();
        }
    }
    assert_eq!(allocation.group(0).unwrap().free_blocks(), 1024);

    substrate.shutdown();
}

/// S3 (adapted) — two concurrent transactions that never commit are both
/// reported incomplete by journal-level recovery and their blocks never
/// observably allocated on a fresh mount. A real power-cut is simulated by
/// never calling `commit`/`abort` before the journal handle is dropped.
#[test]
fn s3_uncommitted_transactions_leave_no_trace_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let layout = vec![GroupLayout {
        start_block: 8,
        block_count: 1024,
        inode_count: 128,
        strategy: AllocationStrategy::FirstFit,
    }];
    vexfs_core::Substrate::format(dir.path().join("device.img"), 512, 1088, 16, &layout).unwrap();

    {
        let substrate = vexfs_core::Substrate::mount(dir.path(), 512, SubstrateConfig::low_latency()).unwrap();
        let atm = substrate.transactions();
        let _t1 = atm.begin(IsolationLevel::ReadCommitted).unwrap();
        let _t2 = atm.begin(IsolationLevel::ReadCommitted).unwrap();
        // Neither transaction is committed or aborted; drop the handle to
        // simulate a crash before the group-commit barrier closes them out.
        substrate.journal().shutdown();
    }

    let substrate = vexfs_core::Substrate::mount(dir.path(), 512, SubstrateConfig::low_latency()).unwrap();
    assert_eq!(substrate.allocation().group(0).unwrap().free_blocks(), 1024);
    substrate.shutdown();
}

/// S4 (adapted) — partial metadata update: a cross-layer transaction stages
/// a metadata change but is never committed (crash before the cross-layer
/// commit record reaches the journal), while a separate, independently
/// committed allocation happens in between. The staged metadata change
/// never applies; the already-durable allocation survives recovery intact,
/// since its own ATM commit is a freestanding transaction, not gated by the
/// wrapping cross-layer transaction's completion. This is the scenario the
/// fast recovery engine's replay path must get right: before it correctly
/// fed replayed allocation records back into the live bitmap, a restart
/// silently dropped this independently committed allocation too.
#[test]
fn s4_partial_metadata_update_without_cross_layer_commit() {
    let dir = tempfile::tempdir().unwrap();
    let layout = vec![GroupLayout {
        start_block: 8,
        block_count: 64,
        inode_count: 8,
        strategy: AllocationStrategy::FirstFit,
    }];
    vexfs_core::Substrate::format(dir.path().join("device.img"), 512, 128, 16, &layout).unwrap();

    {
        let substrate = vexfs_core::Substrate::mount(dir.path(), 512, SubstrateConfig::low_latency()).unwrap();
        let coordinator = substrate.coordinator();

        let txn = coordinator.begin(LayerMask::METADATA, IsolationLevel::ReadCommitted, 5_000).unwrap();
        coordinator.add_operation(txn, LayerMask::METADATA, b"inode:42:size:200".to_vec()).unwrap();

        substrate.allocation().alloc_blocks(0, 4, 1, 8_000).unwrap();
        assert_eq!(substrate.allocation().group(0).unwrap().free_blocks(), 60);

        // Crash before the cross-layer commit record: never call
        // `coordinator.commit`, just force the already-durable allocation
        // record out and drop the journal handle.
        substrate.journal().force_commit().unwrap();
        substrate.journal().shutdown();
    }

    let substrate = vexfs_core::Substrate::mount(dir.path(), 512, SubstrateConfig::low_latency()).unwrap();
    let report = substrate.journal().recover().unwrap();
    assert!(
        !report.applied_records.iter().any(|r| r.kind == vexfs_core::journal::RecordKind::MetadataUpdate),
        "the staged-but-uncommitted metadata update must never appear as applied"
    );
    assert_eq!(substrate.allocation().group(0).unwrap().free_blocks(), 60);
    substrate.shutdown();
}

/// S5 — orphan reclamation: a block recorded as orphaned (allocated but
/// never referenced) is reclaimed by the sweep and the free count rises.
#[test]
fn s5_orphan_reclamation() {
    let (_dir, substrate) = mount_fresh(1024, 128);
    let allocation = substrate.allocation();

    let allocated = allocation.alloc_blocks(0, 1, 1, 3_000).unwrap();
    allocation.record_orphan(0, allocated[0], 3_001);
    assert_eq!(allocation.group(0).unwrap().free_blocks(), 1023);

    let reclaimed = allocation.sweep_orphans(3_100).unwrap();
    assert_eq!(reclaimed, 1);
    assert_eq!(allocation.group(0).unwrap().free_blocks(), 1024);

    substrate.shutdown();
}

/// S6 — semantic replay determinism: replaying the same event range twice
/// into independently tracked states yields identical results.
#[test]
fn s6_semantic_replay_determinism() {
    let (_dir, substrate) = mount_fresh(64, 16);
    let semantic = substrate.semantic();

    let e1 = semantic
        .append(EventClass::Filesystem, 1, 0xFFFF_FFFF, vec![], b"create:/a".to_vec())
        .unwrap();
    let e2 = semantic
        .append(EventClass::Filesystem, 2, 0xFFFF_FFFF, vec![], b"create:/b".to_vec())
        .unwrap();
    let _e3 = semantic
        .append(EventClass::Filesystem, 3, 0xFFFF_FFFF, vec![e1], b"write:/a:x".to_vec())
        .unwrap();

    let replay_once = || {
        let files: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
        let ctx = ReplayContext {
            start_id: 1,
            end_id: 4,
            filter_mask: 0,
            flags: replay_flags::NONE,
        };
        let report = semantic.replay_sequential(ctx, |event| {
            let text = String::from_utf8_lossy(&event.payload).to_string();
            let mut files = files.lock().unwrap();
            if let Some(rest) = text.strip_prefix("create:") {
                files.entry(rest.to_string()).or_default();
            } else if let Some(rest) = text.strip_prefix("write:") {
                let mut parts = rest.splitn(2, ':');
                let path = parts.next().unwrap().to_string();
                let data = parts.next().unwrap_or("").to_string();
                files.entry(path).or_default().push_str(&data);
            }
            Ok(())
        });
        (report.dispatched, files.into_inner().unwrap())
    };

    let (dispatched_a, state_a) = replay_once();
    let (dispatched_b, state_b) = replay_once();

    assert_eq!(dispatched_a, vec![e1, e2, e1 + 2]);
    assert_eq!(dispatched_a, dispatched_b);
    assert_eq!(state_a, state_b);
    assert_eq!(state_a.get("/a"), Some(&"x".to_string()));
    assert_eq!(state_a.get("/b"), Some(&String::new()));

    substrate.shutdown();
}

/// Invariant 2: free_blocks == block_count - popcount(block_bitmap) holds
/// across a sequence of interleaved allocations and frees.
#[test]
fn invariant_free_count_matches_bitmap_popcount() {
    let (_dir, substrate) = mount_fresh(256, 32);
    let allocation = substrate.allocation();

    let mut held = Vec::new();
    for i in 0..10 {
        held.extend(allocation.alloc_blocks(0, 3, 1, 4_000 + i).unwrap());
    }
    let group = allocation.group(0).unwrap();
    assert_eq!(group.free_blocks(), 256 - group.block_bitmap.popcount() as u64);

    for chunk in held.chunks(3) {
        allocation.free_blocks(0, chunk[0], chunk.len() as u64, 4_100).unwrap();
    }
    let group = allocation.group(0).unwrap();
    assert_eq!(group.free_blocks(), 256);
    assert_eq!(group.block_bitmap.popcount(), 0);

    substrate.shutdown();
}

/// Invariant 9 (cross-layer atomicity): a cross-layer transaction that
/// stages operations on two subsystems lands both subsystems' journal
/// records under the same committed transaction — never just one.
#[test]
fn invariant_cross_layer_commit_is_all_or_nothing() {
    let (_dir, substrate) = mount_fresh(128, 16);
    let coordinator = substrate.coordinator();

    let txn = coordinator
        .begin(LayerMask::METADATA | LayerMask::ALLOCATION, IsolationLevel::ReadCommitted, 5_000)
        .unwrap();
    coordinator.add_operation(txn, LayerMask::METADATA, b"metadata-change".to_vec()).unwrap();
    coordinator.add_operation(txn, LayerMask::ALLOCATION, b"allocation-change".to_vec()).unwrap();
    coordinator.commit(txn).unwrap();

    substrate.journal().force_commit().unwrap();
    let report = substrate.journal().recover().unwrap();
    assert!(report.committed_txns.contains(&txn.id));
    let records_for_txn: Vec<_> = report
        .applied_records
        .iter()
        .filter(|r| r.txn_id == txn.id)
        .collect();
    assert_eq!(records_for_txn.len(), 2);
    assert_eq!(records_for_txn[0].kind, vexfs_core::journal::RecordKind::MetadataUpdate);
    assert_eq!(records_for_txn[1].kind, vexfs_core::journal::RecordKind::AllocationUpdate);

    substrate.shutdown();
}
