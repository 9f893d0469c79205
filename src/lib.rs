//! Crash-consistent transactional storage substrate for a vector-native
//! filesystem.
//!
//! `Substrate` is the single entry point: `Substrate::mount` opens a device,
//! runs crash recovery, and spawns the background workers every other
//! component in this crate depends on to make forward progress, mirroring
//! the teacher crate's `Server::new` + `Server::run` split, generalized from
//! one TCP accept loop to a handful of dedicated maintenance threads.

pub mod allocation;
pub mod bitmap;
pub mod block;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod journal;
pub mod metadata;
pub mod queue;
pub mod recovery;
pub mod semantic;
pub mod txn;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use allocation::{AllocationGroup, AllocationStrategy, AllocationSubjournal};
use block::{BlockDevice, FileBlockDevice, GroupDescriptor, Superblock};
pub use config::SubstrateConfig;
use coordinator::{CrossLayerCoordinator, DeadlockSweeper};
use error::Result;
use journal::{JournalWorkerConfig, WriteAheadJournal};
use metadata::MetadataSubjournal;
use recovery::RecoveryEngine;
use semantic::SemanticEventLog;
use txn::AtomicTransactionManager;

pub use error::SubstrateError as Error;

/// Geometry for one allocation group, supplied by the caller at format time.
/// Mirrors the on-disk `GroupDescriptor`; kept separate so callers don't need
/// to construct the wire type directly.
#[derive(Debug, Clone, Copy)]
pub struct GroupLayout {
    pub start_block: u64,
    pub block_count: u64,
    pub inode_count: u64,
    pub strategy: AllocationStrategy,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The mounted substrate: every subsystem plus the background workers that
/// keep them moving. Dropping or calling `shutdown` stops the workers and
/// joins their threads.
pub struct Substrate {
    journal: Arc<WriteAheadJournal>,
    atm: Arc<AtomicTransactionManager>,
    metadata: Arc<MetadataSubjournal>,
    allocation: Arc<AllocationSubjournal>,
    semantic: Arc<SemanticEventLog>,
    coordinator: Arc<CrossLayerCoordinator>,
    recovery: Arc<RecoveryEngine>,
    config: SubstrateConfig,
    shutdown_flag: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    deadlock_sweeper: Mutex<Option<DeadlockSweeper>>,
}

impl Drop for Substrate {
    /// A caller that drops a `Substrate` without calling `shutdown` still
    /// gets its background workers stopped, same as `DeadlockSweeper`'s
    /// own `Drop` — just the flag, no blocking join from inside `drop`.
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }
}

impl Substrate {
    /// Format a fresh device: write a superblock and the requested
    /// allocation group layout to block 0. Idempotent only in the sense
    /// that it always overwrites block 0 — callers format once.
    pub fn format(
        device_path: impl AsRef<Path>,
        block_size: u32,
        total_blocks: u64,
        journal_total_blocks: u64,
        groups: &[GroupLayout],
    ) -> Result<()> {
        let device = FileBlockDevice::open(&device_path, total_blocks, block_size as usize)?;
        let descriptors: Vec<GroupDescriptor> = groups
            .iter()
            .enumerate()
            .map(|(i, g)| GroupDescriptor {
                group_id: i as u32,
                start_block: g.start_block,
                block_count: g.block_count,
                inode_count: g.inode_count,
                flags: 0,
            })
            .collect();
        let superblock = Superblock::format(block_size, total_blocks, 1, journal_total_blocks, descriptors);
        superblock.write_to(&device)
    }

    /// Open a previously formatted device, run crash recovery to
    /// completion, and spawn the background workers named in the
    /// concurrency model: journal group-commit (internal to C4), metadata
    /// batch flush, allocation consistency check, cross-layer consistency
    /// scan, cross-layer deadlock detection, and orphan sweep.
    pub fn mount(data_dir: impl AsRef<Path>, device_block_size: usize, config: SubstrateConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let device_path = data_dir.join("device.img");
        let device_total_blocks = std::fs::metadata(&device_path)
            .map(|m| (m.len() / device_block_size as u64).max(1))
            .unwrap_or(1);
        let device = FileBlockDevice::open(&device_path, device_total_blocks, device_block_size)?;
        let superblock = Superblock::read_from(&device).map_err(|e| {
            warn!("superblock read failed on mount: {}", e);
            e
        })?;
        info!(
            "mounting substrate: {} blocks x {} bytes, {} allocation group(s)",
            superblock.total_blocks,
            superblock.block_size,
            superblock.groups.len()
        );

        let journal = Arc::new(WriteAheadJournal::open(
            data_dir.join("journal.log"),
            JournalWorkerConfig {
                max_batch_size: config.batch_size,
                ..Default::default()
            },
        )?);
        let atm = Arc::new(AtomicTransactionManager::new(
            Arc::clone(&journal),
            config.max_concurrent_transactions,
            config.max_operations_per_transaction,
        ));

        let metadata = Arc::new(MetadataSubjournal::new(
            Arc::clone(&atm),
            config.metadata_cache_capacity,
            config.batch_size,
        ));

        let allocation = Arc::new(AllocationSubjournal::new(Arc::clone(&atm)));
        for descriptor in &superblock.groups {
            let strategy = if descriptor.flags & 1 != 0 {
                AllocationStrategy::VectorOptimized
            } else {
                AllocationStrategy::FirstFit
            };
            let group = AllocationGroup::new(
                descriptor.group_id,
                descriptor.start_block,
                descriptor.block_count,
                descriptor.inode_count,
                strategy,
            )?;
            allocation.add_group(group);
        }

        let semantic = Arc::new(SemanticEventLog::new(Arc::clone(&atm)));

        let coordinator = Arc::new(CrossLayerCoordinator::new(
            Arc::clone(&atm),
            Arc::clone(&metadata),
            Arc::clone(&allocation),
            Arc::clone(&semantic),
            config.max_concurrent_transactions,
        ));

        let recovery = Arc::new(RecoveryEngine::new(
            Arc::clone(&atm),
            Arc::clone(&metadata),
            Arc::clone(&allocation),
            Arc::clone(&semantic),
            config.parallel_recovery_threshold,
            config.effective_recovery_workers(),
            16,
        ));

        let report = recovery.run()?;
        info!(
            "recovery complete: {} records replayed, {} partials resolved, {} unresolved",
            report.replayed,
            report.resolved_partials.len(),
            report.unresolved_partials.len()
        );
        if !report.unresolved_partials.is_empty() {
            warn!("unresolved partial transactions after recovery: {:?}", report.unresolved_partials);
        }

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        workers.push(spawn_interval_worker(
            "metadata-flush",
            Arc::clone(&shutdown_flag),
            Duration::from_millis(config.batch_size.max(1) as u64 * 10),
            {
                let metadata = Arc::clone(&metadata);
                move || {
                    if let Err(e) = metadata.flush_pending() {
                        warn!("metadata flush failed: {}", e);
                    }
                }
            },
        ));

        workers.push(spawn_interval_worker(
            "allocation-consistency-check",
            Arc::clone(&shutdown_flag),
            Duration::from_millis(config.consistency_check_interval_ms),
            {
                let allocation = Arc::clone(&allocation);
                move || {
                    let repaired = allocation.check_all_groups();
                    if !repaired.is_empty() {
                        warn!("allocation consistency check repaired groups: {:?}", repaired);
                    }
                }
            },
        ));

        workers.push(spawn_interval_worker(
            "cross-layer-consistency-scan",
            Arc::clone(&shutdown_flag),
            Duration::from_millis(config.consistency_check_interval_ms),
            {
                let coordinator = Arc::clone(&coordinator);
                move || {
                    let violations = coordinator.run_consistency_scan();
                    if !violations.is_empty() {
                        warn!("cross-layer consistency scan found {} violation(s)", violations.len());
                    }
                }
            },
        ));

        workers.push(spawn_interval_worker(
            "orphan-sweep",
            Arc::clone(&shutdown_flag),
            Duration::from_millis(config.orphan_sweep_interval_ms),
            {
                let allocation = Arc::clone(&allocation);
                move || match allocation.sweep_orphans(now_millis()) {
                    Ok(n) if n > 0 => info!("orphan sweep reclaimed {} block(s)/inode(s)", n),
                    Ok(_) => {}
                    Err(e) => warn!("orphan sweep failed: {}", e),
                }
            },
        ));

        let deadlock_sweeper = DeadlockSweeper::spawn(
            Arc::clone(&coordinator),
            Duration::from_millis(config.deadlock_check_interval_ms),
            64,
        );

        Ok(Self {
            journal,
            atm,
            metadata,
            allocation,
            semantic,
            coordinator,
            recovery,
            config,
            shutdown_flag,
            workers: Mutex::new(workers),
            deadlock_sweeper: Mutex::new(Some(deadlock_sweeper)),
        })
    }

    pub fn journal(&self) -> &Arc<WriteAheadJournal> {
        &self.journal
    }

    pub fn transactions(&self) -> &Arc<AtomicTransactionManager> {
        &self.atm
    }

    pub fn metadata(&self) -> &Arc<MetadataSubjournal> {
        &self.metadata
    }

    pub fn allocation(&self) -> &Arc<AllocationSubjournal> {
        &self.allocation
    }

    pub fn semantic(&self) -> &Arc<SemanticEventLog> {
        &self.semantic
    }

    pub fn coordinator(&self) -> &Arc<CrossLayerCoordinator> {
        &self.coordinator
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    /// Force a full checkpoint right now, outside the automatic interval.
    pub fn checkpoint_now(&self) -> Result<()> {
        let durable_seq = self.journal.force_commit()?;
        self.recovery.create_checkpoint(recovery::CheckpointKind::Full, 0, durable_seq)?;
        Ok(())
    }

    /// Stop every background worker, flush what's pending, take a final
    /// checkpoint, and join all threads. Mirrors the teacher's
    /// `GraniteMessage::Shutdown` handshake, generalized across every
    /// background worker this crate spawns rather than just the one WAL
    /// writer thread.
    pub fn shutdown(self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        if let Some(sweeper) = self.deadlock_sweeper.lock().expect("deadlock sweeper lock poisoned").take() {
            sweeper.shutdown();
        }
        for handle in self.workers.lock().expect("worker list lock poisoned").drain(..) {
            let _ = handle.join();
        }
        if let Err(e) = self.metadata.flush_pending() {
            warn!("final metadata flush failed during shutdown: {}", e);
        }
        if let Err(e) = self.checkpoint_now() {
            warn!("final checkpoint failed during shutdown: {}", e);
        }
        self.journal.shutdown();
        info!("substrate shutdown complete");
    }
}

/// Spawn a named dedicated thread that calls `work` on every `interval`
/// tick until `shutdown_flag` is set. Mirrors `DeadlockSweeper::spawn`'s
/// loop shape, generalized to an arbitrary closure per worker purpose.
fn spawn_interval_worker(
    name: &'static str,
    shutdown_flag: Arc<AtomicBool>,
    interval: Duration,
    mut work: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while !shutdown_flag.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                work();
            }
        })
        .expect("failed to spawn background worker thread")
}
