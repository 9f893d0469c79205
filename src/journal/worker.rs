//! Group-commit worker for the write-ahead journal
//!
//! Adapted from the teacher's deferred-fsync worker: writes land in the OS
//! buffer immediately, a background thread batches up to `batch_size`
//! records or `batch_timeout_ms` milliseconds and issues one barrier per
//! batch. Callers that need durability block on a commit latch
//! (`FsyncState`) rather than fsyncing per-write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, SubstrateError};

use super::record::JournalRecord;

/// Tuning knobs for group commit, mirroring `SubstrateConfig::batch_size`
/// and `commit_timeout_ms` but scoped to this worker's own cadence.
#[derive(Debug, Clone)]
pub struct JournalWorkerConfig {
    pub batch_timeout_ms: u64,
    pub max_batch_size: usize,
    pub fsync_interval_ms: u64,
    pub max_unfsynced_bytes: usize,
}

impl Default for JournalWorkerConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: 5,
            max_batch_size: 64,
            fsync_interval_ms: 50,
            max_unfsynced_bytes: 1 << 20,
        }
    }
}

/// Commit-latch state shared between producers and the worker thread.
pub struct FsyncState {
    durable_seq: AtomicU64,
    written_seq: AtomicU64,
    condvar: Condvar,
    mutex: Mutex<()>,
    shutdown: AtomicU64,
}

impl FsyncState {
    fn new() -> Self {
        Self {
            durable_seq: AtomicU64::new(0),
            written_seq: AtomicU64::new(0),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            shutdown: AtomicU64::new(0),
        }
    }

    pub fn durable_seq(&self) -> u64 {
        self.durable_seq.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn written_seq(&self) -> u64 {
        self.written_seq.load(Ordering::Acquire)
    }

    pub fn wait_for_durable(&self, target_seq: u64, timeout: Duration) -> Result<()> {
        if self.durable_seq.load(Ordering::Acquire) >= target_seq {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .mutex
            .lock()
            .map_err(|_| SubstrateError::invalid_state("fsync state mutex poisoned"))?;

        loop {
            if self.durable_seq.load(Ordering::Acquire) >= target_seq {
                return Ok(());
            }
            if self.shutdown.load(Ordering::Acquire) != 0 {
                return Err(SubstrateError::invalid_state("journal worker shut down during wait"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SubstrateError::timeout(format!(
                    "timed out waiting for seq {} to become durable (current: {})",
                    target_seq,
                    self.durable_seq.load(Ordering::Acquire)
                )));
            }
            let result = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| SubstrateError::invalid_state("fsync state condvar wait failed"))?;
            guard = result.0;
        }
    }

    fn signal_durable(&self, seq: u64) {
        let mut current = self.durable_seq.load(Ordering::Acquire);
        while seq > current {
            match self.durable_seq.compare_exchange_weak(
                current,
                seq,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
        self.condvar.notify_all();
    }

    fn update_written(&self, seq: u64) {
        let mut current = self.written_seq.load(Ordering::Acquire);
        while seq > current {
            match self.written_seq.compare_exchange_weak(
                current,
                seq,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(1, Ordering::Release);
        self.condvar.notify_all();
    }
}

pub struct JournalWriteRequest {
    pub record: JournalRecord,
    pub responder: mpsc::SyncSender<Result<()>>,
}

#[allow(dead_code)]
pub enum JournalMessage {
    Write(JournalWriteRequest),
    Truncate(mpsc::SyncSender<Result<()>>),
    ForceSync(mpsc::SyncSender<Result<u64>>),
    Shutdown,
}

pub struct JournalWorkerHandle {
    pub sender: mpsc::SyncSender<JournalMessage>,
    pub fsync_state: Arc<FsyncState>,
}

impl JournalWorkerHandle {
    pub fn new(log_path: PathBuf, config: JournalWorkerConfig) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let (tx, rx) = mpsc::sync_channel::<JournalMessage>(10_000);
        let fsync_state = Arc::new(FsyncState::new());
        let fsync_state_clone = Arc::clone(&fsync_state);

        std::thread::spawn(move || {
            journal_worker_thread(file, rx, log_path, config, fsync_state_clone);
        });

        Ok(Self {
            sender: tx,
            fsync_state,
        })
    }

    pub fn wait_for_durable(&self, seq: u64) -> Result<()> {
        self.fsync_state.wait_for_durable(seq, Duration::from_secs(30))
    }

    pub fn force_sync(&self) -> Result<u64> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(JournalMessage::ForceSync(tx))
            .map_err(|e| SubstrateError::invalid_state(format!("journal worker channel closed: {}", e)))?;
        rx.recv()
            .map_err(|e| SubstrateError::invalid_state(format!("force sync response lost: {}", e)))?
    }

    pub fn truncate(&self) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(JournalMessage::Truncate(tx))
            .map_err(|e| SubstrateError::invalid_state(format!("journal worker channel closed: {}", e)))?;
        rx.recv()
            .map_err(|e| SubstrateError::invalid_state(format!("truncate response lost: {}", e)))?
    }

    pub fn durable_seq(&self) -> u64 {
        self.fsync_state.durable_seq()
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(JournalMessage::Shutdown);
    }
}

fn journal_worker_thread(
    mut file: File,
    rx: mpsc::Receiver<JournalMessage>,
    log_path: PathBuf,
    config: JournalWorkerConfig,
    fsync_state: Arc<FsyncState>,
) {
    let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
    let fsync_interval = Duration::from_millis(config.fsync_interval_ms);
    let deferred_fsync = config.fsync_interval_ms > 0;

    let mut last_fsync = Instant::now();
    let mut unfsynced_bytes: usize = 0;
    let mut max_written_seq: u64 = 0;

    loop {
        let mut batch = Vec::new();
        let mut pending_truncates: Vec<mpsc::SyncSender<Result<()>>> = Vec::new();
        let mut pending_force_syncs: Vec<mpsc::SyncSender<Result<u64>>> = Vec::new();
        let mut should_shutdown = false;

        let time_until_fsync = if deferred_fsync && unfsynced_bytes > 0 {
            fsync_interval.saturating_sub(last_fsync.elapsed())
        } else {
            fsync_interval
        };
        let recv_timeout = batch_timeout.min(time_until_fsync);

        match rx.recv_timeout(recv_timeout) {
            Ok(JournalMessage::Write(req)) => batch.push(req),
            Ok(JournalMessage::Truncate(responder)) => pending_truncates.push(responder),
            Ok(JournalMessage::ForceSync(responder)) => pending_force_syncs.push(responder),
            Ok(JournalMessage::Shutdown) => should_shutdown = true,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::info!("journal worker shutting down (channel closed)");
                break;
            }
        }

        let deadline = Instant::now() + batch_timeout;
        while batch.len() < config.max_batch_size && !should_shutdown {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(JournalMessage::Write(req)) => batch.push(req),
                Ok(JournalMessage::Truncate(responder)) => pending_truncates.push(responder),
                Ok(JournalMessage::ForceSync(responder)) => pending_force_syncs.push(responder),
                Ok(JournalMessage::Shutdown) => {
                    should_shutdown = true;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if !batch.is_empty() {
            let mut records = Vec::with_capacity(batch.len());
            let mut responders = Vec::with_capacity(batch.len());
            for req in batch.drain(..) {
                records.push(req.record);
                responders.push(req.responder);
            }

            let write_result = if deferred_fsync {
                write_records_no_sync(&mut file, &records)
            } else {
                write_records_with_sync(&mut file, &records).map(|()| records.len() * 64)
            };

            match write_result {
                Ok(bytes_written) => {
                    if let Some(max_seq) = records.iter().map(|r| r.seq).max() {
                        max_written_seq = max_written_seq.max(max_seq);
                        fsync_state.update_written(max_written_seq);
                    }
                    unfsynced_bytes += bytes_written;
                    for responder in responders {
                        let _ = responder.send(Ok(()));
                    }
                    if !deferred_fsync {
                        fsync_state.signal_durable(max_written_seq);
                        unfsynced_bytes = 0;
                        last_fsync = Instant::now();
                    }
                }
                Err(e) => {
                    let error_msg = Arc::new(e.to_string());
                    for responder in responders {
                        let _ = responder.send(Err(SubstrateError::io_string(error_msg.as_ref().clone())));
                    }
                }
            }
        }

        let force_sync_requested = !pending_force_syncs.is_empty();
        let truncate_requested = !pending_truncates.is_empty();
        let time_triggered = deferred_fsync && last_fsync.elapsed() >= fsync_interval;
        let size_triggered = unfsynced_bytes >= config.max_unfsynced_bytes;

        if unfsynced_bytes > 0
            && (time_triggered || size_triggered || force_sync_requested || truncate_requested || should_shutdown)
        {
            match file.sync_data() {
                Ok(()) => {
                    let synced_seq = max_written_seq;
                    fsync_state.signal_durable(synced_seq);
                    unfsynced_bytes = 0;
                    last_fsync = Instant::now();
                    for responder in pending_force_syncs {
                        let _ = responder.send(Ok(synced_seq));
                    }
                }
                Err(e) => {
                    log::error!("journal fsync failed: {}", e);
                    for responder in pending_force_syncs {
                        let _ = responder.send(Err(SubstrateError::from(
                            std::io::Error::new(e.kind(), e.to_string()),
                        )));
                    }
                }
            }
        } else {
            for responder in pending_force_syncs {
                let _ = responder.send(Ok(fsync_state.durable_seq()));
            }
        }

        for responder in pending_truncates {
            match perform_truncate(&mut file, &log_path) {
                Ok(()) => {
                    max_written_seq = 0;
                    unfsynced_bytes = 0;
                    fsync_state.signal_durable(0);
                    let _ = responder.send(Ok(()));
                }
                Err(e) => {
                    let _ = responder.send(Err(e));
                }
            }
        }

        if should_shutdown {
            if unfsynced_bytes > 0 {
                if file.sync_data().is_ok() {
                    fsync_state.signal_durable(max_written_seq);
                }
            }
            fsync_state.signal_shutdown();
            log::info!("journal worker shutting down (shutdown message)");
            break;
        }
    }
}

fn perform_truncate(file: &mut File, log_path: &PathBuf) -> Result<()> {
    file.flush()?;
    file.sync_all()?;
    let new_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;
    *file = new_file;
    Ok(())
}

pub(super) fn write_records_no_sync(file: &mut File, records: &[JournalRecord]) -> Result<usize> {
    let mut total_bytes = 0;
    for record in records {
        let encoded = bincode::serialize(record)
            .map_err(|e| SubstrateError::corrupt(format!("failed to encode journal record: {}", e)))?;
        let len = encoded.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&encoded)?;
        total_bytes += 4 + encoded.len();
    }
    file.flush()?;
    Ok(total_bytes)
}

pub(super) fn write_records_with_sync(file: &mut File, records: &[JournalRecord]) -> Result<()> {
    write_records_no_sync(file, records)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::record::RecordKind;
    use std::thread;

    fn record(seq: u64) -> JournalRecord {
        JournalRecord::new(RecordKind::BeginTxn, seq, seq, vec![], 0)
    }

    #[test]
    fn synchronous_writes_are_immediately_durable() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalWorkerConfig {
            fsync_interval_ms: 0,
            ..Default::default()
        };
        let handle = JournalWorkerHandle::new(dir.path().join("j.log"), config).unwrap();

        let (tx, rx) = mpsc::sync_channel(1);
        handle
            .sender
            .send(JournalMessage::Write(JournalWriteRequest {
                record: record(1),
                responder: tx,
            }))
            .unwrap();
        rx.recv().unwrap().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(handle.durable_seq() >= 1);
        handle.shutdown();
    }

    #[test]
    fn deferred_writes_become_durable_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalWorkerConfig {
            fsync_interval_ms: 20,
            ..Default::default()
        };
        let handle = JournalWorkerHandle::new(dir.path().join("j.log"), config).unwrap();

        let (tx, rx) = mpsc::sync_channel(1);
        handle
            .sender
            .send(JournalMessage::Write(JournalWriteRequest {
                record: record(1),
                responder: tx,
            }))
            .unwrap();
        rx.recv().unwrap().unwrap();
        handle.wait_for_durable(1).unwrap();
        assert!(handle.durable_seq() >= 1);
        handle.shutdown();
    }

    #[test]
    fn force_sync_flushes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalWorkerConfig {
            fsync_interval_ms: 10_000,
            ..Default::default()
        };
        let handle = JournalWorkerHandle::new(dir.path().join("j.log"), config).unwrap();

        let (tx, rx) = mpsc::sync_channel(1);
        handle
            .sender
            .send(JournalMessage::Write(JournalWriteRequest {
                record: record(1),
                responder: tx,
            }))
            .unwrap();
        rx.recv().unwrap().unwrap();
        let seq = handle.force_sync().unwrap();
        assert!(seq >= 1);
        handle.shutdown();
    }

    #[test]
    fn concurrent_writers_all_become_durable() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalWorkerConfig {
            fsync_interval_ms: 20,
            ..Default::default()
        };
        let handle = Arc::new(JournalWorkerHandle::new(dir.path().join("j.log"), config).unwrap());

        let mut handles = Vec::new();
        for t in 0..5 {
            let worker = Arc::clone(&handle);
            handles.push(thread::spawn(move || {
                for i in 0..10u64 {
                    let seq = t * 10 + i + 1;
                    let (tx, rx) = mpsc::sync_channel(1);
                    worker
                        .sender
                        .send(JournalMessage::Write(JournalWriteRequest {
                            record: record(seq),
                            responder: tx,
                        }))
                        .unwrap();
                    rx.recv().unwrap().unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        handle.force_sync().unwrap();
        assert!(handle.durable_seq() >= 50);
        handle.shutdown();
    }

    #[test]
    fn truncate_resets_durable_seq_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("j.log");
        let config = JournalWorkerConfig {
            fsync_interval_ms: 0,
            ..Default::default()
        };
        let handle = JournalWorkerHandle::new(log_path.clone(), config).unwrap();

        let (tx, rx) = mpsc::sync_channel(1);
        handle
            .sender
            .send(JournalMessage::Write(JournalWriteRequest {
                record: record(1),
                responder: tx,
            }))
            .unwrap();
        rx.recv().unwrap().unwrap();
        assert!(std::fs::metadata(&log_path).unwrap().len() > 0);

        handle.truncate().unwrap();
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);
        handle.shutdown();
    }
}
