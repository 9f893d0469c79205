//! Write-Ahead Journal (C4)
//!
//! An ordered, checksummed log of transaction records over raw byte blocks,
//! with group-commit batching. Every other component that needs durability
//! (the transaction manager, the three subjournals) writes through this
//! journal rather than touching the block device directly.

pub mod record;
pub mod recovery;
mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use crate::error::{Result, SubstrateError};

pub use record::{flags, JournalRecord, RecordKind, Seq, TxnId};
pub use recovery::JournalRecoveryReport;
pub use worker::JournalWorkerConfig;
use worker::{JournalMessage, JournalWorkerHandle, JournalWriteRequest};

/// A handle to an in-progress journal transaction. Carries no data of its
/// own beyond identity; the records that belong to it are looked up by
/// `txn_id` during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalTxn {
    pub txn_id: TxnId,
}

/// The write-ahead journal: sequences records, hands them to the
/// group-commit worker, and can replay its own log on recovery.
pub struct WriteAheadJournal {
    worker: JournalWorkerHandle,
    next_txn_id: AtomicU64,
    next_seq: AtomicU64,
    log_path: std::path::PathBuf,
}

impl WriteAheadJournal {
    pub fn open(log_path: impl AsRef<Path>, config: JournalWorkerConfig) -> Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        let worker = JournalWorkerHandle::new(log_path.clone(), config)?;
        Ok(Self {
            worker,
            next_txn_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            log_path,
        })
    }

    /// Reserve a new transaction id and append its begin-record.
    pub fn start(&self) -> Result<JournalTxn> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = JournalRecord::new(RecordKind::BeginTxn, txn_id, seq, Vec::new(), 0);
        self.submit(record, false)?;
        Ok(JournalTxn { txn_id })
    }

    /// Append a checksummed payload record under `txn`. `sync` mirrors the
    /// journal record's `Sync` flag: true forces an immediate durable write.
    pub fn dirty_metadata(&self, txn: JournalTxn, kind: RecordKind, payload: Vec<u8>, sync: bool) -> Result<Seq> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record_flags = if sync { flags::SYNC } else { 0 };
        let record = JournalRecord::new(kind, txn.txn_id, seq, payload, record_flags);
        self.submit(record, sync)?;
        Ok(seq)
    }

    /// Append a commit record and flush all dirty records of `txn` durably.
    pub fn commit(&self, txn: JournalTxn) -> Result<Seq> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = JournalRecord::new(RecordKind::CommitTxn, txn.txn_id, seq, Vec::new(), flags::SYNC);
        self.submit(record, true)?;
        self.worker.wait_for_durable(seq)?;
        Ok(seq)
    }

    /// Append an abort record; replay treats all of `txn`'s records as void.
    pub fn abort(&self, txn: JournalTxn) -> Result<Seq> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = JournalRecord::new(RecordKind::AbortTxn, txn.txn_id, seq, Vec::new(), flags::SYNC);
        self.submit(record, true)?;
        self.worker.wait_for_durable(seq)?;
        Ok(seq)
    }

    /// Group-flush: force the worker to fsync now regardless of its batch
    /// timer, returning the durable sequence number reached.
    pub fn force_commit(&self) -> Result<Seq> {
        self.worker.force_sync()
    }

    pub fn durable_seq(&self) -> Seq {
        self.worker.durable_seq()
    }

    /// Scan the on-disk log from the beginning, classify every transaction,
    /// and report which committed cleanly versus which are incomplete.
    /// Does not mutate any subjournal state; callers (C10) apply the report.
    pub fn recover(&self) -> Result<JournalRecoveryReport> {
        recovery::scan(&self.log_path)
    }

    /// Truncate the on-disk log and reset sequence/txn counters. Used after
    /// a checkpoint has absorbed everything the log currently holds.
    pub fn truncate(&self) -> Result<()> {
        self.worker.truncate()?;
        self.next_seq.store(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.worker.shutdown();
    }

    fn submit(&self, record: JournalRecord, sync: bool) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.worker
            .sender
            .send(JournalMessage::Write(JournalWriteRequest {
                record,
                responder: tx,
            }))
            .map_err(|e| SubstrateError::io_string(format!("journal worker channel closed: {}", e)))?;
        rx.recv()
            .map_err(|e| SubstrateError::io_string(format!("journal write response lost: {}", e)))??;
        if sync {
            // submit() already requested SYNC flag on the record; the
            // caller (commit/abort) does the actual wait_for_durable so
            // group-commit can still batch concurrent commits together.
        }
        Ok(())
    }
}
