//! Journal-level recovery scan
//!
//! A two-pass scan over the on-disk log, mirroring the teacher's
//! `granite::recovery` module: pass one classifies every record by
//! transaction and finds begin/commit/abort markers; pass two reports which
//! transactions are whole and hands back the payload records of committed
//! ones for the caller (the fast recovery engine, C10) to replay into the
//! subjournals. The journal itself does not know how to interpret
//! `MetadataUpdate`/`AllocationUpdate`/`SemanticEvent` payloads — that is
//! the subjournals' job.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::Result;

use super::record::{JournalRecord, RecordKind, Seq, TxnId};

/// Outcome of scanning the journal from its start.
#[derive(Debug, Default)]
pub struct JournalRecoveryReport {
    /// Transactions with a matching begin + commit record, in commit order.
    pub committed_txns: Vec<TxnId>,
    /// Transactions with a matching begin + abort record.
    pub aborted_txns: Vec<TxnId>,
    /// Transactions with a begin record but no terminal record — partial,
    /// handed to C10's partial-transaction resolver.
    pub incomplete_txns: Vec<TxnId>,
    /// Every non-control record (`MetadataUpdate`/`AllocationUpdate`/
    /// `SemanticEvent`) belonging to a committed transaction, in sequence
    /// order, ready for replay.
    pub applied_records: Vec<JournalRecord>,
    /// Payload records belonging to `incomplete_txns`, keyed by transaction
    /// id, for the fast recovery engine's partial-transaction resolver.
    pub incomplete_records: HashMap<TxnId, Vec<JournalRecord>>,
    /// Sequence number the scan stopped at, if it hit a corrupt or
    /// truncated record before reaching end of file.
    pub truncated_at: Option<Seq>,
}

/// Read every length-prefixed record from `log_path`, stopping at the first
/// one that fails to parse or checksum, per the failure model: "the first
/// record that fails ... truncates the log at its sequence."
fn read_all_records(log_path: &Path) -> Result<(Vec<JournalRecord>, Option<Seq>)> {
    let mut file = match File::open(log_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut truncated_at = None;

    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload_buf = vec![0u8; len];
        if file.read_exact(&mut payload_buf).is_err() {
            // Truncated mid-record: stop, the last complete record stands.
            truncated_at = records.last().map(|r: &JournalRecord| r.seq);
            break;
        }
        let record: JournalRecord = match bincode::deserialize(&payload_buf) {
            Ok(r) => r,
            Err(_) => {
                truncated_at = records.last().map(|r: &JournalRecord| r.seq);
                break;
            }
        };
        if !record.verify() {
            truncated_at = Some(record.seq);
            break;
        }
        records.push(record);
    }

    Ok((records, truncated_at))
}

pub fn scan(log_path: &Path) -> Result<JournalRecoveryReport> {
    let (records, truncated_at) = read_all_records(log_path)?;

    let mut begin_seen: HashMap<TxnId, ()> = HashMap::new();
    let mut committed: HashMap<TxnId, ()> = HashMap::new();
    let mut aborted: HashMap<TxnId, ()> = HashMap::new();
    let mut payloads: HashMap<TxnId, Vec<JournalRecord>> = HashMap::new();
    let mut commit_order = Vec::new();
    let mut abort_order = Vec::new();

    for record in &records {
        match record.kind {
            RecordKind::BeginTxn => {
                begin_seen.insert(record.txn_id, ());
            }
            RecordKind::CommitTxn => {
                committed.insert(record.txn_id, ());
                commit_order.push(record.txn_id);
            }
            RecordKind::AbortTxn => {
                aborted.insert(record.txn_id, ());
                abort_order.push(record.txn_id);
            }
            RecordKind::MetadataUpdate | RecordKind::AllocationUpdate | RecordKind::SemanticEvent => {
                payloads.entry(record.txn_id).or_default().push(record.clone());
            }
            RecordKind::CheckpointMarker => {}
        }
    }

    let incomplete_txns: Vec<TxnId> = begin_seen
        .keys()
        .copied()
        .filter(|id| !committed.contains_key(id) && !aborted.contains_key(id))
        .collect();

    let mut applied_records = Vec::new();
    for txn_id in &commit_order {
        if let Some(mut records) = payloads.remove(txn_id) {
            records.sort_by_key(|r| r.seq);
            applied_records.extend(records);
        }
    }

    let mut incomplete_records = HashMap::new();
    for txn_id in &incomplete_txns {
        if let Some(mut records) = payloads.remove(txn_id) {
            records.sort_by_key(|r| r.seq);
            incomplete_records.insert(*txn_id, records);
        }
    }

    Ok(JournalRecoveryReport {
        committed_txns: commit_order,
        aborted_txns: abort_order,
        incomplete_txns,
        applied_records,
        incomplete_records,
        truncated_at,
    })
}
