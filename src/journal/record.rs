//! Journal record types (C4 data model)
//!
//! A record carries a common 64-byte header prefix (see the on-disk layout
//! in the external interface contract) followed by a variable-length,
//! kind-specific payload. Header and payload each carry their own CRC32 so
//! recovery can distinguish a truncated write from a corrupt one.

use serde::{Deserialize, Serialize};

pub const JOURNAL_MAGIC: u32 = 0x5645_4a31; // "VEJ1"
pub const JOURNAL_VERSION: u16 = 1;

pub type Seq = u64;
pub type TxnId = u64;

/// The kind of a journal record, tagging what its payload means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    BeginTxn,
    CommitTxn,
    AbortTxn,
    MetadataUpdate,
    AllocationUpdate,
    SemanticEvent,
    CheckpointMarker,
}

/// A single record in the write-ahead journal.
///
/// `header_checksum` covers `{magic, version, kind, txn_id, seq, payload_len,
/// flags}`; `payload_checksum` covers `payload` alone. Both are computed at
/// construction and re-verified on every read during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub magic: u32,
    pub version: u16,
    pub kind: RecordKind,
    pub txn_id: TxnId,
    pub seq: Seq,
    pub payload: Vec<u8>,
    pub flags: u32,
    pub header_checksum: u32,
    pub payload_checksum: u32,
}

impl JournalRecord {
    pub fn new(kind: RecordKind, txn_id: TxnId, seq: Seq, payload: Vec<u8>, flags: u32) -> Self {
        let payload_checksum = crc32fast::hash(&payload);
        let mut record = Self {
            magic: JOURNAL_MAGIC,
            version: JOURNAL_VERSION,
            kind,
            txn_id,
            seq,
            payload,
            flags,
            header_checksum: 0,
            payload_checksum,
        };
        record.header_checksum = record.compute_header_checksum();
        record
    }

    fn compute_header_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.magic.to_le_bytes());
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&(self.kind as u16).to_le_bytes());
        hasher.update(&self.txn_id.to_le_bytes());
        hasher.update(&self.seq.to_le_bytes());
        hasher.update(&(self.payload.len() as u32).to_le_bytes());
        hasher.update(&self.flags.to_le_bytes());
        hasher.finalize()
    }

    /// Re-verify both checksums against current contents; used by recovery
    /// to find the first bad record and truncate there.
    pub fn verify(&self) -> bool {
        self.magic == JOURNAL_MAGIC
            && self.header_checksum == self.compute_header_checksum()
            && self.payload_checksum == crc32fast::hash(&self.payload)
    }
}

/// Record-level flags.
pub mod flags {
    /// Force an immediate group-commit flush rather than waiting for the
    /// next batch boundary.
    pub const SYNC: u32 = 1 << 0;
}
