//! Error types for the storage substrate
//!
//! Defines a single, closed error taxonomy shared by every subsystem (journal,
//! transaction manager, subjournals, coordinator, recovery engine). Propagation
//! policy is documented per-variant below; callers match on the variant rather
//! than on message text.

use std::fmt;
use std::io;

/// Unified error type for substrate operations.
///
/// The taxonomy is intentionally closed: every fallible public operation in
/// this crate returns one of these variants, never an opaque/boxed error.
#[derive(Debug)]
pub enum SubstrateError {
    /// A caller-supplied argument violated a documented precondition
    /// (zero-size bitmap, non-power-of-two alignment, zero allocation count,
    /// out-of-range group id). Surfaced to the caller; never retried internally.
    InvalidArgument(String),
    /// An allocation request could not be satisfied by the target allocation
    /// group. Surfaced to the caller.
    OutOfSpace(String),
    /// A concurrency ceiling was hit (too many active transactions, queue
    /// full). Surfaced to the caller; the caller may retry later.
    Busy(String),
    /// A referenced entity (transaction, allocation group, cache entry,
    /// checkpoint) does not exist.
    NotFound(String),
    /// An operation exceeded its deadline (cross-layer transaction timeout,
    /// commit-latch wait, recovery top-level timeout).
    Timeout(String),
    /// A checksum did not match recomputed contents (bitmap CRC, cached
    /// metadata bytes, journal record). Recovered locally where documented
    /// (cache eviction + re-read), otherwise fatal.
    ChecksumError(String),
    /// A journal or checkpoint record failed structural validation (bad
    /// magic, truncated payload, unknown record kind). Fatal for the
    /// operation in progress; may block mount if hit on the superblock or
    /// journal header.
    CorruptRecord(String),
    /// The underlying block device or filesystem returned an I/O error.
    IoFailure(io::Error),
    /// The cross-layer deadlock detector selected this transaction as the
    /// victim of a wait-for cycle.
    DeadlockVictim(String),
    /// An operation was attempted against a transaction in a state that does
    /// not permit it (e.g. enqueue after commit/abort).
    InvalidState(String),
}

impl SubstrateError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SubstrateError::InvalidArgument(msg.into())
    }

    pub fn out_of_space(msg: impl Into<String>) -> Self {
        SubstrateError::OutOfSpace(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        SubstrateError::Busy(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SubstrateError::NotFound(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        SubstrateError::Timeout(msg.into())
    }

    pub fn checksum(msg: impl Into<String>) -> Self {
        SubstrateError::ChecksumError(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        SubstrateError::CorruptRecord(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SubstrateError::InvalidState(msg.into())
    }

    pub fn deadlock_victim(msg: impl Into<String>) -> Self {
        SubstrateError::DeadlockVictim(msg.into())
    }

    /// Wrap an ad-hoc I/O failure message (e.g. a channel disconnect) the
    /// same way an `io::Error` arriving through `?` would be wrapped.
    pub fn io_string(msg: impl Into<String>) -> Self {
        SubstrateError::IoFailure(io::Error::new(io::ErrorKind::Other, msg.into()))
    }

    /// True for errors the caller may reasonably retry (`Busy`, `Timeout`).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubstrateError::Busy(_) | SubstrateError::Timeout(_))
    }

    /// True for errors that should abort the in-flight transaction and may
    /// require entering recovery (`IoFailure`, `CorruptRecord`, `ChecksumError`).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SubstrateError::IoFailure(_)
                | SubstrateError::CorruptRecord(_)
                | SubstrateError::ChecksumError(_)
        )
    }
}

impl fmt::Display for SubstrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubstrateError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            SubstrateError::OutOfSpace(msg) => write!(f, "out of space: {}", msg),
            SubstrateError::Busy(msg) => write!(f, "busy: {}", msg),
            SubstrateError::NotFound(msg) => write!(f, "not found: {}", msg),
            SubstrateError::Timeout(msg) => write!(f, "timeout: {}", msg),
            SubstrateError::ChecksumError(msg) => write!(f, "checksum error: {}", msg),
            SubstrateError::CorruptRecord(msg) => write!(f, "corrupt record: {}", msg),
            SubstrateError::IoFailure(e) => write!(f, "I/O failure: {}", e),
            SubstrateError::DeadlockVictim(msg) => write!(f, "deadlock victim: {}", msg),
            SubstrateError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}

impl std::error::Error for SubstrateError {}

impl From<io::Error> for SubstrateError {
    fn from(e: io::Error) -> Self {
        SubstrateError::IoFailure(e)
    }
}

/// Result type alias used throughout the substrate.
pub type Result<T> = std::result::Result<T, SubstrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SubstrateError::busy("ceiling hit").is_retryable());
        assert!(SubstrateError::timeout("deadline exceeded").is_retryable());
        assert!(!SubstrateError::invalid_argument("bad").is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(SubstrateError::checksum("mismatch").is_fatal());
        assert!(SubstrateError::corrupt("bad magic").is_fatal());
        assert!(!SubstrateError::not_found("txn 1").is_fatal());
    }

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk gone");
        let err: SubstrateError = io_err.into();
        assert!(matches!(err, SubstrateError::IoFailure(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            SubstrateError::out_of_space("group 0").to_string(),
            "out of space: group 0"
        );
        assert_eq!(
            SubstrateError::invalid_state("txn 3 committed").to_string(),
            "invalid state: txn 3 committed"
        );
    }
}
