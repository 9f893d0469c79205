//! Atomic Transaction Manager (C5)
//!
//! Adapted from the teacher's `engines::granite::manager::TransactionManager`:
//! the same begin/commit/rollback shape and the same pattern of a
//! non-durable write during the transaction followed by one durable write
//! at commit, but generalized to nested transactions, two isolation levels,
//! and a rollback log of typed before-images rather than SQL undo records.
//!
//! Nested transactions never reach the write-ahead journal on their own:
//! per the design note on the source's nested-commit bug, a child's queued
//! operations and rollback entries are folded into its parent's on
//! `commit`, and only the outermost transaction's commit actually writes a
//! commit record and waits for durability.

mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Result, SubstrateError};
use crate::journal::{JournalRecoveryReport, JournalTxn, RecordKind, WriteAheadJournal};

pub use types::{IsolationLevel, Operation, RollbackEntry, TxnId, TxnState};

const DEFAULT_MAX_NESTING_DEPTH: u32 = 16;

struct TransactionContext {
    id: TxnId,
    state: TxnState,
    isolation: IsolationLevel,
    nesting_level: u32,
    parent: Option<TxnId>,
    journal_txn: JournalTxn,
    rollback_log: Vec<RollbackEntry>,
    operation_queue: Vec<Operation>,
}

impl TransactionContext {
    fn ensure_open(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(SubstrateError::invalid_state(format!(
                "transaction {} is already {:?}",
                self.id, self.state
            )));
        }
        Ok(())
    }
}

/// A caller-held handle to an open transaction. Carries identity only; all
/// mutable state lives in the manager's arena, never in this handle, so
/// there is no back-reference cycle between transaction and manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Txn {
    pub id: TxnId,
}

/// Begin/commit/abort with nesting, per-transaction rollback logs, and a
/// two-phase commit path down into the write-ahead journal.
pub struct AtomicTransactionManager {
    journal: Arc<WriteAheadJournal>,
    next_txn_id: AtomicU64,
    active: RwLock<HashMap<TxnId, TransactionContext>>,
    max_concurrent_transactions: usize,
    max_operations_per_txn: usize,
    max_nesting_depth: u32,
}

impl AtomicTransactionManager {
    pub fn new(journal: Arc<WriteAheadJournal>, max_concurrent_transactions: usize, max_operations_per_txn: usize) -> Self {
        Self {
            journal,
            next_txn_id: AtomicU64::new(1),
            active: RwLock::new(HashMap::new()),
            max_concurrent_transactions,
            max_operations_per_txn,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.read().expect("active transaction table poisoned").len()
    }

    /// Begin a new top-level transaction. Fails `Busy` once the concurrent
    /// transaction ceiling is reached.
    pub fn begin(&self, isolation: IsolationLevel) -> Result<Txn> {
        {
            let active = self.active.read().expect("active transaction table poisoned");
            if active.len() >= self.max_concurrent_transactions {
                return Err(SubstrateError::busy(format!(
                    "active transaction ceiling ({}) reached",
                    self.max_concurrent_transactions
                )));
            }
        }

        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let journal_txn = self.journal.start()?;
        let context = TransactionContext {
            id,
            state: TxnState::Running,
            isolation,
            nesting_level: 0,
            parent: None,
            journal_txn,
            rollback_log: Vec::new(),
            operation_queue: Vec::new(),
        };
        self.active
            .write()
            .expect("active transaction table poisoned")
            .insert(id, context);
        Ok(Txn { id })
    }

    /// Begin a transaction nested under `parent`, inheriting its isolation
    /// level. Fails `InvalidArgument` past the configured nesting ceiling.
    pub fn begin_nested(&self, parent: Txn) -> Result<Txn> {
        let mut active = self.active.write().expect("active transaction table poisoned");
        let (isolation, journal_txn, parent_level) = {
            let parent_ctx = active
                .get(&parent.id)
                .ok_or_else(|| SubstrateError::not_found(format!("transaction {} not found", parent.id)))?;
            parent_ctx.ensure_open()?;
            (parent_ctx.isolation, parent_ctx.journal_txn, parent_ctx.nesting_level)
        };
        if parent_level + 1 > self.max_nesting_depth {
            return Err(SubstrateError::invalid_argument(format!(
                "nesting depth exceeds ceiling of {}",
                self.max_nesting_depth
            )));
        }

        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        active.insert(
            id,
            TransactionContext {
                id,
                state: TxnState::Running,
                isolation,
                nesting_level: parent_level + 1,
                parent: Some(parent.id),
                journal_txn,
                rollback_log: Vec::new(),
                operation_queue: Vec::new(),
            },
        );
        Ok(Txn { id })
    }

    /// Enqueue a validated operation. Fails `InvalidState` once the
    /// transaction has reached a terminal state, or `Busy` once the
    /// transaction's own operation queue has reached the configured ceiling.
    pub fn add_operation(&self, txn: Txn, op: Operation) -> Result<()> {
        let mut active = self.active.write().expect("active transaction table poisoned");
        let ctx = active
            .get_mut(&txn.id)
            .ok_or_else(|| SubstrateError::not_found(format!("transaction {} not found", txn.id)))?;
        ctx.ensure_open()?;
        if ctx.operation_queue.len() >= self.max_operations_per_txn {
            return Err(SubstrateError::busy(format!(
                "transaction {} has reached the per-transaction operation limit of {}",
                txn.id, self.max_operations_per_txn
            )));
        }
        ctx.operation_queue.push(op);
        Ok(())
    }

    /// Record a before-image so `abort` can undo this operation's effect.
    pub fn add_rollback_entry(&self, txn: Txn, entry: RollbackEntry) -> Result<()> {
        let mut active = self.active.write().expect("active transaction table poisoned");
        let ctx = active
            .get_mut(&txn.id)
            .ok_or_else(|| SubstrateError::not_found(format!("transaction {} not found", txn.id)))?;
        ctx.ensure_open()?;
        ctx.rollback_log.push(entry);
        Ok(())
    }

    /// Drain the operation queue, write everything through the journal, and
    /// commit. A nested transaction instead folds its queue and rollback log
    /// into its parent and never touches the journal directly; only the
    /// outermost commit is durable.
    pub fn commit(&self, txn: Txn) -> Result<Vec<Operation>> {
        let (is_nested, parent_id, ops, mut rollback_log, journal_txn, nesting_level) = {
            let mut active = self.active.write().expect("active transaction table poisoned");
            let ctx = active
                .get_mut(&txn.id)
                .ok_or_else(|| SubstrateError::not_found(format!("transaction {} not found", txn.id)))?;
            ctx.ensure_open()?;
            ctx.state = TxnState::Preparing;
            let ops = std::mem::take(&mut ctx.operation_queue);
            let rollback_log = std::mem::take(&mut ctx.rollback_log);
            (
                ctx.parent.is_some(),
                ctx.parent,
                ops,
                rollback_log,
                ctx.journal_txn,
                ctx.nesting_level,
            )
        };

        if is_nested {
            let parent_id = parent_id.expect("nested transaction always has a parent");
            let mut active = self.active.write().expect("active transaction table poisoned");
            {
                let child = active.get_mut(&txn.id).expect("transaction vanished mid-commit");
                child.state = TxnState::Committed;
            }
            let parent = active
                .get_mut(&parent_id)
                .ok_or_else(|| SubstrateError::not_found(format!("parent transaction {} not found", parent_id)))?;
            parent.ensure_open()?;
            parent.operation_queue.extend(ops.iter().cloned());
            parent.rollback_log.append(&mut rollback_log);
            return Ok(ops);
        }

        debug_assert_eq!(nesting_level, 0);
        let write_result = (|| -> Result<()> {
            for op in &ops {
                self.journal
                    .dirty_metadata(journal_txn, op.kind, op.payload.clone(), false)?;
            }
            self.journal.commit(journal_txn)?;
            Ok(())
        })();

        let mut active = self.active.write().expect("active transaction table poisoned");
        let ctx = active.get_mut(&txn.id).expect("transaction vanished mid-commit");
        match write_result {
            Ok(()) => {
                ctx.state = TxnState::Committed;
                Ok(ops)
            }
            Err(e) => {
                ctx.state = TxnState::Aborting;
                ctx.rollback_log = rollback_log;
                drop(active);
                self.abort(txn)?;
                Err(e)
            }
        }
    }

    /// Replay the rollback log in LIFO order, then abort the underlying
    /// journal transaction. Nested aborts only unwind their own effects;
    /// they never touch the parent's queue.
    pub fn abort(&self, txn: Txn) -> Result<Vec<RollbackEntry>> {
        let (rollback_log, journal_txn, is_nested) = {
            let mut active = self.active.write().expect("active transaction table poisoned");
            let ctx = active
                .get_mut(&txn.id)
                .ok_or_else(|| SubstrateError::not_found(format!("transaction {} not found", txn.id)))?;
            if ctx.state.is_terminal() {
                return Err(SubstrateError::invalid_state(format!(
                    "transaction {} is already {:?}",
                    txn.id, ctx.state
                )));
            }
            ctx.state = TxnState::Aborting;
            let mut log = std::mem::take(&mut ctx.rollback_log);
            log.reverse();
            (log, ctx.journal_txn, ctx.parent.is_some())
        };

        if !is_nested {
            self.journal.abort(journal_txn)?;
        }

        let mut active = self.active.write().expect("active transaction table poisoned");
        let ctx = active.get_mut(&txn.id).expect("transaction vanished mid-abort");
        ctx.state = TxnState::Aborted;
        Ok(rollback_log)
    }

    pub fn state_of(&self, txn: Txn) -> Result<TxnState> {
        let active = self.active.read().expect("active transaction table poisoned");
        active
            .get(&txn.id)
            .map(|ctx| ctx.state)
            .ok_or_else(|| SubstrateError::not_found(format!("transaction {} not found", txn.id)))
    }

    /// Delegate to the journal's own recovery scan. Reapplying the returned
    /// records into the subjournals is the caller's job (the fast recovery
    /// engine owns the subjournals, the manager does not).
    pub fn recover_partial_writes(&self) -> Result<JournalRecoveryReport> {
        self.journal.recover()
    }
}
