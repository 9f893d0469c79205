//! Semantic Event Log (C8)
//!
//! An append-only, causally-linked event stream for the agent-facing layer
//! sitting above the filesystem. Every event gets a monotone `event_id` and
//! is written through ATM like any other subjournal record; unlike C6/C7 it
//! carries no in-memory cache, only the replay engine below, since the log
//! itself is the source of truth agents read from.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubstrateError};
use crate::journal::RecordKind;
use crate::txn::{AtomicTransactionManager, IsolationLevel, Operation};

pub type EventId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Filesystem,
    Graph,
    Vector,
    Agent,
    System,
}

bitflags::bitflags! {
    /// Which agent classes may observe an event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VisibilityMask: u32 {
        const NONE = 0;
        const FILESYSTEM = 1 << 0;
        const GRAPH = 1 << 1;
        const VECTOR = 1 << 2;
        const AGENT = 1 << 3;
        const SYSTEM = 1 << 4;
        const ALL = Self::FILESYSTEM.bits() | Self::GRAPH.bits() | Self::VECTOR.bits() | Self::AGENT.bits() | Self::SYSTEM.bits();
    }
}

/// Flags for a replay pass. Several compose (`VERBOSE | VALIDATE`); the
/// shape matches the bitmask contract of `VisibilityMask` above.
pub mod replay_flags {
    pub const NONE: u32 = 0;
    pub const DRY_RUN: u32 = 1 << 0;
    pub const VERBOSE: u32 = 1 << 1;
    pub const STOP_ON_ERROR: u32 = 1 << 2;
    pub const AGENT_VISIBLE: u32 = 1 << 3;
    pub const PARALLEL: u32 = 1 << 4;
    pub const CAUSALITY_ORDER: u32 = 1 << 5;
    pub const VALIDATE: u32 = 1 << 6;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticEvent {
    pub event_id: EventId,
    pub event_class: EventClass,
    pub timestamp: u64,
    pub agent_visibility_mask: u32,
    pub causality_predecessors: Vec<EventId>,
    pub payload: Vec<u8>,
}

/// `{start_id, end_id, filter_mask, flags}` describing one replay pass.
#[derive(Debug, Clone, Copy)]
pub struct ReplayContext {
    pub start_id: EventId,
    pub end_id: EventId,
    pub filter_mask: u32,
    pub flags: u32,
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub dispatched: Vec<EventId>,
    pub skipped: Vec<EventId>,
    pub errors: Vec<(EventId, String)>,
}

/// Append-only event log with causality validation and a pluggable replay
/// dispatcher. Appending writes through ATM exactly like C6/C7; unlike
/// them, the log keeps its own full event history in memory (the agent
/// layer treats the log itself as the queryable record, not a cache).
pub struct SemanticEventLog {
    atm: Arc<AtomicTransactionManager>,
    next_event_id: AtomicU64,
    events: Mutex<Vec<SemanticEvent>>,
}

impl SemanticEventLog {
    pub fn new(atm: Arc<AtomicTransactionManager>) -> Self {
        Self {
            atm,
            next_event_id: AtomicU64::new(1),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Append one event. Every predecessor must already be present in the
    /// log with a strictly smaller id, or the call fails `InvalidArgument`
    /// (enforces the no-cycles, strictly-increasing invariant up front
    /// rather than discovering a cycle during replay).
    pub fn append(
        &self,
        event_class: EventClass,
        timestamp: u64,
        agent_visibility_mask: u32,
        causality_predecessors: Vec<EventId>,
        payload: Vec<u8>,
    ) -> Result<EventId> {
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);

        {
            let events = self.events.lock().expect("semantic event log poisoned");
            let known: HashSet<EventId> = events.iter().map(|e| e.event_id).collect();
            for pred in &causality_predecessors {
                if *pred >= event_id {
                    return Err(SubstrateError::invalid_argument(format!(
                        "causality predecessor {} is not smaller than event {}",
                        pred, event_id
                    )));
                }
                if !known.contains(pred) {
                    return Err(SubstrateError::invalid_argument(format!(
                        "causality predecessor {} has not been appended yet",
                        pred
                    )));
                }
            }
        }

        let event = SemanticEvent {
            event_id,
            event_class,
            timestamp,
            agent_visibility_mask,
            causality_predecessors,
            payload,
        };

        let record_payload = bincode::serialize(&event)
            .map_err(|e| SubstrateError::corrupt(format!("failed to encode semantic event: {}", e)))?;
        let txn = self.atm.begin(IsolationLevel::ReadCommitted)?;
        self.atm.add_operation(
            txn,
            Operation {
                kind: RecordKind::SemanticEvent,
                payload: record_payload,
            },
        )?;
        self.atm.commit(txn)?;

        self.events.lock().expect("semantic event log poisoned").push(event);
        Ok(event_id)
    }

    /// Reinsert an already-committed event discovered during journal replay,
    /// bypassing causality re-validation (it was already validated the first
    /// time) and folding the id cursor forward so post-recovery appends never
    /// collide with replayed ids.
    pub fn apply_replayed(&self, event: SemanticEvent) -> Result<()> {
        let mut current = self.next_event_id.load(Ordering::SeqCst);
        while current <= event.event_id {
            match self
                .next_event_id
                .compare_exchange(current, event.event_id + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        let mut events = self.events.lock().expect("semantic event log poisoned");
        if !events.iter().any(|e| e.event_id == event.event_id) {
            events.push(event);
            events.sort_by_key(|e| e.event_id);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("semantic event log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next event id that would be assigned, used by the cross-layer
    /// coordinator as this log's sequence cursor for snapshotting.
    pub fn op_seq(&self) -> u64 {
        self.next_event_id.load(Ordering::SeqCst)
    }

    /// Sequential replay: dispatch every event in `[start_id, end_id)` in
    /// `event_id` order, honoring `filter_mask` and `STOP_ON_ERROR`.
    pub fn replay_sequential(
        &self,
        ctx: ReplayContext,
        mut dispatch: impl FnMut(&SemanticEvent) -> Result<()>,
    ) -> ReplayReport {
        let events = self.events.lock().expect("semantic event log poisoned");
        let mut report = ReplayReport::default();
        for event in events.iter().filter(|e| e.event_id >= ctx.start_id && e.event_id < ctx.end_id) {
            if ctx.filter_mask != 0 && event.agent_visibility_mask & ctx.filter_mask == 0 {
                report.skipped.push(event.event_id);
                continue;
            }
            if ctx.flags & replay_flags::DRY_RUN != 0 {
                report.dispatched.push(event.event_id);
                continue;
            }
            match dispatch(event) {
                Ok(()) => report.dispatched.push(event.event_id),
                Err(e) => {
                    report.errors.push((event.event_id, e.to_string()));
                    if ctx.flags & replay_flags::STOP_ON_ERROR != 0 {
                        break;
                    }
                }
            }
        }
        report
    }

    /// Parallel replay: shard events by `event_id % worker_count`, but never
    /// dispatch an event before all of its causality predecessors have been
    /// dispatched. `worker_count` only bounds concurrency of the simulated
    /// shards here; each shard still dispatches on the calling thread in a
    /// single pass honoring the high-water-mark gate, matching the
    /// sequential engine's guarantees without spawning OS threads for what
    /// is, in this crate, a caller-supplied synchronous callback.
    pub fn replay_parallel(
        &self,
        ctx: ReplayContext,
        worker_count: usize,
        mut dispatch: impl FnMut(&SemanticEvent) -> Result<()>,
    ) -> ReplayReport {
        let worker_count = worker_count.max(1);
        let events = self.events.lock().expect("semantic event log poisoned");
        let mut dispatched: HashSet<EventId> = HashSet::new();
        let mut report = ReplayReport::default();

        let mut pending: Vec<&SemanticEvent> = events
            .iter()
            .filter(|e| e.event_id >= ctx.start_id && e.event_id < ctx.end_id)
            .collect();
        pending.sort_by_key(|e| e.event_id);

        // Shard assignment only affects which high-water mark an event
        // waits on in a real multi-worker deployment; single-pass replay
        // here just enforces the same causal gate every shard would.
        let _ = worker_count;

        let mut progressed = true;
        while progressed && !pending.is_empty() {
            progressed = false;
            let mut next_round = Vec::new();
            for event in pending {
                let ready = event.causality_predecessors.iter().all(|p| dispatched.contains(p));
                if !ready {
                    next_round.push(event);
                    continue;
                }
                progressed = true;
                if ctx.filter_mask != 0 && event.agent_visibility_mask & ctx.filter_mask == 0 {
                    report.skipped.push(event.event_id);
                    dispatched.insert(event.event_id);
                    continue;
                }
                if ctx.flags & replay_flags::DRY_RUN != 0 {
                    report.dispatched.push(event.event_id);
                    dispatched.insert(event.event_id);
                    continue;
                }
                match dispatch(event) {
                    Ok(()) => {
                        report.dispatched.push(event.event_id);
                        dispatched.insert(event.event_id);
                    }
                    Err(e) => {
                        report.errors.push((event.event_id, e.to_string()));
                        dispatched.insert(event.event_id);
                        if ctx.flags & replay_flags::STOP_ON_ERROR != 0 {
                            return report;
                        }
                    }
                }
            }
            pending = next_round;
        }
        report
    }
}
