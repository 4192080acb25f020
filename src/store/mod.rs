//! Durable relayer state
//!
//! [`RelayerState`] is the single persisted document. [`StateStore`] is the
//! contract the engine and watchers depend on; every mutating call is durable
//! by the time it returns.

use alloy::primitives::TxHash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{id_key, Direction, EventId, ProcessedRecord, RecordStatus};

pub mod file;

pub use file::JsonFileStore;

/// Failure reason given to records found pending at startup
pub const INTERRUPTED_REASON: &str = "interrupted before destination confirmation";

/// Typed store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is malformed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no record for event {0}")]
    UnknownRecord(String),

    #[error("record {event_id} is {status}, not stuck")]
    NotStuck {
        event_id: String,
        status: RecordStatus,
    },

    #[error("event id {event_id} is already recorded for the {existing} direction")]
    DirectionConflict {
        event_id: String,
        existing: Direction,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Processed event ids per direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEventIds {
    #[serde(default)]
    pub deposit: BTreeSet<String>,
    #[serde(default)]
    pub burn: BTreeSet<String>,
}

impl ProcessedEventIds {
    pub fn for_direction(&self, direction: Direction) -> &BTreeSet<String> {
        match direction {
            Direction::Deposit => &self.deposit,
            Direction::Burn => &self.burn,
        }
    }

    pub fn for_direction_mut(&mut self, direction: Direction) -> &mut BTreeSet<String> {
        match direction {
            Direction::Deposit => &mut self.deposit,
            Direction::Burn => &mut self.burn,
        }
    }
}

/// A scanned event handed to the engine but not yet settled.
///
/// Written in the same durable update that moves the scan cursor past the
/// event's block; removed once the event is marked processed or given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDispatch {
    pub direction: Direction,
    pub event_id: EventId,
    pub source_tx_hash: TxHash,
    pub block_number: u64,
    pub dispatched_at: DateTime<Utc>,
}

/// Key of a pending dispatch: `<direction>:<0x event id>`
pub fn dispatch_key(direction: Direction, event_id: &EventId) -> String {
    format!("{}:{}", direction, id_key(event_id))
}

/// Root persisted object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayerState {
    #[serde(default)]
    pub last_scanned_block: BTreeMap<String, u64>,
    #[serde(default)]
    pub processed_event_ids: ProcessedEventIds,
    /// Keyed by `id_key(event_id)`
    #[serde(default)]
    pub records: BTreeMap<String, ProcessedRecord>,
    /// Keyed by [`dispatch_key`]
    #[serde(default)]
    pub pending_dispatches: BTreeMap<String, PendingDispatch>,
    #[serde(default)]
    pub last_saved_at: Option<DateTime<Utc>>,
}

impl RelayerState {
    pub fn is_processed(&self, direction: Direction, event_id: &EventId) -> bool {
        self.processed_event_ids
            .for_direction(direction)
            .contains(&id_key(event_id))
    }

    /// Refuse to let an event id be recorded under both directions
    pub fn check_direction(&self, direction: Direction, event_id: &EventId) -> StoreResult<()> {
        match self.records.get(&id_key(event_id)) {
            Some(existing) if existing.direction != direction => Err(StoreError::DirectionConflict {
                event_id: id_key(event_id),
                existing: existing.direction,
            }),
            _ => Ok(()),
        }
    }

    /// Records currently awaiting manual reconciliation
    pub fn stuck_records(&self) -> Vec<ProcessedRecord> {
        self.records
            .values()
            .filter(|r| r.status == RecordStatus::Stuck)
            .cloned()
            .collect()
    }

    /// Turn records left `pending` by a crash into `stuck` ones.
    ///
    /// Returns the number of records changed.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for record in self.records.values_mut() {
            if record.status == RecordStatus::Pending {
                record.status = RecordStatus::Stuck;
                record.failure_reason = Some(INTERRUPTED_REASON.to_string());
                recovered += 1;
            }
        }
        recovered
    }

    /// Drop the oldest finished records until at most `max_records` remain.
    ///
    /// Pending and stuck records are never trimmed, and processed ids are kept
    /// regardless of what happens to the record.
    pub fn trim_records(&mut self, max_records: usize) -> usize {
        if self.records.len() <= max_records {
            return 0;
        }

        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .records
            .iter()
            .filter(|(_, r)| {
                matches!(r.status, RecordStatus::Completed | RecordStatus::Reconciled)
            })
            .map(|(key, r)| (r.recorded_at, key.clone()))
            .collect();
        finished.sort();

        let excess = self.records.len() - max_records;
        let mut removed = 0;
        for (_, key) in finished.into_iter().take(excess) {
            self.records.remove(&key);
            removed += 1;
        }
        removed
    }
}

/// Durable state contract shared by watchers, the engine and the API
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Whether `event_id` has been marked processed for `direction`
    async fn is_processed(&self, direction: Direction, event_id: &EventId) -> bool;

    /// Atomic check-and-set: mark the event processed and store its pending
    /// record in one durable write. A pending dispatch for the event is
    /// cleared in the same write.
    ///
    /// Returns `false` without writing if the event was already processed,
    /// and [`StoreError::DirectionConflict`] if the id belongs to a record of
    /// the other direction.
    async fn mark_processed(&self, pending: ProcessedRecord) -> StoreResult<bool>;

    /// Insert or replace the record for `record.event_id`.
    ///
    /// A record of the other direction with the same id is never replaced.
    async fn put_tx_hashes(&self, record: ProcessedRecord) -> StoreResult<()>;

    async fn get_tx_hashes(&self, event_id: &EventId) -> Option<ProcessedRecord>;

    /// All records keyed by event id
    async fn records(&self) -> BTreeMap<String, ProcessedRecord>;

    async fn stuck_records(&self) -> Vec<ProcessedRecord>;

    async fn last_scanned_block(&self, chain: &str) -> Option<u64>;

    /// Advance the cursor for `chain`; lower values are ignored
    async fn set_last_scanned_block(&self, chain: &str, block: u64) -> StoreResult<()>;

    /// Record the events dispatched from `block` and move the cursor to it in
    /// one durable write. Already processed events are not recorded; a lower
    /// block leaves the cursor alone.
    async fn advance_cursor(
        &self,
        chain: &str,
        block: u64,
        dispatches: Vec<PendingDispatch>,
    ) -> StoreResult<()>;

    /// Dispatched events of `direction` not yet settled, oldest block first
    async fn pending_dispatches(&self, direction: Direction) -> Vec<PendingDispatch>;

    /// Forget a dispatched event; a no-op if it is not pending
    async fn clear_dispatch(&self, direction: Direction, event_id: &EventId) -> StoreResult<()>;

    /// Flag a processed record as needing manual reconciliation
    async fn mark_stuck(&self, event_id: &EventId, reason: String) -> StoreResult<ProcessedRecord>;

    /// Resolve a stuck record with the destination transaction an operator found
    async fn reconcile(
        &self,
        event_id: &EventId,
        destination_tx_hash: TxHash,
    ) -> StoreResult<ProcessedRecord>;
}
