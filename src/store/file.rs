//! JSON-document implementation of [`StateStore`]
//!
//! The whole [`RelayerState`] lives in memory behind one mutex and is written
//! out on every mutation: serialize to `<path>.tmp`, fsync, rename over the
//! live file, fsync the directory. A crash at any point leaves either the old
//! or the new document on disk.

use alloy::primitives::TxHash;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{dispatch_key, PendingDispatch, RelayerState, StateStore, StoreError, StoreResult};
use crate::metrics;
use crate::types::{id_key, Direction, EventId, ProcessedRecord, RecordStatus};

/// State store backed by a single JSON file
pub struct JsonFileStore {
    path: PathBuf,
    max_records: usize,
    state: Mutex<RelayerState>,
}

impl JsonFileStore {
    /// Load the state file (or start empty) and recover interrupted records
    pub async fn open(path: impl Into<PathBuf>, max_records: usize) -> StoreResult<Self> {
        let path = path.into();
        let mut state = Self::load(&path).await?;

        let recovered = state.recover_interrupted();
        if recovered > 0 {
            warn!(
                recovered,
                path = %path.display(),
                needs_reconciliation = true,
                "Found records interrupted between processed mark and destination confirmation"
            );
            state.last_saved_at = Some(Utc::now());
            Self::save(&path, &state).await?;
        }

        let stuck = state.stuck_records().len();
        metrics::set_stuck_records(stuck);
        info!(
            path = %path.display(),
            records = state.records.len(),
            processed_deposits = state.processed_event_ids.deposit.len(),
            processed_burns = state.processed_event_ids.burn.len(),
            pending_dispatches = state.pending_dispatches.len(),
            stuck,
            "Relayer state loaded"
        );

        Ok(Self {
            path,
            max_records,
            state: Mutex::new(state),
        })
    }

    /// Read a state document; a missing file is a fresh empty state
    pub async fn load(path: &Path) -> StoreResult<RelayerState> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file, starting empty");
                Ok(RelayerState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the state document at `path`
    pub async fn save(path: &Path, state: &RelayerState) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = tmp_path(path);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        sync_parent_dir(path).await?;
        Ok(())
    }

    /// Copy of the in-memory state
    pub async fn snapshot(&self) -> RelayerState {
        self.state.lock().await.clone()
    }

    /// Persist `next` and only then make it the live state
    async fn persist(&self, live: &mut RelayerState, mut next: RelayerState) -> StoreResult<()> {
        let trimmed = next.trim_records(self.max_records);
        if trimmed > 0 {
            debug!(trimmed, max_records = self.max_records, "Trimmed oldest finished records");
        }
        next.last_saved_at = Some(Utc::now());

        Self::save(&self.path, &next).await?;
        metrics::set_stuck_records(
            next.records
                .values()
                .filter(|r| r.status == RecordStatus::Stuck)
                .count(),
        );
        *live = next;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn is_processed(&self, direction: Direction, event_id: &EventId) -> bool {
        self.state.lock().await.is_processed(direction, event_id)
    }

    async fn mark_processed(&self, pending: ProcessedRecord) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.is_processed(pending.direction, &pending.event_id) {
            return Ok(false);
        }
        state.check_direction(pending.direction, &pending.event_id)?;

        let key = id_key(&pending.event_id);
        let mut next = state.clone();
        next.pending_dispatches
            .remove(&dispatch_key(pending.direction, &pending.event_id));
        next.processed_event_ids
            .for_direction_mut(pending.direction)
            .insert(key.clone());
        next.records.insert(key, pending);

        self.persist(&mut state, next).await?;
        Ok(true)
    }

    async fn put_tx_hashes(&self, record: ProcessedRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check_direction(record.direction, &record.event_id)?;
        let key = id_key(&record.event_id);
        let mut next = state.clone();
        next.processed_event_ids
            .for_direction_mut(record.direction)
            .insert(key.clone());
        next.records.insert(key, record);
        self.persist(&mut state, next).await
    }

    async fn get_tx_hashes(&self, event_id: &EventId) -> Option<ProcessedRecord> {
        self.state.lock().await.records.get(&id_key(event_id)).cloned()
    }

    async fn records(&self) -> BTreeMap<String, ProcessedRecord> {
        self.state.lock().await.records.clone()
    }

    async fn stuck_records(&self) -> Vec<ProcessedRecord> {
        self.state.lock().await.stuck_records()
    }

    async fn last_scanned_block(&self, chain: &str) -> Option<u64> {
        self.state.lock().await.last_scanned_block.get(chain).copied()
    }

    async fn set_last_scanned_block(&self, chain: &str, block: u64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .last_scanned_block
            .get(chain)
            .is_some_and(|&current| current >= block)
        {
            return Ok(());
        }
        let mut next = state.clone();
        next.last_scanned_block.insert(chain.to_string(), block);
        self.persist(&mut state, next).await
    }

    async fn advance_cursor(
        &self,
        chain: &str,
        block: u64,
        dispatches: Vec<PendingDispatch>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut changed = false;

        for dispatch in dispatches {
            if next.is_processed(dispatch.direction, &dispatch.event_id) {
                continue;
            }
            next.pending_dispatches
                .insert(dispatch_key(dispatch.direction, &dispatch.event_id), dispatch);
            changed = true;
        }
        if next
            .last_scanned_block
            .get(chain)
            .map_or(true, |&current| current < block)
        {
            next.last_scanned_block.insert(chain.to_string(), block);
            changed = true;
        }

        if !changed {
            return Ok(());
        }
        self.persist(&mut state, next).await
    }

    async fn pending_dispatches(&self, direction: Direction) -> Vec<PendingDispatch> {
        let mut pending: Vec<PendingDispatch> = self
            .state
            .lock()
            .await
            .pending_dispatches
            .values()
            .filter(|d| d.direction == direction)
            .cloned()
            .collect();
        pending.sort_by_key(|d| d.block_number);
        pending
    }

    async fn clear_dispatch(&self, direction: Direction, event_id: &EventId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let key = dispatch_key(direction, event_id);
        if !state.pending_dispatches.contains_key(&key) {
            return Ok(());
        }
        let mut next = state.clone();
        next.pending_dispatches.remove(&key);
        self.persist(&mut state, next).await
    }

    async fn mark_stuck(&self, event_id: &EventId, reason: String) -> StoreResult<ProcessedRecord> {
        let mut state = self.state.lock().await;
        let key = id_key(event_id);
        let mut next = state.clone();
        let record = next
            .records
            .get_mut(&key)
            .ok_or_else(|| StoreError::UnknownRecord(key.clone()))?;
        record.status = RecordStatus::Stuck;
        record.failure_reason = Some(reason);
        record.recorded_at = Utc::now();
        let updated = record.clone();

        self.persist(&mut state, next).await?;
        Ok(updated)
    }

    async fn reconcile(
        &self,
        event_id: &EventId,
        destination_tx_hash: TxHash,
    ) -> StoreResult<ProcessedRecord> {
        let mut state = self.state.lock().await;
        let key = id_key(event_id);
        let mut next = state.clone();
        let record = next
            .records
            .get_mut(&key)
            .ok_or_else(|| StoreError::UnknownRecord(key.clone()))?;
        if record.status != RecordStatus::Stuck {
            return Err(StoreError::NotStuck {
                event_id: key,
                status: record.status,
            });
        }
        record.status = RecordStatus::Reconciled;
        record.destination_tx_hash = Some(destination_tx_hash);
        record.recorded_at = Utc::now();
        let updated = record.clone();

        self.persist(&mut state, next).await?;
        Ok(updated)
    }
}
