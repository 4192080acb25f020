//! Relay engine
//!
//! [`RelayEngine::process`] is the single entry point for relaying one event,
//! whether it was found by a watcher or pushed through the control API. The
//! order of steps matters:
//!
//! 1. short-circuit if the event id is already processed
//! 2. re-derive the event from the mined receipt
//! 3. wait for confirmations on the emitting chain
//! 4. re-check processed (a watcher and an API call may race)
//! 5. compute the fee
//! 6. durably mark processed together with a `pending` record
//! 7. submit `mint`/`unlock` and wait for its receipt
//! 8. record the destination tx hash (`completed`)
//!
//! A failure before step 6 leaves no trace and can be retried. A failure after
//! step 6 is never retried automatically: the record turns `stuck` and waits
//! for [`RelayEngine::reconcile`].

use alloy::primitives::TxHash;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::confirmation::ConfirmationGate;
use crate::config::Config;
use crate::fee;
use crate::metrics;
use crate::rpc::{BridgeChain, ReleaseCall, RpcError};
use crate::store::{StateStore, StoreError};
use crate::types::{id_key, Direction, EventId, ProcessedRecord, RecordStatus};
use crate::verifier::{self, VerifyError};
use crate::writers::RelayExecutor;

/// How a failure should be treated by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad request, nothing touched
    InputInvalid,
    /// Receipt missing, reverted or without the event; retry once that changes
    ChainSemantic,
    /// RPC trouble before the processed mark; safe to retry
    Transient,
    /// The event is marked processed but the destination call did not land
    PostCommit,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::InputInvalid => "input_invalid",
            ErrorClass::ChainSemantic => "chain_semantic",
            ErrorClass::Transient => "transient",
            ErrorClass::PostCommit => "post_commit",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Internal => "internal",
        }
    }
}

/// Engine failures
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Verification(#[from] VerifyError),

    #[error("{0}")]
    Rpc(#[from] RpcError),

    #[error("state store failure: {0}")]
    Store(#[from] StoreError),

    #[error("event {event_id} is marked processed but needs manual reconciliation: {reason}")]
    NeedsReconciliation {
        event_id: EventId,
        source_tx_hash: TxHash,
        reason: String,
    },

    #[error("no record for event {0}")]
    RecordNotFound(EventId),

    #[error("record {event_id} is {status}; only stuck records can be reconciled")]
    NotStuck {
        event_id: EventId,
        status: RecordStatus,
    },

    #[error("reconciliation rejected: {0}")]
    ReconcileRejected(String),
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Verification(VerifyError::Rpc(e)) | RelayError::Rpc(e) => {
                if e.is_retryable() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Internal
                }
            }
            RelayError::Verification(_) => ErrorClass::ChainSemantic,
            RelayError::Store(StoreError::DirectionConflict { .. }) => ErrorClass::Conflict,
            RelayError::Store(_) => ErrorClass::Internal,
            RelayError::NeedsReconciliation { .. } => ErrorClass::PostCommit,
            RelayError::RecordNotFound(_) => ErrorClass::NotFound,
            RelayError::NotStuck { .. } => ErrorClass::Conflict,
            RelayError::ReconcileRejected(_) => ErrorClass::InputInvalid,
        }
    }

    /// Whether running the whole pipeline again is safe and may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::ChainSemantic | ErrorClass::Transient)
    }

    /// Label for the relay outcome metric
    fn outcome(&self) -> &'static str {
        match self {
            RelayError::Verification(_) => "verification_failed",
            RelayError::Rpc(_) => "rpc_error",
            RelayError::Store(_) => "store_error",
            RelayError::NeedsReconciliation { .. } => "needs_reconciliation",
            RelayError::RecordNotFound(_)
            | RelayError::NotStuck { .. }
            | RelayError::ReconcileRejected(_) => "reconcile_rejected",
        }
    }
}

/// Successful relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReceipt {
    pub event_id: EventId,
    pub direction: Direction,
    pub source_chain: String,
    pub destination_chain: String,
    pub source_tx_hash: TxHash,
    pub destination_tx_hash: TxHash,
    pub recipient: alloy::primitives::Address,
    /// Decimal strings in the token's smallest unit
    pub gross_amount: String,
    pub fee_amount: String,
    pub net_amount: String,
    pub confirmations: u64,
    pub elapsed_ms: u64,
}

/// Result of [`RelayEngine::process`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelayOutcome {
    Relayed(RelayReceipt),
    AlreadyProcessed {
        #[serde(rename = "eventId")]
        event_id: EventId,
        direction: Direction,
        record: Option<ProcessedRecord>,
    },
}

/// Everything needed to relay one direction
pub struct Route {
    pub direction: Direction,
    /// Chain that emits the event
    pub source: Arc<dyn BridgeChain>,
    pub gate: ConfirmationGate,
    pub required_confirmations: u64,
    /// Executor on the chain that receives the release call
    pub executor: Arc<RelayExecutor>,
}

impl Route {
    pub fn new(
        direction: Direction,
        source: Arc<dyn BridgeChain>,
        average_block_time: Duration,
        required_confirmations: u64,
        executor: Arc<RelayExecutor>,
    ) -> Self {
        Self {
            direction,
            source,
            gate: ConfirmationGate::new(average_block_time),
            required_confirmations,
            executor,
        }
    }

    pub fn destination(&self) -> &Arc<dyn BridgeChain> {
        self.executor.chain()
    }
}

/// Orchestrates verification, gating, fees, submission and bookkeeping
pub struct RelayEngine {
    deposit: Route,
    burn: Route,
    store: Arc<dyn StateStore>,
}

impl RelayEngine {
    pub fn new(deposit: Route, burn: Route, store: Arc<dyn StateStore>) -> Self {
        Self {
            deposit,
            burn,
            store,
        }
    }

    /// Wire both directions between the configured source and destination
    pub fn from_config(
        config: &Config,
        source: Arc<dyn BridgeChain>,
        destination: Arc<dyn BridgeChain>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let mint_executor = Arc::new(RelayExecutor::new(destination.clone()));
        let unlock_executor = Arc::new(RelayExecutor::new(source.clone()));

        let deposit = Route::new(
            Direction::Deposit,
            source,
            config.source.block_time(),
            config.source.confirmations,
            mint_executor,
        );
        let burn = Route::new(
            Direction::Burn,
            destination,
            config.destination.block_time(),
            config.destination.confirmations,
            unlock_executor,
        );
        Self::new(deposit, burn, store)
    }

    pub fn route(&self, direction: Direction) -> &Route {
        match direction {
            Direction::Deposit => &self.deposit,
            Direction::Burn => &self.burn,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Relay the event of `direction` emitted in `tx_hash`.
    ///
    /// `known_id` is the event id when the caller already decoded it from a
    /// log; it enables the cheap pre-check and picks the right log when a
    /// transaction emitted several events.
    pub async fn process(
        &self,
        direction: Direction,
        tx_hash: TxHash,
        known_id: Option<EventId>,
    ) -> Result<RelayOutcome, RelayError> {
        let result = self.run(direction, tx_hash, known_id).await;
        match &result {
            Ok(RelayOutcome::Relayed(_)) => {
                metrics::record_relay_outcome(direction.as_str(), "relayed")
            }
            Ok(RelayOutcome::AlreadyProcessed { .. }) => {
                metrics::record_relay_outcome(direction.as_str(), "already_processed")
            }
            Err(e) => metrics::record_relay_outcome(direction.as_str(), e.outcome()),
        }
        result
    }

    async fn run(
        &self,
        direction: Direction,
        tx_hash: TxHash,
        known_id: Option<EventId>,
    ) -> Result<RelayOutcome, RelayError> {
        let route = self.route(direction);
        let started = Instant::now();

        if let Some(id) = known_id {
            if self.store.is_processed(direction, &id).await {
                return Ok(self.already_processed(direction, id).await);
            }
        }

        let event = verifier::verify(
            route.source.as_ref(),
            route.destination().name(),
            direction,
            tx_hash,
            known_id,
        )
        .await
        .inspect_err(|e| {
            warn!(%direction, %tx_hash, kind = e.kind(), error = %e, "Event verification failed");
        })?;

        if known_id.is_none() && self.store.is_processed(direction, &event.event_id).await {
            return Ok(self.already_processed(direction, event.event_id).await);
        }

        info!(
            %direction,
            event_id = %event.event_id,
            %tx_hash,
            block = event.block_number,
            amount = %event.amount,
            required = route.required_confirmations,
            "Bridge event verified, waiting for confirmations"
        );

        let confirmations = route
            .gate
            .await_confirmations(
                route.source.as_ref(),
                event.block_number,
                route.required_confirmations,
            )
            .await?;

        if self.store.is_processed(direction, &event.event_id).await {
            return Ok(self.already_processed(direction, event.event_id).await);
        }

        let fees = fee::split(event.amount);

        let pending = ProcessedRecord::pending(&event);
        if !self.store.mark_processed(pending.clone()).await? {
            // Lost the race to a concurrent caller between the re-check and the mark
            return Ok(self.already_processed(direction, event.event_id).await);
        }

        let call = ReleaseCall {
            direction,
            recipient: event.destination_address,
            amount: fees.net,
            event_id: event.event_id,
        };

        let destination_tx_hash = match route.executor.execute(&call).await {
            Ok(hash) => hash,
            Err(e) => {
                let reason = format!("{} failed: {}", direction.release_call(), e);
                return Err(self.mark_stuck(&event.event_id, tx_hash, reason).await);
            }
        };

        if let Err(e) = self
            .store
            .put_tx_hashes(pending.completed(destination_tx_hash))
            .await
        {
            // The release landed; only the bookkeeping is missing. The pending
            // record turns stuck on the next start.
            let reason = format!(
                "{} landed in {} but the record could not be written: {}",
                direction.release_call(),
                destination_tx_hash,
                e
            );
            error!(
                %direction,
                event_id = %event.event_id,
                source_tx_hash = %tx_hash,
                %destination_tx_hash,
                needs_reconciliation = true,
                error = %e,
                "Failed to record destination transaction"
            );
            return Err(RelayError::NeedsReconciliation {
                event_id: event.event_id,
                source_tx_hash: tx_hash,
                reason,
            });
        }

        let elapsed = started.elapsed();
        metrics::record_latency(direction.as_str(), elapsed.as_secs_f64());
        info!(
            %direction,
            event_id = %event.event_id,
            source_tx_hash = %tx_hash,
            %destination_tx_hash,
            gross = %fees.gross,
            fee = %fees.fee,
            net = %fees.net,
            elapsed_ms = elapsed.as_millis() as u64,
            "Relay completed"
        );

        Ok(RelayOutcome::Relayed(RelayReceipt {
            event_id: event.event_id,
            direction,
            source_chain: event.source_chain,
            destination_chain: event.destination_chain,
            source_tx_hash: tx_hash,
            destination_tx_hash,
            recipient: event.destination_address,
            gross_amount: fees.gross.to_string(),
            fee_amount: fees.fee.to_string(),
            net_amount: fees.net.to_string(),
            confirmations,
            elapsed_ms: elapsed.as_millis() as u64,
        }))
    }

    async fn already_processed(&self, direction: Direction, event_id: EventId) -> RelayOutcome {
        info!(%direction, %event_id, "Event already processed, skipping");
        RelayOutcome::AlreadyProcessed {
            event_id,
            direction,
            record: self.store.get_tx_hashes(&event_id).await,
        }
    }

    /// Flag a post-commit failure and build the error reported to the caller
    async fn mark_stuck(&self, event_id: &EventId, source_tx_hash: TxHash, reason: String) -> RelayError {
        error!(
            event_id = %event_id,
            %source_tx_hash,
            needs_reconciliation = true,
            reason = %reason,
            "Destination call failed after the event was marked processed"
        );
        if let Err(e) = self.store.mark_stuck(event_id, reason.clone()).await {
            error!(
                event_id = %event_id,
                needs_reconciliation = true,
                error = %e,
                "Failed to persist stuck status; record stays pending until restart"
            );
        }
        RelayError::NeedsReconciliation {
            event_id: *event_id,
            source_tx_hash,
            reason,
        }
    }

    /// Resolve a stuck record with a destination transaction found by an
    /// operator. The transaction must be mined and successful on the chain the
    /// release call targets.
    pub async fn reconcile(
        &self,
        event_id: EventId,
        destination_tx_hash: TxHash,
    ) -> Result<ProcessedRecord, RelayError> {
        let record = self
            .store
            .get_tx_hashes(&event_id)
            .await
            .ok_or(RelayError::RecordNotFound(event_id))?;
        if record.status != RecordStatus::Stuck {
            return Err(RelayError::NotStuck {
                event_id,
                status: record.status,
            });
        }

        let chain = self.route(record.direction).destination();
        let receipt = chain
            .transaction_receipt(destination_tx_hash)
            .await?
            .ok_or_else(|| {
                RelayError::ReconcileRejected(format!(
                    "transaction {} not found on {}",
                    destination_tx_hash,
                    chain.name()
                ))
            })?;
        if !receipt.success {
            return Err(RelayError::ReconcileRejected(format!(
                "transaction {} reverted on {}",
                destination_tx_hash,
                chain.name()
            )));
        }

        let reconciled = self
            .store
            .reconcile(&event_id, destination_tx_hash)
            .await
            .map_err(|e| match e {
                StoreError::UnknownRecord(_) => RelayError::RecordNotFound(event_id),
                StoreError::NotStuck { status, .. } => RelayError::NotStuck { event_id, status },
                other => RelayError::Store(other),
            })?;

        metrics::record_relay_outcome(record.direction.as_str(), "reconciled");
        info!(
            event_id = %id_key(&event_id),
            direction = %record.direction,
            %destination_tx_hash,
            "Stuck record reconciled"
        );
        Ok(reconciled)
    }
}
