use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::{RelayEngine, RelayError, RelayOutcome};
use crate::metrics;
use crate::rpc::{BackoffPolicy, BridgeChain, RpcError};
use crate::store::{PendingDispatch, StateStore, StoreError};
use crate::types::Direction;
use crate::verifier::{decode_bridge_log, event_topic};

/// Attempts per dispatched event before it is left for the next start
const MAX_DISPATCH_ATTEMPTS: u32 = 30;

/// A finished relay task: the dispatch, which attempt it was, and its result
type RelayResult = (PendingDispatch, u32, Result<RelayOutcome, RelayError>);

/// Result of one scan step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    /// One block was scanned and its events dispatched
    Advanced { block: u64, dispatched: usize },
    /// The cursor is at the chain head
    CaughtUp { head: u64 },
}

#[derive(Debug, thiserror::Error)]
enum ScanError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A dispatched event waiting for its next attempt
struct Retry {
    dispatch: PendingDispatch,
    attempts: u32,
    due: Instant,
}

/// Whether running the relay again may succeed without operator action
fn should_redispatch(error: &RelayError) -> bool {
    error.is_retryable() || matches!(error, RelayError::Store(StoreError::Io(_)))
}

/// Polls one chain for the event of one direction, a block at a time
pub struct EvmWatcher {
    chain: Arc<dyn BridgeChain>,
    direction: Direction,
    engine: Arc<RelayEngine>,
    store: Arc<dyn StateStore>,
    start_block: Option<u64>,
    poll_interval: Duration,
    policy: BackoffPolicy,
}

impl EvmWatcher {
    /// Watch the chain that emits `direction`'s event
    pub fn new(
        engine: Arc<RelayEngine>,
        direction: Direction,
        start_block: Option<u64>,
        poll_interval: Duration,
        policy: BackoffPolicy,
    ) -> Self {
        let route = engine.route(direction);
        let chain = route.source.clone();
        let store = engine.store().clone();

        info!(
            chain = %chain.name(),
            %direction,
            bridge_address = %chain.bridge_address(),
            start_block = ?start_block,
            "EVM watcher created"
        );

        Self {
            chain,
            direction,
            engine,
            store,
            start_block,
            poll_interval,
            policy,
        }
    }

    pub fn chain_name(&self) -> &str {
        self.chain.name()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Run until `shutdown` flips to true, then wait for dispatched relays.
    ///
    /// Events dispatched by an earlier run and never settled are dispatched
    /// again first. Events that fail before commit are retried with backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            chain = %self.chain.name(),
            direction = %self.direction,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting EVM watcher"
        );

        let mut in_flight: JoinSet<RelayResult> = JoinSet::new();
        let mut retries: Vec<Retry> = Vec::new();
        let mut consecutive_failures = 0u32;

        self.resume_pending(&mut in_flight).await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Some(retry) = self.settle(joined).await {
                    retries.push(retry);
                }
            }
            self.dispatch_due(&mut in_flight, &mut retries);

            let delay = match self.scan_next(&mut in_flight).await {
                Ok(ScanStep::Advanced { .. }) => {
                    consecutive_failures = 0;
                    None
                }
                Ok(ScanStep::CaughtUp { .. }) => {
                    consecutive_failures = 0;
                    Some(self.poll_interval)
                }
                Err(ScanError::Rpc(e)) => {
                    consecutive_failures += 1;
                    let delay = self.policy.delay_for(e.kind, consecutive_failures);
                    warn!(
                        chain = %self.chain.name(),
                        direction = %self.direction,
                        kind = %e.kind,
                        consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Watcher RPC error, backing off"
                    );
                    Some(delay)
                }
                Err(ScanError::Store(e)) => {
                    consecutive_failures += 1;
                    error!(
                        chain = %self.chain.name(),
                        direction = %self.direction,
                        error = %e,
                        "Failed to persist block cursor"
                    );
                    Some(self.policy.retry_delay)
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(
            chain = %self.chain.name(),
            direction = %self.direction,
            in_flight = in_flight.len(),
            awaiting_retry = retries.len(),
            "Watcher stopping, waiting for in-flight relays"
        );
        while let Some(joined) = in_flight.join_next().await {
            // Unsettled events stay persisted and resume on the next start
            self.settle(joined).await;
        }
        info!(chain = %self.chain.name(), direction = %self.direction, "Watcher stopped");
    }

    /// Dispatch the events an earlier run recorded but never settled
    async fn resume_pending(&self, in_flight: &mut JoinSet<RelayResult>) {
        let pending = self.store.pending_dispatches(self.direction).await;
        if pending.is_empty() {
            return;
        }
        info!(
            chain = %self.chain.name(),
            direction = %self.direction,
            count = pending.len(),
            "Resuming events dispatched before restart"
        );
        for dispatch in pending {
            self.dispatch(in_flight, dispatch, 1);
        }
    }

    fn dispatch(&self, in_flight: &mut JoinSet<RelayResult>, dispatch: PendingDispatch, attempt: u32) {
        let engine = self.engine.clone();
        in_flight.spawn(async move {
            let result = engine
                .process(dispatch.direction, dispatch.source_tx_hash, Some(dispatch.event_id))
                .await;
            (dispatch, attempt, result)
        });
    }

    fn dispatch_due(&self, in_flight: &mut JoinSet<RelayResult>, retries: &mut Vec<Retry>) {
        let now = Instant::now();
        let (due, waiting): (Vec<Retry>, Vec<Retry>) =
            std::mem::take(retries).into_iter().partition(|r| r.due <= now);
        *retries = waiting;

        for retry in due {
            debug!(
                chain = %self.chain.name(),
                direction = %self.direction,
                event_id = %retry.dispatch.event_id,
                attempt = retry.attempts + 1,
                "Re-dispatching bridge event"
            );
            self.dispatch(in_flight, retry.dispatch, retry.attempts + 1);
        }
    }

    /// Read the cursor, or seed it from the start block or the chain head
    async fn cursor(&self, head: u64) -> Result<u64, ScanError> {
        if let Some(block) = self.store.last_scanned_block(self.chain.name()).await {
            return Ok(block);
        }

        let seed = match self.start_block {
            Some(start) => start.saturating_sub(1),
            None => head,
        };
        self.store
            .set_last_scanned_block(self.chain.name(), seed)
            .await?;
        info!(
            chain = %self.chain.name(),
            direction = %self.direction,
            cursor = seed,
            head,
            "Seeded block cursor"
        );
        Ok(seed)
    }

    /// Scan the block after the cursor, if the head is past it.
    ///
    /// Every decodable bridge log in the block is recorded as a pending
    /// dispatch together with the cursor move, then handed to the engine on
    /// `in_flight`.
    async fn scan_next(&self, in_flight: &mut JoinSet<RelayResult>) -> Result<ScanStep, ScanError> {
        let head = self.chain.block_number().await?;
        let last_scanned = self.cursor(head).await?;
        if head <= last_scanned {
            return Ok(ScanStep::CaughtUp { head });
        }

        let block = last_scanned + 1;
        let logs = self
            .chain
            .bridge_logs(block, event_topic(self.direction))
            .await?;

        let mut dispatches = Vec::new();
        for view in logs {
            let Some(transfer) = decode_bridge_log(self.direction, &view.log) else {
                debug!(
                    chain = %self.chain.name(),
                    block,
                    tx_hash = %view.tx_hash,
                    "Skipping undecodable bridge log"
                );
                continue;
            };

            info!(
                chain = %self.chain.name(),
                direction = %self.direction,
                block,
                tx_hash = %view.tx_hash,
                event_id = %transfer.event_id,
                amount = %transfer.amount,
                "Dispatching bridge event"
            );
            dispatches.push(PendingDispatch {
                direction: self.direction,
                event_id: transfer.event_id,
                source_tx_hash: view.tx_hash,
                block_number: block,
                dispatched_at: Utc::now(),
            });
        }

        // The events become durable in the same write that moves the cursor
        self.store
            .advance_cursor(self.chain.name(), block, dispatches.clone())
            .await?;
        metrics::record_block_scanned(self.chain.name(), block);

        let dispatched = dispatches.len();
        for dispatch in dispatches {
            metrics::record_event_dispatched(self.direction.as_str());
            self.dispatch(in_flight, dispatch, 1);
        }
        if dispatched > 0 {
            debug!(chain = %self.chain.name(), block, dispatched, "Block scanned");
        }

        Ok(ScanStep::Advanced { block, dispatched })
    }

    /// Settle a finished relay task.
    ///
    /// Returns the retry to schedule when the relay failed before commit.
    async fn settle(&self, joined: Result<RelayResult, tokio::task::JoinError>) -> Option<Retry> {
        let (dispatch, attempts, result) = match joined {
            Ok(finished) => finished,
            Err(e) => {
                error!(
                    chain = %self.chain.name(),
                    direction = %self.direction,
                    error = %e,
                    "Relay task panicked"
                );
                return None;
            }
        };

        let error = match result {
            Ok(_) => {
                self.clear(&dispatch).await;
                return None;
            }
            Err(e) => e,
        };

        if !should_redispatch(&error) {
            error!(
                chain = %self.chain.name(),
                direction = %self.direction,
                tx_hash = %dispatch.source_tx_hash,
                event_id = %dispatch.event_id,
                class = error.class().as_str(),
                error = %error,
                "Relay failed"
            );
            self.clear(&dispatch).await;
            return None;
        }

        if attempts >= MAX_DISPATCH_ATTEMPTS {
            error!(
                chain = %self.chain.name(),
                direction = %self.direction,
                tx_hash = %dispatch.source_tx_hash,
                event_id = %dispatch.event_id,
                attempts,
                error = %error,
                "Relay retries exhausted, event stays pending until restart"
            );
            return None;
        }

        let delay = self.policy.backoff_for_failure(attempts);
        warn!(
            chain = %self.chain.name(),
            direction = %self.direction,
            tx_hash = %dispatch.source_tx_hash,
            event_id = %dispatch.event_id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            class = error.class().as_str(),
            error = %error,
            "Relay failed before commit, will retry"
        );
        Some(Retry {
            dispatch,
            attempts,
            due: Instant::now() + delay,
        })
    }

    async fn clear(&self, dispatch: &PendingDispatch) {
        if let Err(e) = self
            .store
            .clear_dispatch(dispatch.direction, &dispatch.event_id)
            .await
        {
            error!(
                chain = %self.chain.name(),
                direction = %self.direction,
                event_id = %dispatch.event_id,
                error = %e,
                "Failed to clear dispatched event"
            );
        }
    }
}
