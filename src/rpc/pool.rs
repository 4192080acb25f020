//! Ordered RPC endpoint pool with round-robin failover
//!
//! Clients never hold on to an endpoint: every call goes through
//! [`RpcEndpointPool::call`], which reads the active endpoint at call time, so a
//! rotation reconnects every dependent client at once.

use alloy::primitives::TxHash;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::{is_already_known, is_nonce_too_low, RpcError, RpcErrorKind};
use crate::metrics;

/// Transient failures in a row after which the active endpoint counts as dead
const SUSTAINED_FAILURE_THRESHOLD: u32 = 3;

/// Backoff applied between attempts after a failure
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Backoff after the first rotation-class failure
    pub initial: Duration,
    /// Ceiling for the doubling backoff
    pub max: Duration,
    /// Delay before retrying a plain transient failure
    pub retry_delay: Duration,
    /// Attempts per single invocation before the error is surfaced
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            retry_delay: Duration::from_secs(2),
            max_attempts: 4,
        }
    }
}

impl BackoffPolicy {
    /// Backoff for the n-th consecutive failure (1-indexed), doubling up to `max`
    pub fn backoff_for_failure(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay to wait after a failure of the given class
    pub fn delay_for(&self, kind: RpcErrorKind, consecutive_failures: u32) -> Duration {
        if kind.triggers_rotation() {
            self.backoff_for_failure(consecutive_failures)
        } else {
            self.retry_delay
        }
    }
}

/// One candidate endpoint and the client bound to it
#[derive(Debug, Clone)]
pub struct RpcEndpoint<C> {
    pub url: String,
    pub client: C,
}

/// Ordered candidate endpoints for one chain
#[derive(Debug)]
pub struct RpcEndpointPool<C> {
    chain: String,
    endpoints: Vec<RpcEndpoint<C>>,
    active: AtomicUsize,
    consecutive_failures: AtomicU32,
    rotations: AtomicU64,
    policy: BackoffPolicy,
}

impl<C: Clone> RpcEndpointPool<C> {
    /// Create a pool; the first endpoint starts active
    pub fn new(
        chain: impl Into<String>,
        endpoints: Vec<RpcEndpoint<C>>,
        policy: BackoffPolicy,
    ) -> eyre::Result<Self> {
        if endpoints.is_empty() {
            return Err(eyre::eyre!("At least one RPC endpoint is required"));
        }
        Ok(Self {
            chain: chain.into(),
            endpoints,
            active: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            rotations: AtomicU64::new(0),
            policy,
        })
    }

    /// The active endpoint
    pub fn current(&self) -> &RpcEndpoint<C> {
        let idx = self.active.load(Ordering::SeqCst);
        &self.endpoints[idx % self.endpoints.len()]
    }

    /// Index of the active endpoint
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst) % self.endpoints.len()
    }

    /// Total rotations since start
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Advance to the next endpoint (round-robin) and return it
    pub fn rotate(&self) -> &RpcEndpoint<C> {
        let len = self.endpoints.len();
        let previous = self.active.fetch_add(1, Ordering::SeqCst) % len;
        let next = (previous + 1) % len;
        self.rotations.fetch_add(1, Ordering::SeqCst);
        metrics::RPC_ROTATIONS
            .with_label_values(&[self.chain.as_str()])
            .inc();
        warn!(
            chain = %self.chain,
            from = %self.endpoints[previous].url,
            to = %self.endpoints[next].url,
            "Rotated RPC endpoint"
        );
        &self.endpoints[next]
    }

    /// Record a failed call.
    ///
    /// Returns the delay to wait before the next attempt, or `None` when the
    /// failure must propagate immediately (non-retryable errors never rotate
    /// or back off).
    pub fn record_failure(&self, kind: RpcErrorKind) -> Option<Duration> {
        metrics::RPC_ERRORS
            .with_label_values(&[self.chain.as_str(), kind.as_str()])
            .inc();

        if !kind.is_retryable() {
            return None;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if kind.triggers_rotation() || failures % SUSTAINED_FAILURE_THRESHOLD == 0 {
            self.rotate();
        }
        Some(self.policy.delay_for(kind, failures))
    }

    /// Record a successful call, resetting the failure streak
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Run `op` against the active endpoint, rotating and backing off on
    /// retryable failures until `max_attempts` is reached.
    pub async fn call<T, F, Fut>(&self, method: &'static str, mut op: F) -> Result<T, RpcError>
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut attempt = 0u32;
        loop {
            let client = self.current().client.clone();
            match op(client).await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    attempt += 1;
                    let Some(delay) = self.record_failure(err.kind) else {
                        debug!(chain = %self.chain, method, error = %err, "Non-retryable RPC error");
                        return Err(err);
                    };
                    if attempt >= self.policy.max_attempts {
                        warn!(
                            chain = %self.chain,
                            method,
                            attempts = attempt,
                            error = %err,
                            "RPC retries exhausted"
                        );
                        return Err(err);
                    }
                    warn!(
                        chain = %self.chain,
                        method,
                        attempt,
                        max = self.policy.max_attempts,
                        ?delay,
                        endpoint = %self.current().url,
                        error = %err,
                        "Retrying RPC call"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Broadcast one signed transaction, resending the same bytes on retry.
    ///
    /// `send` must push identical raw bytes every time. A node answering
    /// "already known" holds that transaction, so the answer resolves to
    /// `tx_hash`. After a retry "nonce too low" does too: the earlier attempt
    /// may have landed, and the caller's receipt wait settles which it was.
    pub async fn broadcast<F, Fut>(&self, tx_hash: TxHash, mut send: F) -> Result<TxHash, RpcError>
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = Result<(), RpcError>>,
    {
        let mut attempts = 0u32;
        self.call("eth_sendRawTransaction", |client| {
            attempts += 1;
            let retried = attempts > 1;
            let sent = send(client);
            async move {
                match sent.await {
                    Ok(()) => Ok(tx_hash),
                    Err(err) if is_already_known(&err.message) => {
                        debug!(%tx_hash, "Transaction already in the node's pool");
                        Ok(tx_hash)
                    }
                    Err(err) if retried && is_nonce_too_low(&err.message) => {
                        debug!(%tx_hash, "Nonce consumed after a retried broadcast");
                        Ok(tx_hash)
                    }
                    Err(err) => Err(err),
                }
            }
        })
        .await
    }
}
