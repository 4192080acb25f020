//! Destination-side submission
//!
//! One [`RelayExecutor`] per executing chain. The relayer key has a single
//! nonce sequence per chain, so submissions are serialized: the lock is held
//! from signing until the receipt is in.

use alloy::primitives::TxHash;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::rpc::{BridgeChain, ReleaseCall, RpcError};

/// Why a release call did not land
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecuteError {
    #[error("{call} transaction {tx_hash} reverted")]
    Reverted { call: &'static str, tx_hash: TxHash },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Submits `mint`/`unlock` calls with the relayer key
pub struct RelayExecutor {
    chain: Arc<dyn BridgeChain>,
    submit_lock: Mutex<()>,
}

impl RelayExecutor {
    pub fn new(chain: Arc<dyn BridgeChain>) -> Self {
        Self {
            chain,
            submit_lock: Mutex::new(()),
        }
    }

    /// Chain the calls land on
    pub fn chain(&self) -> &Arc<dyn BridgeChain> {
        &self.chain
    }

    /// Submit `call` and wait for its receipt; returns the mined tx hash
    pub async fn execute(&self, call: &ReleaseCall) -> Result<TxHash, ExecuteError> {
        let _guard = self.submit_lock.lock().await;
        let started = Instant::now();

        let receipt = self.chain.send_release(call).await?;
        if !receipt.success {
            warn!(
                chain = %self.chain.name(),
                call = call.direction.release_call(),
                tx_hash = %receipt.tx_hash,
                event_id = %call.event_id,
                "Release transaction reverted"
            );
            return Err(ExecuteError::Reverted {
                call: call.direction.release_call(),
                tx_hash: receipt.tx_hash,
            });
        }

        info!(
            chain = %self.chain.name(),
            call = call.direction.release_call(),
            tx_hash = %receipt.tx_hash,
            event_id = %call.event_id,
            recipient = %call.recipient,
            amount = %call.amount,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Release transaction confirmed"
        );
        Ok(receipt.tx_hash)
    }
}
