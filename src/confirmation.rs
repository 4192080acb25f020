//! Confirmation gating
//!
//! The one place where correctness depends on elapsed time: an event is not
//! acted on until its chain has built `required` blocks on top of it.

use std::time::Duration;
use tracing::debug;

use crate::rpc::{BridgeChain, RpcError};

/// Waits for a block to reach a confirmation depth
#[derive(Debug, Clone)]
pub struct ConfirmationGate {
    average_block_time: Duration,
}

impl ConfirmationGate {
    pub fn new(average_block_time: Duration) -> Self {
        Self { average_block_time }
    }

    /// Confirmations of `block_number` at head `current_block`
    pub fn confirmations(current_block: u64, block_number: u64) -> u64 {
        current_block.saturating_sub(block_number)
    }

    /// Block until `chain` is at least `required` blocks past `block_number`.
    ///
    /// Returns the confirmation count that satisfied the gate.
    pub async fn await_confirmations(
        &self,
        chain: &dyn BridgeChain,
        block_number: u64,
        required: u64,
    ) -> Result<u64, RpcError> {
        loop {
            let current_block = chain.block_number().await?;
            let confirmations = Self::confirmations(current_block, block_number);
            if confirmations >= required {
                debug!(
                    chain = %chain.name(),
                    block = block_number,
                    confirmations,
                    required,
                    "Confirmations reached"
                );
                return Ok(confirmations);
            }

            let remaining = required - confirmations;
            let wait = self
                .average_block_time
                .saturating_mul(u32::try_from(remaining).unwrap_or(u32::MAX));
            debug!(
                chain = %chain.name(),
                block = block_number,
                current_block,
                confirmations,
                required,
                wait_ms = wait.as_millis() as u64,
                "Waiting for confirmations"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;

    #[test]
    fn test_confirmation_count() {
        assert_eq!(ConfirmationGate::confirmations(106, 100), 6);
        assert_eq!(ConfirmationGate::confirmations(100, 100), 0);
        // Head behind the event block (lagging endpoint)
        assert_eq!(ConfirmationGate::confirmations(98, 100), 0);
    }

    #[tokio::test]
    async fn test_returns_immediately_when_deep_enough() {
        let chain = MockChain::new("sepolia", 200);
        let gate = ConfirmationGate::new(Duration::from_secs(3600));
        let confirmations = gate.await_confirmations(&chain, 100, 6).await.unwrap();
        assert_eq!(confirmations, 100);
        assert_eq!(chain.block_number_calls(), 1);
    }

    #[tokio::test]
    async fn test_polls_until_threshold() {
        let chain = MockChain::new("sepolia", 101);
        chain.advance_per_poll(1);
        let gate = ConfirmationGate::new(Duration::from_millis(1));

        let confirmations = gate.await_confirmations(&chain, 100, 6).await.unwrap();
        assert_eq!(confirmations, 6);
        // Heads observed: 101, 102, ... 106
        assert_eq!(chain.block_number_calls(), 6);
    }
}
