//! Event verification
//!
//! A bridge event is only ever built from a mined, successful receipt fetched
//! fresh from the chain that emitted it. Watcher logs and HTTP triggers are
//! treated as hints that point at a transaction hash; the receipt is the
//! source of truth.

use alloy::primitives::{Address, Log, TxHash, B256, U256};
use alloy::sol_types::SolEvent;
use tracing::debug;

use crate::contracts::evm_bridge::BridgeContract;
use crate::rpc::{BridgeChain, RpcError};
use crate::types::{BridgeEvent, Direction, EventId};

/// Why a transaction could not be turned into a bridge event
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    #[error("receipt not found for {0} (unknown or not yet mined)")]
    ReceiptNotFound(TxHash),

    #[error("transaction {0} reverted")]
    TransactionReverted(TxHash),

    #[error("no {event} event from the bridge contract in transaction {tx_hash}")]
    EventNotFound { tx_hash: TxHash, event: &'static str },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl VerifyError {
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::ReceiptNotFound(_) => "ReceiptNotFound",
            VerifyError::TransactionReverted(_) => "TransactionReverted",
            VerifyError::EventNotFound { .. } => "EventNotFound",
            VerifyError::Rpc(_) => "Rpc",
        }
    }
}

/// Fields common to `Deposit` and `Burn`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub event_id: EventId,
    pub user: Address,
    pub amount: U256,
    pub requested_chain: String,
    pub destination_address: Address,
}

/// topic0 of the event that starts a relay in `direction`
pub fn event_topic(direction: Direction) -> B256 {
    match direction {
        Direction::Deposit => BridgeContract::Deposit::SIGNATURE_HASH,
        Direction::Burn => BridgeContract::Burn::SIGNATURE_HASH,
    }
}

/// Decode `log` as the event of `direction`; `None` if it is anything else
pub fn decode_bridge_log(direction: Direction, log: &Log) -> Option<DecodedTransfer> {
    match direction {
        Direction::Deposit => BridgeContract::Deposit::decode_log_data(&log.data, true)
            .ok()
            .map(|event| DecodedTransfer {
                event_id: event.depositId,
                user: event.user,
                amount: event.amount,
                requested_chain: event.destinationChain,
                destination_address: event.destinationAddress,
            }),
        Direction::Burn => BridgeContract::Burn::decode_log_data(&log.data, true)
            .ok()
            .map(|event| DecodedTransfer {
                event_id: event.burnId,
                user: event.user,
                amount: event.amount,
                requested_chain: event.destinationChain,
                destination_address: event.destinationAddress,
            }),
    }
}

/// Re-derive the bridge event of `direction` from the receipt of `tx_hash`.
///
/// Only logs emitted by `source`'s bridge contract are considered. When
/// `expected_id` is given (watcher path) the log carrying that id is selected,
/// otherwise the first matching log wins.
pub async fn verify(
    source: &dyn BridgeChain,
    destination_chain: &str,
    direction: Direction,
    tx_hash: TxHash,
    expected_id: Option<EventId>,
) -> Result<BridgeEvent, VerifyError> {
    let receipt = source
        .transaction_receipt(tx_hash)
        .await?
        .ok_or(VerifyError::ReceiptNotFound(tx_hash))?;

    if !receipt.success {
        return Err(VerifyError::TransactionReverted(tx_hash));
    }

    let bridge = source.bridge_address();
    let decoded = receipt
        .logs
        .iter()
        .filter(|log| log.address == bridge)
        .filter_map(|log| decode_bridge_log(direction, log))
        .find(|transfer| expected_id.map_or(true, |id| transfer.event_id == id))
        .ok_or(VerifyError::EventNotFound {
            tx_hash,
            event: direction.event_name(),
        })?;

    debug!(
        chain = %source.name(),
        %direction,
        %tx_hash,
        event_id = %decoded.event_id,
        amount = %decoded.amount,
        block = receipt.block_number,
        "Verified bridge event from receipt"
    );

    Ok(BridgeEvent {
        direction,
        event_id: decoded.event_id,
        user: decoded.user,
        destination_address: decoded.destination_address,
        requested_chain: decoded.requested_chain,
        amount: decoded.amount,
        source_chain: source.name().to_string(),
        destination_chain: destination_chain.to_string(),
        source_tx_hash: tx_hash,
        block_number: receipt.block_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcErrorKind;
    use crate::test_utils::{burn_log, deposit_log, MockChain};

    fn tx(byte: u8) -> TxHash {
        B256::repeat_byte(byte)
    }

    #[tokio::test]
    async fn test_verifies_deposit_from_receipt() {
        let chain = MockChain::new("sepolia", 100);
        let id = B256::repeat_byte(0x11);
        chain.add_deposit(tx(1), 95, id, U256::from(100_000_000u64));

        let event = verify(&chain, "bsc-testnet", Direction::Deposit, tx(1), None)
            .await
            .unwrap();
        assert_eq!(event.event_id, id);
        assert_eq!(event.amount, U256::from(100_000_000u64));
        assert_eq!(event.block_number, 95);
        assert_eq!(event.source_chain, "sepolia");
        assert_eq!(event.destination_chain, "bsc-testnet");
        assert_eq!(event.requested_chain, "bsc-testnet");
        assert_eq!(event.source_tx_hash, tx(1));
    }

    #[tokio::test]
    async fn test_receipt_not_found() {
        let chain = MockChain::new("sepolia", 100);
        let err = verify(&chain, "bsc-testnet", Direction::Deposit, tx(9), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::ReceiptNotFound(h) if h == tx(9)));
    }

    #[tokio::test]
    async fn test_reverted_transaction() {
        let chain = MockChain::new("sepolia", 100);
        chain.add_reverted(tx(2), 90);
        let err = verify(&chain, "bsc-testnet", Direction::Deposit, tx(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::TransactionReverted(_)));
    }

    #[tokio::test]
    async fn test_wrong_event_kind_is_not_found() {
        let chain = MockChain::new("bsc-testnet", 100);
        chain.add_burn(tx(3), 90, B256::repeat_byte(0x22), U256::from(5000u64));
        let err = verify(&chain, "sepolia", Direction::Deposit, tx(3), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::EventNotFound { event: "Deposit", .. }));

        assert!(verify(&chain, "sepolia", Direction::Burn, tx(3), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_logs_from_other_contracts_are_ignored() {
        let chain = MockChain::new("sepolia", 100);
        let spoofed = deposit_log(
            Address::repeat_byte(0xee),
            B256::repeat_byte(0x33),
            U256::from(1u64),
        );
        chain.add_receipt(tx(4), 90, true, vec![spoofed]);
        let err = verify(&chain, "bsc-testnet", Direction::Deposit, tx(4), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::EventNotFound { .. }));
    }

    #[tokio::test]
    async fn test_expected_id_selects_matching_log() {
        let chain = MockChain::new("bsc-testnet", 100);
        let bridge = chain.bridge_address();
        let first = B256::repeat_byte(0x01);
        let second = B256::repeat_byte(0x02);
        chain.add_receipt(
            tx(5),
            80,
            true,
            vec![
                burn_log(bridge, first, U256::from(10u64)),
                burn_log(bridge, second, U256::from(20u64)),
            ],
        );

        let event = verify(&chain, "sepolia", Direction::Burn, tx(5), Some(second))
            .await
            .unwrap();
        assert_eq!(event.event_id, second);
        assert_eq!(event.amount, U256::from(20u64));

        let event = verify(&chain, "sepolia", Direction::Burn, tx(5), None)
            .await
            .unwrap();
        assert_eq!(event.event_id, first);
    }

    #[tokio::test]
    async fn test_rpc_error_propagates() {
        let chain = MockChain::new("sepolia", 100);
        chain.fail_next(RpcErrorKind::NonRetryable, 1);
        let err = verify(&chain, "bsc-testnet", Direction::Deposit, tx(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Rpc(_)));
    }

    #[test]
    fn test_event_topics_differ() {
        assert_ne!(event_topic(Direction::Deposit), event_topic(Direction::Burn));
    }
}
