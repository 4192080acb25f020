//! Chain access layer
//!
//! Everything the relayer needs from a chain goes through [`BridgeChain`]. The
//! production implementation ([`EvmBridgeChain`]) sits on an
//! [`RpcEndpointPool`] that rotates between candidate RPC URLs when an
//! endpoint starts rate limiting or dropping responses.

use alloy::primitives::{Address, Log, TxHash, B256, U256};
use async_trait::async_trait;
use std::fmt;

use crate::types::{Direction, EventId};

pub mod evm;
pub mod pool;

pub use evm::EvmBridgeChain;
pub use pool::{BackoffPolicy, RpcEndpoint, RpcEndpointPool};

/// Classes of RPC failure, ordered by how the pool reacts to them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Provider is throttling us - rotate immediately
    RateLimited,
    /// Provider answered with nothing where a result was expected - rotate immediately
    MissingResponse,
    /// Timeout, connection reset, 5xx - retry, rotate once failures become sustained
    Transient,
    /// Malformed call, revert, bad key - propagate immediately
    NonRetryable,
}

impl RpcErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcErrorKind::RateLimited => "rate_limited",
            RpcErrorKind::MissingResponse => "missing_response",
            RpcErrorKind::Transient => "transient",
            RpcErrorKind::NonRetryable => "non_retryable",
        }
    }

    /// Whether this failure class moves the pool to the next endpoint right away
    pub fn triggers_rotation(&self) -> bool {
        matches!(self, RpcErrorKind::RateLimited | RpcErrorKind::MissingResponse)
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, RpcErrorKind::NonRetryable)
    }
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An RPC failure with its classification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} RPC error: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error from any displayable failure, classifying by its text
    pub fn classify(err: impl fmt::Display) -> Self {
        let message = err.to_string();
        Self {
            kind: classify_error(&message),
            message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Classify an RPC error message for failover decisions
pub fn classify_error(error: &str) -> RpcErrorKind {
    let error_lower = error.to_lowercase();

    if error_lower.contains("rate limit")
        || error_lower.contains("ratelimit")
        || error_lower.contains("too many requests")
        || error_lower.contains("429")
        || error_lower.contains("-32005")
        || error_lower.contains("limit exceeded")
        || error_lower.contains("exceeded the quota")
    {
        return RpcErrorKind::RateLimited;
    }

    if error_lower.contains("missing response")
        || error_lower.contains("null response")
        || error_lower.contains("empty response")
        || error_lower.contains("no response")
        || error_lower.contains("invalid type: null")
    {
        return RpcErrorKind::MissingResponse;
    }

    if error_lower.contains("revert")
        || error_lower.contains("invalid argument")
        || error_lower.contains("invalid params")
        || error_lower.contains("-32602")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("nonce too low")
        || error_lower.contains("already known")
        || error_lower.contains("abi decode")
    {
        return RpcErrorKind::NonRetryable;
    }

    // Timeouts, resets, 5xx and anything unrecognised: keep the loop alive
    RpcErrorKind::Transient
}

/// Whether a broadcast error means the node already holds this exact transaction
pub fn is_already_known(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    error_lower.contains("already known")
        || error_lower.contains("known transaction")
        || error_lower.contains("already imported")
}

/// Whether a broadcast error means the transaction's nonce is already used
pub fn is_nonce_too_low(error: &str) -> bool {
    error.to_lowercase().contains("nonce too low")
}

/// Mined receipt reduced to what verification needs
#[derive(Debug, Clone)]
pub struct ReceiptView {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    pub logs: Vec<Log>,
}

/// A bridge-contract log found while scanning a block
#[derive(Debug, Clone)]
pub struct LogView {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub log: Log,
}

/// Admin call that completes a relay (`mint` or `unlock`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseCall {
    pub direction: Direction,
    pub recipient: Address,
    pub amount: U256,
    pub event_id: EventId,
}

/// Outcome of a mined release transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseReceipt {
    pub tx_hash: TxHash,
    pub success: bool,
}

/// Read/write access to one chain's bridge contract
#[async_trait]
pub trait BridgeChain: Send + Sync {
    /// Chain label used for cursors and records
    fn name(&self) -> &str;

    /// Address of the bridge contract on this chain
    fn bridge_address(&self) -> Address;

    /// Current chain head
    async fn block_number(&self) -> Result<u64, RpcError>;

    /// Receipt of a mined transaction, `None` if unknown or not yet mined
    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<ReceiptView>, RpcError>;

    /// Bridge-contract logs with the given topic0 in a single block
    async fn bridge_logs(&self, block: u64, topic0: B256) -> Result<Vec<LogView>, RpcError>;

    /// Submit a release call with the relayer key and wait for its receipt
    async fn send_release(&self, call: &ReleaseCall) -> Result<ReleaseReceipt, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_error("HTTP error 429 with body: Too Many Requests"),
            RpcErrorKind::RateLimited
        );
        assert_eq!(
            classify_error("server returned an error response: error code -32005: daily request count exceeded"),
            RpcErrorKind::RateLimited
        );
        assert_eq!(
            classify_error("deserialization error: invalid type: null, expected a string"),
            RpcErrorKind::MissingResponse
        );
        assert_eq!(classify_error("execution reverted: already minted"), RpcErrorKind::NonRetryable);
        assert_eq!(classify_error("nonce too low"), RpcErrorKind::NonRetryable);
        assert_eq!(classify_error("connection timeout"), RpcErrorKind::Transient);
        assert_eq!(classify_error("some unknown error"), RpcErrorKind::Transient);
    }

    #[test]
    fn test_broadcast_error_detection() {
        assert!(is_already_known("already known"));
        assert!(is_already_known("server returned an error response: error code -32000: ALREADY KNOWN"));
        assert!(is_already_known("known transaction: 0xabc"));
        assert!(!is_already_known("nonce too low"));
        assert!(is_nonce_too_low("nonce too low: next nonce 8, tx nonce 7"));
        assert!(!is_nonce_too_low("connection reset"));
    }

    #[test]
    fn test_kind_policy() {
        assert!(RpcErrorKind::RateLimited.triggers_rotation());
        assert!(RpcErrorKind::MissingResponse.triggers_rotation());
        assert!(!RpcErrorKind::Transient.triggers_rotation());
        assert!(!RpcErrorKind::NonRetryable.triggers_rotation());
        assert!(!RpcErrorKind::NonRetryable.is_retryable());
        assert!(RpcErrorKind::Transient.is_retryable());
    }

    #[test]
    fn test_classify_keeps_message() {
        let err = RpcError::classify("rate limit reached");
        assert_eq!(err.kind, RpcErrorKind::RateLimited);
        assert_eq!(err.message, "rate limit reached");
        assert_eq!(err.to_string(), "rate_limited RPC error: rate limit reached");
    }
}
