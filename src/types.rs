//! Common types for cross-chain relaying
//!
//! The relayer moves value in two directions between a source chain (lock
//! contract) and a destination chain (wrapped token):
//! - Deposit: `Deposit` event on the source chain -> `mint` on the destination
//! - Burn:    `Burn` event on the destination chain -> `unlock` on the source

use alloy::primitives::{Address, TxHash, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Replay-prevention key carried by every bridge event (depositId / burnId)
pub type EventId = B256;

/// Relay direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Deposit,
    Burn,
}

impl Direction {
    /// Get the direction as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Deposit => "deposit",
            Direction::Burn => "burn",
        }
    }

    /// Name of the event that starts a relay in this direction
    pub fn event_name(&self) -> &'static str {
        match self {
            Direction::Deposit => "Deposit",
            Direction::Burn => "Burn",
        }
    }

    /// Name of the admin call that completes a relay in this direction
    pub fn release_call(&self) -> &'static str {
        match self {
            Direction::Deposit => "mint",
            Direction::Burn => "unlock",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bridge event re-derived from a mined, successful receipt.
///
/// Only the verifier constructs these; watcher logs are treated as hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    pub direction: Direction,
    pub event_id: EventId,
    pub user: Address,
    pub destination_address: Address,
    /// Chain label the user wrote into the event
    pub requested_chain: String,
    pub amount: U256,
    pub source_chain: String,
    pub destination_chain: String,
    pub source_tx_hash: TxHash,
    pub block_number: u64,
}

/// Lifecycle of a processed record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Marked processed, destination call not yet confirmed
    Pending,
    /// Destination call confirmed
    Completed,
    /// Destination call failed or was interrupted after the processed mark
    Stuck,
    /// Stuck record resolved by an operator
    Reconciled,
}

impl RecordStatus {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Completed => "completed",
            RecordStatus::Stuck => "stuck",
            RecordStatus::Reconciled => "reconciled",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Correlation between a source event and its destination transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecord {
    pub event_id: EventId,
    pub direction: Direction,
    pub source_tx_hash: TxHash,
    pub destination_tx_hash: Option<TxHash>,
    pub source_chain: String,
    pub destination_chain: String,
    pub recorded_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ProcessedRecord {
    /// Record written together with the processed mark, before submission
    pub fn pending(event: &BridgeEvent) -> Self {
        Self {
            event_id: event.event_id,
            direction: event.direction,
            source_tx_hash: event.source_tx_hash,
            destination_tx_hash: None,
            source_chain: event.source_chain.clone(),
            destination_chain: event.destination_chain.clone(),
            recorded_at: Utc::now(),
            status: RecordStatus::Pending,
            failure_reason: None,
        }
    }

    /// Copy of this record with the destination transaction confirmed
    pub fn completed(&self, destination_tx_hash: TxHash) -> Self {
        Self {
            destination_tx_hash: Some(destination_tx_hash),
            recorded_at: Utc::now(),
            status: RecordStatus::Completed,
            failure_reason: None,
            ..self.clone()
        }
    }
}

/// Canonical string key for an id: `0x` + 64 lowercase hex chars
pub fn id_key(id: &B256) -> String {
    format!("0x{}", hex::encode(id.as_slice()))
}

/// Strictly parse a 32-byte hash (`0x` followed by exactly 64 hex chars)
pub fn parse_hash32(raw: &str) -> Result<B256, String> {
    let hex_part = raw
        .strip_prefix("0x")
        .ok_or_else(|| format!("hash must start with 0x: {raw:?}"))?;
    if hex_part.len() != 64 {
        return Err(format!(
            "hash must have 64 hex characters, got {}",
            hex_part.len()
        ));
    }
    let bytes = hex::decode(hex_part).map_err(|e| format!("hash is not valid hex: {e}"))?;
    Ok(B256::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_names() {
        assert_eq!(Direction::Deposit.as_str(), "deposit");
        assert_eq!(Direction::Burn.as_str(), "burn");
        assert_eq!(Direction::Deposit.event_name(), "Deposit");
        assert_eq!(Direction::Burn.release_call(), "unlock");
        assert_eq!(format!("{}", Direction::Burn), "burn");
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(RecordStatus::Pending.as_str(), "pending");
        assert_eq!(RecordStatus::Completed.as_str(), "completed");
        assert_eq!(RecordStatus::Stuck.as_str(), "stuck");
        assert_eq!(RecordStatus::Reconciled.as_str(), "reconciled");
    }

    #[test]
    fn test_parse_hash32_accepts_canonical() {
        let raw = format!("0x{}", "ab".repeat(32));
        let hash = parse_hash32(&raw).unwrap();
        assert_eq!(hash, B256::repeat_byte(0xab));
        assert_eq!(id_key(&hash), raw);
    }

    #[test]
    fn test_parse_hash32_rejects_malformed() {
        assert!(parse_hash32(&"ab".repeat(32)).is_err(), "missing prefix");
        assert!(parse_hash32("0x1234").is_err(), "too short");
        assert!(parse_hash32(&format!("0x{}", "zz".repeat(32))).is_err(), "not hex");
        assert!(parse_hash32(&format!("0x{}00", "ab".repeat(32))).is_err(), "too long");
        assert!(parse_hash32("{\"txHash\":\"0x12\"}").is_err());
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = ProcessedRecord {
            event_id: B256::repeat_byte(1),
            direction: Direction::Deposit,
            source_tx_hash: B256::repeat_byte(2),
            destination_tx_hash: None,
            source_chain: "sepolia".to_string(),
            destination_chain: "bsc-testnet".to_string(),
            recorded_at: Utc::now(),
            status: RecordStatus::Pending,
            failure_reason: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["direction"], "deposit");
        assert_eq!(json["status"], "pending");
        assert!(json["destinationTxHash"].is_null());
        assert!(json.get("failureReason").is_none());
        assert!(json["eventId"].as_str().unwrap().starts_with("0x"));

        let back: ProcessedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
