//! Relay fee
//!
//! A flat 1% is withheld from every relayed amount, using floor division on
//! the raw token units. Amounts below 100 units therefore relay fee-free.

use alloy::primitives::U256;
use serde::Serialize;

/// `fee = gross / FEE_DIVISOR` (1%)
pub const FEE_DIVISOR: u64 = 100;

/// Fee withheld from `gross`
pub fn fee_amount(gross: U256) -> U256 {
    gross / U256::from(FEE_DIVISOR)
}

/// Amount paid out on the other chain
pub fn net_amount(gross: U256) -> U256 {
    // fee <= gross, cannot underflow
    gross - fee_amount(gross)
}

/// Gross, fee and net for one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    pub gross: U256,
    pub fee: U256,
    pub net: U256,
}

pub fn split(gross: U256) -> FeeBreakdown {
    let fee = fee_amount(gross);
    FeeBreakdown {
        gross,
        fee,
        net: gross - fee,
    }
}
