//! Contract bindings for the bridge contracts on both chains

pub mod evm_bridge;
