//! Two-chain bridge relayer
//!
//! Watches `Deposit` events on the source chain and `Burn` events on the
//! destination chain, verifies each one against its transaction receipt, waits
//! for finality and submits the matching `mint` or `unlock` call on the other
//! side. Every event is relayed at most once; processed ids and the per-chain
//! scan cursors live in a JSON state file that survives restarts.

pub mod api;
pub mod config;
pub mod confirmation;
pub mod contracts;
pub mod engine;
pub mod fee;
pub mod metrics;
pub mod rpc;
pub mod store;
pub mod types;
pub mod verifier;
pub mod watchers;
pub mod writers;

#[cfg(test)]
mod test_utils;
