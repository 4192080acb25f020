//! Scripted in-memory chain for unit tests

use alloy::primitives::{keccak256, Address, Log, TxHash, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::contracts::evm_bridge::BridgeContract;
use crate::rpc::{
    BackoffPolicy, BridgeChain, LogView, ReceiptView, ReleaseCall, ReleaseReceipt, RpcEndpoint,
    RpcEndpointPool, RpcError, RpcErrorKind,
};

/// Recipient written into every mock event
pub const MOCK_RECIPIENT: Address = Address::repeat_byte(0x42);

/// Fresh state file path inside a temp dir; the dir is removed when dropped
pub fn temp_state(name: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::Builder::new()
        .prefix(&format!("bridge-relayer-{}-", name))
        .tempdir()
        .expect("create temp dir");
    let path = dir.path().join("relayer-state.json");
    (dir, path)
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while !condition().await {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn deposit_log(bridge: Address, deposit_id: B256, amount: U256) -> Log {
    let event = BridgeContract::Deposit {
        user: Address::repeat_byte(0x01),
        amount,
        depositId: deposit_id,
        destinationChain: "bsc-testnet".to_string(),
        destinationAddress: MOCK_RECIPIENT,
    };
    Log {
        address: bridge,
        data: event.encode_log_data(),
    }
}

pub fn burn_log(bridge: Address, burn_id: B256, amount: U256) -> Log {
    let event = BridgeContract::Burn {
        user: Address::repeat_byte(0x02),
        amount,
        burnId: burn_id,
        destinationChain: "sepolia".to_string(),
        destinationAddress: MOCK_RECIPIENT,
    };
    Log {
        address: bridge,
        data: event.encode_log_data(),
    }
}

/// A release call as the mock chain saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub call: ReleaseCall,
    pub tx_hash: TxHash,
    /// Chain head when the call was submitted
    pub head_at_submission: u64,
}

#[derive(Default)]
struct MockState {
    head: u64,
    advance_per_poll: u64,
    receipts: HashMap<TxHash, ReceiptView>,
    logs: Vec<LogView>,
    scripted_failures: VecDeque<RpcErrorKind>,
    log_failure: Option<RpcErrorKind>,
    release_failure: Option<RpcErrorKind>,
    revert_releases: bool,
    release_delay: Duration,
    lost_broadcast_responses: usize,
    hidden_receipts: HashMap<TxHash, ReceiptView>,
    submissions: Vec<Submission>,
}

/// In-memory [`BridgeChain`].
///
/// Reads and release broadcasts go through a two-endpoint [`RpcEndpointPool`]
/// so scripted failures exercise the same rotation and retry path as the real
/// client.
pub struct MockChain {
    name: String,
    bridge_address: Address,
    pool: RpcEndpointPool<usize>,
    state: Mutex<MockState>,
    block_number_calls: AtomicUsize,
    receipt_calls: AtomicUsize,
    active_releases: AtomicUsize,
    max_concurrent_releases: AtomicUsize,
    nonce: AtomicU64,
}

impl MockChain {
    pub fn new(name: &str, head: u64) -> Self {
        let endpoints = vec![
            RpcEndpoint {
                url: format!("mock://{}/primary", name),
                client: 0,
            },
            RpcEndpoint {
                url: format!("mock://{}/secondary", name),
                client: 1,
            },
        ];
        let policy = BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            retry_delay: Duration::from_millis(1),
            max_attempts: 4,
        };
        let pool = RpcEndpointPool::new(name, endpoints, policy).expect("two endpoints");

        Self {
            name: name.to_string(),
            bridge_address: Address::from_slice(&keccak256(name.as_bytes())[12..]),
            pool,
            state: Mutex::new(MockState {
                head,
                ..Default::default()
            }),
            block_number_calls: AtomicUsize::new(0),
            receipt_calls: AtomicUsize::new(0),
            active_releases: AtomicUsize::new(0),
            max_concurrent_releases: AtomicUsize::new(0),
            nonce: AtomicU64::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Pop one scripted failure, if any
    fn scripted(&self) -> Result<(), RpcError> {
        match self.state().scripted_failures.pop_front() {
            Some(kind) => Err(RpcError::new(kind, format!("scripted {} failure", kind))),
            None => Ok(()),
        }
    }

    pub fn head(&self) -> u64 {
        self.state().head
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    /// Grow the head by `blocks` after every `block_number` answer
    pub fn advance_per_poll(&self, blocks: u64) {
        self.state().advance_per_poll = blocks;
    }

    /// Fail the next `count` RPC attempts with `kind`
    pub fn fail_next(&self, kind: RpcErrorKind, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state.scripted_failures.push_back(kind);
        }
    }

    /// Make every `bridge_logs` attempt fail with `kind` until cleared
    pub fn fail_logs(&self, kind: Option<RpcErrorKind>) {
        self.state().log_failure = kind;
    }

    /// Make release submissions fail with `kind` until cleared
    pub fn fail_releases(&self, kind: Option<RpcErrorKind>) {
        self.state().release_failure = kind;
    }

    /// Mine release transactions with a failed status
    pub fn revert_releases(&self, revert: bool) {
        self.state().revert_releases = revert;
    }

    pub fn set_release_delay(&self, delay: Duration) {
        self.state().release_delay = delay;
    }

    pub fn add_receipt(&self, tx_hash: TxHash, block: u64, success: bool, logs: Vec<Log>) {
        self.state().receipts.insert(
            tx_hash,
            ReceiptView {
                tx_hash,
                block_number: block,
                success,
                logs,
            },
        );
    }

    /// Accept the next `count` broadcasts but drop the node's response
    pub fn lose_broadcast_responses(&self, count: usize) {
        self.state().lost_broadcast_responses = count;
    }

    /// Make a known transaction look unmined until [`Self::restore_receipt`]
    pub fn hide_receipt(&self, tx_hash: TxHash) {
        let mut state = self.state();
        if let Some(receipt) = state.receipts.remove(&tx_hash) {
            state.hidden_receipts.insert(tx_hash, receipt);
        }
    }

    pub fn restore_receipt(&self, tx_hash: TxHash) {
        let mut state = self.state();
        if let Some(receipt) = state.hidden_receipts.remove(&tx_hash) {
            state.receipts.insert(tx_hash, receipt);
        }
    }

    pub fn add_reverted(&self, tx_hash: TxHash, block: u64) {
        self.add_receipt(tx_hash, block, false, vec![]);
    }

    /// Successful transaction emitting one bridge log, visible to scans too
    fn add_bridge_log(&self, tx_hash: TxHash, block: u64, log: Log) {
        self.add_receipt(tx_hash, block, true, vec![log.clone()]);
        self.state().logs.push(LogView {
            tx_hash,
            block_number: block,
            log,
        });
    }

    pub fn add_deposit(&self, tx_hash: TxHash, block: u64, deposit_id: B256, amount: U256) {
        self.add_bridge_log(tx_hash, block, deposit_log(self.bridge_address, deposit_id, amount));
    }

    pub fn add_burn(&self, tx_hash: TxHash, block: u64, burn_id: B256, amount: U256) {
        self.add_bridge_log(tx_hash, block, burn_log(self.bridge_address, burn_id, amount));
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn rotations(&self) -> u64 {
        self.pool.rotations()
    }

    pub fn block_number_calls(&self) -> usize {
        self.block_number_calls.load(Ordering::SeqCst)
    }

    pub fn receipt_calls(&self) -> usize {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_releases(&self) -> usize {
        self.max_concurrent_releases.load(Ordering::SeqCst)
    }

    /// Hash of a freshly signed release: one nonce per signature
    fn sign_release(&self, call: &ReleaseCall) -> TxHash {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut preimage = call.event_id.to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        keccak256(&preimage)
    }

    /// One node answering `eth_sendRawTransaction` for a signed release
    fn accept_release(&self, call: &ReleaseCall, tx_hash: TxHash) -> Result<(), RpcError> {
        let mut state = self.state();
        if let Some(kind) = state.release_failure {
            return Err(RpcError::new(kind, "scripted release failure"));
        }
        if state.submissions.iter().any(|s| s.tx_hash == tx_hash) {
            return Err(RpcError::classify("already known"));
        }

        let success = !state.revert_releases;
        let head = state.head;
        state.receipts.insert(
            tx_hash,
            ReceiptView {
                tx_hash,
                block_number: head,
                success,
                logs: vec![],
            },
        );
        state.submissions.push(Submission {
            call: *call,
            tx_hash,
            head_at_submission: head,
        });

        if state.lost_broadcast_responses > 0 {
            state.lost_broadcast_responses -= 1;
            return Err(RpcError::new(
                RpcErrorKind::Transient,
                "connection reset before response",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeChain for MockChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn bridge_address(&self) -> Address {
        self.bridge_address
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        self.pool
            .call("eth_blockNumber", |_| {
                std::future::ready(self.scripted().map(|()| {
                    self.block_number_calls.fetch_add(1, Ordering::SeqCst);
                    let mut state = self.state();
                    let head = state.head;
                    state.head += state.advance_per_poll;
                    head
                }))
            })
            .await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<ReceiptView>, RpcError> {
        self.pool
            .call("eth_getTransactionReceipt", |_| {
                std::future::ready(self.scripted().map(|()| {
                    self.receipt_calls.fetch_add(1, Ordering::SeqCst);
                    self.state().receipts.get(&tx_hash).cloned()
                }))
            })
            .await
    }

    async fn bridge_logs(&self, block: u64, topic0: B256) -> Result<Vec<LogView>, RpcError> {
        self.pool
            .call("eth_getLogs", |_| {
                std::future::ready(self.scripted().and_then(|()| {
                    let state = self.state();
                    if let Some(kind) = state.log_failure {
                        return Err(RpcError::new(kind, "scripted getLogs failure"));
                    }
                    Ok(state
                        .logs
                        .iter()
                        .filter(|view| {
                            view.block_number == block
                                && view.log.address == self.bridge_address
                                && view.log.topics().first() == Some(&topic0)
                        })
                        .cloned()
                        .collect())
                }))
            })
            .await
    }

    async fn send_release(&self, call: &ReleaseCall) -> Result<ReleaseReceipt, RpcError> {
        let active = self.active_releases.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_releases
            .fetch_max(active, Ordering::SeqCst);

        let delay = self.state().release_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let tx_hash = self.sign_release(call);
        let result = self
            .pool
            .broadcast(tx_hash, |_| std::future::ready(self.accept_release(call, tx_hash)))
            .await
            .map(|tx_hash| {
                let success = self
                    .state()
                    .receipts
                    .get(&tx_hash)
                    .map(|receipt| receipt.success)
                    .unwrap_or(false);
                ReleaseReceipt { tx_hash, success }
            });

        self.active_releases.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
