//! EVM implementation of [`BridgeChain`] on top of alloy HTTP providers
//!
//! Read calls go through the endpoint pool. A release call is signed once with
//! the relayer key, then the same raw bytes are broadcast through the pool so a
//! retry or rotation never produces a second transaction.

use alloy::eips::eip2718::Encodable2718;
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, TxHash, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider, SendableTx};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use alloy::transports::http::reqwest::Url;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::pool::{BackoffPolicy, RpcEndpoint, RpcEndpointPool};
use super::{BridgeChain, LogView, ReceiptView, ReleaseCall, ReleaseReceipt, RpcError, RpcErrorKind};
use crate::config::ChainConfig;
use crate::contracts::evm_bridge::BridgeContract;
use crate::types::Direction;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP endpoint: the parsed URL (for signing providers) and a read provider
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    url: Url,
    provider: RootProvider<Http<Client>>,
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Create alloy HTTP providers for each RPC URL.
pub fn create_endpoints(urls: &[String]) -> Result<Vec<RpcEndpoint<HttpEndpoint>>> {
    if urls.is_empty() {
        return Err(eyre::eyre!("At least one RPC URL is required"));
    }
    urls.iter()
        .map(|url| {
            let parsed: Url = url
                .parse()
                .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
            Ok(RpcEndpoint {
                url: url.clone(),
                client: HttpEndpoint {
                    provider: ProviderBuilder::new().on_http(parsed.clone()),
                    url: parsed,
                },
            })
        })
        .collect()
}

/// Bridge contract on one EVM chain
pub struct EvmBridgeChain {
    name: String,
    bridge_address: Address,
    pool: RpcEndpointPool<HttpEndpoint>,
    signer: PrivateKeySigner,
}

impl EvmBridgeChain {
    /// Create a chain client from its configuration and the relayer key
    pub fn new(config: &ChainConfig, private_key: &str, policy: BackoffPolicy) -> Result<Self> {
        let bridge_address = Address::from_str(&config.bridge_address)
            .wrap_err_with(|| format!("Invalid bridge address for {}", config.name))?;
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
        let endpoints = create_endpoints(&config.rpc_urls)?;
        let pool = RpcEndpointPool::new(config.name.clone(), endpoints, policy)?;

        info!(
            chain = %config.name,
            bridge_address = %bridge_address,
            relayer_address = %signer.address(),
            endpoints = pool.len(),
            "EVM chain client initialized"
        );

        Ok(Self {
            name: config.name.clone(),
            bridge_address,
            pool,
            signer,
        })
    }

    async fn fetch_receipt(&self, tx_hash: TxHash) -> Result<Option<ReceiptView>, RpcError> {
        self.pool
            .call("eth_getTransactionReceipt", |endpoint| async move {
                let receipt = endpoint
                    .provider
                    .get_transaction_receipt(tx_hash)
                    .await
                    .map_err(RpcError::classify)?;

                let Some(receipt) = receipt else {
                    return Ok(None);
                };
                // A receipt without a block is not mined yet
                let Some(block_number) = receipt.block_number else {
                    return Ok(None);
                };

                Ok::<_, RpcError>(Some(ReceiptView {
                    tx_hash: receipt.transaction_hash,
                    block_number,
                    success: receipt.status(),
                    logs: receipt
                        .inner
                        .logs()
                        .iter()
                        .map(|log| log.inner.clone())
                        .collect(),
                }))
            })
            .await
    }

    /// Sign a release transaction once, fixing its nonce, gas and fees
    async fn sign_release(&self, call: ReleaseCall) -> Result<(TxHash, Bytes), RpcError> {
        let input = release_calldata(&call);
        self.pool
            .call("eth_fillTransaction", |endpoint| {
                let wallet = EthereumWallet::from(self.signer.clone());
                let request = TransactionRequest::default()
                    .to(self.bridge_address)
                    .input(input.clone().into());
                async move {
                    // with_recommended_fillers() populates nonce, gas limit and fees
                    let provider = ProviderBuilder::new()
                        .with_recommended_fillers()
                        .wallet(wallet)
                        .on_http(endpoint.url);

                    match provider.fill(request).await.map_err(RpcError::classify)? {
                        SendableTx::Envelope(envelope) => Ok((
                            *envelope.tx_hash(),
                            Bytes::from(envelope.encoded_2718()),
                        )),
                        SendableTx::Builder(_) => Err(RpcError::new(
                            RpcErrorKind::NonRetryable,
                            "wallet filler returned an unsigned release transaction",
                        )),
                    }
                }
            })
            .await
    }

    async fn submit(&self, call: ReleaseCall) -> Result<TxHash, RpcError> {
        let (tx_hash, raw) = self.sign_release(call).await?;
        debug!(chain = %self.name, tx_hash = %tx_hash, "Release transaction signed");

        self.pool
            .broadcast(tx_hash, |endpoint| {
                let raw = raw.clone();
                async move {
                    endpoint
                        .provider
                        .send_raw_transaction(&raw)
                        .await
                        .map(|_| ())
                        .map_err(RpcError::classify)
                }
            })
            .await
    }
}

fn release_calldata(call: &ReleaseCall) -> Bytes {
    match call.direction {
        Direction::Deposit => BridgeContract::mintCall {
            user: call.recipient,
            amount: call.amount,
            depositId: call.event_id,
        }
        .abi_encode(),
        Direction::Burn => BridgeContract::unlockCall {
            user: call.recipient,
            amount: call.amount,
            burnId: call.event_id,
        }
        .abi_encode(),
    }
    .into()
}

#[async_trait]
impl BridgeChain for EvmBridgeChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn bridge_address(&self) -> Address {
        self.bridge_address
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        self.pool
            .call("eth_blockNumber", |endpoint| async move {
                endpoint
                    .provider
                    .get_block_number()
                    .await
                    .map_err(RpcError::classify)
            })
            .await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<ReceiptView>, RpcError> {
        self.fetch_receipt(tx_hash).await
    }

    async fn bridge_logs(&self, block: u64, topic0: B256) -> Result<Vec<LogView>, RpcError> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(topic0)
            .from_block(block)
            .to_block(block);

        self.pool
            .call("eth_getLogs", |endpoint| {
                let filter = filter.clone();
                async move {
                    let logs = endpoint
                        .provider
                        .get_logs(&filter)
                        .await
                        .map_err(RpcError::classify)?;

                    logs.into_iter()
                        .map(|log| {
                            let tx_hash = log.transaction_hash.ok_or_else(|| {
                                RpcError::new(
                                    RpcErrorKind::MissingResponse,
                                    "log is missing its transaction hash",
                                )
                            })?;
                            Ok(LogView {
                                tx_hash,
                                block_number: log.block_number.unwrap_or(block),
                                log: log.inner,
                            })
                        })
                        .collect::<Result<Vec<_>, RpcError>>()
                }
            })
            .await
    }

    async fn send_release(&self, call: &ReleaseCall) -> Result<ReleaseReceipt, RpcError> {
        debug!(
            chain = %self.name,
            call = call.direction.release_call(),
            recipient = %call.recipient,
            amount = %call.amount,
            event_id = %call.event_id,
            "Submitting release call"
        );

        let tx_hash = self.submit(*call).await?;
        info!(
            chain = %self.name,
            tx_hash = %tx_hash,
            "Release transaction sent, waiting for receipt"
        );

        let deadline = Instant::now() + RECEIPT_TIMEOUT;
        loop {
            if let Some(receipt) = self.fetch_receipt(tx_hash).await? {
                return Ok(ReleaseReceipt {
                    tx_hash,
                    success: receipt.success,
                });
            }
            if Instant::now() >= deadline {
                return Err(RpcError::new(
                    RpcErrorKind::Transient,
                    format!(
                        "release transaction {} not mined after {}s",
                        tx_hash,
                        RECEIPT_TIMEOUT.as_secs()
                    ),
                ));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_url() {
        let urls = parse_rpc_urls("https://ethereum-sepolia.publicnode.com");
        assert_eq!(urls, vec!["https://ethereum-sepolia.publicnode.com"]);
    }

    #[test]
    fn test_parse_trims_whitespace_and_ignores_empty() {
        let urls = parse_rpc_urls(" https://a.com , ,https://b.com,");
        assert_eq!(urls, vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(parse_rpc_urls("").is_empty());
    }

    #[test]
    fn test_create_endpoints_multiple() {
        let endpoints = create_endpoints(&[
            "http://localhost:8545".to_string(),
            "http://localhost:8546".to_string(),
        ])
        .unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1].url, "http://localhost:8546");
    }

    #[test]
    fn test_create_endpoints_rejects_bad_input() {
        assert!(create_endpoints(&[]).is_err());
        assert!(create_endpoints(&["not a url".to_string()]).is_err());
    }

    #[test]
    fn test_release_calldata_selects_admin_call() {
        let mint = ReleaseCall {
            direction: Direction::Deposit,
            recipient: Address::repeat_byte(0x42),
            amount: alloy::primitives::U256::from(5u64),
            event_id: B256::repeat_byte(0x01),
        };
        let data = release_calldata(&mint);
        assert_eq!(&data[..4], BridgeContract::mintCall::SELECTOR.as_slice());
        assert_eq!(data.len(), 4 + 32 * 3);

        let unlock = release_calldata(&ReleaseCall {
            direction: Direction::Burn,
            ..mint
        });
        assert_eq!(&unlock[..4], BridgeContract::unlockCall::SELECTOR.as_slice());
        assert_eq!(&unlock[4..], &data[4..]);
    }

    #[test]
    fn test_new_chain_validates_addresses() {
        let mut config = ChainConfig {
            name: "sepolia".to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            bridge_address: "0x0000000000000000000000000000000000000001".to_string(),
            confirmations: 6,
            block_time_ms: 12_000,
            start_block: None,
        };
        let key = "0x0000000000000000000000000000000000000000000000000000000000000001";

        let chain = EvmBridgeChain::new(&config, key, BackoffPolicy::default()).unwrap();
        assert_eq!(chain.name(), "sepolia");
        assert_eq!(chain.bridge_address(), Address::with_last_byte(1));

        assert!(EvmBridgeChain::new(&config, "not-a-key", BackoffPolicy::default()).is_err());

        config.bridge_address = "0x1234".to_string();
        assert!(EvmBridgeChain::new(&config, key, BackoffPolicy::default()).is_err());
    }
}
