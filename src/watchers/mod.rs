use eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::engine::RelayEngine;
use crate::types::Direction;

pub mod evm;

pub use evm::{EvmWatcher, ScanStep};

/// Runs one watcher per direction: deposits on the source chain, burns on
/// the destination chain
pub struct WatcherManager {
    watchers: Vec<EvmWatcher>,
}

impl WatcherManager {
    /// Create a new watcher manager
    pub fn new(config: &Config, engine: Arc<RelayEngine>) -> Self {
        let policy = config.backoff_policy();
        let poll_interval = config.relayer.poll_interval();

        let watchers = vec![
            EvmWatcher::new(
                engine.clone(),
                Direction::Deposit,
                config.source.start_block,
                poll_interval,
                policy.clone(),
            ),
            EvmWatcher::new(
                engine,
                Direction::Burn,
                config.destination.start_block,
                poll_interval,
                policy,
            ),
        ];

        info!(
            watchers = watchers.len(),
            chains = ?watchers.iter().map(|w| w.chain_name().to_string()).collect::<Vec<_>>(),
            "Watcher manager created"
        );
        Self { watchers }
    }

    /// Run all watchers until shutdown.
    ///
    /// Returns once every watcher has stopped and drained its in-flight
    /// relays; errors only if a watcher task panicked.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();
        for watcher in self.watchers {
            let shutdown = shutdown.clone();
            join_set.spawn(async move { watcher.run(shutdown).await });
        }

        let mut panicked = 0;
        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!("A watcher task panicked: {:?}", e);
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(eyre::eyre!("{} watcher task(s) panicked", panicked));
        }
        info!("All watchers stopped");
        Ok(())
    }
}
