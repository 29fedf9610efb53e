//! Swap tracker
//!
//! The tracker fans in events from every chain watcher and reduces them into
//! one registry of cross-chain swaps. It:
//! 1. Starts every watcher and, on request, replays their history
//! 2. Holds back status updates until every chain has finished replaying
//! 3. Publishes one status update per swap change and forwards operations
//! 4. Routes initiate/redeem/refund calls to the watcher owning a leg

mod reducer;

use reducer::Reducer;

use crate::chain::{ChainWatcher, WatcherSink};
use crate::error::{WatchtowerError, WatchtowerResult};
use crate::events::{ChainType, InitiateArgs, Operation, Wallet};
use crate::swap::{Leg, Swap};

use futures::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default capacity of every tracker queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Replay watcher history on start
    pub restore: bool,
    pub queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            restore: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Outbound queues of a tracker
pub struct TrackerStreams {
    pub status_changed: mpsc::Receiver<Swap>,
    pub operations: mpsc::Receiver<Operation>,
}

/// Reducer state waiting for `start`
struct Pending {
    reducer: Reducer,
    sink: WatcherSink,
}

/// Handle to the swap registry and the chain watchers behind it
pub struct Tracker {
    watchers: HashMap<ChainType, Arc<dyn ChainWatcher>>,
    config: TrackerConfig,
    pending: Mutex<Option<Pending>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl Tracker {
    /// Create a tracker over `watchers`, one per chain type
    pub fn new(
        watchers: Vec<Arc<dyn ChainWatcher>>,
        config: TrackerConfig,
    ) -> WatchtowerResult<(Self, TrackerStreams)> {
        let mut by_chain = HashMap::new();
        for watcher in watchers {
            let chain = watcher.chain_type();
            if by_chain.insert(chain, watcher).is_some() {
                return Err(WatchtowerError::DuplicateChain { chain });
            }
        }

        let capacity = config.queue_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (ops_in_tx, ops_in_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = mpsc::channel(capacity);
        let (ops_out_tx, ops_out_rx) = mpsc::channel(capacity);
        let (stop, stop_rx) = watch::channel(false);

        let reducer = Reducer::new(
            by_chain.len(),
            config.restore,
            events_rx,
            ops_in_rx,
            status_tx,
            ops_out_tx,
            stop_rx,
        );

        let tracker = Self {
            watchers: by_chain,
            config,
            pending: Mutex::new(Some(Pending {
                reducer,
                sink: WatcherSink::new(events_tx, ops_in_tx),
            })),
            task: Mutex::new(None),
            stop,
        };

        let streams = TrackerStreams {
            status_changed: status_rx,
            operations: ops_out_rx,
        };

        Ok((tracker, streams))
    }

    /// Start watchers and the reducer, then replay history if configured
    pub async fn start(&self) -> WatchtowerResult<()> {
        let Pending { reducer, sink } = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(WatchtowerError::AlreadyStarted)?;

        try_join_all(self.watchers.values().map(|w| w.init())).await?;
        try_join_all(self.watchers.values().map(|w| w.run(sink.clone()))).await?;
        // the tracker keeps no sender of its own
        drop(sink);

        *self.task.lock().await = Some(tokio::spawn(reducer.run()));
        info!("Tracker started with {} chains", self.watchers.len());

        if self.config.restore {
            info!("Restoring swap history");
            try_join_all(self.watchers.values().map(|w| w.restore())).await?;
        }

        Ok(())
    }

    /// Stop the reducer, wait for it, then close every watcher
    pub async fn close(&self) -> WatchtowerResult<()> {
        let _ = self.stop.send(true);

        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| WatchtowerError::Internal(format!("tracker task failed: {}", e)))?;
        }

        for result in join_all(self.watchers.values().map(|w| w.close())).await {
            if let Err(e) = result {
                warn!("Failed to close chain watcher: {}", e);
            }
        }

        info!("Tracker stopped");
        Ok(())
    }

    /// Submit a redeem on the chain owning `leg`
    pub async fn redeem(&self, swap: &Swap, leg: &Leg) -> WatchtowerResult<()> {
        let watcher = self.leg_watcher(swap, leg)?;
        let secret = swap
            .secret
            .as_ref()
            .ok_or_else(|| WatchtowerError::MissingSecret {
                hashed_secret: swap.hashed_secret.to_string(),
            })?;

        watcher
            .redeem(&swap.hashed_secret, secret, &leg.contract_address)
            .await
    }

    /// Submit a refund on the chain owning `leg`
    pub async fn refund(&self, swap: &Swap, leg: &Leg) -> WatchtowerResult<()> {
        self.leg_watcher(swap, leg)?
            .refund(&swap.hashed_secret, &leg.contract_address)
            .await
    }

    /// Lock funds in a new HTLC on `chain`
    pub async fn initiate(&self, args: InitiateArgs, chain: ChainType) -> WatchtowerResult<()> {
        self.watcher(chain)?.initiate(args).await
    }

    pub fn wallet(&self, chain: ChainType) -> WatchtowerResult<Wallet> {
        Ok(self.watcher(chain)?.wallet())
    }

    /// Chains with a registered watcher
    pub fn chains(&self) -> Vec<ChainType> {
        let mut chains: Vec<_> = self.watchers.keys().copied().collect();
        chains.sort();
        chains
    }

    fn watcher(&self, chain: ChainType) -> WatchtowerResult<&Arc<dyn ChainWatcher>> {
        self.watchers
            .get(&chain)
            .ok_or(WatchtowerError::UnknownChain { chain })
    }

    fn leg_watcher(&self, swap: &Swap, leg: &Leg) -> WatchtowerResult<&Arc<dyn ChainWatcher>> {
        let chain = leg.chain.ok_or_else(|| WatchtowerError::UnassignedLeg {
            hashed_secret: swap.hashed_secret.to_string(),
        })?;
        self.watcher(chain)
    }
}
