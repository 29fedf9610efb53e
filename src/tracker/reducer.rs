//! Single-writer reducer owning the swap registry

use crate::events::{ChainType, Event, HashedSecret, Operation};
use crate::swap::Swap;

use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct Reducer {
    swaps: HashMap<HashedSecret, Swap>,
    /// Hashed secrets of swaps that already reached a final status
    finished: HashSet<HashedSecret>,
    /// Chains that signalled the end of their replay
    restored: HashSet<ChainType>,
    chain_count: usize,
    synced: bool,
    events: mpsc::Receiver<Event>,
    operations: mpsc::Receiver<Operation>,
    status_tx: mpsc::Sender<Swap>,
    operations_tx: mpsc::Sender<Operation>,
    stop: watch::Receiver<bool>,
}

impl Reducer {
    pub fn new(
        chain_count: usize,
        restore: bool,
        events: mpsc::Receiver<Event>,
        operations: mpsc::Receiver<Operation>,
        status_tx: mpsc::Sender<Swap>,
        operations_tx: mpsc::Sender<Operation>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            swaps: HashMap::new(),
            finished: HashSet::new(),
            restored: HashSet::new(),
            chain_count,
            synced: !restore,
            events,
            operations,
            status_tx,
            operations_tx,
            stop,
        }
    }

    pub async fn run(mut self) {
        info!("Tracker reducer started (synced: {})", self.synced);

        loop {
            tokio::select! {
                biased;

                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                }

                Some(event) = self.events.recv() => {
                    self.on_event(event).await;
                }

                Some(operation) = self.operations.recv() => {
                    self.forward(operation).await;
                }
            }
        }

        info!("Tracker reducer stopped with {} swaps", self.swaps.len());
    }

    async fn on_event(&mut self, event: Event) {
        crate::metrics::record_event(event.chain(), event.name());

        let Some(hashed_secret) = event.hashed_secret().cloned() else {
            if let Event::Restored(restored) = &event {
                self.on_restored(restored.chain).await;
            }
            return;
        };

        if self.finished.contains(&hashed_secret) {
            debug!("Ignoring {} for finished swap {}", event.name(), hashed_secret);
            return;
        }

        let before = self
            .swaps
            .remove(&hashed_secret)
            .unwrap_or_else(|| Swap::new(hashed_secret.clone()));
        let after = before.clone().apply(&event);

        if after != before {
            debug!(
                "Swap {} {} -> {} on {} {}",
                hashed_secret,
                before.status,
                after.status,
                event.chain(),
                event.name()
            );
            if self.synced {
                self.emit(after.clone()).await;
            }
        }

        if after.is_finished() {
            self.finished.insert(hashed_secret);
            crate::metrics::record_tombstoned_swaps("tracker", self.finished.len());
        } else {
            self.swaps.insert(hashed_secret, after);
        }
        crate::metrics::record_tracked_swaps(self.swaps.len());
    }

    async fn on_restored(&mut self, chain: ChainType) {
        if self.synced {
            debug!("Chain {} restored after sync, ignoring", chain);
            return;
        }

        if !self.restored.insert(chain) {
            warn!("Chain {} signalled restore more than once", chain);
            return;
        }
        info!(
            "Chain {} restored ({}/{})",
            chain,
            self.restored.len(),
            self.chain_count
        );

        if self.restored.len() >= self.chain_count {
            self.synced = true;
            info!("All chains restored, publishing {} swaps", self.swaps.len());

            let snapshot: Vec<Swap> = self.swaps.values().cloned().collect();
            for swap in snapshot {
                self.emit(swap).await;
            }
        }
    }

    async fn emit(&self, swap: Swap) {
        if self.status_tx.send(swap).await.is_err() {
            warn!("Status queue closed, dropping update");
            return;
        }
        crate::metrics::record_status_update();
    }

    async fn forward(&self, operation: Operation) {
        debug!(
            "Operation {} on {} is {:?}",
            operation.hash, operation.chain, operation.status
        );
        if self.operations_tx.send(operation).await.is_err() {
            warn!("Operation queue closed, dropping update");
        }
    }

    /// Process everything currently queued without waiting for more
    #[cfg(test)]
    pub async fn drain(&mut self) {
        loop {
            if let Ok(event) = self.events.try_recv() {
                self.on_event(event).await;
            } else if let Ok(operation) = self.operations.try_recv() {
                self.forward(operation).await;
            } else {
                break;
            }
        }
    }
}
