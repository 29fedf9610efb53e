//! Chain watcher contract
//!
//! A chain watcher is the adapter between one blockchain and the tracker:
//! it resolves chain identity, subscribes to HTLC contract logs, replays
//! history on request and submits initiate/redeem/refund transactions.
//! Concrete adapters live outside this crate; [`MemoryWatcher`] is the
//! in-process implementation used for dry runs and tests.

pub mod memory;

pub use memory::MemoryWatcher;

use crate::error::{WatchtowerError, WatchtowerResult};
use crate::events::{ChainType, Event, HashedSecret, InitiateArgs, Operation, Secret, Wallet};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Outbound queues a watcher publishes into
///
/// Each watcher receives its own clone from the tracker. Sends wait for
/// capacity when the tracker falls behind; nothing is dropped.
#[derive(Debug, Clone)]
pub struct WatcherSink {
    events: mpsc::Sender<Event>,
    operations: mpsc::Sender<Operation>,
}

impl WatcherSink {
    pub fn new(events: mpsc::Sender<Event>, operations: mpsc::Sender<Operation>) -> Self {
        Self { events, operations }
    }

    /// Publish a swap event
    pub async fn emit(&self, event: Event) -> WatchtowerResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| WatchtowerError::QueueClosed("events"))
    }

    /// Publish an operation status update
    pub async fn report(&self, operation: Operation) -> WatchtowerResult<()> {
        self.operations
            .send(operation)
            .await
            .map_err(|_| WatchtowerError::QueueClosed("operations"))
    }
}

/// Interface every chain adapter satisfies
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    /// Chain family this watcher owns
    fn chain_type(&self) -> ChainType;

    /// One-time chain id and key resolution
    async fn init(&self) -> WatchtowerResult<()>;

    /// Start background subscriptions publishing into `sink`
    async fn run(&self, sink: WatcherSink) -> WatchtowerResult<()>;

    /// Replay historical events in order, then exactly one restored event
    async fn restore(&self) -> WatchtowerResult<()>;

    /// Stop background work and release resources
    async fn close(&self) -> WatchtowerResult<()>;

    async fn initiate(&self, args: InitiateArgs) -> WatchtowerResult<()>;

    async fn redeem(
        &self,
        hashed_secret: &HashedSecret,
        secret: &Secret,
        contract_address: &str,
    ) -> WatchtowerResult<()>;

    async fn refund(
        &self,
        hashed_secret: &HashedSecret,
        contract_address: &str,
    ) -> WatchtowerResult<()>;

    fn wallet(&self) -> Wallet;
}
