//! Cross-chain HTLC swap tracking and watch-tower automation
//!
//! Chain watchers publish contract events, the [`Tracker`] folds them into
//! per-swap state and the [`WatchTower`] redeems or refunds on the
//! participant's behalf.

pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod swap;
pub mod tracker;
pub mod watchtower;

pub use chain::{ChainWatcher, MemoryWatcher, WatcherSink};
pub use error::{WatchtowerError, WatchtowerResult};
pub use events::{ChainType, Event, HashedSecret, Operation, OperationStatus, Secret};
pub use swap::{Leg, Status, Swap};
pub use tracker::{Tracker, TrackerConfig, TrackerStreams};
pub use watchtower::{PolicyConfig, WatchTower};
