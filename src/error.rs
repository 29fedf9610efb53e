//! Error types for the swap watch-tower

use crate::events::ChainType;

use thiserror::Error;

/// Main error type for the tracker, watch-tower and chain watchers
#[derive(Error, Debug)]
pub enum WatchtowerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain} error: {message}")]
    Chain { chain: ChainType, message: String },

    #[error("Chain {chain} not configured")]
    UnknownChain { chain: ChainType },

    #[error("Leg has no chain assigned for swap {hashed_secret}")]
    UnassignedLeg { hashed_secret: String },

    #[error("Chain {chain} registered more than once")]
    DuplicateChain { chain: ChainType },

    #[error("Swap {hashed_secret} has no secret to redeem with")]
    MissingSecret { hashed_secret: String },

    #[error("Submission of {action} failed on chain {chain}: {message}")]
    Submission {
        chain: ChainType,
        action: &'static str,
        message: String,
    },

    #[error("Invalid hex value: {0}")]
    InvalidHex(String),

    #[error("Queue closed: {0}")]
    QueueClosed(&'static str),

    #[error("Tracker already started")]
    AlreadyStarted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WatchtowerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WatchtowerError::Chain { .. }
                | WatchtowerError::Submission { .. }
                | WatchtowerError::QueueClosed(_)
        )
    }
}

/// Result type for watch-tower operations
pub type WatchtowerResult<T> = Result<T, WatchtowerError>;
