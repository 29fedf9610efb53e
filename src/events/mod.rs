//! Swap event model shared by chain watchers, the tracker and the watch-tower
//!
//! Chain watchers translate on-chain HTLC logs into [`Event`]s and submitted
//! transactions into [`Operation`]s. Everything is keyed by [`HashedSecret`],
//! the digest both legs of an atomic swap lock on.

use crate::error::{WatchtowerError, WatchtowerResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Digest length in bytes for hashed secrets and secrets
pub const DIGEST_LEN: usize = 32;

/// Blockchain family a watcher talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Tezos,
    Ethereum,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Tezos => "tezos",
            ChainType::Ethereum => "ethereum",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainType {
    type Err = WatchtowerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tezos" => Ok(ChainType::Tezos),
            "ethereum" => Ok(ChainType::Ethereum),
            other => Err(WatchtowerError::Config(format!("Unknown chain type: {}", other))),
        }
    }
}

/// Decode a 32-byte hex digest, with or without `0x`, into lowercase hex
fn normalize_digest(value: &str) -> WatchtowerResult<String> {
    let stripped = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    let bytes = hex::decode(stripped)
        .map_err(|e| WatchtowerError::InvalidHex(format!("{}: {}", value, e)))?;

    if bytes.len() != DIGEST_LEN {
        return Err(WatchtowerError::InvalidHex(format!(
            "{}: expected {} bytes, got {}",
            value,
            DIGEST_LEN,
            bytes.len()
        )));
    }

    Ok(hex::encode(bytes))
}

/// Correlation key joining both legs of a swap
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HashedSecret(String);

impl HashedSecret {
    pub fn parse(value: &str) -> WatchtowerResult<Self> {
        normalize_digest(value).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HashedSecret {
    type Error = WatchtowerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HashedSecret> for String {
    fn from(value: HashedSecret) -> Self {
        value.0
    }
}

impl fmt::Display for HashedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pre-image of a [`HashedSecret`], public once a redeem executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Secret(String);

impl Secret {
    pub fn parse(value: &str) -> WatchtowerResult<Self> {
        normalize_digest(value).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Secret {
    type Error = WatchtowerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Secret> for String {
    fn from(value: Secret) -> Self {
        value.0
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// HTLC initiated on a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitEvent {
    pub hashed_secret: HashedSecret,
    pub chain: ChainType,
    pub contract_address: String,
    pub initiator: String,
    pub participant: String,
    pub refund_time: DateTime<Utc>,
    pub amount: u128,
    pub pay_off: u128,
}

/// HTLC redeemed, revealing the secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemEvent {
    pub hashed_secret: HashedSecret,
    pub chain: ChainType,
    pub contract_address: String,
    pub secret: Secret,
}

/// HTLC refunded after its timeout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundEvent {
    pub hashed_secret: HashedSecret,
    pub chain: ChainType,
    pub contract_address: String,
}

/// A watcher finished replaying its historical log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredEvent {
    pub chain: ChainType,
}

/// Events emitted by chain watchers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Init(InitEvent),
    Redeem(RedeemEvent),
    Refund(RefundEvent),
    Restored(RestoredEvent),
}

impl Event {
    /// Chain that emitted this event
    pub fn chain(&self) -> ChainType {
        match self {
            Event::Init(e) => e.chain,
            Event::Redeem(e) => e.chain,
            Event::Refund(e) => e.chain,
            Event::Restored(e) => e.chain,
        }
    }

    /// Swap key, absent for the restore sentinel
    pub fn hashed_secret(&self) -> Option<&HashedSecret> {
        match self {
            Event::Init(e) => Some(&e.hashed_secret),
            Event::Redeem(e) => Some(&e.hashed_secret),
            Event::Refund(e) => Some(&e.hashed_secret),
            Event::Restored(_) => None,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            Event::Init(_) => "init",
            Event::Redeem(_) => "redeem",
            Event::Refund(_) => "refund",
            Event::Restored(_) => "restored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Applied,
    Failed,
}

/// A submitted transaction tracked on its chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub hash: String,
    pub chain: ChainType,
    pub status: OperationStatus,
    pub hashed_secret: HashedSecret,
}

impl Operation {
    pub fn key(&self) -> OperationKey {
        OperationKey {
            hash: self.hash.clone(),
            chain: self.chain,
        }
    }
}

/// Operation hashes are only unique per chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub hash: String,
    pub chain: ChainType,
}

/// Arguments for locking funds in a new HTLC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateArgs {
    pub hashed_secret: HashedSecret,
    pub participant: String,
    pub contract_address: String,
    pub token_address: Option<String>,
    pub amount: u128,
    pub pay_off: u128,
    pub refund_time: DateTime<Utc>,
}

/// Signing identity of a watcher
#[derive(Clone, Default)]
pub struct Wallet {
    pub address: String,
    pub public_key: String,
    pub private_key: Vec<u8>,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}
