//! Cross-chain swap lifecycle
//!
//! A [`Swap`] is the reconciliation of both legs of an atomic swap, keyed by
//! the hashed secret. It only ever changes through [`Swap::apply`], which is
//! a pure transition over the event vocabulary in [`crate::events`].
//!
//! Lifecycle (never regresses):
//!
//! ```text
//! Empty -> InitiatedOnce -> Initiated -+-> RedeemedOnce -> Redeemed
//!                                      +-> RefundedOnce -> Refunded
//! ```
//!
//! Redeem and refund branches are exclusive: whichever is entered first wins.

use crate::events::{ChainType, Event, HashedSecret, InitEvent, RedeemEvent, RefundEvent, Secret};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Empty,
    InitiatedOnce,
    Initiated,
    RedeemedOnce,
    Redeemed,
    RefundedOnce,
    Refunded,
}

impl Status {
    /// Position in the lifecycle; both terminal branches share ranks
    pub fn rank(&self) -> u8 {
        match self {
            Status::Empty => 0,
            Status::InitiatedOnce => 1,
            Status::Initiated => 2,
            Status::RedeemedOnce | Status::RefundedOnce => 3,
            Status::Redeemed | Status::Refunded => 4,
        }
    }

    /// Whether `next` is reachable from `self` without regressing
    pub fn can_become(&self, next: Status) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (Status::RedeemedOnce | Status::Redeemed, Status::RefundedOnce | Status::Refunded) => {
                false
            }
            (Status::RefundedOnce | Status::Refunded, Status::RedeemedOnce | Status::Redeemed) => {
                false
            }
            _ => next.rank() > self.rank(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Status::Redeemed | Status::Refunded)
    }

    fn is_open(&self) -> bool {
        matches!(self, Status::Empty | Status::InitiatedOnce | Status::Initiated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Empty => "empty",
            Status::InitiatedOnce => "initiated_once",
            Status::Initiated => "initiated",
            Status::RedeemedOnce => "redeemed_once",
            Status::Redeemed => "redeemed",
            Status::RefundedOnce => "refunded_once",
            Status::Refunded => "refunded",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chain-side half of a swap
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Leg {
    /// `None` until this leg's init has been observed
    pub chain: Option<ChainType>,
    pub address: String,
    pub participant: String,
    pub contract_address: String,
    pub amount: u128,
    pub pay_off: u128,
    pub status: Status,
}

impl Leg {
    fn from_init(event: &InitEvent) -> Self {
        Self {
            chain: Some(event.chain),
            address: event.initiator.clone(),
            participant: event.participant.clone(),
            contract_address: event.contract_address.clone(),
            amount: event.amount,
            pay_off: event.pay_off,
            status: Status::Initiated,
        }
    }

    fn matches(&self, chain: ChainType, contract_address: &str) -> bool {
        self.chain == Some(chain) && self.contract_address.eq_ignore_ascii_case(contract_address)
    }
}

/// Cross-chain swap aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub hashed_secret: HashedSecret,
    pub secret: Option<Secret>,
    pub status: Status,
    pub refund_time: Option<DateTime<Utc>>,
    pub initiator: Leg,
    pub acceptor: Leg,
    /// Chains that reported a redeem, whether or not their leg is known
    #[serde(default)]
    pub redeemed_on: BTreeSet<ChainType>,
    #[serde(default)]
    pub refunded_on: BTreeSet<ChainType>,
    pub retry_count: u32,
}

impl Swap {
    pub fn new(hashed_secret: HashedSecret) -> Self {
        Self {
            hashed_secret,
            secret: None,
            status: Status::Empty,
            refund_time: None,
            initiator: Leg::default(),
            acceptor: Leg::default(),
            redeemed_on: BTreeSet::new(),
            refunded_on: BTreeSet::new(),
            retry_count: 0,
        }
    }

    /// Apply an event, returning the resulting swap
    ///
    /// Events for another hashed secret and restore sentinels leave the swap
    /// untouched.
    pub fn apply(mut self, event: &Event) -> Swap {
        if event
            .hashed_secret()
            .is_some_and(|hashed_secret| *hashed_secret != self.hashed_secret)
        {
            return self;
        }

        match event {
            Event::Init(init) => self.on_init(init),
            Event::Redeem(redeem) => self.on_redeem(redeem),
            Event::Refund(refund) => self.on_refund(refund),
            Event::Restored(_) => {}
        }
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Legs in (initiator, acceptor) order
    pub fn legs(&self) -> [&Leg; 2] {
        [&self.initiator, &self.acceptor]
    }

    fn on_init(&mut self, event: &InitEvent) {
        match self.status {
            Status::Empty => {
                self.initiator = Leg::from_init(event);
                self.acceptor = Leg::default();
                self.refund_time = Some(event.refund_time);
                self.status = Status::InitiatedOnce;
            }
            Status::InitiatedOnce if self.initiator.chain != Some(event.chain) => {
                self.acceptor = Leg::from_init(event);
                self.status = Status::Initiated;
            }
            _ => {}
        }
    }

    fn on_redeem(&mut self, event: &RedeemEvent) {
        if self.secret.is_none() {
            self.secret = Some(event.secret.clone());
        }
        // a chain redeems at most once, even before its init is seen
        if self.redeemed_on.contains(&event.chain) {
            return;
        }

        match self.status {
            status if status.is_open() => self.status = Status::RedeemedOnce,
            Status::RedeemedOnce => self.status = Status::Redeemed,
            _ => return,
        }

        self.redeemed_on.insert(event.chain);
        self.mark_leg(event.chain, &event.contract_address, Status::Redeemed);
    }

    fn on_refund(&mut self, event: &RefundEvent) {
        if self.refunded_on.contains(&event.chain) {
            return;
        }

        match self.status {
            status if status.is_open() => self.status = Status::RefundedOnce,
            Status::RefundedOnce => self.status = Status::Refunded,
            // secret already public, redeem wins
            _ => return,
        }

        self.refunded_on.insert(event.chain);
        self.mark_leg(event.chain, &event.contract_address, Status::Refunded);
    }

    fn mark_leg(&mut self, chain: ChainType, contract_address: &str, status: Status) {
        for leg in [&mut self.initiator, &mut self.acceptor] {
            if leg.matches(chain, contract_address) {
                leg.status = status;
            }
        }
    }
}
