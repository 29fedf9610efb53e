//! Watch-tower policy engine
//!
//! Consumes the tracker's status and operation queues and acts on them:
//! redeems the remaining leg once a secret is public, refunds legs whose
//! deadline has passed, and gives up on a swap after a bounded number of
//! submissions.

use crate::config::{Action, Settings};
use crate::events::{ChainType, HashedSecret, Operation, OperationKey, OperationStatus};
use crate::swap::{Leg, Status, Swap};
use crate::tracker::{Tracker, TrackerStreams};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default refund scan period
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub need_redeem: bool,
    pub need_refund: bool,
    /// Submissions allowed per swap before it is abandoned
    pub retry_count_on_failed_tx: u32,
    pub scan_interval: Duration,
    /// Smallest redeem reward worth acting on, per chain
    pub min_payoff: HashMap<ChainType, u128>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            need_redeem: true,
            need_refund: true,
            retry_count_on_failed_tx: 3,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            min_payoff: HashMap::new(),
        }
    }
}

impl PolicyConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let actions = &settings.watchtower.actions;
        let min_payoff = settings
            .enabled_chains()
            .into_iter()
            .map(|(_, chain)| (chain.chain_type, chain.min_payoff as u128))
            .collect();

        Self {
            need_redeem: actions.contains(&Action::Redeem),
            need_refund: actions.contains(&Action::Refund),
            retry_count_on_failed_tx: settings.watchtower.retry_count_on_failed_tx,
            scan_interval: Duration::from_secs(settings.watchtower.scan_interval_secs.max(1)),
            min_payoff,
        }
    }
}

/// Policy reducer; the only writer of its swap and operation maps
pub struct WatchTower {
    tracker: Arc<Tracker>,
    config: PolicyConfig,
    swaps: HashMap<HashedSecret, Swap>,
    operations: HashMap<OperationKey, Operation>,
    abandoned: HashSet<HashedSecret>,
    /// Retries spent on swaps dropped after a refund submission
    refunded: HashMap<HashedSecret, u32>,
}

impl WatchTower {
    pub fn new(tracker: Arc<Tracker>, config: PolicyConfig) -> Self {
        Self {
            tracker,
            config,
            swaps: HashMap::new(),
            operations: HashMap::new(),
            abandoned: HashSet::new(),
            refunded: HashMap::new(),
        }
    }

    /// Main policy loop, exits on stop or once both tracker queues close
    pub async fn run(mut self, mut streams: TrackerStreams, mut stop: watch::Receiver<bool>) {
        let mut scan = interval(self.config.scan_interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        scan.tick().await;

        let mut status_open = true;
        let mut operations_open = true;

        info!(
            "Watch-tower started (redeem: {}, refund: {}, retries: {})",
            self.config.need_redeem, self.config.need_refund, self.config.retry_count_on_failed_tx
        );

        while status_open || operations_open {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }

                swap = streams.status_changed.recv(), if status_open => match swap {
                    Some(swap) => self.on_status_changed(swap).await,
                    None => status_open = false,
                },

                operation = streams.operations.recv(), if operations_open => match operation {
                    Some(operation) => self.on_operation(operation).await,
                    None => operations_open = false,
                },

                _ = scan.tick() => {
                    self.on_tick(Utc::now()).await;
                }
            }
        }

        info!("Watch-tower stopped with {} swaps tracked", self.swaps.len());
    }

    /// Upsert the tracker's snapshot and evaluate policy
    pub async fn on_status_changed(&mut self, swap: Swap) {
        if self.abandoned.contains(&swap.hashed_secret) {
            debug!("Ignoring update for abandoned swap {}", swap.hashed_secret);
            return;
        }

        let hashed_secret = swap.hashed_secret.clone();
        let retry_count = self
            .swaps
            .get(&hashed_secret)
            .map(|tracked| tracked.retry_count)
            .or_else(|| self.refunded.remove(&hashed_secret))
            .unwrap_or(0);

        debug!("Swap {} is {}", hashed_secret, swap.status);
        self.swaps.insert(
            hashed_secret.clone(),
            Swap {
                retry_count,
                ..swap
            },
        );

        self.on_swap(&hashed_secret).await;
        self.record_tracked();
    }

    pub async fn on_operation(&mut self, operation: Operation) {
        let key = operation.key();
        match operation.status {
            OperationStatus::Pending => {
                debug!("Tracking operation {} on {}", operation.hash, operation.chain);
                self.operations.insert(key, operation);
            }
            OperationStatus::Applied => {
                if self.operations.remove(&key).is_some() {
                    info!(
                        "Operation {} applied on {} for swap {}",
                        operation.hash, operation.chain, operation.hashed_secret
                    );
                }
            }
            OperationStatus::Failed => {
                self.operations.remove(&key);
                warn!(
                    "Operation {} failed on {} for swap {}",
                    operation.hash, operation.chain, operation.hashed_secret
                );
                crate::metrics::record_submission(operation.chain, "operation", false);

                if self.swaps.contains_key(&operation.hashed_secret) {
                    self.on_swap(&operation.hashed_secret).await;
                    self.record_tracked();
                }
            }
        }
    }

    /// Refund every tracked swap whose deadline is at or before `now`
    pub async fn on_tick(&mut self, now: DateTime<Utc>) {
        if !self.config.need_refund {
            return;
        }

        let due: Vec<HashedSecret> = self
            .swaps
            .values()
            .filter(|swap| refundable(swap.status))
            .filter(|swap| swap.refund_time.is_some_and(|deadline| deadline <= now))
            .map(|swap| swap.hashed_secret.clone())
            .collect();

        for hashed_secret in due {
            if self.exhausted(&hashed_secret) {
                self.abandon(&hashed_secret);
                continue;
            }

            let Some(swap) = self.swaps.get(&hashed_secret).cloned() else {
                continue;
            };
            let Some(leg) = open_leg(&swap) else {
                debug!("Swap {} has no leg left to refund", hashed_secret);
                self.swaps.remove(&hashed_secret);
                continue;
            };

            if self.submit(&swap, leg, Action::Refund).await {
                if let Some(refunded) = self.swaps.remove(&hashed_secret) {
                    self.refunded.insert(hashed_secret, refunded.retry_count);
                }
            }
        }

        self.record_tracked();
    }

    /// Evaluate policy for one tracked swap
    async fn on_swap(&mut self, hashed_secret: &HashedSecret) {
        let Some(swap) = self.swaps.get(hashed_secret).cloned() else {
            return;
        };

        if self.exhausted(hashed_secret) {
            self.abandon(hashed_secret);
            return;
        }

        match swap.status {
            Status::RedeemedOnce if self.config.need_redeem => {
                let Some(leg) = open_leg(&swap) else {
                    debug!("Swap {} has no leg left to redeem", hashed_secret);
                    return;
                };

                let min_payoff = self.min_payoff(leg);
                if leg.pay_off < min_payoff {
                    info!(
                        "Skipping redeem of swap {}: pay-off {} below minimum {}",
                        hashed_secret, leg.pay_off, min_payoff
                    );
                    return;
                }

                self.submit(&swap, leg, Action::Redeem).await;
            }
            Status::Redeemed | Status::Refunded => {
                info!("Swap {} finished as {}", hashed_secret, swap.status);
                self.swaps.remove(hashed_secret);
                self.refunded.remove(hashed_secret);
            }
            _ => {}
        }
    }

    /// Submit `action` on `leg`, consuming one retry; true on success
    async fn submit(&mut self, swap: &Swap, leg: &Leg, action: Action) -> bool {
        if let Some(tracked) = self.swaps.get_mut(&swap.hashed_secret) {
            tracked.retry_count += 1;
        }

        let result = match action {
            Action::Redeem => self.tracker.redeem(swap, leg).await,
            Action::Refund => self.tracker.refund(swap, leg).await,
        };
        let chain = leg.chain.map(|c| c.as_str()).unwrap_or("unassigned");

        match result {
            Ok(()) => {
                info!(
                    "{} submitted for swap {} on {}",
                    action, swap.hashed_secret, chain
                );
                if let Some(chain) = leg.chain {
                    crate::metrics::record_submission(chain, action.as_str(), true);
                }
                true
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!("{} failed for swap {} on {}: {}", action, swap.hashed_secret, chain, e);
                } else {
                    error!("{} failed for swap {} on {}: {}", action, swap.hashed_secret, chain, e);
                }
                if let Some(chain) = leg.chain {
                    crate::metrics::record_submission(chain, action.as_str(), false);
                }
                false
            }
        }
    }

    fn exhausted(&self, hashed_secret: &HashedSecret) -> bool {
        self.swaps
            .get(hashed_secret)
            .is_some_and(|swap| swap.retry_count >= self.config.retry_count_on_failed_tx)
    }

    fn abandon(&mut self, hashed_secret: &HashedSecret) {
        if let Some(swap) = self.swaps.remove(hashed_secret) {
            warn!(
                "Giving up on swap {} ({}) after {} attempts, manual action required",
                hashed_secret, swap.status, swap.retry_count
            );
            self.abandoned.insert(hashed_secret.clone());
            crate::metrics::record_swap_abandoned();
            crate::metrics::record_tombstoned_swaps("watchtower", self.abandoned.len());
        }
    }

    fn min_payoff(&self, leg: &Leg) -> u128 {
        leg.chain
            .and_then(|chain| self.config.min_payoff.get(&chain).copied())
            .unwrap_or(0)
    }

    fn record_tracked(&self) {
        crate::metrics::record_watched_swaps(self.swaps.len());
    }

    /// Tracked snapshot of a swap
    pub fn swap(&self, hashed_secret: &HashedSecret) -> Option<&Swap> {
        self.swaps.get(hashed_secret)
    }

    pub fn is_abandoned(&self, hashed_secret: &HashedSecret) -> bool {
        self.abandoned.contains(hashed_secret)
    }

    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }
}

/// Refunds never race a revealed secret
fn refundable(status: Status) -> bool {
    matches!(
        status,
        Status::InitiatedOnce | Status::Initiated | Status::RefundedOnce
    )
}

/// First leg that is neither redeemed nor refunded yet
fn open_leg(swap: &Swap) -> Option<&Leg> {
    swap.legs()
        .into_iter()
        .find(|leg| leg.chain.is_some() && leg.status == Status::Initiated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::Submission;
    use crate::chain::{ChainWatcher, MemoryWatcher, MockChainWatcher};
    use crate::error::WatchtowerError;
    use crate::events::{Event, InitEvent, RedeemEvent, RefundEvent, Secret};
    use crate::tracker::TrackerConfig;
    use chrono::Duration as ChronoDuration;

    fn hashed_secret() -> HashedSecret {
        HashedSecret::parse(&"42".repeat(32)).unwrap()
    }

    fn init(chain: ChainType, refund_time: DateTime<Utc>, pay_off: u128) -> Event {
        Event::Init(InitEvent {
            hashed_secret: hashed_secret(),
            chain,
            contract_address: format!("{}-htlc", chain),
            initiator: "alice".to_string(),
            participant: "bob".to_string(),
            refund_time,
            amount: 1_000,
            pay_off,
        })
    }

    fn redeem(chain: ChainType) -> Event {
        Event::Redeem(RedeemEvent {
            hashed_secret: hashed_secret(),
            chain,
            contract_address: format!("{}-htlc", chain),
            secret: Secret::parse(&"07".repeat(32)).unwrap(),
        })
    }

    fn initiated(refund_time: DateTime<Utc>) -> Swap {
        Swap::new(hashed_secret())
            .apply(&init(ChainType::Tezos, refund_time, 10))
            .apply(&init(ChainType::Ethereum, refund_time, 10))
    }

    fn tower(
        config: PolicyConfig,
    ) -> (WatchTower, Arc<MemoryWatcher>, Arc<MemoryWatcher>) {
        let tezos = Arc::new(MemoryWatcher::new(ChainType::Tezos));
        let ethereum = Arc::new(MemoryWatcher::new(ChainType::Ethereum));
        let watchers: Vec<Arc<dyn ChainWatcher>> = vec![tezos.clone(), ethereum.clone()];
        let (tracker, _streams) = Tracker::new(watchers, TrackerConfig::default()).unwrap();
        (WatchTower::new(Arc::new(tracker), config), tezos, ethereum)
    }

    fn redeems(watcher: &MemoryWatcher) -> usize {
        watcher
            .submissions()
            .iter()
            .filter(|s| matches!(s, Submission::Redeem { .. }))
            .count()
    }

    fn operation(status: OperationStatus) -> Operation {
        Operation {
            hash: "op1".to_string(),
            chain: ChainType::Ethereum,
            status,
            hashed_secret: hashed_secret(),
        }
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = Settings::parse(
            r#"
            [watchtower]
            actions = ["refund"]
            retry_count_on_failed_tx = 5
            scan_interval_secs = 0

            [chains.ethereum]
            chain_type = "ethereum"
            min_payoff = 250
        "#,
        )
        .unwrap();

        let config = PolicyConfig::from_settings(&settings);
        assert!(!config.need_redeem);
        assert!(config.need_refund);
        assert_eq!(config.retry_count_on_failed_tx, 5);
        assert_eq!(config.scan_interval, Duration::from_secs(1));
        assert_eq!(config.min_payoff.get(&ChainType::Ethereum), Some(&250));
    }

    #[tokio::test]
    async fn test_redeems_remaining_leg() {
        let (mut tower, tezos, ethereum) = tower(PolicyConfig::default());
        let future = Utc::now() + ChronoDuration::hours(1);

        tower.on_status_changed(initiated(future)).await;
        assert!(ethereum.submissions().is_empty());

        let swap = initiated(future).apply(&redeem(ChainType::Tezos));
        tower.on_status_changed(swap.clone()).await;

        assert!(tezos.submissions().is_empty());
        assert!(matches!(
            ethereum.submissions().as_slice(),
            [Submission::Redeem { secret, .. }] if Some(secret) == swap.secret.as_ref()
        ));
        assert_eq!(tower.swap(&hashed_secret()).unwrap().retry_count, 1);

        tower
            .on_status_changed(swap.apply(&redeem(ChainType::Ethereum)))
            .await;
        assert!(tower.swap(&hashed_secret()).is_none());
        assert_eq!(ethereum.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_no_redeem_when_not_configured() {
        let config = PolicyConfig {
            need_redeem: false,
            ..PolicyConfig::default()
        };
        let (mut tower, _tezos, ethereum) = tower(config);
        let swap = initiated(Utc::now() + ChronoDuration::hours(1)).apply(&redeem(ChainType::Tezos));

        tower.on_status_changed(swap).await;
        assert!(ethereum.submissions().is_empty());
        assert!(tower.swap(&hashed_secret()).is_some());
    }

    #[tokio::test]
    async fn test_redeem_skipped_below_min_payoff() {
        let config = PolicyConfig {
            min_payoff: HashMap::from([(ChainType::Ethereum, 11)]),
            ..PolicyConfig::default()
        };
        let (mut tower, _tezos, ethereum) = tower(config);
        let swap = initiated(Utc::now() + ChronoDuration::hours(1)).apply(&redeem(ChainType::Tezos));

        tower.on_status_changed(swap).await;
        assert!(ethereum.submissions().is_empty());
        assert_eq!(tower.swap(&hashed_secret()).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_budget_abandons_swap() {
        let (mut tower, _tezos, ethereum) = tower(PolicyConfig::default());
        ethereum.fail_next(usize::MAX);
        let swap = initiated(Utc::now() + ChronoDuration::hours(1)).apply(&redeem(ChainType::Tezos));

        for attempt in 1..=3 {
            tower.on_status_changed(swap.clone()).await;
            assert_eq!(ethereum.submissions().len(), attempt);
        }

        tower.on_status_changed(swap.clone()).await;
        assert_eq!(ethereum.submissions().len(), 3);
        assert!(tower.swap(&hashed_secret()).is_none());
        assert!(tower.is_abandoned(&hashed_secret()));
        assert!(
            crate::metrics::TOMBSTONED_SWAPS
                .with_label_values(&["watchtower"])
                .get()
                >= 1.0
        );

        // abandoned swaps stay abandoned
        tower.on_status_changed(swap).await;
        assert_eq!(ethereum.submissions().len(), 3);
        assert!(tower.swap(&hashed_secret()).is_none());
    }

    #[tokio::test]
    async fn test_failed_operation_triggers_retry() {
        let (mut tower, _tezos, ethereum) = tower(PolicyConfig::default());
        let swap = initiated(Utc::now() + ChronoDuration::hours(1)).apply(&redeem(ChainType::Tezos));

        tower.on_status_changed(swap).await;
        tower.on_operation(operation(OperationStatus::Pending)).await;
        assert_eq!(tower.pending_operations(), 1);

        tower.on_operation(operation(OperationStatus::Failed)).await;
        assert_eq!(tower.pending_operations(), 0);
        assert_eq!(ethereum.submissions().len(), 2);
        assert_eq!(tower.swap(&hashed_secret()).unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_applied_operation_stops_tracking() {
        let (mut tower, _tezos, ethereum) = tower(PolicyConfig::default());

        tower.on_operation(operation(OperationStatus::Pending)).await;
        tower.on_operation(operation(OperationStatus::Applied)).await;
        assert_eq!(tower.pending_operations(), 0);
        assert!(ethereum.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_refund_scan_refunds_expired_swap() {
        let (mut tower, tezos, ethereum) = tower(PolicyConfig::default());
        let now = Utc::now();
        let swap = Swap::new(hashed_secret()).apply(&init(
            ChainType::Tezos,
            now - ChronoDuration::seconds(1),
            0,
        ));

        tower.on_status_changed(swap).await;
        assert!(tezos.submissions().is_empty());

        tower.on_tick(now).await;
        assert!(matches!(
            tezos.submissions().as_slice(),
            [Submission::Refund { contract_address, .. }] if contract_address == "tezos-htlc"
        ));
        assert!(ethereum.submissions().is_empty());
        assert!(tower.swap(&hashed_secret()).is_none());

        tower.on_tick(now).await;
        assert_eq!(tezos.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_refund_scan_skips_redeemed_swap() {
        let (mut tower, tezos, ethereum) = tower(PolicyConfig::default());
        let now = Utc::now();
        let swap = initiated(now - ChronoDuration::minutes(10)).apply(&redeem(ChainType::Tezos));

        tower.on_status_changed(swap).await;
        assert_eq!(redeems(&ethereum), 1);

        tower.on_tick(now).await;
        assert!(matches!(
            ethereum.submissions().as_slice(),
            [Submission::Redeem { .. }]
        ));
        assert!(tezos.submissions().is_empty());
        assert!(tower.swap(&hashed_secret()).is_some());
    }

    #[tokio::test]
    async fn test_refund_keeps_retry_count() {
        let (mut tower, _tezos, _ethereum) = tower(PolicyConfig::default());
        let now = Utc::now();
        let swap = Swap::new(hashed_secret()).apply(&init(
            ChainType::Tezos,
            now - ChronoDuration::seconds(1),
            0,
        ));

        tower.on_status_changed(swap.clone()).await;
        tower.on_tick(now).await;
        assert!(tower.swap(&hashed_secret()).is_none());

        let refunded = swap.apply(&Event::Refund(RefundEvent {
            hashed_secret: hashed_secret(),
            chain: ChainType::Tezos,
            contract_address: "tezos-htlc".to_string(),
        }));
        tower.on_status_changed(refunded).await;
        let tracked = tower.swap(&hashed_secret()).unwrap();
        assert_eq!(tracked.status, Status::RefundedOnce);
        assert_eq!(tracked.retry_count, 1);

        // nothing left to refund, the next scan drops it
        tower.on_tick(now).await;
        assert!(tower.swap(&hashed_secret()).is_none());
    }

    #[tokio::test]
    async fn test_refund_scan_ignores_future_deadline() {
        let (mut tower, tezos, _ethereum) = tower(PolicyConfig::default());
        let now = Utc::now();

        tower.on_status_changed(initiated(now + ChronoDuration::minutes(10))).await;
        tower.on_tick(now).await;

        assert!(tezos.submissions().is_empty());
        assert!(tower.swap(&hashed_secret()).is_some());
    }

    #[tokio::test]
    async fn test_refund_scan_disabled() {
        let config = PolicyConfig {
            need_refund: false,
            ..PolicyConfig::default()
        };
        let (mut tower, tezos, _ethereum) = tower(config);
        let now = Utc::now();

        tower.on_status_changed(initiated(now - ChronoDuration::minutes(10))).await;
        tower.on_tick(now).await;
        assert!(tezos.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refund_retries_until_budget() {
        let mut watcher = MockChainWatcher::new();
        watcher.expect_chain_type().return_const(ChainType::Tezos);
        watcher.expect_refund().times(2).returning(|_, _| {
            Err(WatchtowerError::Submission {
                chain: ChainType::Tezos,
                action: "refund",
                message: "node unavailable".to_string(),
            })
        });

        let watchers: Vec<Arc<dyn ChainWatcher>> = vec![Arc::new(watcher)];
        let (tracker, _streams) = Tracker::new(watchers, TrackerConfig::default()).unwrap();
        let config = PolicyConfig {
            retry_count_on_failed_tx: 2,
            ..PolicyConfig::default()
        };
        let mut tower = WatchTower::new(Arc::new(tracker), config);

        let now = Utc::now();
        let swap = Swap::new(hashed_secret()).apply(&init(
            ChainType::Tezos,
            now - ChronoDuration::minutes(1),
            0,
        ));
        tower.on_status_changed(swap).await;

        tower.on_tick(now).await;
        assert_eq!(tower.swap(&hashed_secret()).unwrap().retry_count, 1);
        tower.on_tick(now).await;
        assert_eq!(tower.swap(&hashed_secret()).unwrap().retry_count, 2);

        tower.on_tick(now).await;
        assert!(tower.swap(&hashed_secret()).is_none());
        assert!(tower.is_abandoned(&hashed_secret()));
    }

    #[tokio::test]
    async fn test_refunded_swap_stops_tracking() {
        let (mut tower, tezos, _ethereum) = tower(PolicyConfig::default());
        let mut swap = initiated(Utc::now() + ChronoDuration::hours(1));
        swap.status = Status::Refunded;

        tower.on_status_changed(swap).await;
        assert!(tower.swap(&hashed_secret()).is_none());
        assert!(tezos.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_on_stop() {
        let (tower, _tezos, _ethereum) = tower(PolicyConfig::default());
        let (_status_tx, status_changed) = tokio::sync::mpsc::channel(1);
        let (_ops_tx, operations) = tokio::sync::mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(tower.run(
            TrackerStreams {
                status_changed,
                operations,
            },
            stop_rx,
        ));
        stop_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watch-tower did not stop")
            .unwrap();
    }
}
