//! In-process chain watcher backed by a recorded event backlog

use super::{ChainWatcher, WatcherSink};
use crate::error::{WatchtowerError, WatchtowerResult};
use crate::events::{
    ChainType, Event, HashedSecret, InitiateArgs, Operation, OperationStatus, RestoredEvent,
    Secret, Wallet,
};

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Call recorded by a [`MemoryWatcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Initiate(InitiateArgs),
    Redeem {
        hashed_secret: HashedSecret,
        secret: Secret,
        contract_address: String,
    },
    Refund {
        hashed_secret: HashedSecret,
        contract_address: String,
    },
}

impl Submission {
    pub fn hashed_secret(&self) -> &HashedSecret {
        match self {
            Submission::Initiate(args) => &args.hashed_secret,
            Submission::Redeem { hashed_secret, .. } => hashed_secret,
            Submission::Refund { hashed_secret, .. } => hashed_secret,
        }
    }
}

/// Watcher that replays a fixed backlog and records submissions
///
/// Submissions are reported as pending operations; they never reach a chain.
pub struct MemoryWatcher {
    chain: ChainType,
    wallet: Wallet,
    backlog: Vec<Event>,
    sink: Mutex<Option<WatcherSink>>,
    submissions: Mutex<Vec<Submission>>,
    /// Number of upcoming submissions to reject
    failures: AtomicUsize,
    nonce: AtomicU64,
}

impl MemoryWatcher {
    pub fn new(chain: ChainType) -> Self {
        Self {
            chain,
            wallet: Wallet {
                address: format!("{}-watchtower", chain),
                ..Wallet::default()
            },
            backlog: Vec::new(),
            sink: Mutex::new(None),
            submissions: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            nonce: AtomicU64::new(0),
        }
    }

    /// Events replayed by `restore`, before the restored sentinel
    pub fn with_backlog(mut self, backlog: Vec<Event>) -> Self {
        self.backlog = backlog;
        self
    }

    /// Load a JSON array of events as the backlog
    pub fn with_backlog_file(self, path: &Path) -> WatchtowerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WatchtowerError::Config(format!("Failed to read backlog {:?}: {}", path, e))
        })?;
        let backlog: Vec<Event> = serde_json::from_str(&raw).map_err(|e| {
            WatchtowerError::Config(format!("Failed to parse backlog {:?}: {}", path, e))
        })?;

        if let Some(foreign) = backlog.iter().find(|e| e.chain() != self.chain) {
            return Err(WatchtowerError::Config(format!(
                "Backlog {:?} for {} contains a {} event",
                path,
                self.chain,
                foreign.chain()
            )));
        }

        Ok(self.with_backlog(backlog))
    }

    /// Reject the next `count` submissions
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Publish a live event as if observed on chain
    pub async fn push(&self, event: Event) -> WatchtowerResult<()> {
        self.current_sink()?.emit(event).await
    }

    /// Publish an operation update as if observed on chain
    pub async fn push_operation(&self, operation: Operation) -> WatchtowerResult<()> {
        self.current_sink()?.report(operation).await
    }

    /// Submissions received so far
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock_submissions().clone()
    }

    fn current_sink(&self) -> WatchtowerResult<WatcherSink> {
        self.sink
            .lock()
            .map_err(|_| WatchtowerError::Internal("watcher sink lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| WatchtowerError::Chain {
                chain: self.chain,
                message: "watcher is not running".to_string(),
            })
    }

    fn lock_submissions(&self) -> std::sync::MutexGuard<'_, Vec<Submission>> {
        self.submissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn submit(&self, action: &'static str, submission: Submission) -> WatchtowerResult<()> {
        let hashed_secret = submission.hashed_secret().clone();
        self.lock_submissions().push(submission);

        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(WatchtowerError::Submission {
                chain: self.chain,
                action,
                message: "rejected by memory watcher".to_string(),
            });
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let operation = Operation {
            hash: format!("{}-{}-{}", self.chain, action, nonce),
            chain: self.chain,
            status: OperationStatus::Pending,
            hashed_secret,
        };
        debug!("{} {} submitted as {}", self.chain, action, operation.hash);

        // without a running sink the operation is simply not observed
        if let Ok(sink) = self.current_sink() {
            sink.report(operation).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChainWatcher for MemoryWatcher {
    fn chain_type(&self) -> ChainType {
        self.chain
    }

    async fn init(&self) -> WatchtowerResult<()> {
        info!(
            "Memory watcher for {} ready with {} backlog events",
            self.chain,
            self.backlog.len()
        );
        Ok(())
    }

    async fn run(&self, sink: WatcherSink) -> WatchtowerResult<()> {
        *self
            .sink
            .lock()
            .map_err(|_| WatchtowerError::Internal("watcher sink lock poisoned".to_string()))? =
            Some(sink);
        Ok(())
    }

    async fn restore(&self) -> WatchtowerResult<()> {
        let sink = self.current_sink()?;
        for event in &self.backlog {
            sink.emit(event.clone()).await?;
        }
        sink.emit(Event::Restored(RestoredEvent { chain: self.chain }))
            .await?;

        info!("{} restored {} events", self.chain, self.backlog.len());
        Ok(())
    }

    async fn close(&self) -> WatchtowerResult<()> {
        if let Ok(mut sink) = self.sink.lock() {
            sink.take();
        }
        Ok(())
    }

    async fn initiate(&self, args: InitiateArgs) -> WatchtowerResult<()> {
        self.submit("initiate", Submission::Initiate(args)).await
    }

    async fn redeem(
        &self,
        hashed_secret: &HashedSecret,
        secret: &Secret,
        contract_address: &str,
    ) -> WatchtowerResult<()> {
        self.submit(
            "redeem",
            Submission::Redeem {
                hashed_secret: hashed_secret.clone(),
                secret: secret.clone(),
                contract_address: contract_address.to_string(),
            },
        )
        .await
    }

    async fn refund(
        &self,
        hashed_secret: &HashedSecret,
        contract_address: &str,
    ) -> WatchtowerResult<()> {
        self.submit(
            "refund",
            Submission::Refund {
                hashed_secret: hashed_secret.clone(),
                contract_address: contract_address.to_string(),
            },
        )
        .await
    }

    fn wallet(&self) -> Wallet {
        self.wallet.clone()
    }
}
