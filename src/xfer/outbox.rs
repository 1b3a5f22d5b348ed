//! Federation Outbox
//!
//! Transfers touching a transit account must be mirrored on the peer system
//! behind it. The entry is written in the ledger transaction; [`OutboxWorker`]
//! drains it after commit and calls the peer through a [`PeerGateway`].
//!
//! Delivery is at-least-once. Peers dedup by the local ledger id, which is
//! sent as their external id.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::error::XferError;
use super::store::LedgerStore;
use super::types::XferId;
use crate::account::AccountId;
use crate::domain::Domain;

// ============================================================================
// Entries
// ============================================================================

/// Which side of the transfer the peer sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum Direction {
    /// Source is a transit account: value comes in from the peer
    In = 1,
    /// Destination is a transit account: value goes out to the peer
    Out = 2,
}

impl Direction {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Direction::In),
            2 => Some(Direction::Out),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("IN"),
            Direction::Out => f.write_str("OUT"),
        }
    }
}

/// What the peer is asked to do with its side of the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum PeerOp {
    /// Mirror a transfer that was just posted (done or held)
    Start = 0,
    /// A held transfer was confirmed
    Confirm = 1,
    /// A held or done transfer was released
    Cancel = 2,
}

impl PeerOp {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(PeerOp::Start),
            1 => Some(PeerOp::Confirm),
            2 => Some(PeerOp::Cancel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum OutboxStatus {
    Pending = 0,
    Done = 1,
    Failed = -1,
}

impl OutboxStatus {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OutboxStatus::Pending),
            1 => Some(OutboxStatus::Done),
            -1 => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// Entry as enqueued inside a ledger transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEntry {
    pub xfer_id: XferId,
    pub domain: Domain,
    pub direction: Direction,
    pub op: PeerOp,
    /// Transit account the peer is reached through
    pub rel_account: AccountId,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub xfer_id: XferId,
    pub domain: Domain,
    pub direction: Direction,
    pub op: PeerOp,
    pub rel_account: AccountId,
    pub payload: Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub error: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

// ============================================================================
// Peer Gateway
// ============================================================================

/// Result of one peer call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Success,
    /// Permanent rejection; the entry is parked for manual handling
    Failed(String),
    /// Peer unreachable or not finished; retried on the next scan
    Pending,
}

/// Call towards a peer ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerRequest {
    /// Local ledger id, used by the peer as its external id
    pub ext_id: String,
    pub domain: &'static str,
    pub rel_account: AccountId,
    pub payload: Value,
}

/// Peer ledger client.
///
/// All methods MUST be idempotent on `PeerRequest::ext_id`.
#[async_trait]
pub trait PeerGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Take value from the peer (our source is its representation)
    async fn pull(&self, req: &PeerRequest) -> OpResult;

    /// Hand value to the peer
    async fn push(&self, req: &PeerRequest) -> OpResult;

    /// Finalize a pull that was started on hold
    async fn confirm_pull(&self, req: &PeerRequest) -> OpResult;

    async fn confirm_push(&self, req: &PeerRequest) -> OpResult;

    async fn cancel_pull(&self, req: &PeerRequest) -> OpResult;

    async fn cancel_push(&self, req: &PeerRequest) -> OpResult;
}

/// Gateway that accepts everything and only logs; used when no peers are
/// configured.
pub struct LoggingGateway;

#[async_trait]
impl PeerGateway for LoggingGateway {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn pull(&self, req: &PeerRequest) -> OpResult {
        info!(ext_id = %req.ext_id, domain = req.domain, rel = %req.rel_account, "peer pull");
        OpResult::Success
    }

    async fn push(&self, req: &PeerRequest) -> OpResult {
        info!(ext_id = %req.ext_id, domain = req.domain, rel = %req.rel_account, "peer push");
        OpResult::Success
    }

    async fn confirm_pull(&self, req: &PeerRequest) -> OpResult {
        info!(ext_id = %req.ext_id, domain = req.domain, "peer confirm pull");
        OpResult::Success
    }

    async fn confirm_push(&self, req: &PeerRequest) -> OpResult {
        info!(ext_id = %req.ext_id, domain = req.domain, "peer confirm push");
        OpResult::Success
    }

    async fn cancel_pull(&self, req: &PeerRequest) -> OpResult {
        info!(ext_id = %req.ext_id, domain = req.domain, "peer cancel pull");
        OpResult::Success
    }

    async fn cancel_push(&self, req: &PeerRequest) -> OpResult {
        info!(ext_id = %req.ext_id, domain = req.domain, "peer cancel push");
        OpResult::Success
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub scan_interval: Duration,
    pub batch_size: usize,
    /// Entries still pending after this many attempts are marked failed
    pub max_retries: i32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5),
            batch_size: 100,
            max_retries: 20,
        }
    }
}

/// Drains the outbox towards the peer gateway
pub struct OutboxWorker {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PeerGateway>,
    config: OutboxConfig,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PeerGateway>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Run forever
    pub async fn run(&self) -> ! {
        info!(
            gateway = self.gateway.name(),
            scan_interval_ms = self.config.scan_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox worker"
        );

        loop {
            if let Err(e) = self.drain_once().await {
                error!(error = %e, "Outbox scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// One scan; returns the number of entries delivered
    pub async fn drain_once(&self) -> Result<usize, XferError> {
        let entries = self.store.pending_outbox(self.config.batch_size).await?;
        if entries.is_empty() {
            debug!("Outbox empty");
            return Ok(0);
        }

        let mut delivered = 0;
        for entry in &entries {
            match entry.domain.dispatch_ext(self.gateway.as_ref(), entry).await {
                OpResult::Success => {
                    self.store.complete_outbox(entry.id).await?;
                    debug!(outbox_id = entry.id, xfer_id = %entry.xfer_id, "Outbox entry delivered");
                    delivered += 1;
                }
                OpResult::Failed(reason) => {
                    warn!(
                        outbox_id = entry.id,
                        xfer_id = %entry.xfer_id,
                        reason = %reason,
                        "Peer rejected outbox entry"
                    );
                    self.store.fail_outbox(entry.id, &reason).await?;
                }
                OpResult::Pending if entry.retry_count + 1 >= self.config.max_retries => {
                    error!(
                        outbox_id = entry.id,
                        xfer_id = %entry.xfer_id,
                        retry_count = entry.retry_count,
                        "CRITICAL: outbox entry exhausted retries"
                    );
                    self.store.fail_outbox(entry.id, "retries exhausted").await?;
                }
                OpResult::Pending => {
                    self.store.retry_outbox(entry.id).await?;
                }
            }
        }

        if delivered > 0 {
            info!(count = delivered, "Outbox entries delivered this scan");
        }
        Ok(delivered)
    }
}

/// Scripted gateway for tests
#[cfg(feature = "mock-api")]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    pub struct MockGateway {
        calls: Mutex<Vec<(&'static str, String)>>,
        next: Mutex<Option<OpResult>>,
    }

    impl Default for MockGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                next: Mutex::new(None),
            }
        }

        /// Result returned by every call until changed
        pub fn respond(&self, result: OpResult) {
            *self.next.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        }

        pub fn calls(&self) -> Vec<(&'static str, String)> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        fn record(&self, op: &'static str, req: &PeerRequest) -> OpResult {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((op, req.ext_id.clone()));
            self.next
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or(OpResult::Success)
        }
    }

    #[async_trait]
    impl PeerGateway for MockGateway {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn pull(&self, req: &PeerRequest) -> OpResult {
            self.record("pull", req)
        }

        async fn push(&self, req: &PeerRequest) -> OpResult {
            self.record("push", req)
        }

        async fn confirm_pull(&self, req: &PeerRequest) -> OpResult {
            self.record("confirm_pull", req)
        }

        async fn confirm_push(&self, req: &PeerRequest) -> OpResult {
            self.record("confirm_push", req)
        }

        async fn cancel_pull(&self, req: &PeerRequest) -> OpResult {
            self.record("cancel_pull", req)
        }

        async fn cancel_push(&self, req: &PeerRequest) -> OpResult {
            self.record("cancel_push", req)
        }
    }
}
