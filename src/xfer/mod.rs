//! Transfer Processing
//!
//! Idempotent two-account ledger writes with optional reservation,
//! currency conversion, limit accounting and peer federation.
//!
//! # Modules
//!
//! - [`engine`] - The transfer pipeline and its transitions
//! - [`store`] - Transactional storage contracts
//! - [`outbox`] - Post-commit peer federation
//! - [`pg`] / [`memory`] - Store implementations

pub mod engine;
pub mod error;
#[cfg(feature = "mock-api")]
pub mod memory;
pub mod outbox;
pub mod pg;
pub mod schema;
pub mod state;
pub mod store;
pub mod types;

pub use engine::XferEngine;
pub use error::XferError;
#[cfg(feature = "mock-api")]
pub use memory::MemoryStore;
pub use outbox::{
    Direction, LoggingGateway, NewOutboxEntry, OpResult, OutboxConfig, OutboxEntry, OutboxStatus,
    OutboxWorker, PeerGateway, PeerOp, PeerRequest,
};
pub use pg::PgLedgerStore;
pub use state::XferStatus;
pub use store::{BalanceUpdate, LedgerStore, LedgerTx};
pub use types::{
    CancelRequest, FeeRequest, XferId, XferRecord, XferRef, XferRequest, ext_id_matches,
    make_ext_id,
};
