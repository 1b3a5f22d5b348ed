//! xfer_engine - Multi-currency Ledger and Transfer Engine
//!
//! Moves value between accounts exactly once under retries, partial
//! failures and concurrent requests, while keeping per-holder rolling
//! limits in step with the ledger.
//!
//! # Modules
//!
//! - [`amount`] - Fixed-point amounts, conversion and stats arithmetic
//! - [`account`] - Accounts and the registries the engine reads
//! - [`limits`] - Rolling limit statistics
//! - [`xfer`] - The transfer pipeline, stores and peer outbox
//! - [`domain`] - Retail, gaming, deposit and payment extensions

pub mod account;
pub mod amount;
pub mod config;
pub mod db;
pub mod domain;
pub mod limits;
pub mod logging;
pub mod xfer;

// Convenient re-exports at crate root
pub use account::{Account, AccountId, AccountKind, HolderId, Registry};
pub use amount::{AmountError, StatsMap};
pub use domain::Domain;
pub use limits::{LimitDomain, LimitSpec};
pub use xfer::{
    CancelRequest, LedgerStore, XferEngine, XferError, XferId, XferRecord, XferRef, XferRequest,
    XferStatus,
};
