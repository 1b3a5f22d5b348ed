//! Accounts and the collaborator registries consumed by the engine

pub mod models;
pub mod registry;

pub use models::{
    Account, AccountHolder, AccountId, AccountKind, Currency, ExRate, HolderId, LimitsConfig,
};
#[cfg(feature = "mock-api")]
pub use registry::MemoryRegistry;
pub use registry::{PgRegistry, Registry, conversion_rate};
