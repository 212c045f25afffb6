//! Infrastructure layer: ledger storage, the posting service, configuration.

pub mod config;
pub mod service;
pub mod store;


pub use config::{ConfigError, LedgerConfig};
pub use service::{AccountStatement, Entry, LedgerService, PostTransaction, ServiceError};
pub use store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, StoreError, connect};
