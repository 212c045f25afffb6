//! Ledger store boundary.
//!
//! Durable, principal-scoped storage for accounts and splits with atomic
//! multi-account commits. The ledger core never talks to a backend directly.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use r#trait::{LedgerStore, StoreError};

use crate::config::LedgerConfig;

/// Build the store selected by `config`.
///
/// With a `database_url` this connects to Postgres and applies the schema;
/// otherwise it returns an empty in-memory store.
pub async fn connect(config: &LedgerConfig) -> Result<Arc<dyn LedgerStore>, StoreError> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .map_err(|e| StoreError::Storage(format!("connect: {e}")))?;
            let store = PostgresLedgerStore::new(pool);
            store.migrate().await?;
            info!("using postgres ledger store");
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory ledger store");
            Ok(Arc::new(InMemoryLedgerStore::new()))
        }
    }
}
