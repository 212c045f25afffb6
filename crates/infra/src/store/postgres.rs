//! Postgres-backed ledger store.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` (split key already written) |
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | anything else | | `Storage` |
//!
//! ## Concurrency
//!
//! Account rows carry a `version`. `atomic_commit` updates each account with
//! `WHERE version = <resolved version>` inside one SQL transaction; a row that
//! moved on matches nothing and the whole transaction is rolled back with a
//! `Conflict`. The row lock taken by the update serializes overlapping commits.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use splitbook_core::{AccountKey, PrincipalId, SplitKey, TransactionId};
use splitbook_ledger::{Account, AccountSet, Split};

use super::r#trait::{LedgerStore, StoreError, check_commit_batch};

/// Schema statements, applied in order by [`PostgresLedgerStore::migrate`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ledger_accounts (
        account_key BIGSERIAL PRIMARY KEY,
        owner_id UUID NOT NULL,
        name TEXT NOT NULL CHECK (length(btrim(name)) > 0),
        total BIGINT NOT NULL DEFAULT 0,
        version BIGINT NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_accounts_owner_name_idx
        ON ledger_accounts (owner_id, name)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_splits (
        transaction_id UUID NOT NULL,
        account_key BIGINT NOT NULL REFERENCES ledger_accounts (account_key),
        amount BIGINT NOT NULL CHECK (amount <> 0),
        memo TEXT NOT NULL DEFAULT '',
        booked_on DATE,
        PRIMARY KEY (transaction_id, account_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_splits_account_idx
        ON ledger_splits (account_key, booked_on)
    "#,
];

/// Split history of one account, oldest date first, then largest amount.
const SPLITS_BY_ACCOUNT: &str = r#"
    SELECT transaction_id, amount, memo, booked_on
    FROM ledger_splits
    WHERE account_key = $1
    ORDER BY booked_on ASC NULLS FIRST, amount DESC
"#;

/// Postgres-backed ledger store.
///
/// Every query is scoped by `owner_id`; reads of another principal's account
/// surface as [`StoreError::Permission`].
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn owner_of(&self, key: AccountKey) -> Result<Option<PrincipalId>, StoreError> {
        let row = sqlx::query("SELECT owner_id FROM ledger_accounts WHERE account_key = $1")
            .bind(key.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("owner_of", e))?;

        row.map(|r| r.try_get::<Uuid, _>("owner_id").map(PrincipalId::from_uuid))
            .transpose()
            .map_err(|e| map_sqlx_error("owner_of", e))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, account), fields(owner = %owner), err)]
    async fn create_account(
        &self,
        owner: PrincipalId,
        account: &Account,
    ) -> Result<AccountKey, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO ledger_accounts (owner_id, name)
            VALUES ($1, $2)
            RETURNING account_key
            "#,
        )
        .bind(owner.as_uuid())
        .bind(account.name())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;

        let key = row
            .try_get::<i64, _>("account_key")
            .map_err(|e| map_sqlx_error("create_account", e))?;
        Ok(AccountKey::new(key))
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn list_accounts(
        &self,
        owner: PrincipalId,
    ) -> Result<Vec<(AccountKey, Account)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT account_key, name, total, version
            FROM ledger_accounts
            WHERE owner_id = $1
            ORDER BY name ASC, account_key ASC
            "#,
        )
        .bind(owner.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_accounts", e))?;

        rows.iter()
            .map(|row| {
                let account = AccountRow::from_row(row)?;
                Ok((account.key, account.into_account()))
            })
            .collect()
    }

    #[instrument(skip(self, keys), fields(owner = %owner, keys = keys.len()), err)]
    async fn resolve(
        &self,
        owner: PrincipalId,
        keys: &[AccountKey],
    ) -> Result<AccountSet, StoreError> {
        let raw: Vec<i64> = keys.iter().map(|k| k.get()).collect();
        let rows = sqlx::query(
            r#"
            SELECT account_key, owner_id, name, total, version
            FROM ledger_accounts
            WHERE account_key = ANY($1)
            "#,
        )
        .bind(raw)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resolve", e))?;

        let mut found = BTreeMap::new();
        for row in &rows {
            let owner_id: Uuid = row
                .try_get("owner_id")
                .map_err(|e| map_sqlx_error("resolve", e))?;
            let account = AccountRow::from_row(row)?;
            found.insert(account.key, (PrincipalId::from_uuid(owner_id), account));
        }

        let mut set = AccountSet::new();
        for key in keys {
            if set.contains_key(key) {
                continue;
            }
            let (row_owner, account) = found.remove(key).ok_or(StoreError::NotFound(*key))?;
            if row_owner != owner {
                return Err(StoreError::Permission(*key));
            }
            set.insert(*key, account.into_account());
        }
        Ok(set)
    }

    #[instrument(
        skip(self),
        fields(owner = %owner, account = %key, split_count = tracing::field::Empty),
        err
    )]
    async fn account_splits(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<Vec<Split>, StoreError> {
        match self.owner_of(key).await? {
            None => return Err(StoreError::NotFound(key)),
            Some(o) if o != owner => return Err(StoreError::Permission(key)),
            Some(_) => {}
        }

        let rows = sqlx::query(SPLITS_BY_ACCOUNT)
            .bind(key.get())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("account_splits", e))?;
        let splits = decode_splits(key, &rows)?;

        Span::current().record("split_count", splits.len());
        Ok(splits)
    }

    #[instrument(
        skip(self),
        fields(owner = %owner, account = %key, split_count = tracing::field::Empty),
        err
    )]
    async fn account_statement(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<(Account, Vec<Split>), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // One snapshot for the account row and its splits.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        let row = sqlx::query(
            r#"
            SELECT account_key, owner_id, name, total, version
            FROM ledger_accounts
            WHERE account_key = $1
            "#,
        )
        .bind(key.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("account_statement", e))?
        .ok_or(StoreError::NotFound(key))?;

        let owner_id: Uuid = row
            .try_get("owner_id")
            .map_err(|e| map_sqlx_error("account_statement", e))?;
        if PrincipalId::from_uuid(owner_id) != owner {
            return Err(StoreError::Permission(key));
        }
        let account = AccountRow::from_row(&row)?.into_account();

        let rows = sqlx::query(SPLITS_BY_ACCOUNT)
            .bind(key.get())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("account_statement", e))?;
        let splits = decode_splits(key, &rows)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("split_count", splits.len());
        Ok((account, splits))
    }

    #[instrument(
        skip(self, accounts, splits),
        fields(owner = %owner, accounts = accounts.len(), splits = splits.len()),
        err
    )]
    async fn atomic_commit(
        &self,
        owner: PrincipalId,
        accounts: Vec<(AccountKey, Account)>,
        splits: Vec<(SplitKey, Split)>,
    ) -> Result<(), StoreError> {
        check_commit_batch(&accounts, &splits)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for (key, account) in &accounts {
            let expected = i64::try_from(account.version())
                .map_err(|_| StoreError::InvalidCommit(format!("account {key} version out of range")))?;

            let result = sqlx::query(
                r#"
                UPDATE ledger_accounts
                SET name = $1, total = $2, version = version + 1
                WHERE account_key = $3 AND owner_id = $4 AND version = $5
                "#,
            )
            .bind(account.name())
            .bind(account.total())
            .bind(key.get())
            .bind(owner.as_uuid())
            .bind(expected)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_account", e))?;

            if result.rows_affected() == 0 {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::Conflict(format!(
                    "account {key} changed since version {expected}"
                )));
            }
        }

        for (key, split) in &splits {
            sqlx::query(
                r#"
                INSERT INTO ledger_splits (transaction_id, account_key, amount, memo, booked_on)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(key.transaction_id.as_uuid())
            .bind(key.account.get())
            .bind(split.amount())
            .bind(split.memo())
            .bind(split.date())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_split", e))?;
        }

        // Dropping `tx` on an early return above rolls it back.
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(owner = %owner, account = %key), err)]
    async fn delete_account(&self, owner: PrincipalId, key: AccountKey) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            "SELECT owner_id FROM ledger_accounts WHERE account_key = $1 FOR UPDATE",
        )
        .bind(key.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_account", e))?;

        let row_owner = match row {
            Some(r) => r
                .try_get::<Uuid, _>("owner_id")
                .map_err(|e| map_sqlx_error("lock_account", e))?,
            None => return Ok(()),
        };
        if row_owner != *owner.as_uuid() {
            return Ok(());
        }

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM ledger_splits WHERE account_key = $1")
            .bind(key.get())
            .fetch_one(&mut *tx)
            .await
            .and_then(|r| r.try_get("n"))
            .map_err(|e| map_sqlx_error("count_splits", e))?;
        if count != 0 {
            return Err(StoreError::AccountHasSplits {
                key,
                count: count.unsigned_abs(),
            });
        }

        sqlx::query("DELETE FROM ledger_accounts WHERE account_key = $1")
            .bind(key.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_account", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }
}

/// Decoded `ledger_accounts` row.
#[derive(Debug)]
struct AccountRow {
    key: AccountKey,
    name: String,
    total: i64,
    version: u64,
}

impl AccountRow {
    fn from_row(row: &PgRow) -> Result<Self, StoreError> {
        let read = |e: sqlx::Error| map_sqlx_error("decode_account", e);
        let version: i64 = row.try_get("version").map_err(read)?;
        Ok(Self {
            key: AccountKey::new(row.try_get("account_key").map_err(read)?),
            name: row.try_get("name").map_err(read)?,
            total: row.try_get("total").map_err(read)?,
            version: version.unsigned_abs(),
        })
    }

    fn into_account(self) -> Account {
        Account::restore(self.name, self.total, self.version)
    }
}

fn decode_splits(key: AccountKey, rows: &[PgRow]) -> Result<Vec<Split>, StoreError> {
    let read = |e: sqlx::Error| map_sqlx_error("decode_split", e);
    let mut splits = Vec::with_capacity(rows.len());
    for row in rows {
        let transaction_id: Uuid = row.try_get("transaction_id").map_err(read)?;
        let amount: i64 = row.try_get("amount").map_err(read)?;
        let memo: String = row.try_get("memo").map_err(read)?;
        let booked_on: Option<NaiveDate> = row.try_get("booked_on").map_err(read)?;
        splits.push(Split::restore(
            SplitKey::new(TransactionId::from_uuid(transaction_id), key),
            amount,
            memo,
            booked_on,
        ));
    }
    Ok(splits)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") | Some("40001") | Some("40P01") => {
                StoreError::Conflict(format!("{operation}: {db}"))
            }
            _ => StoreError::Storage(format!("{operation}: {db}")),
        },
        _ => StoreError::Storage(format!("{operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_storage_failures() {
        let err = map_sqlx_error("resolve", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Storage(msg) if msg.starts_with("resolve:")));
    }

    #[test]
    fn schema_creates_both_tables() {
        assert!(SCHEMA.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS ledger_accounts")));
        assert!(SCHEMA.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS ledger_splits")));
    }
}
