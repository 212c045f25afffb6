//! Ledger application service.
//!
//! Orchestrates the store and the ledger core for one principal:
//!
//! ```text
//! PostTransaction
//!   ↓
//! 1. Stage + pre-flight `valid()` (no IO)
//!   ↓
//! 2. Resolve every referenced account (all-or-nothing, owner-scoped)
//!   ↓
//! 3. Commit in memory (totals + splits, one transaction id)
//!   ↓
//! 4. atomic_commit of the updated accounts and new splits
//! ```
//!
//! A conflict in step 4 discards the in-memory accounts and transaction and
//! starts again from step 2 with a freshly staged transaction, up to
//! `max_commit_retries` times. Every other failure is returned as is.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use splitbook_core::{AccountKey, Amount, LedgerError, PrincipalId};
use splitbook_ledger::{Account, Posting, Split, Transaction};

use crate::config::{DEFAULT_MAX_COMMIT_RETRIES, LedgerConfig};
use crate::store::{LedgerStore, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Ledger rule violation (validation, balance, names).
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Store failure (ownership, conflict, storage).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Malformed request input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServiceError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// True if the same request may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict(_)))
    }
}

/// One account movement of a transaction request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub account: AccountKey,
    pub amount: Amount,
}

/// Request to post one balanced transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTransaction {
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub memo: String,
    pub date: NaiveDate,
}

impl PostTransaction {
    pub fn new(entries: Vec<Entry>, memo: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            entries,
            memo: memo.into(),
            date,
        }
    }

    /// Build from parallel amount/account columns and a `YYYY-MM-DD` date.
    pub fn from_columns(
        amounts: &[Amount],
        accounts: &[AccountKey],
        memo: impl Into<String>,
        date: &str,
    ) -> Result<Self, ServiceError> {
        if amounts.len() != accounts.len() {
            return Err(ServiceError::invalid_request(format!(
                "{} amounts but {} accounts",
                amounts.len(),
                accounts.len()
            )));
        }

        let entries = accounts
            .iter()
            .zip(amounts)
            .map(|(account, amount)| Entry {
                account: *account,
                amount: *amount,
            })
            .collect();

        Ok(Self::new(entries, memo, parse_date(date)?))
    }

    /// Fresh transaction holding one split per entry.
    pub fn stage(&self) -> Transaction {
        let mut x = Transaction::new();
        x.add_splits(self.entries.iter().map(|e| {
            Split::to(e.account, e.amount)
                .with_memo(self.memo.clone())
                .on(self.date)
        }));
        x
    }
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(raw: &str) -> Result<NaiveDate, ServiceError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ServiceError::invalid_request(format!("could not parse {raw:?} as a date")))
}

/// An account together with its durable split history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStatement {
    pub key: AccountKey,
    pub account: Account,
    pub splits: Vec<Split>,
}

/// Principal-scoped ledger operations over a [`LedgerStore`].
#[derive(Debug)]
pub struct LedgerService<S> {
    store: S,
    max_commit_retries: u32,
}

impl<S> LedgerService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
        }
    }

    pub fn from_config(store: S, config: &LedgerConfig) -> Self {
        Self::new(store).with_max_commit_retries(config.max_commit_retries)
    }

    pub fn with_max_commit_retries(mut self, retries: u32) -> Self {
        self.max_commit_retries = retries;
        self
    }
}

impl<S> LedgerService<S>
where
    S: LedgerStore,
{
    /// Validate and persist a new account. Client names are never stored verbatim.
    #[instrument(skip(self, name), fields(owner = %owner), err)]
    pub async fn open_account(
        &self,
        owner: PrincipalId,
        name: impl Into<String> + Send,
    ) -> Result<(AccountKey, Account), ServiceError> {
        let mut account = Account::new(name);
        account.validate()?;

        let key = self.store.create_account(owner, &account).await?;
        info!(account = %key, "account opened");

        let mut saved = self.store.resolve(owner, &[key]).await?;
        let account = saved.remove(&key).ok_or(StoreError::NotFound(key))?;
        Ok((key, account))
    }

    pub async fn list_accounts(
        &self,
        owner: PrincipalId,
    ) -> Result<Vec<(AccountKey, Account)>, ServiceError> {
        Ok(self.store.list_accounts(owner).await?)
    }

    /// Account and history. Another principal's account reads as not found.
    #[instrument(skip(self), fields(owner = %owner, account = %key), err)]
    pub async fn show_account(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<AccountStatement, ServiceError> {
        let hide = |e: StoreError| match e {
            StoreError::Permission(k) => StoreError::NotFound(k),
            other => other,
        };

        let (account, splits) = self.store.account_statement(owner, key).await.map_err(hide)?;

        Ok(AccountStatement {
            key,
            account,
            splits,
        })
    }

    /// Delete an account that has no splits.
    #[instrument(skip(self), fields(owner = %owner, account = %key), err)]
    pub async fn close_account(&self, owner: PrincipalId, key: AccountKey) -> Result<(), ServiceError> {
        self.store.delete_account(owner, key).await?;
        Ok(())
    }

    /// Post a balanced transaction across the owner's accounts.
    #[instrument(
        skip(self, request),
        fields(owner = %owner, entries = request.entries.len()),
        err
    )]
    pub async fn post_transaction(
        &self,
        owner: PrincipalId,
        request: &PostTransaction,
    ) -> Result<Posting, ServiceError> {
        let staged = request.stage();
        staged.valid()?;
        let keys = staged.account_keys();

        let mut attempt: u32 = 0;
        loop {
            match self.try_post(owner, request, &keys).await {
                Err(ServiceError::Store(StoreError::Conflict(reason)))
                    if attempt < self.max_commit_retries =>
                {
                    attempt += 1;
                    warn!(attempt, %reason, "commit conflict; retrying");
                }
                Ok(posting) => {
                    info!(
                        transaction_id = %posting.transaction_id,
                        splits = posting.splits.len(),
                        "transaction posted"
                    );
                    return Ok(posting);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One resolve → commit → persist attempt on fresh in-memory state.
    async fn try_post(
        &self,
        owner: PrincipalId,
        request: &PostTransaction,
        keys: &[AccountKey],
    ) -> Result<Posting, ServiceError> {
        let mut accounts = self.store.resolve(owner, keys).await?;

        let mut x = request.stage();
        let posting = x.commit(&mut accounts, || self.store.generate_transaction_id())?;

        let written: Vec<_> = posting
            .account_keys()
            .into_iter()
            .filter_map(|key| accounts.remove(&key).map(|account| (key, account)))
            .collect();
        self.store
            .atomic_commit(owner, written, posting.keyed_splits())
            .await?;

        Ok(posting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use splitbook_core::SplitKey;
    use splitbook_ledger::AccountSet;

    use crate::store::InMemoryLedgerStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2014, 11, 1).unwrap()
    }

    fn transfer(entries: &[(AccountKey, Amount)]) -> PostTransaction {
        PostTransaction::new(
            entries
                .iter()
                .map(|(account, amount)| Entry {
                    account: *account,
                    amount: *amount,
                })
                .collect(),
            "Test transaction",
            date(),
        )
    }

    async fn open(
        service: &LedgerService<impl LedgerStore>,
        owner: PrincipalId,
        names: &[&str],
    ) -> Vec<AccountKey> {
        let mut keys = Vec::new();
        for name in names {
            keys.push(service.open_account(owner, *name).await.unwrap().0);
        }
        keys
    }

    /// Store that fails the first `failures` commits with the given error.
    struct FailingCommits {
        inner: InMemoryLedgerStore,
        failures: AtomicU32,
        error: StoreError,
        attempts: AtomicU32,
    }

    impl FailingCommits {
        fn new(failures: u32, error: StoreError) -> Self {
            Self {
                inner: InMemoryLedgerStore::new(),
                failures: AtomicU32::new(failures),
                error,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LedgerStore for FailingCommits {
        async fn create_account(
            &self,
            owner: PrincipalId,
            account: &Account,
        ) -> Result<AccountKey, StoreError> {
            self.inner.create_account(owner, account).await
        }

        async fn list_accounts(
            &self,
            owner: PrincipalId,
        ) -> Result<Vec<(AccountKey, Account)>, StoreError> {
            self.inner.list_accounts(owner).await
        }

        async fn resolve(
            &self,
            owner: PrincipalId,
            keys: &[AccountKey],
        ) -> Result<AccountSet, StoreError> {
            self.inner.resolve(owner, keys).await
        }

        async fn account_splits(
            &self,
            owner: PrincipalId,
            key: AccountKey,
        ) -> Result<Vec<Split>, StoreError> {
            self.inner.account_splits(owner, key).await
        }

        async fn account_statement(
            &self,
            owner: PrincipalId,
            key: AccountKey,
        ) -> Result<(Account, Vec<Split>), StoreError> {
            self.inner.account_statement(owner, key).await
        }

        async fn atomic_commit(
            &self,
            owner: PrincipalId,
            accounts: Vec<(AccountKey, Account)>,
            splits: Vec<(SplitKey, Split)>,
        ) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            self.inner.atomic_commit(owner, accounts, splits).await
        }

        async fn delete_account(
            &self,
            owner: PrincipalId,
            key: AccountKey,
        ) -> Result<(), StoreError> {
            self.inner.delete_account(owner, key).await
        }
    }

    #[tokio::test]
    async fn open_account_trims_and_rejects_blank_names() {
        let service = LedgerService::new(InMemoryLedgerStore::new());
        let owner = PrincipalId::new();

        let (_, account) = service.open_account(owner, "  Checking\t").await.unwrap();
        assert_eq!(account.name(), "Checking");
        assert_eq!(account.total(), 0);

        assert_eq!(
            service.open_account(owner, "   ").await,
            Err(ServiceError::Ledger(LedgerError::InvalidName))
        );
        assert_eq!(service.list_accounts(owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn simple_transfer_posts_one_shared_transaction_id() {
        let service = LedgerService::new(InMemoryLedgerStore::new());
        let owner = PrincipalId::new();
        let keys = open(&service, owner, &["Salary", "Checking", "Savings"]).await;

        let unbalanced = transfer(&[(keys[0], -1000), (keys[1], 800)]);
        assert_eq!(
            service.post_transaction(owner, &unbalanced).await,
            Err(ServiceError::Ledger(LedgerError::UnbalancedAmount { total: -200 }))
        );

        let balanced = transfer(&[(keys[0], -1000), (keys[1], 800), (keys[2], 200)]);
        let posting = service.post_transaction(owner, &balanced).await.unwrap();

        let mut totals = Vec::new();
        for key in &keys {
            let statement = service.show_account(owner, *key).await.unwrap();
            assert_eq!(statement.splits.len(), 1);
            assert_eq!(statement.splits[0].transaction_id(), Some(posting.transaction_id));
            assert_eq!(statement.splits[0].memo(), "Test transaction");
            assert_eq!(statement.splits[0].date(), Some(date()));
            totals.push(statement.account.total());
        }
        assert_eq!(totals, vec![-1000, 800, 200]);
    }

    #[tokio::test]
    async fn invalid_transactions_never_reach_the_store() {
        let store = Arc::new(FailingCommits::new(0, StoreError::Storage("unused".into())));
        let service = LedgerService::new(store.clone());
        let owner = PrincipalId::new();
        let keys = open(&service, owner, &["a1", "a2"]).await;

        let cases = [
            (transfer(&[]), LedgerError::EmptyTransaction),
            (
                transfer(&[(keys[0], 4), (keys[0], -4)]),
                LedgerError::DuplicateAccount(keys[0]),
            ),
            (
                transfer(&[(keys[0], 4), (keys[1], -3)]),
                LedgerError::UnbalancedAmount { total: 1 },
            ),
        ];
        for (request, expected) in cases {
            assert_eq!(
                service.post_transaction(owner, &request).await,
                Err(ServiceError::Ledger(expected))
            );
        }
        assert_eq!(store.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn posting_against_foreign_or_missing_accounts_is_rejected() {
        let service = LedgerService::new(InMemoryLedgerStore::new());
        let alice = PrincipalId::new();
        let bob = PrincipalId::new();
        let mine = open(&service, alice, &["a1"]).await[0];
        let theirs = open(&service, bob, &["b1"]).await[0];

        assert_eq!(
            service
                .post_transaction(alice, &transfer(&[(mine, -5), (theirs, 5)]))
                .await,
            Err(ServiceError::Store(StoreError::Permission(theirs)))
        );

        let missing = AccountKey::new(404);
        assert_eq!(
            service
                .post_transaction(alice, &transfer(&[(mine, -5), (missing, 5)]))
                .await,
            Err(ServiceError::Store(StoreError::NotFound(missing)))
        );

        let statement = service.show_account(alice, mine).await.unwrap();
        assert_eq!(statement.account.total(), 0);
        assert!(statement.splits.is_empty());
    }

    #[tokio::test]
    async fn foreign_accounts_read_as_not_found() {
        let service = LedgerService::new(InMemoryLedgerStore::new());
        let theirs = open(&service, PrincipalId::new(), &["b1"]).await[0];

        assert_eq!(
            service.show_account(PrincipalId::new(), theirs).await,
            Err(ServiceError::Store(StoreError::NotFound(theirs)))
        );
    }

    #[tokio::test]
    async fn conflicts_are_retried_with_a_fresh_transaction() {
        let store = Arc::new(FailingCommits::new(2, StoreError::Conflict("busy".into())));
        let service = LedgerService::new(store.clone()).with_max_commit_retries(2);
        let owner = PrincipalId::new();
        let keys = open(&service, owner, &["a1", "a2"]).await;

        let posting = service
            .post_transaction(owner, &transfer(&[(keys[0], -9), (keys[1], 9)]))
            .await
            .unwrap();

        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(posting.splits.len(), 2);
        let statement = service.show_account(owner, keys[1]).await.unwrap();
        assert_eq!(statement.account.total(), 9);
        assert_eq!(statement.splits.len(), 1);
    }

    #[tokio::test]
    async fn conflicts_beyond_the_retry_budget_are_returned() {
        let store = Arc::new(FailingCommits::new(5, StoreError::Conflict("busy".into())));
        let service = LedgerService::new(store.clone()).with_max_commit_retries(1);
        let owner = PrincipalId::new();
        let keys = open(&service, owner, &["a1", "a2"]).await;

        let err = service
            .post_transaction(owner, &transfer(&[(keys[0], -9), (keys[1], 9)]))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn storage_failure_leaves_durable_state_unchanged() {
        let store = Arc::new(FailingCommits::new(1, StoreError::Storage("disk full".into())));
        let service = LedgerService::new(store.clone());
        let owner = PrincipalId::new();
        let keys = open(&service, owner, &["a1", "a2"]).await;

        let err = service
            .post_transaction(owner, &transfer(&[(keys[0], -9), (keys[1], 9)]))
            .await
            .unwrap_err();

        assert_eq!(err, ServiceError::Store(StoreError::Storage("disk full".into())));
        assert!(!err.is_retryable());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        for key in &keys {
            let statement = service.show_account(owner, *key).await.unwrap();
            assert_eq!(statement.account.total(), 0);
            assert!(statement.splits.is_empty());
        }
    }

    #[tokio::test]
    async fn closing_accounts_with_splits_fails() {
        let service = LedgerService::new(InMemoryLedgerStore::new());
        let owner = PrincipalId::new();
        let keys = open(&service, owner, &["a1", "a2", "unused"]).await;
        service
            .post_transaction(owner, &transfer(&[(keys[0], -1), (keys[1], 1)]))
            .await
            .unwrap();

        assert_eq!(
            service.close_account(owner, keys[0]).await,
            Err(ServiceError::Store(StoreError::AccountHasSplits {
                key: keys[0],
                count: 1
            }))
        );
        assert_eq!(service.close_account(owner, keys[2]).await, Ok(()));
        assert_eq!(service.list_accounts(owner).await.unwrap().len(), 2);
    }

    #[test]
    fn columns_must_have_equal_length() {
        let err = PostTransaction::from_columns(
            &[-123, 123],
            &[AccountKey::new(1)],
            "memo",
            "2014-11-01",
        )
        .unwrap_err();
        assert_eq!(err, ServiceError::InvalidRequest("2 amounts but 1 accounts".into()));
    }

    #[test]
    fn columns_are_paired_in_order() {
        let request = PostTransaction::from_columns(
            &[-123, 123],
            &[AccountKey::new(1), AccountKey::new(2)],
            "memo",
            "2014-11-01",
        )
        .unwrap();
        assert_eq!(request.entries[1], Entry { account: AccountKey::new(2), amount: 123 });
        assert_eq!(request.date, date());
        assert_eq!(request.stage().splits().len(), 2);
    }

    #[test]
    fn dates_must_be_year_month_day() {
        assert_eq!(parse_date("2014-11-01").unwrap(), date());
        assert!(parse_date("").is_err());
        assert!(parse_date("Not a real date").is_err());
        assert!(parse_date("2014-13-01").is_err());
    }

    #[test]
    fn request_json_shape() {
        let request: PostTransaction = serde_json::from_str(
            r#"{"entries":[{"account":1,"amount":-5},{"account":2,"amount":5}],"date":"2014-11-01"}"#,
        )
        .unwrap();
        assert_eq!(request.memo, "");
        assert_eq!(request.entries.len(), 2);
        assert!(request.stage().valid().is_ok());
    }
}
