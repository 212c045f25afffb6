use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use splitbook_core::{AccountKey, PrincipalId, SplitKey, TransactionId};
use splitbook_ledger::{Account, AccountSet, Split};

/// Ledger store operation error.
///
/// These are **infrastructure errors** (ownership, concurrency, storage) as
/// opposed to ledger errors (validation, balance).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The account does not exist.
    #[error("account {0} not found")]
    NotFound(AccountKey),

    /// The account exists but belongs to another principal.
    #[error("account {0} belongs to another principal")]
    Permission(AccountKey),

    /// A concurrent write touched the same accounts (transient, retryable).
    #[error("concurrent modification: {0}")]
    Conflict(String),

    /// The account still has splits and cannot be deleted.
    #[error("account {key} still has {count} splits")]
    AccountHasSplits { key: AccountKey, count: u64 },

    /// A commit batch was inconsistent (e.g. a split for an account not written).
    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    /// The storage backend failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Durable, principal-scoped account and split storage.
///
/// ## Concurrency
///
/// Accounts carry a store-maintained `version`. `atomic_commit` only writes an
/// account that is still at the version it was resolved at, and bumps it.
/// Two commits over overlapping accounts therefore serialize: the loser gets
/// [`StoreError::Conflict`] and nothing it wrote becomes visible. Commits over
/// disjoint accounts never conflict.
///
/// ## Atomicity
///
/// The account write set and the split write set of one `atomic_commit` land
/// together or not at all.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a new (already validated) account and return its key.
    async fn create_account(
        &self,
        owner: PrincipalId,
        account: &Account,
    ) -> Result<AccountKey, StoreError>;

    /// Every account of `owner`, ordered by name.
    async fn list_accounts(
        &self,
        owner: PrincipalId,
    ) -> Result<Vec<(AccountKey, Account)>, StoreError>;

    /// Load all of `keys` or fail; never returns a partial set.
    async fn resolve(
        &self,
        owner: PrincipalId,
        keys: &[AccountKey],
    ) -> Result<AccountSet, StoreError>;

    /// Durable split history of one account: by date, then largest amount first.
    async fn account_splits(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<Vec<Split>, StoreError>;

    /// One account and its durable split history, read from one consistent
    /// snapshot: the total always equals the sum of the returned splits.
    async fn account_statement(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<(Account, Vec<Split>), StoreError>;

    /// Write updated accounts and new splits as one durable unit.
    ///
    /// Each account's `version()` is the version it was resolved at.
    async fn atomic_commit(
        &self,
        owner: PrincipalId,
        accounts: Vec<(AccountKey, Account)>,
        splits: Vec<(SplitKey, Split)>,
    ) -> Result<(), StoreError>;

    /// Delete an account without splits.
    ///
    /// Absent and foreign accounts are reported as success so callers cannot
    /// probe for other principals' keys.
    async fn delete_account(&self, owner: PrincipalId, key: AccountKey) -> Result<(), StoreError>;

    /// Fresh id for one commit; must not collide across the store.
    fn generate_transaction_id(&self) -> TransactionId {
        TransactionId::random()
    }
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn create_account(
        &self,
        owner: PrincipalId,
        account: &Account,
    ) -> Result<AccountKey, StoreError> {
        (**self).create_account(owner, account).await
    }

    async fn list_accounts(
        &self,
        owner: PrincipalId,
    ) -> Result<Vec<(AccountKey, Account)>, StoreError> {
        (**self).list_accounts(owner).await
    }

    async fn resolve(
        &self,
        owner: PrincipalId,
        keys: &[AccountKey],
    ) -> Result<AccountSet, StoreError> {
        (**self).resolve(owner, keys).await
    }

    async fn account_splits(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<Vec<Split>, StoreError> {
        (**self).account_splits(owner, key).await
    }

    async fn account_statement(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<(Account, Vec<Split>), StoreError> {
        (**self).account_statement(owner, key).await
    }

    async fn atomic_commit(
        &self,
        owner: PrincipalId,
        accounts: Vec<(AccountKey, Account)>,
        splits: Vec<(SplitKey, Split)>,
    ) -> Result<(), StoreError> {
        (**self).atomic_commit(owner, accounts, splits).await
    }

    async fn delete_account(&self, owner: PrincipalId, key: AccountKey) -> Result<(), StoreError> {
        (**self).delete_account(owner, key).await
    }

    fn generate_transaction_id(&self) -> TransactionId {
        (**self).generate_transaction_id()
    }
}

/// Check that a commit batch is internally consistent.
///
/// Every account and split key appears at most once, and every split targets
/// an account written in the same batch. Shared by the store implementations so
/// both reject the same batches before touching storage.
pub(crate) fn check_commit_batch(
    accounts: &[(AccountKey, Account)],
    splits: &[(SplitKey, Split)],
) -> Result<(), StoreError> {
    let mut written = HashSet::with_capacity(accounts.len());
    for (key, _) in accounts {
        if !written.insert(*key) {
            return Err(StoreError::InvalidCommit(format!(
                "account {key} is written more than once"
            )));
        }
    }

    let mut seen = HashSet::with_capacity(splits.len());
    for (key, split) in splits {
        if split.key() != Some(*key) {
            return Err(StoreError::InvalidCommit(format!(
                "split key {key} does not match split contents"
            )));
        }
        if !seen.insert(*key) {
            return Err(StoreError::InvalidCommit(format!(
                "split {key} is written more than once"
            )));
        }
        if !written.contains(&key.account) {
            return Err(StoreError::InvalidCommit(format!(
                "split {key} targets account {} which is not written in this batch",
                key.account
            )));
        }
    }
    Ok(())
}
