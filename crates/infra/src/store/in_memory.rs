use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use splitbook_core::{AccountKey, Amount, PrincipalId, SplitKey};
use splitbook_ledger::{Account, AccountSet, Split};

use super::r#trait::{LedgerStore, StoreError, check_commit_batch};

#[derive(Debug, Clone)]
struct StoredAccount {
    owner: PrincipalId,
    name: String,
    total: Amount,
    version: u64,
}

impl StoredAccount {
    fn to_account(&self) -> Account {
        Account::restore(self.name.clone(), self.total, self.version)
    }
}

#[derive(Debug, Default)]
struct State {
    last_key: i64,
    accounts: HashMap<AccountKey, StoredAccount>,
    splits: BTreeMap<SplitKey, Split>,
}

impl State {
    fn owned(&self, owner: PrincipalId, key: AccountKey) -> Result<&StoredAccount, StoreError> {
        let stored = self.accounts.get(&key).ok_or(StoreError::NotFound(key))?;
        if stored.owner != owner {
            return Err(StoreError::Permission(key));
        }
        Ok(stored)
    }

    /// Splits of `key` by date, then largest amount first.
    fn history(&self, key: AccountKey) -> Vec<Split> {
        let mut splits: Vec<Split> = self
            .splits
            .iter()
            .filter(|(k, _)| k.account == key)
            .map(|(_, s)| s.clone())
            .collect();
        splits.sort_by(|a, b| a.date().cmp(&b.date()).then(b.amount().cmp(&a.amount())));
        splits
    }

    fn split_count(&self, key: AccountKey) -> u64 {
        self.splits.keys().filter(|k| k.account == key).count() as u64
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. One lock guards all state: a commit validates both
/// write sets and applies them under the same write guard, so readers never
/// observe half a commit.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<State>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_account(
        &self,
        owner: PrincipalId,
        account: &Account,
    ) -> Result<AccountKey, StoreError> {
        let mut state = self.write()?;
        state.last_key += 1;
        let key = AccountKey::new(state.last_key);
        state.accounts.insert(
            key,
            StoredAccount {
                owner,
                name: account.name().to_string(),
                total: 0,
                version: 1,
            },
        );
        Ok(key)
    }

    async fn list_accounts(
        &self,
        owner: PrincipalId,
    ) -> Result<Vec<(AccountKey, Account)>, StoreError> {
        let state = self.read()?;
        let mut accounts: Vec<(AccountKey, Account)> = state
            .accounts
            .iter()
            .filter(|(_, stored)| stored.owner == owner)
            .map(|(key, stored)| (*key, stored.to_account()))
            .collect();
        accounts.sort_by(|(ka, a), (kb, b)| a.name().cmp(b.name()).then(ka.cmp(kb)));
        Ok(accounts)
    }

    async fn resolve(
        &self,
        owner: PrincipalId,
        keys: &[AccountKey],
    ) -> Result<AccountSet, StoreError> {
        let state = self.read()?;
        keys.iter()
            .map(|key| Ok((*key, state.owned(owner, *key)?.to_account())))
            .collect()
    }

    async fn account_splits(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<Vec<Split>, StoreError> {
        let state = self.read()?;
        state.owned(owner, key)?;
        Ok(state.history(key))
    }

    async fn account_statement(
        &self,
        owner: PrincipalId,
        key: AccountKey,
    ) -> Result<(Account, Vec<Split>), StoreError> {
        let state = self.read()?;
        let account = state.owned(owner, key)?.to_account();
        Ok((account, state.history(key)))
    }

    async fn atomic_commit(
        &self,
        owner: PrincipalId,
        accounts: Vec<(AccountKey, Account)>,
        splits: Vec<(SplitKey, Split)>,
    ) -> Result<(), StoreError> {
        check_commit_batch(&accounts, &splits)?;

        let mut state = self.write()?;

        // Check both write sets before applying either.
        for (key, account) in &accounts {
            let stored = state.owned(owner, *key)?;
            if stored.version != account.version() {
                return Err(StoreError::Conflict(format!(
                    "account {key} is at version {}, commit expected {}",
                    stored.version,
                    account.version()
                )));
            }
        }
        for (key, _) in &splits {
            if state.splits.contains_key(key) {
                return Err(StoreError::Conflict(format!("split {key} already exists")));
            }
        }

        for (key, account) in accounts {
            if let Some(stored) = state.accounts.get_mut(&key) {
                stored.name = account.name().to_string();
                stored.total = account.total();
                stored.version += 1;
            }
        }
        let count = splits.len();
        state.splits.extend(splits);

        debug!(splits = count, "in-memory commit applied");
        Ok(())
    }

    async fn delete_account(&self, owner: PrincipalId, key: AccountKey) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match state.accounts.get(&key) {
            Some(stored) if stored.owner == owner => {}
            _ => return Ok(()),
        }

        let count = state.split_count(key);
        if count != 0 {
            return Err(StoreError::AccountHasSplits { key, count });
        }

        state.accounts.remove(&key);
        Ok(())
    }
}
