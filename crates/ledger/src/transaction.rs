use std::collections::HashSet;

use splitbook_core::{AccountKey, LedgerError, LedgerResult, SplitKey, TransactionId};

use crate::account::AccountSet;
use crate::split::Split;

/// A series of splits that move value between accounts under double-entry rules.
///
/// A transaction can only be committed when it has splits, they add up to zero,
/// every split names an account, no two splits name the same account, and no
/// split was posted by an earlier commit. So some accounts end up abstract:
/// "Salary" is debited for every credit to checking and grows more negative
/// over time.
///
/// ## Lifecycle
///
/// - **Open**: splits are staged with [`Transaction::add_split`]. A failed
///   [`Transaction::valid`] or [`Transaction::commit`] leaves it open.
/// - **Committed**: a successful commit drains the staged splits. Committing the
///   same value again fails with [`LedgerError::EmptyTransaction`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    splits: Vec<Split>,
    total: i128,
}

/// Result of a successful commit: the splits to persist, stamped with the
/// transaction id they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub transaction_id: TransactionId,
    pub splits: Vec<Split>,
}

impl Posting {
    /// Keys of the accounts touched by this posting, in split order.
    pub fn account_keys(&self) -> Vec<AccountKey> {
        self.splits.iter().filter_map(Split::account).collect()
    }

    /// Splits paired with their durable keys.
    pub fn keyed_splits(&self) -> Vec<(SplitKey, Split)> {
        self.splits
            .iter()
            .filter_map(|s| s.key().map(|k| (k, s.clone())))
            .collect()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a split. No validation happens until `valid`/`commit`.
    pub fn add_split(&mut self, split: Split) {
        self.total += i128::from(split.amount());
        self.splits.push(split);
    }

    pub fn add_splits(&mut self, splits: impl IntoIterator<Item = Split>) {
        for split in splits {
            self.add_split(split);
        }
    }

    pub fn splits(&self) -> &[Split] {
        &self.splits
    }

    /// Running sum of the staged amounts.
    pub fn total(&self) -> i128 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// Distinct account keys referenced by staged splits.
    pub fn account_keys(&self) -> Vec<AccountKey> {
        let mut keys: Vec<AccountKey> = self.splits.iter().filter_map(Split::account).collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Check that the transaction can be committed, without changing anything.
    pub fn valid(&self) -> LedgerResult<()> {
        if self.splits.is_empty() {
            return Err(LedgerError::EmptyTransaction);
        }

        if self.total != 0 {
            return Err(LedgerError::UnbalancedAmount { total: self.total });
        }

        let keys = self
            .splits
            .iter()
            .map(Split::account)
            .collect::<Option<Vec<AccountKey>>>()
            .ok_or(LedgerError::NilAccount)?;

        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !seen.insert(*key) {
                return Err(LedgerError::DuplicateAccount(*key));
            }
        }

        if let Some((key, _)) = keys
            .iter()
            .zip(&self.splits)
            .find(|(_, split)| split.amount() == 0)
        {
            return Err(LedgerError::ZeroAmount(*key));
        }

        if let Some((key, _)) = keys
            .iter()
            .zip(&self.splits)
            .find(|(_, split)| split.transaction_id().is_some())
        {
            return Err(LedgerError::AlreadyCommitted(*key));
        }

        Ok(())
    }

    /// Apply the staged splits to `accounts`, if the transaction is valid.
    ///
    /// `next_id` is called once, after every check passed, to obtain the id
    /// shared by all posted splits. On error neither `self` nor `accounts` is
    /// modified.
    pub fn commit(
        &mut self,
        accounts: &mut AccountSet,
        next_id: impl FnOnce() -> TransactionId,
    ) -> LedgerResult<Posting> {
        self.valid()?;

        for split in &self.splits {
            let key = split.account().ok_or(LedgerError::NilAccount)?;
            let account = accounts
                .get(&key)
                .ok_or(LedgerError::AccountNotLoaded(key))?;
            if !account.can_absorb(split.amount()) {
                return Err(LedgerError::AmountOverflow(key));
            }
        }

        let transaction_id = next_id();
        let mut posted = Vec::with_capacity(self.splits.len());

        for mut split in std::mem::take(&mut self.splits) {
            split.assign_transaction(transaction_id);
            if let Some(account) = split.account().and_then(|k| accounts.get_mut(&k)) {
                account.record(split.clone());
            }
            posted.push(split);
        }
        self.total = 0;

        Ok(Posting {
            transaction_id,
            splits: posted,
        })
    }
}
