use chrono::NaiveDate;
use serde::Serialize;

use splitbook_core::{AccountKey, Amount, SplitKey, TransactionId};

/// The addition or subtraction of an amount from a single account, as part of
/// a transaction.
///
/// Splits are immutable once built; the only change they ever see is the
/// transaction id stamped on them at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Split {
    amount: Amount,
    account: Option<AccountKey>,
    transaction_id: Option<TransactionId>,
    memo: String,
    date: Option<NaiveDate>,
}

impl Split {
    /// New split targeting `account`.
    ///
    /// `None` is accepted here so callers can stage partially-built input; a
    /// transaction holding such a split fails validation.
    pub fn new(amount: Amount, account: Option<AccountKey>) -> Self {
        Self {
            amount,
            account,
            transaction_id: None,
            memo: String::new(),
            date: None,
        }
    }

    /// Shorthand for a split against a known account.
    pub fn to(account: AccountKey, amount: Amount) -> Self {
        Self::new(amount, Some(account))
    }

    /// Rehydrate a committed split from a store record.
    pub fn restore(
        key: SplitKey,
        amount: Amount,
        memo: impl Into<String>,
        date: Option<NaiveDate>,
    ) -> Self {
        Self {
            amount,
            account: Some(key.account),
            transaction_id: Some(key.transaction_id),
            memo: memo.into(),
            date,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = memo.into();
        self
    }

    pub fn on(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn account(&self) -> Option<AccountKey> {
        self.account
    }

    /// Unset until the owning transaction commits.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    pub fn memo(&self) -> &str {
        &self.memo
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    /// Durable key; only committed splits with an account have one.
    pub fn key(&self) -> Option<SplitKey> {
        Some(SplitKey::new(self.transaction_id?, self.account?))
    }

    pub(crate) fn assign_transaction(&mut self, id: TransactionId) {
        self.transaction_id = Some(id);
    }
}
