use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use splitbook_core::{AccountKey, Amount, LedgerError, LedgerResult};

use crate::split::Split;

/// Working set of a commit: resolved accounts by key.
///
/// Ordered so that iteration (and therefore persistence order) is deterministic.
pub type AccountSet = BTreeMap<AccountKey, Account>;

/// A named bucket that can receive splits in a transaction.
///
/// Accounts are more general than a real-life bank account: they can stand for
/// any category of income or expense, like "Salary" or "Rent".
///
/// Only `name` is accepted from clients; `total` is serialized for display but
/// never read back from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    name: String,
    #[serde(skip_deserializing)]
    total: Amount,
    #[serde(skip)]
    version: u64,
    #[serde(skip)]
    splits: Vec<Split>,
}

impl Account {
    /// Unsaved account with a zero total.
    ///
    /// The name is taken verbatim; call [`Account::validate`] before saving.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total: 0,
            version: 0,
            splits: Vec::new(),
        }
    }

    /// Rehydrate an account from a store record.
    pub fn restore(name: impl Into<String>, total: Amount, version: u64) -> Self {
        Self {
            name: name.into(),
            total,
            version,
            splits: Vec::new(),
        }
    }

    /// Trim the name in place and reject it if nothing is left.
    ///
    /// The trimmed name is kept even when validation fails.
    pub fn validate(&mut self) -> LedgerResult<()> {
        let trimmed = self.name.trim();
        if trimmed.len() != self.name.len() {
            self.name = trimmed.to_string();
        }

        if self.name.is_empty() {
            return Err(LedgerError::InvalidName);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sum of every split committed to this account.
    pub fn total(&self) -> Amount {
        self.total
    }

    /// Store revision this value was loaded at (0 if never saved).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Splits committed through this in-memory value, oldest first.
    pub fn splits(&self) -> &[Split] {
        &self.splits
    }

    /// Whether `amount` can be added without overflowing the total.
    pub(crate) fn can_absorb(&self, amount: Amount) -> bool {
        self.total.checked_add(amount).is_some()
    }

    /// Apply a committed split. Callers check [`Account::can_absorb`] first.
    pub(crate) fn record(&mut self, split: Split) {
        self.total += split.amount();
        self.splits.push(split);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_name_is_unchanged() {
        let mut a = Account::new("valid");
        assert_eq!(a.validate(), Ok(()));
        assert_eq!(a.name(), "valid");
    }

    #[test]
    fn whitespace_is_trimmed() {
        let mut a = Account::new("\ttrim whitespace   ");
        assert_eq!(a.validate(), Ok(()));
        assert_eq!(a.name(), "trim whitespace");
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut a = Account::new("");
        assert_eq!(a.validate(), Err(LedgerError::InvalidName));
    }

    #[test]
    fn blank_name_is_rejected_and_trimmed() {
        let mut a = Account::new(" \n\t ");
        assert_eq!(a.validate(), Err(LedgerError::InvalidName));
        assert_eq!(a.name(), "");
    }

    #[test]
    fn json_shows_name_and_total_only() {
        let a = Account::restore("Checking", 12345, 4);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "Checking", "total": 12345 }));
    }

    #[test]
    fn json_input_cannot_set_total() {
        let a: Account = serde_json::from_str(r#"{"name":"Rent","total":999}"#).unwrap();
        assert_eq!(a.name(), "Rent");
        assert_eq!(a.total(), 0);
        assert_eq!(a.version(), 0);
    }

    proptest! {
        /// Property: validation is idempotent and all-whitespace names always fail.
        #[test]
        fn validate_is_idempotent(name in "[ \t\n]{0,3}[a-zA-Z0-9 ]{0,12}[ \t\n]{0,3}") {
            let mut once = Account::new(name.clone());
            let first = once.validate();

            let mut twice = once.clone();
            let second = twice.validate();

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(once.name(), twice.name());
            prop_assert_eq!(first.is_err(), name.trim().is_empty());
        }
    }
}
