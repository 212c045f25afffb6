//! Ledger error model.

use thiserror::Error;

use crate::id::AccountKey;

/// Result type used across the ledger core.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-level error.
///
/// Only deterministic failures of the double-entry rules live here. Storage,
/// ownership and concurrency failures belong to the store layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// An account name was empty after trimming whitespace.
    #[error("account name must not be empty")]
    InvalidName,

    /// A transaction had no splits staged.
    #[error("transaction has no splits")]
    EmptyTransaction,

    /// The staged splits do not sum to zero.
    #[error("transaction is unbalanced: nonzero total {total}")]
    UnbalancedAmount { total: i128 },

    /// A split was staged without an account.
    #[error("split has no account")]
    NilAccount,

    /// More than one split targets the same account.
    #[error("multiple splits for account {0}")]
    DuplicateAccount(AccountKey),

    /// A split carries a zero amount.
    #[error("split for account {0} has a zero amount")]
    ZeroAmount(AccountKey),

    /// A split already carries the id of an earlier commit.
    #[error("split for account {0} is already committed")]
    AlreadyCommitted(AccountKey),

    /// A split references an account that is not in the commit working set.
    #[error("account {0} is not loaded in the working set")]
    AccountNotLoaded(AccountKey),

    /// Applying a split would overflow the account total.
    #[error("total of account {0} would overflow")]
    AmountOverflow(AccountKey),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl LedgerError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbalanced_error_reports_total() {
        let err = LedgerError::UnbalancedAmount { total: -200 };
        assert_eq!(err.to_string(), "transaction is unbalanced: nonzero total -200");
    }

    #[test]
    fn already_committed_names_the_account() {
        let err = LedgerError::AlreadyCommitted(AccountKey::new(7));
        assert_eq!(err.to_string(), "split for account 7 is already committed");
    }
}
