//! Double-entry ledger core.
//!
//! Pure domain logic only: no IO, no persistence concerns. Stores hand in
//! already-resolved accounts and persist what a commit returns.

pub mod account;
pub mod split;
pub mod transaction;

pub use account::{Account, AccountSet};
pub use split::Split;
pub use transaction::{Posting, Transaction};

pub use splitbook_core::{AccountKey, Amount, LedgerError, LedgerResult, SplitKey, TransactionId};
