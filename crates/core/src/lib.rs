//! Ledger foundation building blocks.
//!
//! Identifiers, the amount type and the ledger error model. No IO.

pub mod error;
pub mod id;

pub use error::{LedgerError, LedgerResult};
pub use id::{AccountKey, Amount, PrincipalId, SplitKey, TransactionId};
