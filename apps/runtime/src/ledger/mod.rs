//! Account balances and the append-only transaction log.

pub mod store;
pub mod types;


pub use store::{LedgerStore, LedgerStoreError};
pub use types::{AccountRow, AppliedDelta, LedgerDelta, TransactionRow, TransactionType};
