pub mod error;
pub mod ledger;
pub mod storage;
pub mod types;

pub use error::{EscrowError, Result};
pub use ledger::EscrowLedger;
pub use storage::{EscrowStorage, MemoryStorage};
pub use types::{AccountId, TokenAmount};
