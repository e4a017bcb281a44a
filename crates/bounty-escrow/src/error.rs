use crate::types::TokenAmount;
use thiserror::Error;

/// Escrow accounting error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// Attached value does not cover the reward being locked
    #[error("Insufficient deposit: required {required}, attached {attached}")]
    InsufficientDeposit {
        required: TokenAmount,
        attached: TokenAmount,
    },

    /// A zero-value escrow is never accepted
    #[error("Escrow amount must be greater than zero for project {0}")]
    ZeroAmount(String),

    /// The project already has a locked reward
    #[error("Reward already locked for project {0}")]
    AlreadyLocked(String),

    /// No locked reward recorded for the project
    #[error("No locked reward for project {0}")]
    LockNotFound(String),

    /// A payout is already outstanding for the project
    #[error("Payout already in flight for project {0}")]
    AlreadyInFlight(String),

    /// Release-for-payout requires the in-flight marker
    #[error("No payout in flight for project {0}")]
    NotInFlight(String),

    /// Locked-total arithmetic overflowed
    #[error("Locked total overflow while locking {0}")]
    Overflow(TokenAmount),

    /// Persistence backend failure
    #[error("Escrow storage error: {0}")]
    Storage(String),
}

/// Result type for escrow operations
pub type Result<T> = std::result::Result<T, EscrowError>;
