use crate::types::ProjectStatus;
use bounty_escrow::{EscrowError, TokenAmount};
use thiserror::Error;

/// Ownership violation message for edits. Fixed verbatim for client
/// compatibility.
pub const MSG_OWNER_ONLY_EDIT: &str = "You can only edit projects you own.";
/// Ownership violation message for cancellation.
pub const MSG_OWNER_ONLY_CANCEL: &str = "You can only cancel projects you own.";
/// Ownership violation message for payout authorization.
pub const MSG_OWNER_ONLY_PAYOUT: &str = "Only the project owner can authorize payout.";
/// Worker violation message for completion.
pub const MSG_WORKER_ONLY_COMPLETE: &str = "Only the assigned worker can complete a project.";

/// Ledger error types. A failed call leaves store and escrow unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// The id has been used before, including by cancelled or paid records
    #[error("A project with id {0} already exists")]
    DuplicateId(String),

    /// No record under the id
    #[error("Project not found: {0}")]
    NotFound(String),

    /// Caller is not the identity the operation requires
    #[error("{0}")]
    Unauthorized(&'static str),

    /// The record's status does not permit the operation
    #[error("Project {id} is {status}, the operation is not permitted")]
    InvalidState { id: String, status: ProjectStatus },

    /// Attached value does not cover the reward
    #[error("Insufficient deposit: required {required}, attached {attached}")]
    InsufficientDeposit {
        required: TokenAmount,
        attached: TokenAmount,
    },

    /// A worker is already assigned (claim race guard)
    #[error("Project {0} already has a worker assigned")]
    AlreadyClaimed(String),

    /// A call argument failed input validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Escrow accounting failure
    #[error("Escrow error: {0}")]
    Escrow(String),

    /// Persistence backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// External transfer rail failure
    #[error("Transfer rail error: {0}")]
    Rail(String),
}

impl From<EscrowError> for LedgerError {
    fn from(err: EscrowError) -> Self {
        match err {
            EscrowError::InsufficientDeposit { required, attached } => {
                LedgerError::InsufficientDeposit { required, attached }
            }
            other => LedgerError::Escrow(other.to_string()),
        }
    }
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;
