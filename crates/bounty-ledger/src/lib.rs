//! Bounty ledger engine: project records, escrowed rewards and
//! two-phase payout settlement.
//!
//! A posted project locks its reward in escrow at creation and walks a
//! fixed lifecycle (created, claimed, completed, paid, with owner
//! cancellation before completion). Value only leaves escrow through a
//! settled payout to the worker or a refund to the owner, so the total
//! held always equals the sum of rewards on live records.
//!
//! [`BountyLedger`] is the host-facing entry point; the store, escrow
//! and settlement layers underneath are usable on their own.

pub mod access;
pub mod engine;
pub mod error;
pub mod settlement;
pub mod storage;
pub mod store;
pub mod types;

pub use engine::{BountyLedger, CallContext, LedgerConfig};
pub use error::{LedgerError, Result};
pub use settlement::{ChannelTransferRail, PayoutCoordinator, TransferRail};
pub use storage::{JsonFileStorage, MemoryStorage, ProjectStorage};
pub use store::ProjectStore;
pub use types::{
    AllProjects, PendingTransferId, ProjectEvent, ProjectRecord, ProjectSnapshot, ProjectStatus,
    SettlementRecord, TransferOutcome, TransferRequest, WorkerProjects,
};

pub use bounty_escrow::{AccountId, EscrowLedger, EscrowStorage, TokenAmount};
