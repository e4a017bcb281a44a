use bounty_escrow::{AccountId, TokenAmount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a project record.
///
/// The status graph is monotonic forward:
///
/// ```text
/// Created ──► Claimed ──► Completed ──► PayoutPending ──► Paid
///    │           │                          │
///    └──► Cancelled ◄───┘                   └──► Completed   (settlement failure)
/// ```
///
/// `PayoutPending` is internal to the settlement window; external
/// enumeration reports it as `Completed` so callers never observe a state
/// whose outcome is unknown. The rollback on settlement failure is the one
/// sanctioned backward edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectStatus {
    /// Posted, reward locked, no worker yet.
    Created,
    /// A worker has claimed the project.
    Claimed,
    /// Worker marked the work done; payout may be authorized.
    Completed,
    /// Payout initiated, external transfer not yet settled.
    PayoutPending,
    /// Transfer settled successfully; reward released to the worker.
    Paid,
    /// Owner cancelled before completion; reward released for refund.
    Cancelled,
}

impl ProjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: &Self) -> bool {
        use ProjectStatus::*;
        match (self, next) {
            (Created, Claimed) => true,
            (Created, Cancelled) => true,

            (Claimed, Completed) => true,
            (Claimed, Cancelled) => true,

            (Completed, PayoutPending) => true,

            // Settlement outcomes; PayoutPending -> Completed is the
            // rollback edge.
            (PayoutPending, Paid) => true,
            (PayoutPending, Completed) => true,

            // Terminal states never transition.
            (Paid, _) | (Cancelled, _) => false,

            _ => false,
        }
    }

    /// Status as reported by external queries. The in-flight settlement
    /// window is not separately enumerable.
    pub fn reported(&self) -> ProjectStatus {
        match self {
            Self::PayoutPending => Self::Completed,
            other => *other,
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One posted work item and its escrowed reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Caller-supplied id, globally unique forever, sole lookup key.
    pub id: String,
    /// Free-form reference URL to the mirrored issue.
    pub github_issue_link: String,
    pub description: String,
    /// Escrowed amount, equal to the value attached at creation.
    pub reward: TokenAmount,
    pub status: ProjectStatus,
    /// Creating caller; the only identity allowed to edit, cancel, or
    /// authorize payout.
    pub project_owner: AccountId,
    /// Set at claim and immutable afterwards. Present on Claimed,
    /// Completed, PayoutPending and Paid records; also retained for
    /// history on a record cancelled after it was claimed.
    pub worker: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    /// Ordering key: assigned at creation, bumped on every status
    /// transition; status views rebuild from it deterministically.
    pub seq: u64,
}

/// What external queries see of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub id: String,
    pub github_issue_link: String,
    pub description: String,
    pub reward: TokenAmount,
    pub status: ProjectStatus,
    pub worker: Option<AccountId>,
    pub project_owner: AccountId,
}

impl From<&ProjectRecord> for ProjectSnapshot {
    fn from(record: &ProjectRecord) -> Self {
        Self {
            id: record.id.clone(),
            github_issue_link: record.github_issue_link.clone(),
            description: record.description.clone(),
            reward: record.reward,
            status: record.status.reported(),
            worker: record.worker.clone(),
            project_owner: record.project_owner.clone(),
        }
    }
}

/// Status-partitioned enumeration of every record, insertion order
/// preserved within each bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllProjects {
    pub created: Vec<ProjectSnapshot>,
    pub claimed: Vec<ProjectSnapshot>,
    pub completed: Vec<ProjectSnapshot>,
    pub paid: Vec<ProjectSnapshot>,
    pub cancelled: Vec<ProjectSnapshot>,
}

/// Per-worker view of claimed and settled work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerProjects {
    pub claimed: Vec<ProjectSnapshot>,
    pub completed: Vec<ProjectSnapshot>,
    pub paid: Vec<ProjectSnapshot>,
}

/// Opaque handle correlating a settlement callback to the payout that
/// scheduled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingTransferId(pub u64);

impl fmt::Display for PendingTransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Outcome of an external transfer, delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    Success,
    Failure,
}

/// Outbound transfer request handed to the host over the rail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub pending_id: PendingTransferId,
    pub to: AccountId,
    pub amount: TokenAmount,
}

/// Record of one settlement attempt, kept for owner-visible history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub project_id: String,
    pub worker: AccountId,
    pub amount: TokenAmount,
    pub outcome: TransferOutcome,
    /// Content hash correlating this attempt across logs.
    pub reference: String,
    pub settled_at: DateTime<Utc>,
}

/// Lifecycle event emitted by the facade when an event channel is
/// configured.
#[derive(Debug, Clone)]
pub enum ProjectEvent {
    Created {
        id: String,
        owner: AccountId,
        reward: TokenAmount,
    },
    Updated {
        id: String,
    },
    Claimed {
        id: String,
        worker: AccountId,
    },
    Completed {
        id: String,
    },
    PayoutInitiated {
        id: String,
        pending_id: PendingTransferId,
    },
    PayoutSettled {
        id: String,
        outcome: TransferOutcome,
    },
    Cancelled {
        id: String,
        refund: TokenAmount,
    },
}
