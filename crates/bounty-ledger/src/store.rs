use crate::access;
use crate::error::{
    LedgerError, Result, MSG_OWNER_ONLY_CANCEL, MSG_OWNER_ONLY_EDIT, MSG_OWNER_ONLY_PAYOUT,
    MSG_WORKER_ONLY_COMPLETE,
};
use crate::storage::ProjectStorage;
use crate::types::{ProjectRecord, ProjectStatus};
use bounty_escrow::{AccountId, TokenAmount};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct StoreState {
    /// Authoritative map. Records are never removed, so past ids stay
    /// unavailable forever.
    records: HashMap<String, ProjectRecord>,
    /// Derived status views, id lists in insertion order per status.
    views: HashMap<ProjectStatus, Vec<String>>,
    next_seq: u64,
}

impl StoreState {
    fn empty() -> Self {
        Self {
            records: HashMap::new(),
            views: HashMap::new(),
            next_seq: 0,
        }
    }

    fn enter_view(&mut self, status: ProjectStatus, id: &str) {
        self.views.entry(status).or_default().push(id.to_string());
    }

    fn move_view(&mut self, id: &str, from: ProjectStatus, to: ProjectStatus) {
        if let Some(view) = self.views.get_mut(&from) {
            view.retain(|entry| entry != id);
        }
        self.enter_view(to, id);
    }
}

/// Exclusive owner of all project records.
///
/// Holds the id-keyed map plus status-partitioned views used purely for
/// enumeration; both live under one lock so no caller ever observes a
/// record in two status buckets, or in none, between transitions. Every
/// mutation is persisted through the storage seam before the in-memory
/// state changes, so a failed call leaves everything untouched.
pub struct ProjectStore {
    storage: Arc<dyn ProjectStorage>,
    state: RwLock<StoreState>,
}

impl ProjectStore {
    pub fn new(storage: Arc<dyn ProjectStorage>) -> Self {
        Self {
            storage,
            state: RwLock::new(StoreState::empty()),
        }
    }

    /// Rebuild the store from persisted records. Views are recomputed by
    /// replaying records in `seq` order.
    pub async fn load(storage: Arc<dyn ProjectStorage>) -> Result<Self> {
        let mut records = storage
            .get_all()
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        records.sort_by_key(|record| record.seq);

        let mut state = StoreState::empty();
        for record in records {
            state.next_seq = state.next_seq.max(record.seq + 1);
            state.enter_view(record.status, &record.id);
            state.records.insert(record.id.clone(), record);
        }

        info!(
            record_count = state.records.len(),
            next_seq = state.next_seq,
            "Project store loaded"
        );

        Ok(Self {
            storage,
            state: RwLock::new(state),
        })
    }

    /// Insert a new record with status `Created` and no worker.
    pub async fn create(
        &self,
        id: &str,
        github_issue_link: String,
        description: String,
        reward: TokenAmount,
        owner: AccountId,
    ) -> Result<String> {
        let mut state = self.state.write().await;

        if state.records.contains_key(id) {
            return Err(LedgerError::DuplicateId(id.to_string()));
        }

        let record = ProjectRecord {
            id: id.to_string(),
            github_issue_link,
            description,
            reward,
            status: ProjectStatus::Created,
            project_owner: owner.clone(),
            worker: None,
            created_at: Utc::now(),
            seq: state.next_seq,
        };

        self.persist(&record).await?;

        state.next_seq += 1;
        state.enter_view(ProjectStatus::Created, id);
        state.records.insert(id.to_string(), record);

        info!(
            project_id = %id,
            owner = %owner,
            reward = %reward,
            "Project created"
        );
        Ok(id.to_string())
    }

    /// Edit the mutable fields. Only the owner may edit, and only while
    /// the record is `Created` or `Claimed`.
    pub async fn update(
        &self,
        id: &str,
        caller: &AccountId,
        github_issue_link: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        let record = state
            .records
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if !access::is_owner(record, caller) {
            return Err(LedgerError::Unauthorized(MSG_OWNER_ONLY_EDIT));
        }
        if !matches!(
            record.status,
            ProjectStatus::Created | ProjectStatus::Claimed
        ) {
            return Err(LedgerError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }

        let mut updated = record.clone();
        if let Some(link) = github_issue_link {
            updated.github_issue_link = link;
        }
        if let Some(desc) = description {
            updated.description = desc;
        }

        self.persist(&updated).await?;
        state.records.insert(id.to_string(), updated);

        debug!(project_id = %id, caller = %caller, "Project updated");
        Ok(())
    }

    /// Assign a worker and transition `Created -> Claimed`.
    pub async fn claim(&self, id: &str, worker: AccountId) -> Result<()> {
        let mut state = self.state.write().await;

        let record = state
            .records
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if record.status != ProjectStatus::Created {
            return Err(LedgerError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }
        // Unreachable given the status check, but guards a racing claim.
        if record.worker.is_some() {
            return Err(LedgerError::AlreadyClaimed(id.to_string()));
        }

        let mut updated = record.clone();
        updated.worker = Some(worker.clone());
        updated.status = ProjectStatus::Claimed;
        updated.seq = state.next_seq;

        self.persist(&updated).await?;

        state.next_seq += 1;
        state.move_view(id, ProjectStatus::Created, ProjectStatus::Claimed);
        state.records.insert(id.to_string(), updated);

        info!(project_id = %id, worker = %worker, "Project claimed");
        Ok(())
    }

    /// Worker marks the work done: `Claimed -> Completed`. The editable
    /// window ends here.
    pub async fn complete(&self, id: &str, caller: &AccountId) -> Result<()> {
        let mut state = self.state.write().await;

        let record = state
            .records
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if !access::is_worker(record, caller) {
            return Err(LedgerError::Unauthorized(MSG_WORKER_ONLY_COMPLETE));
        }
        if record.status != ProjectStatus::Claimed {
            return Err(LedgerError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }

        self.transition(&mut state, id, ProjectStatus::Completed)
            .await?;

        info!(project_id = %id, worker = %caller, "Project completed");
        Ok(())
    }

    /// Owner-initiated early exit: `Created | Claimed -> Cancelled`.
    /// Returns the escrowed reward for refund.
    pub async fn cancel(&self, id: &str, caller: &AccountId) -> Result<TokenAmount> {
        let mut state = self.state.write().await;
        let reward = Self::cancellable(&state, id, caller)?;

        self.transition(&mut state, id, ProjectStatus::Cancelled)
            .await?;

        info!(project_id = %id, owner = %caller, refund = %reward, "Project cancelled");
        Ok(reward)
    }

    /// Run the cancellation preconditions without mutating anything.
    /// Lets the caller release escrow before committing the transition.
    pub async fn ensure_cancellable(&self, id: &str, caller: &AccountId) -> Result<TokenAmount> {
        let state = self.state.read().await;
        Self::cancellable(&state, id, caller)
    }

    fn cancellable(state: &StoreState, id: &str, caller: &AccountId) -> Result<TokenAmount> {
        let record = state
            .records
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if !access::is_owner(record, caller) {
            return Err(LedgerError::Unauthorized(MSG_OWNER_ONLY_CANCEL));
        }
        if !matches!(
            record.status,
            ProjectStatus::Created | ProjectStatus::Claimed
        ) {
            return Err(LedgerError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }
        Ok(record.reward)
    }

    /// Open the settlement window: `Completed -> PayoutPending`. Only
    /// the owner may authorize payout; a record already in the window
    /// fails the status check, so no second payout can start while one
    /// is outstanding.
    pub async fn begin_payout(&self, id: &str, caller: &AccountId) -> Result<ProjectRecord> {
        let mut state = self.state.write().await;

        let record = state
            .records
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if !access::is_owner(record, caller) {
            return Err(LedgerError::Unauthorized(MSG_OWNER_ONLY_PAYOUT));
        }
        if record.status != ProjectStatus::Completed {
            return Err(LedgerError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }

        self.transition(&mut state, id, ProjectStatus::PayoutPending)
            .await?;

        info!(project_id = %id, owner = %caller, "Payout window opened");
        Ok(state.records[id].clone())
    }

    /// Settlement success: `PayoutPending -> Paid`.
    pub async fn finish_payout(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        self.expect_status(&state, id, ProjectStatus::PayoutPending)?;
        self.transition(&mut state, id, ProjectStatus::Paid).await?;
        info!(project_id = %id, "Payout settled, project paid");
        Ok(())
    }

    /// Settlement failure: `PayoutPending -> Completed`, the one
    /// sanctioned backward edge. The owner may retry.
    pub async fn rollback_payout(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        self.expect_status(&state, id, ProjectStatus::PayoutPending)?;
        self.transition(&mut state, id, ProjectStatus::Completed)
            .await?;
        info!(project_id = %id, "Payout rolled back, project completed again");
        Ok(())
    }

    pub async fn exists(&self, id: &str) -> bool {
        let state = self.state.read().await;
        state.records.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<ProjectRecord> {
        let state = self.state.read().await;
        state.records.get(id).cloned()
    }

    /// Records currently in `status`, insertion order preserved.
    pub async fn list_by_status(&self, status: ProjectStatus) -> Vec<ProjectRecord> {
        let state = self.state.read().await;
        state
            .views
            .get(&status)
            .map(|view| {
                view.iter()
                    .filter_map(|id| state.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records claimed by `worker`, ordered by transition sequence.
    pub async fn list_by_worker(&self, worker: &AccountId) -> Vec<ProjectRecord> {
        let state = self.state.read().await;
        let mut records: Vec<ProjectRecord> = state
            .records
            .values()
            .filter(|record| record.worker.as_ref() == Some(worker))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.seq);
        records
    }

    /// Records owned by `owner`, ordered by transition sequence.
    pub async fn list_by_owner(&self, owner: &AccountId) -> Vec<ProjectRecord> {
        let state = self.state.read().await;
        let mut records: Vec<ProjectRecord> = state
            .records
            .values()
            .filter(|record| &record.project_owner == owner)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.seq);
        records
    }

    fn expect_status(&self, state: &StoreState, id: &str, status: ProjectStatus) -> Result<()> {
        let record = state
            .records
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if record.status != status {
            return Err(LedgerError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }
        Ok(())
    }

    /// Apply a validated status transition: persist first, then move the
    /// record between views and bump its ordering key.
    async fn transition(
        &self,
        state: &mut StoreState,
        id: &str,
        to: ProjectStatus,
    ) -> Result<()> {
        let record = state
            .records
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        let from = record.status;
        debug_assert!(from.can_transition_to(&to));

        let mut updated = record.clone();
        updated.status = to;
        updated.seq = state.next_seq;

        self.persist(&updated).await?;

        state.next_seq += 1;
        state.move_view(id, from, to);
        state.records.insert(id.to_string(), updated);

        debug!(project_id = %id, from = %from, to = %to, "Status transition");
        Ok(())
    }

    async fn persist(&self, record: &ProjectRecord) -> Result<()> {
        self.storage
            .put(record)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }
}
