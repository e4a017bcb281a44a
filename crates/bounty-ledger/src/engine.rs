use crate::error::{LedgerError, Result};
use crate::settlement::{PayoutCoordinator, TransferRail};
use crate::storage::ProjectStorage;
use crate::store::ProjectStore;
use crate::types::{
    AllProjects, PendingTransferId, ProjectEvent, ProjectSnapshot, ProjectStatus, SettlementRecord,
    TransferOutcome, WorkerProjects,
};
use bounty_escrow::{AccountId, EscrowLedger, EscrowStorage, TokenAmount};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Input limits enforced at the call boundary.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub max_id_len: usize,
    pub max_link_len: usize,
    pub max_description_len: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_id_len: 64,
            max_link_len: 512,
            max_description_len: 4096,
        }
    }
}

/// Ambient call information the host supplies with each operation.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub caller: AccountId,
    pub attached_deposit: TokenAmount,
}

impl CallContext {
    pub fn new(caller: impl Into<AccountId>) -> Self {
        Self {
            caller: caller.into(),
            attached_deposit: TokenAmount::ZERO,
        }
    }

    pub fn with_deposit(caller: impl Into<AccountId>, deposit: TokenAmount) -> Self {
        Self {
            caller: caller.into(),
            attached_deposit: deposit,
        }
    }
}

/// Single entry point tying the project store, the escrow ledger and
/// the payout coordinator together. Hosts embed this and route every
/// caller through it.
pub struct BountyLedger {
    store: Arc<ProjectStore>,
    escrow: Arc<EscrowLedger>,
    coordinator: PayoutCoordinator,
    config: LedgerConfig,
    events: Option<mpsc::UnboundedSender<ProjectEvent>>,
}

impl BountyLedger {
    pub fn new(
        project_storage: Arc<dyn ProjectStorage>,
        escrow_storage: Arc<dyn EscrowStorage>,
        rail: Arc<dyn TransferRail>,
        config: LedgerConfig,
    ) -> Self {
        let store = Arc::new(ProjectStore::new(project_storage));
        let escrow = Arc::new(EscrowLedger::new(escrow_storage));
        let coordinator = PayoutCoordinator::new(store.clone(), escrow.clone(), rail);
        Self {
            store,
            escrow,
            coordinator,
            config,
            events: None,
        }
    }

    /// Rebuild the ledger from persisted project and escrow state.
    pub async fn load(
        project_storage: Arc<dyn ProjectStorage>,
        escrow_storage: Arc<dyn EscrowStorage>,
        rail: Arc<dyn TransferRail>,
        config: LedgerConfig,
    ) -> Result<Self> {
        let store = Arc::new(ProjectStore::load(project_storage).await?);
        let escrow = Arc::new(
            EscrowLedger::load(escrow_storage)
                .await
                .map_err(LedgerError::from)?,
        );
        let coordinator = PayoutCoordinator::new(store.clone(), escrow.clone(), rail);
        Ok(Self {
            store,
            escrow,
            coordinator,
            config,
            events: None,
        })
    }

    /// Attach an event channel. Lifecycle events are emitted after each
    /// successful mutation; a dropped receiver is ignored.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ProjectEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Post a project. The attached deposit becomes the escrowed reward
    /// in full, so the recorded reward can never disagree with the
    /// value actually held.
    pub async fn add_project(
        &self,
        ctx: &CallContext,
        id: &str,
        github_issue_link: String,
        description: String,
    ) -> Result<String> {
        self.validate_inputs(id, &github_issue_link, &description)?;
        if ctx.attached_deposit.is_zero() {
            return Err(LedgerError::InsufficientDeposit {
                required: TokenAmount::from_base_units(1),
                attached: TokenAmount::ZERO,
            });
        }
        if self.store.exists(id).await {
            return Err(LedgerError::DuplicateId(id.to_string()));
        }

        let reward = ctx.attached_deposit;
        self.escrow.lock(id, reward, ctx.attached_deposit).await?;

        match self
            .store
            .create(
                id,
                github_issue_link,
                description,
                reward,
                ctx.caller.clone(),
            )
            .await
        {
            Ok(created) => {
                self.emit(ProjectEvent::Created {
                    id: created.clone(),
                    owner: ctx.caller.clone(),
                    reward,
                });
                Ok(created)
            }
            Err(e) => {
                // Unwind the lock so the failed call leaves no value
                // held against a record that does not exist.
                if let Err(unlock) = self.escrow.release_for_refund(id).await {
                    warn!(
                        project_id = %id,
                        error = %unlock,
                        "Escrow left locked after failed creation"
                    );
                }
                Err(e)
            }
        }
    }

    /// Edit the descriptive fields of an owned project. `None` leaves a
    /// field unchanged.
    pub async fn update_project(
        &self,
        ctx: &CallContext,
        id: &str,
        github_issue_link: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        if let Some(link) = &github_issue_link {
            if link.len() > self.config.max_link_len {
                return Err(LedgerError::InvalidInput(format!(
                    "issue link exceeds {} bytes",
                    self.config.max_link_len
                )));
            }
        }
        if let Some(desc) = &description {
            if desc.len() > self.config.max_description_len {
                return Err(LedgerError::InvalidInput(format!(
                    "description exceeds {} bytes",
                    self.config.max_description_len
                )));
            }
        }

        self.store
            .update(id, &ctx.caller, github_issue_link, description)
            .await?;
        self.emit(ProjectEvent::Updated { id: id.to_string() });
        Ok(())
    }

    /// Claim an open project for the calling worker.
    pub async fn claim_project(&self, ctx: &CallContext, id: &str) -> Result<()> {
        self.store.claim(id, ctx.caller.clone()).await?;
        self.emit(ProjectEvent::Claimed {
            id: id.to_string(),
            worker: ctx.caller.clone(),
        });
        Ok(())
    }

    /// Worker marks their claimed project done.
    pub async fn complete_project(&self, ctx: &CallContext, id: &str) -> Result<()> {
        self.store.complete(id, &ctx.caller).await?;
        self.emit(ProjectEvent::Completed { id: id.to_string() });
        Ok(())
    }

    /// Owner authorizes payout of a completed project. The reward
    /// transfer is scheduled on the rail; the record reaches `Paid`
    /// only once [`Self::on_transfer_settled`] reports success.
    pub async fn initiate_payout(&self, ctx: &CallContext, id: &str) -> Result<()> {
        let pending_id = self.coordinator.initiate_payout(id, &ctx.caller).await?;
        self.emit(ProjectEvent::PayoutInitiated {
            id: id.to_string(),
            pending_id,
        });
        Ok(())
    }

    /// Owner cancels a project that has not been completed. The escrow
    /// is released before the record transitions, so a release failure
    /// leaves the record live and still holding its reward; a rail
    /// failure when scheduling the refund is logged, not surfaced,
    /// since the record is already terminal by then.
    pub async fn cancel_project(&self, ctx: &CallContext, id: &str) -> Result<()> {
        self.store.ensure_cancellable(id, &ctx.caller).await?;
        let refund = self.escrow.release_for_refund(id).await?;

        if let Err(e) = self.store.cancel(id, &ctx.caller).await {
            // Put the value back so the still-live record keeps its
            // escrow and the conservation invariant holds.
            if let Err(relock) = self.escrow.lock(id, refund, refund).await {
                error!(
                    project_id = %id,
                    amount = %refund,
                    error = %relock,
                    "Escrow could not be restored after failed cancellation"
                );
            }
            return Err(e);
        }

        if let Some(record) = self.store.get(id).await {
            self.coordinator.record_refund(&record).await;
        }

        self.emit(ProjectEvent::Cancelled {
            id: id.to_string(),
            refund,
        });
        Ok(())
    }

    /// Settlement callback from the host. Unknown transfer ids are
    /// ignored, so redelivery is safe.
    pub async fn on_transfer_settled(
        &self,
        pending_id: PendingTransferId,
        outcome: TransferOutcome,
    ) -> Result<()> {
        if let Some(settlement) = self
            .coordinator
            .on_transfer_settled(pending_id, outcome)
            .await?
        {
            self.emit(ProjectEvent::PayoutSettled {
                id: settlement.project_id,
                outcome,
            });
        }
        Ok(())
    }

    pub async fn get_project(&self, id: &str) -> Option<ProjectSnapshot> {
        self.store.get(id).await.map(|record| (&record).into())
    }

    /// Every record, partitioned by reported status. Records in their
    /// payout window appear under `completed`.
    pub async fn get_all_projects(&self) -> AllProjects {
        let mut all = AllProjects::default();
        all.created = self.snapshots_of(ProjectStatus::Created).await;
        all.claimed = self.snapshots_of(ProjectStatus::Claimed).await;
        all.paid = self.snapshots_of(ProjectStatus::Paid).await;
        all.cancelled = self.snapshots_of(ProjectStatus::Cancelled).await;

        let mut completed = self.store.list_by_status(ProjectStatus::Completed).await;
        completed.extend(self.store.list_by_status(ProjectStatus::PayoutPending).await);
        completed.sort_by_key(|record| record.seq);
        all.completed = completed.iter().map(ProjectSnapshot::from).collect();

        debug!(
            created = all.created.len(),
            claimed = all.claimed.len(),
            completed = all.completed.len(),
            paid = all.paid.len(),
            cancelled = all.cancelled.len(),
            "Enumerated all projects"
        );
        all
    }

    /// Projects claimed by `worker`, partitioned by reported status.
    pub async fn get_worker_projects(&self, worker: &AccountId) -> WorkerProjects {
        let mut view = WorkerProjects::default();
        for record in self.store.list_by_worker(worker).await {
            let snapshot = ProjectSnapshot::from(&record);
            match record.status.reported() {
                ProjectStatus::Claimed => view.claimed.push(snapshot),
                ProjectStatus::Completed => view.completed.push(snapshot),
                ProjectStatus::Paid => view.paid.push(snapshot),
                _ => {}
            }
        }
        view
    }

    /// Projects posted by `owner`, every status included.
    pub async fn get_owner_projects(&self, owner: &AccountId) -> Vec<ProjectSnapshot> {
        self.store
            .list_by_owner(owner)
            .await
            .iter()
            .map(ProjectSnapshot::from)
            .collect()
    }

    pub async fn settlement_history(&self) -> Vec<SettlementRecord> {
        self.coordinator.settlement_history().await
    }

    /// Total value currently held in escrow.
    pub async fn locked_total(&self) -> TokenAmount {
        self.escrow.locked_total().await
    }

    pub async fn locked_amount(&self, id: &str) -> Option<TokenAmount> {
        self.escrow.locked_amount(id).await
    }

    async fn snapshots_of(&self, status: ProjectStatus) -> Vec<ProjectSnapshot> {
        self.store
            .list_by_status(status)
            .await
            .iter()
            .map(ProjectSnapshot::from)
            .collect()
    }

    fn validate_inputs(&self, id: &str, link: &str, description: &str) -> Result<()> {
        if id.is_empty() {
            return Err(LedgerError::InvalidInput("project id is empty".to_string()));
        }
        if id.len() > self.config.max_id_len {
            return Err(LedgerError::InvalidInput(format!(
                "project id exceeds {} bytes",
                self.config.max_id_len
            )));
        }
        if link.len() > self.config.max_link_len {
            return Err(LedgerError::InvalidInput(format!(
                "issue link exceeds {} bytes",
                self.config.max_link_len
            )));
        }
        if description.len() > self.config.max_description_len {
            return Err(LedgerError::InvalidInput(format!(
                "description exceeds {} bytes",
                self.config.max_description_len
            )));
        }
        Ok(())
    }

    fn emit(&self, event: ProjectEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("Event receiver dropped, no longer emitting");
            }
        }
    }
}

impl std::fmt::Debug for BountyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BountyLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
