use crate::error::{LedgerError, Result};
use crate::store::ProjectStore;
use crate::types::{
    PendingTransferId, ProjectRecord, ProjectStatus, SettlementRecord, TransferOutcome,
    TransferRequest,
};
use async_trait::async_trait;
use bounty_escrow::{AccountId, EscrowLedger, TokenAmount};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Boundary to the value-transfer mechanism. Scheduling a transfer is
/// asynchronous; the outcome arrives later as a settlement callback
/// keyed by the returned id.
#[async_trait]
pub trait TransferRail: Send + Sync {
    async fn schedule_transfer(
        &self,
        to: &AccountId,
        amount: TokenAmount,
    ) -> anyhow::Result<PendingTransferId>;
}

/// Rail that hands transfer requests to the host over an mpsc channel.
/// The host executes them however it likes and reports outcomes back
/// through [`PayoutCoordinator::on_transfer_settled`].
pub struct ChannelTransferRail {
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<TransferRequest>,
}

impl ChannelTransferRail {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: AtomicU64::new(1),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl TransferRail for ChannelTransferRail {
    async fn schedule_transfer(
        &self,
        to: &AccountId,
        amount: TokenAmount,
    ) -> anyhow::Result<PendingTransferId> {
        let pending_id = PendingTransferId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.tx
            .send(TransferRequest {
                pending_id,
                to: to.clone(),
                amount,
            })
            .map_err(|_| anyhow::anyhow!("transfer rail receiver dropped"))?;
        Ok(pending_id)
    }
}

/// Drives the two-phase payout protocol.
///
/// Initiation moves the record into its payout window, marks the escrow
/// lock in-flight and schedules the transfer; settlement resolves the
/// window in whichever direction the rail reports. Each step that fails
/// unwinds the steps before it, so a rejected initiation leaves the
/// record in `Completed` with its escrow intact.
pub struct PayoutCoordinator {
    store: Arc<ProjectStore>,
    escrow: Arc<EscrowLedger>,
    rail: Arc<dyn TransferRail>,
    /// Outstanding transfers, pending id to project id.
    pending: RwLock<HashMap<PendingTransferId, String>>,
    history: RwLock<Vec<SettlementRecord>>,
}

impl PayoutCoordinator {
    pub fn new(
        store: Arc<ProjectStore>,
        escrow: Arc<EscrowLedger>,
        rail: Arc<dyn TransferRail>,
    ) -> Self {
        Self {
            store,
            escrow,
            rail,
            pending: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Open the payout window for a completed project and schedule the
    /// reward transfer to its worker.
    pub async fn initiate_payout(
        &self,
        project_id: &str,
        caller: &AccountId,
    ) -> Result<PendingTransferId> {
        let record = self.store.begin_payout(project_id, caller).await?;
        let worker = match record.worker.clone() {
            Some(worker) => worker,
            None => {
                // A completed record always carries a worker; restore the
                // window if the invariant is somehow violated.
                self.store.rollback_payout(project_id).await?;
                return Err(LedgerError::InvalidState {
                    id: project_id.to_string(),
                    status: record.status,
                });
            }
        };

        let amount = match self.escrow.mark_in_flight(project_id).await {
            Ok(amount) => amount,
            Err(e) => {
                self.store.rollback_payout(project_id).await?;
                return Err(e.into());
            }
        };

        let pending_id = match self.rail.schedule_transfer(&worker, amount).await {
            Ok(pending_id) => pending_id,
            Err(e) => {
                self.escrow.clear_in_flight(project_id).await?;
                self.store.rollback_payout(project_id).await?;
                return Err(LedgerError::Rail(e.to_string()));
            }
        };

        self.pending
            .write()
            .await
            .insert(pending_id, project_id.to_string());

        info!(
            project_id = %project_id,
            worker = %worker,
            amount = %amount,
            pending_id = %pending_id,
            "Payout initiated"
        );
        Ok(pending_id)
    }

    /// Settle an outstanding transfer. Unknown ids are ignored, so
    /// duplicate callbacks for the same transfer are harmless. If
    /// applying the outcome fails midway the handle stays registered,
    /// so the host can redeliver the callback and the remaining steps
    /// are picked up where the failed attempt stopped.
    pub async fn on_transfer_settled(
        &self,
        pending_id: PendingTransferId,
        outcome: TransferOutcome,
    ) -> Result<Option<SettlementRecord>> {
        let project_id = match self.pending.write().await.remove(&pending_id) {
            Some(project_id) => project_id,
            None => {
                warn!(pending_id = %pending_id, "Settlement for unknown transfer, ignoring");
                return Ok(None);
            }
        };

        match self.apply_outcome(&project_id, outcome).await {
            Ok(settlement) => {
                self.history.write().await.push(settlement.clone());
                Ok(Some(settlement))
            }
            Err(e) => {
                warn!(
                    pending_id = %pending_id,
                    project_id = %project_id,
                    error = %e,
                    "Settlement could not be applied, awaiting redelivery"
                );
                self.pending.write().await.insert(pending_id, project_id);
                Err(e)
            }
        }
    }

    /// Apply a settlement outcome. Each step checks whether it already
    /// ran, so a redelivered callback resumes a partially-applied
    /// settlement instead of tripping on its own earlier progress.
    async fn apply_outcome(
        &self,
        project_id: &str,
        outcome: TransferOutcome,
    ) -> Result<SettlementRecord> {
        let record = self
            .store
            .get(project_id)
            .await
            .ok_or_else(|| LedgerError::NotFound(project_id.to_string()))?;
        let worker = record
            .worker
            .clone()
            .ok_or_else(|| LedgerError::InvalidState {
                id: project_id.to_string(),
                status: record.status,
            })?;

        let amount = match outcome {
            TransferOutcome::Success => {
                if record.status == ProjectStatus::PayoutPending {
                    self.store.finish_payout(project_id).await?;
                }
                let amount = if self.escrow.locked_amount(project_id).await.is_some() {
                    self.escrow.release_for_payout(project_id).await?
                } else {
                    record.reward
                };
                info!(
                    project_id = %project_id,
                    worker = %worker,
                    amount = %amount,
                    "Transfer settled, payout complete"
                );
                amount
            }
            TransferOutcome::Failure => {
                if record.status == ProjectStatus::PayoutPending {
                    self.store.rollback_payout(project_id).await?;
                }
                if self.escrow.is_in_flight(project_id).await {
                    self.escrow.clear_in_flight(project_id).await?;
                }
                warn!(
                    project_id = %project_id,
                    worker = %worker,
                    "Transfer failed, payout rolled back"
                );
                record.reward
            }
        };

        let settled_at = Utc::now();
        Ok(SettlementRecord {
            project_id: project_id.to_string(),
            worker: worker.clone(),
            amount,
            outcome,
            reference: settlement_reference(project_id, &worker, amount, settled_at.timestamp()),
            settled_at,
        })
    }

    pub async fn pending_project(&self, pending_id: PendingTransferId) -> Option<String> {
        self.pending.read().await.get(&pending_id).cloned()
    }

    pub async fn settlement_history(&self) -> Vec<SettlementRecord> {
        self.history.read().await.clone()
    }

    pub(crate) async fn record_refund(&self, record: &ProjectRecord) {
        if let Err(e) = self
            .rail
            .schedule_transfer(&record.project_owner, record.reward)
            .await
        {
            // The escrow lock is already gone; the refund stays owed to
            // the owner and must be replayed by the host.
            warn!(
                project_id = %record.id,
                owner = %record.project_owner,
                amount = %record.reward,
                error = %e,
                "Refund transfer could not be scheduled"
            );
        }
    }
}

/// Content hash tying a settlement to its project, worker, amount and
/// time of settlement.
fn settlement_reference(
    project_id: &str,
    worker: &AccountId,
    amount: TokenAmount,
    timestamp: i64,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(project_id.as_bytes());
    hasher.update(worker.as_str().as_bytes());
    hasher.update(&amount.to_base_units().to_le_bytes());
    hasher.update(&timestamp.to_le_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::ProjectStatus;
    use bounty_escrow::MemoryStorage as EscrowMemoryStorage;

    fn amount(units: u128) -> TokenAmount {
        TokenAmount::from_base_units(units)
    }

    struct Fixture {
        store: Arc<ProjectStore>,
        escrow: Arc<EscrowLedger>,
        coordinator: PayoutCoordinator,
        rx: mpsc::UnboundedReceiver<TransferRequest>,
    }

    async fn fixture_with_completed(id: &str, reward: u128) -> Fixture {
        let store = Arc::new(ProjectStore::new(Arc::new(MemoryStorage::new())));
        let escrow = Arc::new(EscrowLedger::new(Arc::new(EscrowMemoryStorage::new())));
        let (rail, rx) = ChannelTransferRail::new();
        let coordinator =
            PayoutCoordinator::new(store.clone(), escrow.clone(), Arc::new(rail));

        store
            .create(
                id,
                String::new(),
                String::new(),
                amount(reward),
                AccountId::new("company1"),
            )
            .await
            .unwrap();
        escrow
            .lock(id, amount(reward), amount(reward))
            .await
            .unwrap();
        store.claim(id, AccountId::new("alice")).await.unwrap();
        store.complete(id, &AccountId::new("alice")).await.unwrap();

        Fixture {
            store,
            escrow,
            coordinator,
            rx,
        }
    }

    #[tokio::test]
    async fn successful_payout_pays_and_unlocks() {
        let mut fx = fixture_with_completed("p1", 2000).await;
        let owner = AccountId::new("company1");

        let pending_id = fx.coordinator.initiate_payout("p1", &owner).await.unwrap();

        let request = fx.rx.recv().await.unwrap();
        assert_eq!(request.pending_id, pending_id);
        assert_eq!(request.to, AccountId::new("alice"));
        assert_eq!(request.amount, amount(2000));

        let settlement = fx
            .coordinator
            .on_transfer_settled(pending_id, TransferOutcome::Success)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settlement.project_id, "p1");
        assert_eq!(settlement.outcome, TransferOutcome::Success);
        assert_eq!(settlement.reference.len(), 64);

        assert_eq!(fx.store.get("p1").await.unwrap().status, ProjectStatus::Paid);
        assert_eq!(fx.escrow.locked_amount("p1").await, None);
        assert_eq!(fx.escrow.locked_total().await, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn failed_transfer_rolls_back_and_allows_retry() {
        let mut fx = fixture_with_completed("p1", 2000).await;
        let owner = AccountId::new("company1");

        let pending_id = fx.coordinator.initiate_payout("p1", &owner).await.unwrap();
        fx.rx.recv().await.unwrap();

        fx.coordinator
            .on_transfer_settled(pending_id, TransferOutcome::Failure)
            .await
            .unwrap()
            .unwrap();

        // Back to Completed with escrow intact.
        assert_eq!(
            fx.store.get("p1").await.unwrap().status,
            ProjectStatus::Completed
        );
        assert_eq!(fx.escrow.locked_amount("p1").await, Some(amount(2000)));

        // Retry succeeds end to end.
        let retry_id = fx.coordinator.initiate_payout("p1", &owner).await.unwrap();
        assert_ne!(retry_id, pending_id);
        fx.rx.recv().await.unwrap();
        fx.coordinator
            .on_transfer_settled(retry_id, TransferOutcome::Success)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fx.store.get("p1").await.unwrap().status, ProjectStatus::Paid);
        assert_eq!(fx.escrow.locked_total().await, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn duplicate_settlement_is_ignored() {
        let mut fx = fixture_with_completed("p1", 500).await;
        let owner = AccountId::new("company1");

        let pending_id = fx.coordinator.initiate_payout("p1", &owner).await.unwrap();
        fx.rx.recv().await.unwrap();

        fx.coordinator
            .on_transfer_settled(pending_id, TransferOutcome::Success)
            .await
            .unwrap()
            .unwrap();

        // Second callback for the same id is a no-op.
        let duplicate = fx
            .coordinator
            .on_transfer_settled(pending_id, TransferOutcome::Success)
            .await
            .unwrap();
        assert!(duplicate.is_none());
        assert_eq!(fx.coordinator.settlement_history().await.len(), 1);
        assert_eq!(fx.store.get("p1").await.unwrap().status, ProjectStatus::Paid);
    }

    #[tokio::test]
    async fn settlement_error_keeps_handle_for_redelivery() {
        let storage = Arc::new(crate::storage::testing::FlakyStorage::new());
        let store = Arc::new(ProjectStore::new(storage.clone()));
        let escrow = Arc::new(EscrowLedger::new(Arc::new(EscrowMemoryStorage::new())));
        let (rail, mut rx) = ChannelTransferRail::new();
        let coordinator = PayoutCoordinator::new(store.clone(), escrow.clone(), Arc::new(rail));

        let owner = AccountId::new("company1");
        store
            .create("p1", String::new(), String::new(), amount(800), owner.clone())
            .await
            .unwrap();
        escrow.lock("p1", amount(800), amount(800)).await.unwrap();
        store.claim("p1", AccountId::new("alice")).await.unwrap();
        store.complete("p1", &AccountId::new("alice")).await.unwrap();

        let pending_id = coordinator.initiate_payout("p1", &owner).await.unwrap();
        rx.recv().await.unwrap();

        // Backend goes down before the outcome can be applied.
        storage.set_failing(true);
        let err = coordinator
            .on_transfer_settled(pending_id, TransferOutcome::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));

        // Nothing finalized, nothing forgotten.
        assert_eq!(
            coordinator.pending_project(pending_id).await,
            Some("p1".to_string())
        );
        assert_eq!(
            store.get("p1").await.unwrap().status,
            ProjectStatus::PayoutPending
        );
        assert!(escrow.is_in_flight("p1").await);
        assert!(coordinator.settlement_history().await.is_empty());

        // Redelivery after recovery completes the payout.
        storage.set_failing(false);
        coordinator
            .on_transfer_settled(pending_id, TransferOutcome::Success)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get("p1").await.unwrap().status, ProjectStatus::Paid);
        assert_eq!(escrow.locked_total().await, TokenAmount::ZERO);
        assert_eq!(coordinator.settlement_history().await.len(), 1);
        assert_eq!(coordinator.pending_project(pending_id).await, None);
    }

    #[tokio::test]
    async fn rejected_initiation_leaves_everything_untouched() {
        let fx = fixture_with_completed("p1", 2000).await;

        // Wrong caller: the window never opens, escrow never moves.
        let err = fx
            .coordinator
            .initiate_payout("p1", &AccountId::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));
        assert_eq!(
            fx.store.get("p1").await.unwrap().status,
            ProjectStatus::Completed
        );
        assert!(!fx.escrow.is_in_flight("p1").await);
    }

    #[tokio::test]
    async fn dropped_rail_receiver_unwinds_initiation() {
        let fx = fixture_with_completed("p1", 2000).await;
        let owner = AccountId::new("company1");
        drop(fx.rx);

        let err = fx.coordinator.initiate_payout("p1", &owner).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rail(_)));
        assert_eq!(
            fx.store.get("p1").await.unwrap().status,
            ProjectStatus::Completed
        );
        assert!(!fx.escrow.is_in_flight("p1").await);
        assert_eq!(fx.escrow.locked_amount("p1").await, Some(amount(2000)));
    }
}
