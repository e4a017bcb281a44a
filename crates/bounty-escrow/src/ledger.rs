use crate::error::{EscrowError, Result};
use crate::storage::EscrowStorage;
use crate::types::TokenAmount;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    amount: TokenAmount,
    in_flight: bool,
}

/// Tracks the reward locked per project and the running locked total.
///
/// The ledger never moves tokens itself; it authorizes amounts for the
/// payout coordinator or facade to transfer. Invariant: `locked_total`
/// equals the sum of all currently locked rewards at every observable
/// point, with in-flight payouts still counted until they settle.
pub struct EscrowLedger {
    storage: Arc<dyn EscrowStorage>,
    locks: RwLock<HashMap<String, LockEntry>>,
    locked_total: RwLock<TokenAmount>,
}

impl EscrowLedger {
    pub fn new(storage: Arc<dyn EscrowStorage>) -> Self {
        Self {
            storage,
            locks: RwLock::new(HashMap::new()),
            locked_total: RwLock::new(TokenAmount::ZERO),
        }
    }

    /// Rebuild the ledger from persisted lock entries.
    ///
    /// The per-project map is authoritative; a stale persisted total is
    /// recomputed rather than trusted.
    pub async fn load(storage: Arc<dyn EscrowStorage>) -> Result<Self> {
        let persisted = storage
            .get_all_locks()
            .await
            .map_err(|e| EscrowError::Storage(e.to_string()))?;
        let persisted_total = storage
            .get_locked_total()
            .await
            .map_err(|e| EscrowError::Storage(e.to_string()))?;

        let mut locks = HashMap::new();
        let mut total = TokenAmount::ZERO;
        for (project_id, amount) in persisted {
            total = total
                .checked_add(amount)
                .ok_or(EscrowError::Overflow(amount))?;
            locks.insert(
                project_id,
                LockEntry {
                    amount,
                    in_flight: false,
                },
            );
        }

        if total != persisted_total {
            warn!(
                persisted_total = %persisted_total,
                recomputed_total = %total,
                "Persisted locked total disagrees with lock entries, recomputing"
            );
            storage
                .set_locked_total(total)
                .await
                .map_err(|e| EscrowError::Storage(e.to_string()))?;
        }

        info!(
            lock_count = locks.len(),
            locked_total = %total,
            "Escrow ledger loaded"
        );

        Ok(Self {
            storage,
            locks: RwLock::new(locks),
            locked_total: RwLock::new(total),
        })
    }

    /// Lock the reward for a newly created project.
    ///
    /// The reward is defined as exactly the value attached to the call;
    /// an attached value below `amount` is rejected before any state
    /// changes.
    pub async fn lock(
        &self,
        project_id: &str,
        amount: TokenAmount,
        attached: TokenAmount,
    ) -> Result<()> {
        if amount.is_zero() {
            return Err(EscrowError::ZeroAmount(project_id.to_string()));
        }
        if attached < amount {
            return Err(EscrowError::InsufficientDeposit {
                required: amount,
                attached,
            });
        }

        let mut locks = self.locks.write().await;
        let mut total = self.locked_total.write().await;

        if locks.contains_key(project_id) {
            return Err(EscrowError::AlreadyLocked(project_id.to_string()));
        }

        let new_total = total
            .checked_add(amount)
            .ok_or(EscrowError::Overflow(amount))?;

        self.persist(project_id, Some(amount), new_total).await?;

        locks.insert(
            project_id.to_string(),
            LockEntry {
                amount,
                in_flight: false,
            },
        );
        let total_before = *total;
        *total = new_total;

        info!(
            project_id = %project_id,
            amount = %amount,
            locked_total_before = %total_before,
            locked_total_after = %new_total,
            "Reward locked in escrow"
        );
        Ok(())
    }

    /// Unlock a cancelled project's reward for return to its owner.
    pub async fn release_for_refund(&self, project_id: &str) -> Result<TokenAmount> {
        let mut locks = self.locks.write().await;
        let mut total = self.locked_total.write().await;

        let entry = locks
            .get(project_id)
            .copied()
            .ok_or_else(|| EscrowError::LockNotFound(project_id.to_string()))?;
        if entry.in_flight {
            return Err(EscrowError::AlreadyInFlight(project_id.to_string()));
        }

        let new_total = total.saturating_sub(entry.amount);
        self.persist(project_id, None, new_total).await?;

        locks.remove(project_id);
        let total_before = *total;
        *total = new_total;

        info!(
            project_id = %project_id,
            amount = %entry.amount,
            locked_total_before = %total_before,
            locked_total_after = %new_total,
            "Reward released for refund"
        );
        Ok(entry.amount)
    }

    /// Mark a reward as in flight for the duration of a payout attempt.
    ///
    /// The amount stays in `locked_total` until settlement; a second
    /// marker for the same project is refused while one is outstanding.
    pub async fn mark_in_flight(&self, project_id: &str) -> Result<TokenAmount> {
        let mut locks = self.locks.write().await;

        let entry = locks
            .get_mut(project_id)
            .ok_or_else(|| EscrowError::LockNotFound(project_id.to_string()))?;
        if entry.in_flight {
            return Err(EscrowError::AlreadyInFlight(project_id.to_string()));
        }

        entry.in_flight = true;

        info!(
            project_id = %project_id,
            amount = %entry.amount,
            "Reward marked in flight"
        );
        Ok(entry.amount)
    }

    /// Clear the in-flight marker after a failed settlement. The reward
    /// stays locked; nothing moved.
    pub async fn clear_in_flight(&self, project_id: &str) -> Result<()> {
        let mut locks = self.locks.write().await;

        let entry = locks
            .get_mut(project_id)
            .ok_or_else(|| EscrowError::LockNotFound(project_id.to_string()))?;
        if !entry.in_flight {
            return Err(EscrowError::NotInFlight(project_id.to_string()));
        }

        entry.in_flight = false;

        info!(
            project_id = %project_id,
            amount = %entry.amount,
            "In-flight marker cleared, reward stays locked"
        );
        Ok(())
    }

    /// Unlock a settled payout's reward for transfer to the worker.
    ///
    /// Only legal while the amount is marked in flight; this is the
    /// other half of the two-phase payout.
    pub async fn release_for_payout(&self, project_id: &str) -> Result<TokenAmount> {
        let mut locks = self.locks.write().await;
        let mut total = self.locked_total.write().await;

        let entry = locks
            .get(project_id)
            .copied()
            .ok_or_else(|| EscrowError::LockNotFound(project_id.to_string()))?;
        if !entry.in_flight {
            return Err(EscrowError::NotInFlight(project_id.to_string()));
        }

        let new_total = total.saturating_sub(entry.amount);
        self.persist(project_id, None, new_total).await?;

        locks.remove(project_id);
        let total_before = *total;
        *total = new_total;

        info!(
            project_id = %project_id,
            amount = %entry.amount,
            locked_total_before = %total_before,
            locked_total_after = %new_total,
            "Reward released for payout"
        );
        Ok(entry.amount)
    }

    pub async fn locked_amount(&self, project_id: &str) -> Option<TokenAmount> {
        let locks = self.locks.read().await;
        locks.get(project_id).map(|entry| entry.amount)
    }

    pub async fn is_in_flight(&self, project_id: &str) -> bool {
        let locks = self.locks.read().await;
        locks.get(project_id).map(|e| e.in_flight).unwrap_or(false)
    }

    pub async fn locked_total(&self) -> TokenAmount {
        *self.locked_total.read().await
    }

    /// Write a lock mutation and the new total to storage as one unit.
    async fn persist(
        &self,
        project_id: &str,
        lock: Option<TokenAmount>,
        new_total: TokenAmount,
    ) -> Result<()> {
        self.storage
            .begin_transaction()
            .await
            .map_err(|e| EscrowError::Storage(e.to_string()))?;

        let write = async {
            match lock {
                Some(amount) => self.storage.set_locked(project_id, amount).await?,
                None => self.storage.remove_locked(project_id).await?,
            }
            self.storage.set_locked_total(new_total).await
        };

        match write.await {
            Ok(()) => {
                self.storage
                    .commit_transaction()
                    .await
                    .map_err(|e| EscrowError::Storage(e.to_string()))?;
                Ok(())
            }
            Err(e) => {
                debug!(
                    project_id = %project_id,
                    error = %e,
                    "Escrow persist failed, rolling back"
                );
                self.storage
                    .rollback_transaction()
                    .await
                    .map_err(|e| EscrowError::Storage(e.to_string()))?;
                Err(EscrowError::Storage(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn amount(units: u128) -> TokenAmount {
        TokenAmount::from_base_units(units)
    }

    #[tokio::test]
    async fn lock_requires_attached_value() {
        let ledger = EscrowLedger::new(Arc::new(MemoryStorage::new()));

        let err = ledger
            .lock("p1", amount(2000), amount(100))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EscrowError::InsufficientDeposit {
                required: amount(2000),
                attached: amount(100),
            }
        );
        assert_eq!(ledger.locked_total().await, TokenAmount::ZERO);

        ledger.lock("p1", amount(2000), amount(2000)).await.unwrap();
        assert_eq!(ledger.locked_total().await, amount(2000));
        assert_eq!(ledger.locked_amount("p1").await, Some(amount(2000)));
    }

    #[tokio::test]
    async fn zero_and_double_lock_rejected() {
        let ledger = EscrowLedger::new(Arc::new(MemoryStorage::new()));

        assert!(matches!(
            ledger.lock("p1", TokenAmount::ZERO, amount(10)).await,
            Err(EscrowError::ZeroAmount(_))
        ));

        ledger.lock("p1", amount(10), amount(10)).await.unwrap();
        assert!(matches!(
            ledger.lock("p1", amount(10), amount(10)).await,
            Err(EscrowError::AlreadyLocked(_))
        ));
        assert_eq!(ledger.locked_total().await, amount(10));
    }

    #[tokio::test]
    async fn refund_unlocks_and_reduces_total() {
        let ledger = EscrowLedger::new(Arc::new(MemoryStorage::new()));

        ledger.lock("p1", amount(500), amount(500)).await.unwrap();
        ledger.lock("p2", amount(300), amount(300)).await.unwrap();

        let refunded = ledger.release_for_refund("p1").await.unwrap();
        assert_eq!(refunded, amount(500));
        assert_eq!(ledger.locked_total().await, amount(300));
        assert_eq!(ledger.locked_amount("p1").await, None);

        assert!(matches!(
            ledger.release_for_refund("p1").await,
            Err(EscrowError::LockNotFound(_))
        ));
    }

    #[tokio::test]
    async fn in_flight_window_guards_double_payout() {
        let ledger = EscrowLedger::new(Arc::new(MemoryStorage::new()));
        ledger.lock("p1", amount(2000), amount(2000)).await.unwrap();

        // Payout before initiation is refused.
        assert!(matches!(
            ledger.release_for_payout("p1").await,
            Err(EscrowError::NotInFlight(_))
        ));

        assert_eq!(ledger.mark_in_flight("p1").await.unwrap(), amount(2000));
        assert!(ledger.is_in_flight("p1").await);
        assert!(matches!(
            ledger.mark_in_flight("p1").await,
            Err(EscrowError::AlreadyInFlight(_))
        ));

        // In flight still counts toward the total.
        assert_eq!(ledger.locked_total().await, amount(2000));

        // Failed settlement: marker cleared, amount stays locked.
        ledger.clear_in_flight("p1").await.unwrap();
        assert_eq!(ledger.locked_total().await, amount(2000));

        // Retry and settle.
        ledger.mark_in_flight("p1").await.unwrap();
        let released = ledger.release_for_payout("p1").await.unwrap();
        assert_eq!(released, amount(2000));
        assert_eq!(ledger.locked_total().await, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn load_rebuilds_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let ledger = EscrowLedger::new(storage.clone());
            ledger.lock("p1", amount(700), amount(700)).await.unwrap();
            ledger.lock("p2", amount(300), amount(300)).await.unwrap();
        }

        let reloaded = EscrowLedger::load(storage).await.unwrap();
        assert_eq!(reloaded.locked_total().await, amount(1000));
        assert_eq!(reloaded.locked_amount("p1").await, Some(amount(700)));
        assert_eq!(reloaded.locked_amount("p2").await, Some(amount(300)));
    }
}
