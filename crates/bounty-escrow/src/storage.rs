use crate::types::TokenAmount;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

// Type aliases for complex types
type LockMap = HashMap<String, TokenAmount>;
type SnapshotBackup = Option<(LockMap, TokenAmount)>;

/// Persistence seam for escrow bookkeeping.
///
/// The locked amount per project id and the running locked total must
/// survive across calls; everything else the ledger derives in memory.
#[async_trait]
pub trait EscrowStorage: Send + Sync {
    async fn get_locked(&self, project_id: &str) -> Result<Option<TokenAmount>>;
    async fn set_locked(&self, project_id: &str, amount: TokenAmount) -> Result<()>;
    async fn remove_locked(&self, project_id: &str) -> Result<()>;
    async fn get_locked_total(&self) -> Result<TokenAmount>;
    async fn set_locked_total(&self, total: TokenAmount) -> Result<()>;
    async fn get_all_locks(&self) -> Result<Vec<(String, TokenAmount)>>;

    async fn begin_transaction(&self) -> Result<()>;
    async fn commit_transaction(&self) -> Result<()>;
    async fn rollback_transaction(&self) -> Result<()>;
}

pub struct MemoryStorage {
    locks: Arc<RwLock<LockMap>>,
    locked_total: Arc<RwLock<TokenAmount>>,
    backup: Arc<RwLock<SnapshotBackup>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
            locked_total: Arc::new(RwLock::new(TokenAmount::ZERO)),
            backup: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl EscrowStorage for MemoryStorage {
    async fn get_locked(&self, project_id: &str) -> Result<Option<TokenAmount>> {
        let locks = self.locks.read().await;
        Ok(locks.get(project_id).copied())
    }

    async fn set_locked(&self, project_id: &str, amount: TokenAmount) -> Result<()> {
        let mut locks = self.locks.write().await;
        let old = locks.insert(project_id.to_string(), amount);

        if old != Some(amount) {
            debug!(
                project_id = %project_id,
                amount = %amount,
                storage_type = "memory",
                "Locked amount stored"
            );
        }
        Ok(())
    }

    async fn remove_locked(&self, project_id: &str) -> Result<()> {
        let mut locks = self.locks.write().await;
        locks.remove(project_id);
        Ok(())
    }

    async fn get_locked_total(&self) -> Result<TokenAmount> {
        Ok(*self.locked_total.read().await)
    }

    async fn set_locked_total(&self, total: TokenAmount) -> Result<()> {
        let mut locked_total = self.locked_total.write().await;
        *locked_total = total;
        Ok(())
    }

    async fn get_all_locks(&self) -> Result<Vec<(String, TokenAmount)>> {
        let locks = self.locks.read().await;
        Ok(locks
            .iter()
            .map(|(id, amount)| (id.clone(), *amount))
            .collect())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let locks = self.locks.read().await;
        let total = self.locked_total.read().await;

        let mut backup = self.backup.write().await;
        *backup = Some((locks.clone(), *total));

        info!(
            lock_count = locks.len(),
            storage_type = "memory",
            "Escrow transaction began (snapshot created)"
        );
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let mut backup = self.backup.write().await;
        let had_backup = backup.is_some();
        *backup = None;

        if had_backup {
            info!(
                storage_type = "memory",
                "Escrow transaction committed (snapshot discarded)"
            );
        }
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let mut backup = self.backup.write().await;

        if let Some((lock_backup, total_backup)) = backup.take() {
            let mut locks = self.locks.write().await;
            let mut total = self.locked_total.write().await;

            *locks = lock_backup;
            *total = total_backup;

            info!(
                lock_count = locks.len(),
                locked_total = %*total,
                storage_type = "memory",
                "Escrow transaction rolled back (snapshot restored)"
            );
        }

        Ok(())
    }
}
