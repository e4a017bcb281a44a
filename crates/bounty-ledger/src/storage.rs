use crate::types::ProjectRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Persistence seam for the id-keyed record map.
///
/// Status views are derived state and are rebuilt from this map on load;
/// they are never persisted separately.
#[async_trait]
pub trait ProjectStorage: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>>;
    async fn put(&self, record: &ProjectRecord) -> Result<()>;
    async fn get_all(&self) -> Result<Vec<ProjectRecord>>;
}

pub struct MemoryStorage {
    records: Arc<RwLock<HashMap<String, ProjectRecord>>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ProjectStorage for MemoryStorage {
    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }

    async fn put(&self, record: &ProjectRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record.clone());
        debug!(
            project_id = %record.id,
            status = %record.status,
            storage_type = "memory",
            "Project record stored"
        );
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<ProjectRecord>> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }
}

/// Durable backend that keeps the whole record map as one JSON document.
///
/// Suited to the single-writer call model: every mutation rewrites the
/// file, so a crash between calls never leaves a torn map.
pub struct JsonFileStorage {
    path: PathBuf,
    records: Arc<RwLock<HashMap<String, ProjectRecord>>>,
}

impl JsonFileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading project store {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing project store {}", path.display()))?
        } else {
            HashMap::new()
        };

        info!(
            path = %path.display(),
            record_count = records.len(),
            storage_type = "json_file",
            "Project store opened"
        );

        Ok(Self {
            path,
            records: Arc::new(RwLock::new(records)),
        })
    }

    async fn flush(&self, records: &HashMap<String, ProjectRecord>) -> Result<()> {
        let content = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("writing project store {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ProjectStorage for JsonFileStorage {
    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }

    async fn put(&self, record: &ProjectRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record.clone());
        self.flush(&records).await?;
        debug!(
            project_id = %record.id,
            status = %record.status,
            storage_type = "json_file",
            "Project record stored"
        );
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<ProjectRecord>> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProjectStatus;
    use bounty_escrow::{AccountId, TokenAmount};
    use chrono::Utc;

    fn record(id: &str, seq: u64) -> ProjectRecord {
        ProjectRecord {
            id: id.to_string(),
            github_issue_link: "https://github.com/test-project/issues/1".to_string(),
            description: "This is a test".to_string(),
            reward: TokenAmount::from_base_units(2000),
            status: ProjectStatus::Created,
            project_owner: AccountId::new("company1"),
            worker: None,
            created_at: Utc::now(),
            seq,
        }
    }

    #[tokio::test]
    async fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");

        {
            let storage = JsonFileStorage::open(&path).unwrap();
            storage.put(&record("p1", 0)).await.unwrap();
            storage.put(&record("p2", 1)).await.unwrap();
        }

        let reopened = JsonFileStorage::open(&path).unwrap();
        let all = reopened.get_all().await.unwrap();
        assert_eq!(all.len(), 2);

        let p1 = reopened.get("p1").await.unwrap().unwrap();
        assert_eq!(p1.reward, TokenAmount::from_base_units(2000));
        assert_eq!(p1.status, ProjectStatus::Created);
        assert_eq!(reopened.get("p3").await.unwrap(), None);
    }
}
