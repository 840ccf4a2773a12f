//! Job record storage.
//!
//! The store is the single source of truth for status polling: every update
//! is visible to the next read from any task, and nothing above it caches
//! records.

use crate::{JobId, JobRecord, JobUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a fresh record. Fails if the id is already taken, so at most
    /// one orchestrator can ever own a given id.
    async fn create(&self, id: JobId, record: JobRecord) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    async fn set_field(&self, id: JobId, update: JobUpdate) -> Result<(), StoreError>;

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.get(id).await?.is_some())
    }

    /// Removing an absent record is not an error.
    async fn delete(&self, id: JobId) -> Result<(), StoreError>;

    async fn list_ids(&self) -> Result<Vec<JobId>, StoreError>;
}

/// Process-local store. Everything is lost on restart.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, id: JobId, record: JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        jobs.insert(id, record);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn set_field(&self, id: JobId, update: JobUpdate) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.apply(update);
        Ok(())
    }

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.jobs.read().await.contains_key(&id))
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<JobId>, StoreError> {
        Ok(self.jobs.read().await.keys().copied().collect())
    }
}
