//! Local records of in-flight uploads.
//!
//! A job is recorded under its temporary id while it runs. On success the
//! record is committed under the server's id; on failure it is removed.

use crate::error::E2eeResult;
use crate::types::{CompletedUpload, JobState, UploadJob};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn create(&self, job: &UploadJob) -> E2eeResult<()>;

    /// Records a state change. Committed records are still found by their
    /// temporary id.
    async fn update_state(&self, temporary_id: &str, state: JobState) -> E2eeResult<()>;

    /// Converts a temporary record into a durable one keyed by the final id.
    async fn commit(&self, temporary_id: &str, completed: &CompletedUpload) -> E2eeResult<()>;

    async fn remove(&self, temporary_id: &str) -> E2eeResult<()>;
}

/// A job record with the states it passed through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub job: UploadJob,
    pub history: Vec<JobState>,
    pub final_id: Option<String>,
}

/// In-memory job registry.
#[derive(Clone, Default)]
pub struct MemoryJobRegistry {
    records: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl MemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks a record up by temporary or final id.
    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        let records = self.records.read().await;
        records.get(id).cloned().or_else(|| {
            records
                .values()
                .find(|r| r.final_id.as_deref() == Some(id))
                .cloned()
        })
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobRegistry for MemoryJobRegistry {
    async fn create(&self, job: &UploadJob) -> E2eeResult<()> {
        self.records.write().await.insert(
            job.temporary_id.clone(),
            JobRecord {
                job: job.clone(),
                history: vec![job.state],
                final_id: None,
            },
        );
        Ok(())
    }

    async fn update_state(&self, temporary_id: &str, state: JobState) -> E2eeResult<()> {
        let mut records = self.records.write().await;
        let key = if records.contains_key(temporary_id) {
            Some(temporary_id.to_string())
        } else {
            records
                .iter()
                .find(|(_, r)| r.job.temporary_id == temporary_id)
                .map(|(key, _)| key.clone())
        };
        if let Some(record) = key.and_then(|k| records.get_mut(&k)) {
            record.job.state = state;
            record.history.push(state);
        }
        Ok(())
    }

    async fn commit(&self, temporary_id: &str, completed: &CompletedUpload) -> E2eeResult<()> {
        let mut records = self.records.write().await;
        if let Some(mut record) = records.remove(temporary_id) {
            record.final_id = Some(completed.final_id.clone());
            records.insert(completed.final_id.clone(), record);
        }
        Ok(())
    }

    async fn remove(&self, temporary_id: &str) -> E2eeResult<()> {
        self.records.write().await.remove(temporary_id);
        Ok(())
    }
}
