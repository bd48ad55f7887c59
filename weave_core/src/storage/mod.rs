//! Workflow persistence.
//!
//! A [`WorkflowStore`] holds one record per workflow, keyed by workflow id.
//! [`FileWorkflowStore`] writes each record to `<dir>/<workflow_id>.json` as
//! pretty-printed JSON; [`MemoryWorkflowStore`] keeps records in a map and is
//! used by tests and embedders that do not need durability.
//!
//! Saves are whole-record overwrites. The file store writes to a temporary
//! sibling and renames it over the target, so a reader never observes a
//! half-written record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{is_valid_identifier, Workflow, WorkflowSummary};

/// Durable keyed storage for workflow records.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Writes the full record, replacing any previous one.
    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Reads a record.
    ///
    /// # Returns
    ///
    /// `Err(StoreError::NotFound)` if no record exists.
    async fn load(&self, workflow_id: &str) -> Result<Workflow, StoreError>;

    /// Removes a record. Returns false if none existed.
    async fn delete(&self, workflow_id: &str) -> Result<bool, StoreError>;

    /// Summaries of every stored workflow, oldest first.
    async fn list(&self) -> Result<Vec<WorkflowSummary>, StoreError>;

    /// Returns true if a record exists.
    async fn exists(&self, workflow_id: &str) -> Result<bool, StoreError>;
}

fn check_id(workflow_id: &str) -> Result<(), StoreError> {
    if is_valid_identifier(workflow_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidId(workflow_id.to_string()))
    }
}

fn sort_summaries(summaries: &mut [WorkflowSummary]) {
    summaries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.workflow_id.cmp(&b.workflow_id))
    });
}

/// One JSON file per workflow under a directory.
///
/// # Example
///
/// ```ignore
/// let store = FileWorkflowStore::open(".weave/workflows").await?;
/// store.save(&workflow).await?;
/// let loaded = store.load(&workflow.workflow_id).await?;
/// ```
#[derive(Clone, Debug)]
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `workflow_id`.
    pub fn record_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }

    async fn read_record(path: &Path) -> Result<Workflow, StoreError> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError> {
        check_id(&workflow.workflow_id)?;
        let json = serde_json::to_string_pretty(workflow)?;

        let target = self.record_path(&workflow.workflow_id);
        let tmp = self.dir.join(format!(".{}.json.tmp", workflow.workflow_id));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &target).await?;

        tracing::trace!(workflow_id = %workflow.workflow_id, status = %workflow.status, "saved workflow record");
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Workflow, StoreError> {
        check_id(workflow_id)?;
        let path = self.record_path(workflow_id);
        match Self::read_record(&path).await {
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(workflow_id.to_string()))
            }
            other => other,
        }
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool, StoreError> {
        check_id(workflow_id)?;
        match tokio::fs::remove_file(self.record_path(workflow_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }

            match Self::read_record(&path).await {
                Ok(workflow) => summaries.push(workflow.summary()),
                // Record deleted between read_dir and read
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable workflow record");
                }
            }
        }

        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn exists(&self, workflow_id: &str) -> Result<bool, StoreError> {
        check_id(workflow_id)?;
        Ok(tokio::fs::try_exists(self.record_path(workflow_id)).await?)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    records: RwLock<HashMap<String, Workflow>>,
}

impl MemoryWorkflowStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError> {
        check_id(&workflow.workflow_id)?;
        self.records
            .write()
            .await
            .insert(workflow.workflow_id.clone(), workflow.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Workflow, StoreError> {
        self.records
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(workflow_id).is_some())
    }

    async fn list(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        let mut summaries: Vec<WorkflowSummary> = self
            .records
            .read()
            .await
            .values()
            .map(Workflow::summary)
            .collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn exists(&self, workflow_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(workflow_id))
    }
}
