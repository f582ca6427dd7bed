//! Durable deployment records
//!
//! Each deployment is one JSON document keyed by its id. `status` reads go
//! through the store, so callers always see the last persisted snapshot.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::PipelineError;
use crate::filesys::dir::Dir;
use crate::models::deployment::Deployment;

/// Deployment persistence
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert or replace the record
    async fn save(&self, deployment: &Deployment) -> Result<(), PipelineError>;

    /// Load one record
    async fn load(&self, id: &str) -> Result<Option<Deployment>, PipelineError>;

    /// Load every record
    async fn list(&self) -> Result<Vec<Deployment>, PipelineError>;
}

/// One pretty-printed JSON file per deployment
#[derive(Debug, Clone)]
pub struct FileDeploymentStore {
    dir: Dir,
}

impl FileDeploymentStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    /// Create the backing directory
    pub async fn open(dir: Dir) -> Result<Self, PipelineError> {
        dir.create().await?;
        Ok(Self::new(dir))
    }

    fn file_name(id: &str) -> Result<String, PipelineError> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(PipelineError::StorageError(format!(
                "Invalid deployment id: {:?}",
                id
            )));
        }
        Ok(format!("{}.json", id))
    }
}

#[async_trait]
impl DeploymentStore for FileDeploymentStore {
    async fn save(&self, deployment: &Deployment) -> Result<(), PipelineError> {
        let file = self.dir.file(&Self::file_name(&deployment.id)?);
        file.write_json(deployment).await?;
        debug!("Persisted deployment {} to {:?}", deployment.id, file.path());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Deployment>, PipelineError> {
        // no record can exist under an id that could not have been saved
        let Ok(name) = Self::file_name(id) else {
            return Ok(None);
        };
        let file = self.dir.file(&name);
        if !file.exists().await {
            return Ok(None);
        }
        Ok(Some(file.read_json().await?))
    }

    async fn list(&self) -> Result<Vec<Deployment>, PipelineError> {
        if !self.dir.exists().await {
            return Ok(Vec::new());
        }

        let mut deployments = Vec::new();
        for path in self.dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = crate::filesys::file::File::new(path);
            match file.read_json::<Deployment>().await {
                Ok(deployment) => deployments.push(deployment),
                Err(e) => warn!("Skipping unreadable deployment record {:?}: {}", file.path(), e),
            }
        }

        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deployments)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryDeploymentStore {
    entries: RwLock<HashMap<String, Deployment>>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn save(&self, deployment: &Deployment) -> Result<(), PipelineError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Deployment>, PipelineError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Deployment>, PipelineError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut deployments: Vec<Deployment> = entries.values().cloned().collect();
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deployments)
    }
}
