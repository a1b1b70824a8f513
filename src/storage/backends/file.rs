//! File-based status store
//!
//! Layout under the state directory:
//!
//! ```text
//! requests/<id>.json
//! executions/<id>/<node>.json
//! ```
//!
//! Every write goes to a temporary file first and is renamed into place, so
//! a reader never sees a half-written record.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::controller::{CleanupRequest, NodeExecution};
use crate::storage::{
    error::{check_id, StoreError, StoreResult},
    traits::{supersedes, StatusStore},
};

const JSON_EXTENSION: &str = "json";

pub struct FileStore {
    base_dir: PathBuf,
    /// Serializes read-check-write sequences inside this process
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn requests_dir(&self) -> PathBuf {
        self.base_dir.join("requests")
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.requests_dir().join(format!("{id}.{JSON_EXTENSION}"))
    }

    fn executions_dir(&self, request_id: &str) -> PathBuf {
        self.base_dir.join("executions").join(request_id)
    }

    fn execution_path(&self, request_id: &str, node: &str) -> PathBuf {
        self.executions_dir(request_id)
            .join(format!("{node}.{JSON_EXTENSION}"))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialization {
            path: path.to_path_buf(),
            source,
        })?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StoreError::io(path, e))?;

        trace!("Wrote {} ({} bytes)", path.display(), json.len());
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Every `*.json` document directly under `dir`
    async fn read_dir_json<T: DeserializeOwned>(&self, dir: &Path) -> StoreResult<Vec<T>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JSON_EXTENSION) {
                continue;
            }
            match self.read_json(&path).await {
                Ok(Some(document)) => documents.push(document),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record: {e}"),
            }
        }
        Ok(documents)
    }
}

#[async_trait]
impl StatusStore for FileStore {
    async fn create_request(&self, request: &CleanupRequest) -> StoreResult<()> {
        check_id(&request.id)?;
        let _lock = self.write_lock.lock().await;

        let path = self.request_path(&request.id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::AlreadyExists(request.id.clone()));
        }
        self.write_json(&path, request).await?;
        debug!("Created request {}", request.id);
        Ok(())
    }

    async fn get_request(&self, id: &str) -> StoreResult<CleanupRequest> {
        check_id(id)?;
        self.read_json(&self.request_path(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_requests(&self) -> StoreResult<Vec<CleanupRequest>> {
        let mut requests: Vec<CleanupRequest> = self.read_dir_json(&self.requests_dir()).await?;
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn update_request(&self, request: &CleanupRequest) -> StoreResult<()> {
        check_id(&request.id)?;
        let _lock = self.write_lock.lock().await;

        let path = self.request_path(&request.id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::NotFound(request.id.clone()));
        }
        self.write_json(&path, request).await
    }

    async fn record_execution(&self, execution: &NodeExecution) -> StoreResult<bool> {
        check_id(&execution.parent_request_id)?;
        check_id(&execution.node_id)?;
        let _lock = self.write_lock.lock().await;

        let path = self.execution_path(&execution.parent_request_id, &execution.node_id);
        let existing: Option<NodeExecution> = self.read_json(&path).await?;
        if !supersedes(existing.as_ref(), execution) {
            trace!(
                "Kept stored execution {}/{}",
                execution.parent_request_id,
                execution.node_id
            );
            return Ok(false);
        }
        self.write_json(&path, execution).await?;
        Ok(true)
    }

    async fn get_execution(
        &self,
        request_id: &str,
        node: &str,
    ) -> StoreResult<Option<NodeExecution>> {
        check_id(request_id)?;
        check_id(node)?;
        self.read_json(&self.execution_path(request_id, node)).await
    }

    async fn list_executions(&self, request_id: &str) -> StoreResult<Vec<NodeExecution>> {
        check_id(request_id)?;
        let mut executions: Vec<NodeExecution> =
            self.read_dir_json(&self.executions_dir(request_id)).await?;
        executions.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(executions)
    }

    async fn delete_executions(&self, request_id: &str) -> StoreResult<usize> {
        check_id(request_id)?;
        let _lock = self.write_lock.lock().await;

        let dir = self.executions_dir(request_id);
        let count = self.read_dir_json::<NodeExecution>(&dir).await?.len();
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(&dir, e)),
        }
        debug!("Deleted {count} executions of request {request_id}");
        Ok(count)
    }
}
