//! In-memory status store for tests and embedding

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::controller::{CleanupRequest, NodeExecution};
use crate::storage::{
    error::{check_id, StoreError, StoreResult},
    traits::{supersedes, StatusStore},
};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    requests: Arc<RwLock<HashMap<String, CleanupRequest>>>,
    executions: Arc<RwLock<HashMap<String, BTreeMap<String, NodeExecution>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn create_request(&self, request: &CleanupRequest) -> StoreResult<()> {
        check_id(&request.id)?;
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists(request.id.clone()));
        }
        requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, id: &str) -> StoreResult<CleanupRequest> {
        self.requests
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_requests(&self) -> StoreResult<Vec<CleanupRequest>> {
        let mut requests: Vec<CleanupRequest> =
            self.requests.read().await.values().cloned().collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn update_request(&self, request: &CleanupRequest) -> StoreResult<()> {
        let mut requests = self.requests.write().await;
        match requests.get_mut(&request.id) {
            Some(stored) => {
                *stored = request.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(request.id.clone())),
        }
    }

    async fn record_execution(&self, execution: &NodeExecution) -> StoreResult<bool> {
        check_id(&execution.node_id)?;
        let mut executions = self.executions.write().await;
        let per_request = executions
            .entry(execution.parent_request_id.clone())
            .or_default();
        if !supersedes(per_request.get(&execution.node_id), execution) {
            return Ok(false);
        }
        per_request.insert(execution.node_id.clone(), execution.clone());
        Ok(true)
    }

    async fn get_execution(
        &self,
        request_id: &str,
        node: &str,
    ) -> StoreResult<Option<NodeExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .get(request_id)
            .and_then(|m| m.get(node))
            .cloned())
    }

    async fn list_executions(&self, request_id: &str) -> StoreResult<Vec<NodeExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .get(request_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_executions(&self, request_id: &str) -> StoreResult<usize> {
        Ok(self
            .executions
            .write()
            .await
            .remove(request_id)
            .map(|m| m.len())
            .unwrap_or(0))
    }
}
