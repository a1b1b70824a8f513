use async_trait::async_trait;

use crate::controller::{CleanupRequest, NodeExecution};
use crate::storage::error::StoreResult;

/// Durable home of CleanupRequests and their NodeExecutions
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persist a new request; fails if the id is taken
    async fn create_request(&self, request: &CleanupRequest) -> StoreResult<()>;

    async fn get_request(&self, id: &str) -> StoreResult<CleanupRequest>;

    /// All requests, oldest first
    async fn list_requests(&self) -> StoreResult<Vec<CleanupRequest>>;

    /// Replace an existing request
    async fn update_request(&self, request: &CleanupRequest) -> StoreResult<()>;

    /// Write an execution unless that would move it backwards
    ///
    /// Returns `false` (and writes nothing) when the stored record is a later
    /// attempt, or the same attempt already terminal.
    async fn record_execution(&self, execution: &NodeExecution) -> StoreResult<bool>;

    async fn get_execution(&self, request_id: &str, node: &str)
        -> StoreResult<Option<NodeExecution>>;

    async fn list_executions(&self, request_id: &str) -> StoreResult<Vec<NodeExecution>>;

    /// Remove every execution of a request, returning how many were deleted
    async fn delete_executions(&self, request_id: &str) -> StoreResult<usize>;
}

/// Monotonic write rule shared by every backend
pub(crate) fn supersedes(existing: Option<&NodeExecution>, incoming: &NodeExecution) -> bool {
    match existing {
        None => true,
        Some(current) if current.attempt > incoming.attempt => false,
        Some(current) if current.attempt == incoming.attempt => !current.is_terminal(),
        Some(_) => true,
    }
}
