//! Contract tests run against every backend

use super::*;
use crate::config::ControllerConfig;
use crate::controller::{CleanupRequest, ExecutionPhase, NodeExecution, RequestOptions, RequestOverrides, RequestPhase};
use crate::pipeline::ImageSelector;
use tempfile::TempDir;

fn request(id: &str) -> CleanupRequest {
    CleanupRequest::new(
        id,
        ImageSelector::from_list(["nginx"]),
        RequestOptions::resolve(&ControllerConfig::default(), &RequestOverrides::default()),
    )
}

async fn request_lifecycle(store: &dyn StatusStore) {
    store.create_request(&request("cleanup-a")).await.unwrap();
    assert!(matches!(
        store.create_request(&request("cleanup-a")).await,
        Err(StoreError::AlreadyExists(_))
    ));

    let mut stored = store.get_request("cleanup-a").await.unwrap();
    assert_eq!(stored.phase, RequestPhase::Pending);
    stored.phase = RequestPhase::Running;
    store.update_request(&stored).await.unwrap();
    assert_eq!(
        store.get_request("cleanup-a").await.unwrap().phase,
        RequestPhase::Running
    );

    assert!(store.get_request("cleanup-missing").await.unwrap_err().is_not_found());
    assert!(store.update_request(&request("cleanup-missing")).await.is_err());

    store.create_request(&request("cleanup-b")).await.unwrap();
    let ids: Vec<String> = store
        .list_requests()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["cleanup-a", "cleanup-b"]);
}

async fn execution_monotonicity(store: &dyn StatusStore) {
    let running = NodeExecution::new("cleanup-a", "worker-1", 1).started();
    assert!(store.record_execution(&running).await.unwrap());

    let cancelled = running.clone().cancelled("deadline exceeded");
    assert!(store.record_execution(&cancelled).await.unwrap());

    // a late write from the worker must not resurrect the execution
    assert!(!store.record_execution(&running).await.unwrap());
    let stored = store
        .get_execution("cleanup-a", "worker-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.phase, ExecutionPhase::Cancelled);

    let retry = NodeExecution::new("cleanup-a", "worker-1", 2);
    assert!(store.record_execution(&retry).await.unwrap());
    assert!(!store.record_execution(&cancelled).await.unwrap());

    store
        .record_execution(&NodeExecution::new("cleanup-a", "worker-2", 1))
        .await
        .unwrap();
    assert_eq!(store.list_executions("cleanup-a").await.unwrap().len(), 2);
    assert_eq!(store.delete_executions("cleanup-a").await.unwrap(), 2);
    assert!(store.list_executions("cleanup-a").await.unwrap().is_empty());
    assert_eq!(store.delete_executions("cleanup-a").await.unwrap(), 0);
}

#[tokio::test]
async fn test_memory_store_contract() {
    let store = MemoryStore::new();
    request_lifecycle(&store).await;
    execution_monotonicity(&store).await;
}

#[tokio::test]
async fn test_file_store_contract() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path());
    request_lifecycle(&store).await;
    execution_monotonicity(&store).await;
}

#[tokio::test]
async fn test_file_store_survives_reopen_and_ignores_temp_files() {
    let dir = TempDir::new().unwrap();
    FileStore::new(dir.path())
        .create_request(&request("cleanup-a"))
        .await
        .unwrap();
    std::fs::write(dir.path().join("requests").join("cleanup-b.tmp"), b"{").unwrap();

    let reopened = FileStore::new(dir.path());
    let requests = reopened.list_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].image_selector, ImageSelector::from_list(["nginx"]));
}

#[tokio::test]
async fn test_path_like_ids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path());
    assert!(matches!(
        store.get_request("../../etc/passwd").await,
        Err(StoreError::InvalidId(_))
    ));
}
