//! Common test utilities and helpers

#![allow(dead_code)]

use eraser::config::ControllerConfig;
use eraser::controller::{CleanupRequest, JobController, StaticCluster};
use eraser::cri::InMemoryRuntime;
use eraser::pipeline::NodePipeline;
use eraser::storage::FileStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A fake cluster: in-memory runtimes, a static node list, and a file store
/// in a temporary directory
pub struct TestCluster {
    pub runtime: InMemoryRuntime,
    pub cluster: StaticCluster,
    pub store: Arc<FileStore>,
    pub controller: JobController,
    _state_dir: TempDir,
}

impl TestCluster {
    pub fn new(nodes: &[&str]) -> Self {
        Self::with_config(nodes, fast_config())
    }

    pub fn with_config(nodes: &[&str], config: ControllerConfig) -> Self {
        let runtime = InMemoryRuntime::new();
        for node in nodes {
            runtime.add_node(node);
        }
        let cluster = StaticCluster::with_workers(nodes);
        let state_dir = TempDir::new().expect("create state dir");
        let store = Arc::new(FileStore::new(state_dir.path()));
        let controller = JobController::new(
            store.clone(),
            Arc::new(cluster.clone()),
            NodePipeline::new(Arc::new(runtime.clone())),
            config,
        );

        Self {
            runtime,
            cluster,
            store,
            controller,
            _state_dir: state_dir,
        }
    }

    /// Reconcile until the request is terminal
    pub async fn drive(&self, id: &str) -> CleanupRequest {
        let started = Instant::now();
        loop {
            let request = self.controller.reconcile(id).await.expect("reconcile");
            if request.is_terminal() {
                return request;
            }
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "request {id} stuck in {}",
                request.phase
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Poll `condition` until it holds or the timeout passes
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
