//! End-to-end cleanup runs against in-memory runtimes and a file store

mod common;

use common::{eventually, fast_config, TestCluster};
use eraser::controller::{
    ExecutionPhase, JobController, NodePhase, RequestOverrides, RequestPhase,
};
use eraser::pipeline::{ImageSelector, NodePipeline};
use eraser::storage::{FileStore, StatusStore};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_all_unused_cleanup_across_nodes() {
    let cluster = TestCluster::new(&["worker-1", "worker-2"]);
    for node in ["worker-1", "worker-2"] {
        cluster.runtime.add_tagged_image(node, "nginx:latest");
        cluster.runtime.add_tagged_image(node, "pause:3.9");
        cluster.runtime.run_container(node, "sandbox", "pause:3.9");
    }
    cluster.runtime.add_tagged_image("worker-2", "busybox:1.36");

    let id = cluster
        .controller
        .submit(ImageSelector::AllUnused, RequestOverrides::default())
        .await
        .unwrap();
    let request = cluster.drive(&id).await;

    assert_eq!(request.phase, RequestPhase::Succeeded);
    assert_eq!(request.per_node_status["worker-1"].counts.removed, 1);
    assert_eq!(request.per_node_status["worker-2"].counts.removed, 2);
    for node in ["worker-1", "worker-2"] {
        assert!(!cluster.runtime.has_image(node, "nginx:latest"));
        assert!(cluster.runtime.has_image(node, "pause:3.9"));
    }
    assert!(request.message.unwrap().contains("3 image(s) removed"));
}

#[tokio::test]
async fn test_records_are_written_to_the_state_dir() {
    let cluster = TestCluster::new(&["worker-1"]);
    cluster.runtime.add_tagged_image("worker-1", "nginx:latest");

    let id = cluster
        .controller
        .submit(ImageSelector::from_list(["nginx:latest"]), RequestOverrides::default())
        .await
        .unwrap();
    cluster.drive(&id).await;

    let base = cluster.store.base_dir();
    assert!(base.join("requests").join(format!("{id}.json")).is_file());
    assert!(base.join("executions").join(&id).join("worker-1.json").is_file());

    // a fresh handle on the same directory sees the same records
    let reopened = FileStore::new(base);
    let request = reopened.get_request(&id).await.unwrap();
    assert_eq!(request.phase, RequestPhase::Succeeded);
    let execution = reopened.get_execution(&id, "worker-1").await.unwrap().unwrap();
    assert_eq!(execution.phase, ExecutionPhase::Succeeded);
}

#[tokio::test]
async fn test_controller_restart_resumes_from_store() {
    let cluster = TestCluster::new(&["worker-1", "worker-2"]);
    cluster.runtime.add_tagged_image("worker-1", "nginx:latest");
    cluster.runtime.add_tagged_image("worker-2", "nginx:latest");
    cluster.runtime.set_latency("worker-2", Duration::from_secs(10));

    let id = cluster
        .controller
        .submit(ImageSelector::AllUnused, RequestOverrides::default())
        .await
        .unwrap();
    cluster.controller.reconcile(&id).await.unwrap();
    let runtime = cluster.runtime.clone();
    assert!(
        eventually(Duration::from_secs(5), || !runtime.has_image("worker-1", "nginx:latest")).await
    );
    loop {
        let execution = cluster.store.get_execution(&id, "worker-1").await.unwrap();
        if execution.is_some_and(|e| e.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cluster.controller.shutdown().await;

    cluster.runtime.set_latency("worker-2", Duration::ZERO);
    let restarted = JobController::new(
        cluster.store.clone(),
        Arc::new(cluster.cluster.clone()),
        NodePipeline::new(Arc::new(cluster.runtime.clone())),
        fast_config(),
    );
    let request = loop {
        let request = restarted.reconcile(&id).await.unwrap();
        if request.is_terminal() {
            break request;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(request.phase, RequestPhase::Succeeded);
    assert_eq!(request.per_node_status["worker-1"].attempt, 1);
    assert_eq!(request.per_node_status["worker-2"].attempt, 2);
    assert!(!cluster.runtime.has_image("worker-2", "nginx:latest"));
}

#[tokio::test]
async fn test_unreachable_node_times_out_while_others_succeed() {
    let cluster = TestCluster::new(&["worker-1", "worker-2", "worker-3"]);
    for node in ["worker-1", "worker-2", "worker-3"] {
        cluster.runtime.add_tagged_image(node, "nginx:latest");
    }
    cluster.runtime.hang("worker-2");

    // default deadline and call timeout: only the readiness change settles worker-2
    let id = cluster
        .controller
        .submit(ImageSelector::AllUnused, RequestOverrides::default())
        .await
        .unwrap();
    cluster.controller.reconcile(&id).await.unwrap();
    cluster.cluster.set_ready("worker-2", false);
    let request = cluster.drive(&id).await;

    assert_eq!(request.phase, RequestPhase::TimedOut);
    assert_eq!(request.node_phase("worker-1"), Some(&NodePhase::Succeeded));
    assert_eq!(request.node_phase("worker-2"), Some(&NodePhase::TimedOut));
    assert_eq!(request.node_phase("worker-3"), Some(&NodePhase::Succeeded));
    assert!(cluster.runtime.has_image("worker-2", "nginx:latest"));
    cluster.controller.shutdown().await;
}

#[tokio::test]
async fn test_submit_returns_before_any_node_work() {
    let cluster = TestCluster::new(&["worker-1"]);
    cluster.runtime.add_tagged_image("worker-1", "nginx:latest");

    let id = cluster
        .controller
        .submit(ImageSelector::AllUnused, RequestOverrides::default())
        .await
        .unwrap();

    let request = cluster.store.get_request(&id).await.unwrap();
    assert_eq!(request.phase, RequestPhase::Pending);
    assert!(request.per_node_status.is_empty());
    assert!(cluster.runtime.removal_calls().is_empty());
    assert!(cluster.store.list_executions(&id).await.unwrap().is_empty());
}
