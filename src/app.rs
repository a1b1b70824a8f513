//! Assembly of configured components
//!
//! Turns an [`EraserConfig`] into the store, cluster view and node pipeline
//! the controller runs with. Real runtimes are reached through `crictl` and
//! `kubectl` subprocesses.

use crate::config::{ClusterSource, EraserConfig};
use crate::controller::{ClusterClient, ClusterNode, JobController, KubectlCluster, StaticCluster};
use crate::cri::CrictlClient;
use crate::error::Result;
use crate::exclusion::ExclusionPatterns;
use crate::pipeline::{NodePipeline, ScannerChain};
use crate::storage::FileStore;
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use std::sync::Arc;
use tracing::debug;

/// Open the file store under `storage.state_dir`, creating it if needed
pub async fn open_store(config: &EraserConfig) -> Result<Arc<FileStore>> {
    let dir = &config.storage.state_dir;
    tokio::fs::create_dir_all(dir).await?;
    debug!("Using state directory {}", dir.display());
    Ok(Arc::new(FileStore::new(dir.clone())))
}

pub fn cluster_client(
    config: &EraserConfig,
    runner: Arc<dyn ProcessRunner>,
) -> Arc<dyn ClusterClient> {
    match config.cluster.source {
        ClusterSource::Kubectl => Arc::new(KubectlCluster::new(
            runner,
            &config.cluster,
            config.runtime.call_timeout,
        )),
        ClusterSource::Static => {
            let nodes: Vec<ClusterNode> = config.cluster.nodes.clone();
            Arc::new(StaticCluster::new(nodes))
        }
    }
}

pub fn node_pipeline(config: &EraserConfig, runner: Arc<dyn ProcessRunner>) -> Result<NodePipeline> {
    let client = CrictlClient::new(Arc::clone(&runner), config.runtime.clone());
    let mut pipeline = NodePipeline::new(Arc::new(client))
        .with_exclusions(ExclusionPatterns::new(&config.exclusions.images)?)
        .with_call_timeout(config.runtime.call_timeout)
        .with_scan_timeout(config.scanner.timeout);

    if let Some(scanner) = ScannerChain::from_config(&config.scanner, runner)? {
        pipeline = pipeline.with_scanner(scanner);
    }
    Ok(pipeline)
}

/// Build a controller backed by real subprocess runners
pub async fn build_controller(config: &EraserConfig) -> Result<JobController> {
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
    let store = open_store(config).await?;
    let cluster = cluster_client(config, Arc::clone(&runner));
    let pipeline = node_pipeline(config, runner)?;
    Ok(JobController::new(
        store,
        cluster,
        pipeline,
        config.controller.clone(),
    ))
}
