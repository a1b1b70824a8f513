//! Cluster node inventory
//!
//! The controller asks a [`ClusterClient`] for the current node set when a
//! request starts and again on every reconcile, to notice nodes that left.

use crate::config::ClusterConfig;
use crate::subprocess::{ProcessCommandBuilder, ProcessError, ProcessRunner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const ROLE_LABEL_PREFIX: &str = "node-role.kubernetes.io/";
const CONTROL_PLANE_ROLES: [&str; 2] = ["control-plane", "master"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

impl ClusterNode {
    pub fn worker(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
            labels: BTreeMap::new(),
            ready: true,
        }
    }

    pub fn control_plane(name: impl Into<String>) -> Self {
        let mut node = Self::worker(name);
        node.roles.push("control-plane".to_string());
        node
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn is_control_plane(&self) -> bool {
        self.roles
            .iter()
            .any(|r| CONTROL_PLANE_ROLES.contains(&r.as_str()))
            || CONTROL_PLANE_ROLES
                .iter()
                .any(|r| self.labels.contains_key(&format!("{ROLE_LABEL_PREFIX}{r}")))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to list cluster nodes: {0}")]
    Unavailable(String),

    #[error("unexpected node list format: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError>;
}

/// Fixed, mutable node inventory for tests and `source: static`
#[derive(Debug, Clone, Default)]
pub struct StaticCluster {
    nodes: Arc<RwLock<Vec<ClusterNode>>>,
}

impl StaticCluster {
    pub fn new(nodes: Vec<ClusterNode>) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(nodes)),
        }
    }

    pub fn with_workers(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| ClusterNode::worker(*n)).collect())
    }

    pub fn add(&self, node: ClusterNode) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.retain(|n| n.name != node.name);
        nodes.push(node);
    }

    /// Simulate a node leaving the cluster
    pub fn remove(&self, name: &str) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|n| n.name != name);
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = nodes.iter_mut().find(|n| n.name == name) {
            node.ready = ready;
        }
    }
}

#[async_trait]
impl ClusterClient for StaticCluster {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        Ok(self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Reads the node list with `kubectl get nodes -o json`
pub struct KubectlCluster {
    runner: Arc<dyn ProcessRunner>,
    kubectl: String,
    kubeconfig: Option<PathBuf>,
    timeout: Duration,
}

impl KubectlCluster {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: &ClusterConfig, timeout: Duration) -> Self {
        Self {
            runner,
            kubectl: config.kubectl.clone(),
            kubeconfig: config.kubeconfig.clone(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeItem>,
}

#[derive(Deserialize)]
struct NodeItem {
    metadata: NodeMetadata,
    #[serde(default)]
    status: NodeStatusDoc,
}

#[derive(Deserialize)]
struct NodeMetadata {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct NodeStatusDoc {
    #[serde(default)]
    conditions: Vec<NodeCondition>,
}

#[derive(Deserialize)]
struct NodeCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

pub(crate) fn parse_node_list(json: &str) -> Result<Vec<ClusterNode>, ClusterError> {
    let list: NodeList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .map(|item| {
            let roles = item
                .metadata
                .labels
                .keys()
                .filter_map(|k| k.strip_prefix(ROLE_LABEL_PREFIX))
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            let ready = item
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True");
            ClusterNode {
                name: item.metadata.name,
                roles,
                labels: item.metadata.labels,
                ready,
            }
        })
        .collect())
}

#[async_trait]
impl ClusterClient for KubectlCluster {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>, ClusterError> {
        let mut builder = ProcessCommandBuilder::new(&self.kubectl);
        if let Some(kubeconfig) = &self.kubeconfig {
            builder = builder.arg("--kubeconfig").arg(&kubeconfig.to_string_lossy());
        }
        let command = builder
            .args(["get", "nodes", "-o", "json"])
            .timeout(self.timeout)
            .build();

        let output = self.runner.run(command).await?;
        if !output.status.success() {
            return Err(ClusterError::Unavailable(output.stderr.trim().to_string()));
        }
        parse_node_list(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockProcessRunner;

    const NODES_JSON: &str = r#"{
      "items": [
        {
          "metadata": {
            "name": "kind-control-plane",
            "labels": {"node-role.kubernetes.io/control-plane": ""}
          },
          "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        },
        {
          "metadata": {"name": "kind-worker", "labels": {"kubernetes.io/os": "linux"}},
          "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        },
        {
          "metadata": {"name": "kind-worker2"},
          "status": {"conditions": [{"type": "Ready", "status": "Unknown"}]}
        }
      ]
    }"#;

    #[test]
    fn test_parse_node_list() {
        let nodes = parse_node_list(NODES_JSON).unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes[0].is_control_plane());
        assert_eq!(nodes[0].roles, vec!["control-plane"]);
        assert!(!nodes[1].is_control_plane());
        assert!(nodes[1].ready);
        assert!(!nodes[2].ready);
    }

    #[tokio::test]
    async fn test_kubectl_passes_kubeconfig() {
        let mock = MockProcessRunner::new();
        mock.expect_command("kubectl")
            .returns_stdout(NODES_JSON)
            .finish();

        let config = ClusterConfig {
            kubeconfig: Some(PathBuf::from("/etc/kube/admin.conf")),
            ..Default::default()
        };
        let cluster = KubectlCluster::new(Arc::new(mock.clone()), &config, Duration::from_secs(5));
        let nodes = cluster.list_nodes().await.unwrap();

        assert_eq!(nodes.len(), 3);
        let args = &mock.get_call_history()[0].args;
        assert_eq!(
            args,
            &vec!["--kubeconfig", "/etc/kube/admin.conf", "get", "nodes", "-o", "json"]
        );
    }

    #[tokio::test]
    async fn test_kubectl_failure() {
        let mock = MockProcessRunner::new();
        mock.expect_command("kubectl")
            .returns_exit_code(1)
            .returns_stderr("The connection to the server was refused")
            .finish();

        let cluster = KubectlCluster::new(
            Arc::new(mock),
            &ClusterConfig::default(),
            Duration::from_secs(5),
        );
        assert!(matches!(
            cluster.list_nodes().await,
            Err(ClusterError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_static_cluster_churn() {
        let cluster = StaticCluster::with_workers(&["n1", "n2"]);
        cluster.remove("n2");
        cluster.add(ClusterNode::worker("n3").not_ready());
        let names: Vec<String> = cluster.list_nodes().await.unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["n1", "n3"]);
    }
}
