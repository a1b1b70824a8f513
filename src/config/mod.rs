//! Configuration for the controller, node runtimes and storage
//!
//! Every field has a default so an empty YAML document (or no file at all)
//! yields a usable configuration. Durations are written in humantime form
//! (`30s`, `10m`, `1h`).

pub mod loader;

pub use loader::{load, load_from_str, ConfigError};

use crate::controller::cluster::ClusterNode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Node label that opts a node out of cleanup
pub const SKIP_NODE_LABEL: &str = "eraser.sh/cleanup.filter";

/// Longest deadline a request may carry
pub const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EraserConfig {
    pub controller: ControllerConfig,
    pub runtime: RuntimeConfig,
    pub exclusions: ExclusionConfig,
    pub scanner: ScannerConfig,
    pub storage: StorageConfig,
    pub cluster: ClusterConfig,
}

impl EraserConfig {
    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.poll_interval.is_zero() {
            return Err(ConfigError::invalid(
                "controller.poll_interval",
                "must be greater than zero",
            ));
        }
        if self.controller.deadline.is_zero() {
            return Err(ConfigError::invalid(
                "controller.deadline",
                "must be greater than zero",
            ));
        }
        if self.controller.deadline > MAX_DEADLINE {
            return Err(ConfigError::invalid(
                "controller.deadline",
                "must not exceed 365 days",
            ));
        }
        if self.controller.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "controller.max_attempts",
                "at least one attempt is required",
            ));
        }
        if self.runtime.call_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "runtime.call_timeout",
                "must be greater than zero",
            ));
        }
        if self.runtime.crictl.trim().is_empty() {
            return Err(ConfigError::invalid("runtime.crictl", "must not be empty"));
        }

        for pattern in self.exclusions.images.iter().chain(&self.scanner.deny) {
            glob::Pattern::new(pattern).map_err(|e| {
                ConfigError::invalid("exclusions", format!("bad pattern '{pattern}': {e}"))
            })?;
        }

        if self.cluster.source == ClusterSource::Static && self.cluster.nodes.is_empty() {
            return Err(ConfigError::invalid(
                "cluster.nodes",
                "a static cluster needs at least one node",
            ));
        }

        Ok(())
    }
}

/// What to record for a node that leaves the cluster mid-run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachableNodePolicy {
    #[default]
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Failed nodes tolerated before a request is aborted
    pub failure_tolerance: usize,

    /// Global deadline measured from the moment a request starts running
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,

    /// How long terminal requests keep their per-node execution records
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Attempts per node for retryable failures, including the first
    pub max_attempts: u32,

    pub unreachable_node_policy: UnreachableNodePolicy,

    pub nodes: NodeFilterConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            failure_tolerance: 0,
            deadline: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            unreachable_node_policy: UnreachableNodePolicy::default(),
            nodes: NodeFilterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFilterConfig {
    pub include_control_plane: bool,
    /// Nodes carrying any of these labels are skipped
    pub skip_labels: Vec<String>,
    pub excluded_nodes: Vec<String>,
    pub skip_unready: bool,
}

impl Default for NodeFilterConfig {
    fn default() -> Self {
        Self {
            include_control_plane: false,
            skip_labels: vec![SKIP_NODE_LABEL.to_string()],
            excluded_nodes: Vec::new(),
            skip_unready: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `crictl` binary, looked up on PATH (or inside the exec target)
    pub crictl: String,

    pub runtime_endpoint: Option<String>,

    /// Command prefix that reaches a node, `{node}` is substituted
    ///
    /// Empty means the runtime is local. `["docker", "exec", "{node}"]`
    /// reaches kind nodes, `["ssh", "{node}"]` reaches real hosts.
    pub exec: Vec<String>,

    /// Bound on every single runtime call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            crictl: "crictl".to_string(),
            runtime_endpoint: None,
            exec: Vec::new(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionConfig {
    /// Glob patterns of images that are never removed
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Glob patterns the scan stage refuses to pass to removal
    pub deny: Vec<String>,

    /// External gate, `{image}` is substituted; exit 0 allows, exit 1 denies
    pub command: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            deny: Vec::new(),
            command: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl ScannerConfig {
    pub fn is_enabled(&self) -> bool {
        !self.deny.is_empty() || !self.command.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("eraser"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/eraser"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSource {
    #[default]
    Kubectl,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub source: ClusterSource,
    pub kubectl: String,
    pub kubeconfig: Option<PathBuf>,
    /// Node inventory for `source: static`
    pub nodes: Vec<ClusterNode>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            source: ClusterSource::default(),
            kubectl: "kubectl".to_string(),
            kubeconfig: None,
            nodes: Vec::new(),
        }
    }
}
