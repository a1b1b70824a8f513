//! CleanupRequest: the persistent record clients observe

use crate::config::ControllerConfig;
use crate::pipeline::{final_dispositions, Disposition, ImageSelector, StageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl RequestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestPhase::Succeeded | RequestPhase::Failed | RequestPhase::TimedOut
        )
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestPhase::Pending => "Pending",
            RequestPhase::Running => "Running",
            RequestPhase::Succeeded => "Succeeded",
            RequestPhase::Failed => "Failed",
            RequestPhase::TimedOut => "TimedOut",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "reason")]
pub enum NodePhase {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    TimedOut,
}

impl NodePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodePhase::Succeeded | NodePhase::Failed(_) | NodePhase::TimedOut
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NodePhase::Failed(_))
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Pending => f.write_str("Pending"),
            NodePhase::Running => f.write_str("Running"),
            NodePhase::Succeeded => f.write_str("Succeeded"),
            NodePhase::Failed(reason) => write!(f, "Failed({reason})"),
            NodePhase::TimedOut => f.write_str("TimedOut"),
        }
    }
}

/// Per-image tallies copied from the node's final report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCounts {
    pub removed: usize,
    pub remove_failed: usize,
    pub excluded: usize,
    pub scan_failed: usize,
}

impl ImageCounts {
    pub fn from_stages(stages: &[StageResult]) -> Self {
        let mut counts = ImageCounts::default();
        for disposition in final_dispositions(stages).values() {
            match disposition {
                Disposition::Removed => counts.removed += 1,
                Disposition::RemoveFailed(_) => counts.remove_failed += 1,
                Disposition::Excluded(_) => counts.excluded += 1,
                Disposition::ScanFailed(_) => counts.scan_failed += 1,
                Disposition::Candidate | Disposition::Cancelled => {}
            }
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(flatten)]
    pub phase: NodePhase,
    pub attempt: u32,
    #[serde(default)]
    pub counts: ImageCounts,
    /// Images left on the node because removal or scanning failed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_images: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl NodeStatus {
    pub fn pending() -> Self {
        Self {
            phase: NodePhase::Pending,
            attempt: 1,
            counts: ImageCounts::default(),
            failed_images: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_phase(&self, phase: NodePhase) -> Self {
        Self {
            phase,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Terminal status carrying the per-image detail of the last attempt
    pub fn finished(&self, phase: NodePhase, stages: &[StageResult]) -> Self {
        let failed_images = final_dispositions(stages)
            .into_iter()
            .filter_map(|(image, disposition)| match disposition {
                Disposition::RemoveFailed(reason) | Disposition::ScanFailed(reason) => {
                    Some((image, reason))
                }
                _ => None,
            })
            .collect();

        Self {
            phase,
            counts: ImageCounts::from_stages(stages),
            failed_images,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Per-request knobs a submitter may override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_tolerance: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub deadline: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_control_plane: Option<bool>,
}

/// Options fixed at submission so later config changes never alter a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    pub failure_tolerance: usize,
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    pub include_control_plane: bool,
}

impl RequestOptions {
    pub fn resolve(config: &ControllerConfig, overrides: &RequestOverrides) -> Self {
        Self {
            failure_tolerance: overrides
                .failure_tolerance
                .unwrap_or(config.failure_tolerance),
            deadline: overrides.deadline.unwrap_or(config.deadline),
            include_control_plane: overrides
                .include_control_plane
                .unwrap_or(config.nodes.include_control_plane),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub id: String,
    pub image_selector: ImageSelector,
    pub options: RequestOptions,
    pub phase: RequestPhase,
    #[serde(default)]
    pub per_node_status: BTreeMap<String, NodeStatus>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set once the per-node execution records have been garbage-collected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executions_deleted_at: Option<DateTime<Utc>>,
}

impl CleanupRequest {
    pub fn new(id: impl Into<String>, image_selector: ImageSelector, options: RequestOptions) -> Self {
        Self {
            id: id.into(),
            image_selector,
            options,
            phase: RequestPhase::Pending,
            per_node_status: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            message: None,
            executions_deleted_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Instant after which outstanding nodes are cancelled
    ///
    /// A deadline past the representable range never expires.
    pub fn deadline_at(&self) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        let at = chrono::Duration::from_std(self.options.deadline)
            .ok()
            .and_then(|deadline| started.checked_add_signed(deadline))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(at)
    }

    pub fn node_phase(&self, node: &str) -> Option<&NodePhase> {
        self.per_node_status.get(node).map(|s| &s.phase)
    }

    pub fn count_nodes(&self, predicate: impl Fn(&NodePhase) -> bool) -> usize {
        self.per_node_status
            .values()
            .filter(|s| predicate(&s.phase))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_win_over_config() {
        let config = ControllerConfig::default();
        let options = RequestOptions::resolve(
            &config,
            &RequestOverrides {
                failure_tolerance: Some(2),
                deadline: None,
                include_control_plane: Some(true),
            },
        );
        assert_eq!(options.failure_tolerance, 2);
        assert_eq!(options.deadline, config.deadline);
        assert!(options.include_control_plane);
    }

    #[test]
    fn test_record_uses_camel_case() {
        let mut request = CleanupRequest::new(
            "cleanup-1",
            ImageSelector::AllUnused,
            RequestOptions::resolve(&ControllerConfig::default(), &RequestOverrides::default()),
        );
        let mut status = NodeStatus::pending();
        status.phase = NodePhase::Failed("collect: socket closed".into());
        request.per_node_status.insert("worker-1".into(), status);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["imageSelector"], "allUnused");
        assert_eq!(json["phase"], "Pending");
        assert_eq!(json["perNodeStatus"]["worker-1"]["phase"], "Failed");
        assert_eq!(
            json["perNodeStatus"]["worker-1"]["reason"],
            "collect: socket closed"
        );
        assert_eq!(json["options"]["deadline"], "10m");

        let back: CleanupRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_deadline_starts_with_running() {
        let mut request = CleanupRequest::new(
            "cleanup-1",
            ImageSelector::AllUnused,
            RequestOptions::resolve(&ControllerConfig::default(), &RequestOverrides::default()),
        );
        assert!(request.deadline_at().is_none());
        let started = Utc::now();
        request.started_at = Some(started);
        assert_eq!(
            request.deadline_at(),
            Some(started + chrono::Duration::minutes(10))
        );
    }

    #[test]
    fn test_unrepresentable_deadline_never_expires() {
        let mut request = CleanupRequest::new(
            "cleanup-1",
            ImageSelector::AllUnused,
            RequestOptions::resolve(&ControllerConfig::default(), &RequestOverrides::default()),
        );
        request.started_at = Some(Utc::now());
        for secs in [300_000 * 365 * 86_400, u64::MAX] {
            request.options.deadline = Duration::from_secs(secs);
            assert_eq!(request.deadline_at(), Some(DateTime::<Utc>::MAX_UTC));
        }
    }
}
