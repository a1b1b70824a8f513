use super::cluster::ClusterNode;
use crate::config::NodeFilterConfig;

/// Why a cluster node was left out of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ControlPlane,
    Label(String),
    Excluded,
    NotReady,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::ControlPlane => write!(f, "control-plane node"),
            SkipReason::Label(label) => write!(f, "carries label {label}"),
            SkipReason::Excluded => write!(f, "excluded by name"),
            SkipReason::NotReady => write!(f, "not ready"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSelection {
    pub targets: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
}

fn skip_reason(
    node: &ClusterNode,
    filter: &NodeFilterConfig,
    include_control_plane: bool,
) -> Option<SkipReason> {
    if filter.excluded_nodes.iter().any(|n| n == &node.name) {
        return Some(SkipReason::Excluded);
    }
    if !include_control_plane && node.is_control_plane() {
        return Some(SkipReason::ControlPlane);
    }
    if let Some(label) = filter
        .skip_labels
        .iter()
        .find(|l| node.labels.contains_key(l.as_str()))
    {
        return Some(SkipReason::Label(label.clone()));
    }
    if filter.skip_unready && !node.ready {
        return Some(SkipReason::NotReady);
    }
    None
}

/// Split the current node set into targets and skipped nodes
///
/// Targets come back sorted and de-duplicated.
pub fn select_targets(
    nodes: &[ClusterNode],
    filter: &NodeFilterConfig,
    include_control_plane: bool,
) -> TargetSelection {
    let mut selection = TargetSelection::default();
    for node in nodes {
        match skip_reason(node, filter, include_control_plane) {
            Some(reason) => selection.skipped.push((node.name.clone(), reason)),
            None => selection.targets.push(node.name.clone()),
        }
    }
    selection.targets.sort();
    selection.targets.dedup();
    selection
}
