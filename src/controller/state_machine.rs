//! Pure CleanupRequest state machine
//!
//! Nothing in this module performs I/O. The controller feeds it observed
//! node outcomes and persists whatever it returns.
//!
//! ```text
//! Pending --Start--> Running --Finish--> Succeeded | Failed | TimedOut
//! ```
//!
//! Terminal phases are absorbing, both for the request and for every entry
//! of `perNodeStatus`.

use super::request::{NodePhase, NodeStatus, RequestPhase};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid transition from {from} on {transition}")]
    InvalidTransition { from: String, transition: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTransition {
    /// Targets resolved and executions spawned
    Start,
    /// Aggregation reached a terminal phase
    Finish(RequestPhase),
}

impl std::fmt::Display for RequestTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestTransition::Start => f.write_str("Start"),
            RequestTransition::Finish(phase) => write!(f, "Finish({phase})"),
        }
    }
}

pub fn apply_transition(
    phase: RequestPhase,
    transition: RequestTransition,
) -> Result<RequestPhase, StateError> {
    match (phase, transition) {
        (RequestPhase::Pending, RequestTransition::Start) => Ok(RequestPhase::Running),
        (RequestPhase::Running, RequestTransition::Finish(next)) if next.is_terminal() => Ok(next),
        (from, transition) => Err(StateError::InvalidTransition {
            from: from.to_string(),
            transition: transition.to_string(),
        }),
    }
}

/// Write `status` for `node` unless the current entry is already terminal
///
/// Returns whether the map changed.
pub fn record_node_status(
    statuses: &mut BTreeMap<String, NodeStatus>,
    node: &str,
    status: NodeStatus,
) -> bool {
    match statuses.get(node) {
        Some(current) if current.phase.is_terminal() => {
            if current.phase != status.phase {
                debug!(
                    node,
                    current = %current.phase,
                    ignored = %status.phase,
                    "Ignoring update to terminal node status"
                );
            }
            false
        }
        Some(current) if *current == status => false,
        _ => {
            statuses.insert(node.to_string(), status);
            true
        }
    }
}

/// Move every non-terminal node to `phase`, returning the nodes touched
pub fn finish_outstanding(
    statuses: &mut BTreeMap<String, NodeStatus>,
    phase: NodePhase,
) -> Vec<String> {
    let outstanding: Vec<String> = statuses
        .iter()
        .filter(|(_, s)| !s.phase.is_terminal())
        .map(|(node, _)| node.clone())
        .collect();

    for node in &outstanding {
        if let Some(status) = statuses.get(node) {
            let next = status.with_phase(phase.clone());
            record_node_status(statuses, node, next);
        }
    }
    outstanding
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nodes are still outstanding and tolerance holds
    Continue,
    /// More nodes failed than tolerated; abort the rest
    ToleranceExceeded,
    Complete(RequestPhase),
}

/// Derive the request verdict from its per-node statuses
pub fn aggregate(statuses: &BTreeMap<String, NodeStatus>, failure_tolerance: usize) -> Verdict {
    let failed = statuses.values().filter(|s| s.phase.is_failed()).count();
    if failed > failure_tolerance {
        return Verdict::ToleranceExceeded;
    }

    if !statuses.values().all(|s| s.phase.is_terminal()) {
        return Verdict::Continue;
    }

    if statuses.values().all(|s| s.phase == NodePhase::Succeeded) {
        Verdict::Complete(RequestPhase::Succeeded)
    } else if statuses.values().any(|s| s.phase == NodePhase::TimedOut) {
        Verdict::Complete(RequestPhase::TimedOut)
    } else {
        Verdict::Complete(RequestPhase::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(phases: &[(&str, NodePhase)]) -> BTreeMap<String, NodeStatus> {
        phases
            .iter()
            .map(|(node, phase)| (node.to_string(), NodeStatus::pending().with_phase(phase.clone())))
            .collect()
    }

    #[test]
    fn test_valid_transitions() {
        let phase = apply_transition(RequestPhase::Pending, RequestTransition::Start).unwrap();
        assert_eq!(phase, RequestPhase::Running);
        let phase = apply_transition(phase, RequestTransition::Finish(RequestPhase::TimedOut)).unwrap();
        assert_eq!(phase, RequestPhase::TimedOut);
    }

    #[test]
    fn test_terminal_phases_are_absorbing() {
        for terminal in [RequestPhase::Succeeded, RequestPhase::Failed, RequestPhase::TimedOut] {
            assert!(apply_transition(terminal, RequestTransition::Start).is_err());
            assert!(apply_transition(terminal, RequestTransition::Finish(RequestPhase::Failed)).is_err());
        }
    }

    #[test]
    fn test_cannot_skip_running_or_finish_non_terminal() {
        assert!(apply_transition(RequestPhase::Pending, RequestTransition::Finish(RequestPhase::Succeeded)).is_err());
        let err = apply_transition(RequestPhase::Running, RequestTransition::Finish(RequestPhase::Pending))
            .unwrap_err();
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_terminal_node_status_never_changes() {
        let mut map = statuses(&[("n1", NodePhase::Running)]);
        let succeeded = map["n1"].with_phase(NodePhase::Succeeded);
        assert!(record_node_status(&mut map, "n1", succeeded));

        let timed_out = map["n1"].with_phase(NodePhase::TimedOut);
        assert!(!record_node_status(&mut map, "n1", timed_out));
        assert_eq!(map["n1"].phase, NodePhase::Succeeded);
    }

    #[test]
    fn test_finish_outstanding_skips_terminal() {
        let mut map = statuses(&[
            ("n1", NodePhase::Succeeded),
            ("n2", NodePhase::Running),
            ("n3", NodePhase::Pending),
        ]);
        let touched = finish_outstanding(&mut map, NodePhase::TimedOut);
        assert_eq!(touched, vec!["n2".to_string(), "n3".to_string()]);
        assert_eq!(map["n1"].phase, NodePhase::Succeeded);
        assert_eq!(map["n3"].phase, NodePhase::TimedOut);
    }

    #[test]
    fn test_aggregate() {
        let ok = statuses(&[("n1", NodePhase::Succeeded), ("n2", NodePhase::Succeeded)]);
        assert_eq!(aggregate(&ok, 0), Verdict::Complete(RequestPhase::Succeeded));

        let running = statuses(&[("n1", NodePhase::Succeeded), ("n2", NodePhase::Running)]);
        assert_eq!(aggregate(&running, 0), Verdict::Continue);

        let one_failed = statuses(&[
            ("n1", NodePhase::Failed("boom".into())),
            ("n2", NodePhase::Running),
        ]);
        assert_eq!(aggregate(&one_failed, 0), Verdict::ToleranceExceeded);
        assert_eq!(aggregate(&one_failed, 1), Verdict::Continue);

        let tolerated = statuses(&[
            ("n1", NodePhase::Failed("boom".into())),
            ("n2", NodePhase::Succeeded),
        ]);
        assert_eq!(aggregate(&tolerated, 1), Verdict::Complete(RequestPhase::Failed));

        let churned = statuses(&[("n1", NodePhase::Succeeded), ("n2", NodePhase::TimedOut)]);
        assert_eq!(aggregate(&churned, 0), Verdict::Complete(RequestPhase::TimedOut));
    }

    #[test]
    fn test_no_nodes_is_success() {
        assert_eq!(
            aggregate(&BTreeMap::new(), 0),
            Verdict::Complete(RequestPhase::Succeeded)
        );
    }
}
