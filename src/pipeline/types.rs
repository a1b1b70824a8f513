use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collect,
    Scan,
    Remove,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Collect => write!(f, "collect"),
            Stage::Scan => write!(f, "scan"),
            Stage::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// What happened to one image inside a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", content = "reason", rename_all = "kebab-case")]
pub enum Disposition {
    /// Still eligible for removal after this stage
    Candidate,
    Excluded(String),
    ScanFailed(String),
    Removed,
    RemoveFailed(String),
    /// Never attempted because cancellation was signalled first
    Cancelled,
}

impl Disposition {
    pub fn is_removed(&self) -> bool {
        matches!(self, Disposition::Removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCandidate {
    /// Human-facing reference (first tag, digest or id)
    pub reference: String,
    pub image_id: String,
    #[serde(flatten)]
    pub disposition: Disposition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
    #[serde(default)]
    pub images: Vec<ImageCandidate>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Succeeded,
    Failed { reason: String, retryable: bool },
    Cancelled,
}

/// Everything one pipeline run did on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stage_results: Vec<StageResult>,
    pub outcome: PipelineOutcome,
}

/// Last disposition of every image a run touched, keyed by reference
pub fn final_dispositions(stages: &[StageResult]) -> BTreeMap<String, Disposition> {
    let mut dispositions = BTreeMap::new();
    for stage in stages {
        for image in &stage.images {
            dispositions.insert(image.reference.clone(), image.disposition.clone());
        }
    }
    dispositions
}

impl PipelineReport {
    pub fn final_dispositions(&self) -> BTreeMap<String, Disposition> {
        final_dispositions(&self.stage_results)
    }

    pub fn removed(&self) -> Vec<String> {
        self.final_dispositions()
            .into_iter()
            .filter(|(_, d)| d.is_removed())
            .map(|(r, _)| r)
            .collect()
    }

    /// Images whose removal failed, with the reason
    pub fn failed_removals(&self) -> BTreeMap<String, String> {
        self.final_dispositions()
            .into_iter()
            .filter_map(|(r, d)| match d {
                Disposition::RemoveFailed(reason) => Some((r, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Disposition) -> bool) -> usize {
        self.final_dispositions()
            .values()
            .filter(|d| predicate(d))
            .count()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stage_results.iter().find(|s| s.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(reference: &str, disposition: Disposition) -> ImageCandidate {
        ImageCandidate {
            reference: reference.to_string(),
            image_id: format!("sha256:{reference}"),
            disposition,
        }
    }

    fn stage(stage: Stage, images: Vec<ImageCandidate>) -> StageResult {
        StageResult {
            stage,
            outcome: StageOutcome::Completed,
            images,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_later_stages_override_dispositions() {
        let report = PipelineReport {
            node: "n1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stage_results: vec![
                stage(
                    Stage::Collect,
                    vec![
                        candidate("a", Disposition::Candidate),
                        candidate("b", Disposition::Candidate),
                        candidate("c", Disposition::Excluded("in use".into())),
                    ],
                ),
                stage(
                    Stage::Remove,
                    vec![
                        candidate("a", Disposition::Removed),
                        candidate("b", Disposition::RemoveFailed("busy".into())),
                    ],
                ),
            ],
            outcome: PipelineOutcome::Succeeded,
        };

        assert_eq!(report.removed(), vec!["a".to_string()]);
        assert_eq!(report.failed_removals().get("b").map(String::as_str), Some("busy"));
        assert_eq!(
            report.count(|d| matches!(d, Disposition::Excluded(_))),
            1
        );
    }

    #[test]
    fn test_disposition_wire_format() {
        let json = serde_json::to_value(candidate("a", Disposition::ScanFailed("cve".into()))).unwrap();
        assert_eq!(json["disposition"], "scan-failed");
        assert_eq!(json["reason"], "cve");
        let json = serde_json::to_value(candidate("a", Disposition::Removed)).unwrap();
        assert_eq!(json["disposition"], "removed");
    }
}
