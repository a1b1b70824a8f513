//! Node Worker Pipeline
//!
//! One pipeline run executes Collect, an optional Scan, and Remove against a
//! single node. At most one run is active per node at a time; a second run for
//! the same node waits for the first to finish.
//!
//! Stage failures stay inside the [`PipelineReport`]: `run` itself never
//! errors, so the controller always has something to record.

pub mod cancel;
mod collect;
pub mod lock;
mod remove;
pub mod scan;
pub mod selector;
pub mod types;

pub use cancel::CancelSignal;
pub use lock::KeyedLocks;
pub use scan::{CommandScanner, ImageScanner, PatternScanner, ScanError, ScanVerdict, ScannerChain};
pub use selector::{ImageSelector, ALL_IMAGES};
pub use types::{
    final_dispositions, Disposition, ImageCandidate, PipelineOutcome, PipelineReport, Stage,
    StageOutcome, StageResult,
};

use crate::cri::{Image, ImageClient};
use crate::exclusion::ExclusionPatterns;
use chrono::Utc;
use collect::{CollectError, Collected};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct NodePipeline {
    client: Arc<dyn ImageClient>,
    scanner: Option<Arc<dyn ImageScanner>>,
    exclusions: ExclusionPatterns,
    call_timeout: Duration,
    scan_timeout: Duration,
    node_locks: KeyedLocks,
}

impl NodePipeline {
    pub fn new(client: Arc<dyn ImageClient>) -> Self {
        Self {
            client,
            scanner: None,
            exclusions: ExclusionPatterns::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            node_locks: KeyedLocks::new(),
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn ImageScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_exclusions(mut self, exclusions: ExclusionPatterns) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Bound on every individual runtime call
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Share node serialization with other pipelines
    pub fn with_node_locks(mut self, locks: KeyedLocks) -> Self {
        self.node_locks = locks;
        self
    }

    pub fn node_locks(&self) -> &KeyedLocks {
        &self.node_locks
    }

    /// Run Collect, Scan and Remove on `node`
    pub async fn run(
        &self,
        node: &str,
        selector: &ImageSelector,
        cancel: &CancelSignal,
    ) -> PipelineReport {
        let started_at = Utc::now();
        let mut report = PipelineReport {
            node: node.to_string(),
            started_at,
            finished_at: started_at,
            stage_results: Vec::new(),
            outcome: PipelineOutcome::Succeeded,
        };

        let _node_guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(node, "Cancelled while waiting for node");
                report.outcome = PipelineOutcome::Cancelled;
                report.finished_at = Utc::now();
                return report;
            }
            guard = self.node_locks.acquire(node) => guard,
        };

        info!(node, selector = %selector, "Starting node pipeline");
        report.outcome = self.run_stages(node, selector, cancel, &mut report.stage_results).await;
        report.finished_at = Utc::now();

        match &report.outcome {
            PipelineOutcome::Succeeded => info!(
                node,
                removed = report.count(Disposition::is_removed),
                "Node pipeline succeeded"
            ),
            PipelineOutcome::Failed { reason, retryable } => {
                warn!(node, reason = %reason, retryable, "Node pipeline failed")
            }
            PipelineOutcome::Cancelled => info!(node, "Node pipeline cancelled"),
        }
        report
    }

    async fn run_stages(
        &self,
        node: &str,
        selector: &ImageSelector,
        cancel: &CancelSignal,
        stages: &mut Vec<StageResult>,
    ) -> PipelineOutcome {
        // Collect
        let started_at = Utc::now();
        let collected = collect::collect(
            self.client.as_ref(),
            node,
            selector,
            &self.exclusions,
            self.call_timeout,
            cancel,
        )
        .await;

        let Collected {
            records,
            mut candidates,
        } = match collected {
            Ok(collected) => collected,
            Err(CollectError::Cancelled) => {
                stages.push(stage_result(Stage::Collect, StageOutcome::Cancelled, Vec::new(), started_at));
                return PipelineOutcome::Cancelled;
            }
            Err(CollectError::Runtime(e)) => {
                stages.push(stage_result(
                    Stage::Collect,
                    StageOutcome::Failed(e.to_string()),
                    Vec::new(),
                    started_at,
                ));
                return PipelineOutcome::Failed {
                    reason: format!("collect: {e}"),
                    retryable: e.is_retryable(),
                };
            }
        };
        stages.push(stage_result(Stage::Collect, StageOutcome::Completed, records, started_at));

        // Scan
        if let Some(scanner) = &self.scanner {
            let started_at = Utc::now();
            let (records, allowed, cancelled) =
                self.scan(scanner.as_ref(), node, candidates, cancel).await;
            candidates = allowed;
            if cancelled {
                stages.push(stage_result(Stage::Scan, StageOutcome::Cancelled, records, started_at));
                return PipelineOutcome::Cancelled;
            }
            stages.push(stage_result(Stage::Scan, StageOutcome::Completed, records, started_at));
        }

        // Remove
        let started_at = Utc::now();
        let mut records = Vec::new();
        if !candidates.is_empty() {
            let rechecked = collect::recheck(
                self.client.as_ref(),
                node,
                candidates,
                self.call_timeout,
                cancel,
            )
            .await;
            match rechecked {
                Ok((free, pinned)) => {
                    candidates = free;
                    records = pinned;
                }
                Err(CollectError::Cancelled) => {
                    stages.push(stage_result(Stage::Remove, StageOutcome::Cancelled, Vec::new(), started_at));
                    return PipelineOutcome::Cancelled;
                }
                Err(CollectError::Runtime(e)) => {
                    stages.push(stage_result(
                        Stage::Remove,
                        StageOutcome::Failed(e.to_string()),
                        Vec::new(),
                        started_at,
                    ));
                    return PipelineOutcome::Failed {
                        reason: format!("remove: {e}"),
                        retryable: e.is_retryable(),
                    };
                }
            }
        }
        let (removed, summary) =
            remove::remove(self.client.as_ref(), node, &candidates, self.call_timeout, cancel).await;
        records.extend(removed);

        if summary.cancelled > 0 {
            stages.push(stage_result(Stage::Remove, StageOutcome::Cancelled, records, started_at));
            return PipelineOutcome::Cancelled;
        }
        if summary.all_failed() {
            let reason = format!("all {} removals failed", summary.attempted);
            stages.push(stage_result(
                Stage::Remove,
                StageOutcome::Failed(reason.clone()),
                records,
                started_at,
            ));
            return PipelineOutcome::Failed {
                reason,
                retryable: false,
            };
        }
        stages.push(stage_result(Stage::Remove, StageOutcome::Completed, records, started_at));
        PipelineOutcome::Succeeded
    }

    /// Returns per-image records, the images allowed through, and whether
    /// the stage stopped on cancellation
    async fn scan(
        &self,
        scanner: &dyn ImageScanner,
        node: &str,
        candidates: Vec<Image>,
        cancel: &CancelSignal,
    ) -> (Vec<ImageCandidate>, Vec<Image>, bool) {
        let mut records = Vec::with_capacity(candidates.len());
        let mut allowed = Vec::with_capacity(candidates.len());

        for image in candidates {
            if cancel.is_cancelled() {
                return (records, allowed, true);
            }

            let reference = image.display_name().to_string();
            let verdict = tokio::time::timeout(self.scan_timeout, scanner.evaluate(&reference)).await;
            let disposition = match verdict {
                Ok(Ok(ScanVerdict::Allow)) => Disposition::Candidate,
                Ok(Ok(ScanVerdict::Deny(reason))) => {
                    debug!(node, image = %reference, reason = %reason, "Scanner denied removal");
                    Disposition::ScanFailed(reason)
                }
                Ok(Err(e)) => {
                    warn!(node, image = %reference, error = %e, "Scanner error");
                    Disposition::ScanFailed(e.to_string())
                }
                Err(_) => {
                    warn!(node, image = %reference, "Scanner timed out");
                    Disposition::ScanFailed(format!("scanner timed out after {:?}", self.scan_timeout))
                }
            };

            let passed = disposition == Disposition::Candidate;
            records.push(collect::record(&image, disposition));
            if passed {
                allowed.push(image);
            }
        }

        (records, allowed, false)
    }
}

fn stage_result(
    stage: Stage,
    outcome: StageOutcome,
    images: Vec<ImageCandidate>,
    started_at: chrono::DateTime<Utc>,
) -> StageResult {
    StageResult {
        stage,
        outcome,
        images,
        started_at,
        finished_at: Utc::now(),
    }
}
