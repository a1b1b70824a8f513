//! Job Controller
//!
//! Drives every CleanupRequest through its state machine. Each reconcile of a
//! request runs under that request's lock, reads the observed NodeExecution
//! records, and derives the next request state from them. Node pipelines run
//! in their own tasks and only ever report back through the store.
//!
//! ```text
//! submit ──> Pending ──reconcile──> Running ──reconcile*──> Succeeded
//!                          │                               Failed
//!                          └─ one task per target node     TimedOut
//! ```

pub mod cluster;
pub mod error;
pub mod execution;
pub mod request;
pub mod state_machine;
pub mod submit;
pub mod targets;


pub use cluster::{ClusterClient, ClusterError, ClusterNode, KubectlCluster, StaticCluster};
pub use error::ControllerError;
pub use execution::{ExecutionPhase, NodeExecution};
pub use request::{
    CleanupRequest, ImageCounts, NodePhase, NodeStatus, RequestOptions, RequestOverrides,
    RequestPhase,
};
pub use state_machine::{StateError, Verdict};
pub use submit::wait_for_terminal;
pub use targets::{select_targets, SkipReason, TargetSelection};

use crate::config::{ControllerConfig, UnreachableNodePolicy};
use crate::pipeline::{CancelSignal, ImageSelector, KeyedLocks, NodePipeline};
use crate::storage::StatusStore;
use chrono::Utc;
use futures::future::join_all;
use humantime_serde::re::humantime;
use state_machine::{
    aggregate, apply_transition, finish_outstanding, record_node_status, RequestTransition,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ABORTED: &str = "aborted: failure tolerance exceeded";
const NODE_DEPARTED: &str = "node left the cluster";
const NODE_NOT_READY: &str = "node is not ready";
const NODE_UNREACHABLE: &str = "node unreachable";
const DEADLINE_EXCEEDED: &str = "deadline exceeded";
const MAX_WAIT_POLL: Duration = Duration::from_millis(200);

/// (request id, node)
type ExecutionKey = (String, String);

struct ActiveExecution {
    attempt: u32,
    cancel: CancelSignal,
    handle: JoinHandle<()>,
}

/// What the latest execution record says should happen to a node
enum Observation {
    Progress(NodePhase),
    Finished(NodePhase),
    Retry(String),
}

#[derive(Clone)]
pub struct JobController {
    store: Arc<dyn StatusStore>,
    cluster: Arc<dyn ClusterClient>,
    pipeline: NodePipeline,
    config: Arc<ControllerConfig>,
    request_locks: KeyedLocks,
    active: Arc<Mutex<HashMap<ExecutionKey, ActiveExecution>>>,
    wake: Arc<Notify>,
}

impl JobController {
    pub fn new(
        store: Arc<dyn StatusStore>,
        cluster: Arc<dyn ClusterClient>,
        pipeline: NodePipeline,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            cluster,
            pipeline,
            config: Arc::new(config),
            request_locks: KeyedLocks::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Create a Pending request; the next reconcile pass picks it up
    pub async fn submit(
        &self,
        selector: ImageSelector,
        overrides: RequestOverrides,
    ) -> Result<String, ControllerError> {
        let id = submit::submit(self.store.as_ref(), &self.config, selector, overrides).await?;
        self.wake.notify_one();
        Ok(id)
    }

    pub async fn wait_for_terminal(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<CleanupRequest, ControllerError> {
        let interval = self.config.poll_interval.min(MAX_WAIT_POLL);
        submit::wait_for_terminal(self.store.as_ref(), id, timeout, interval).await
    }

    /// Advance one request as far as its observed state allows
    pub async fn reconcile(&self, id: &str) -> Result<CleanupRequest, ControllerError> {
        let _guard = self.request_locks.acquire(id).await;
        let mut request = self.store.get_request(id).await?;
        let before = request.clone();
        self.prune_finished(id);

        if request.phase == RequestPhase::Pending {
            self.start(&mut request).await?;
        }
        if request.phase == RequestPhase::Running {
            self.advance(&mut request).await?;
        }
        if request.is_terminal() {
            self.collect_garbage(&mut request).await?;
        }

        if request != before {
            self.store.update_request(&request).await?;
            debug!(request = %request.id, phase = %request.phase, "Stored request");
        }
        Ok(request)
    }

    /// Reconcile every request with work left, returning how many were touched
    ///
    /// Requests are reconciled concurrently; a slow or blocked request never
    /// holds up the others.
    pub async fn reconcile_all(&self) -> Result<usize, ControllerError> {
        let requests = self.store.list_requests().await?;
        let passes = requests
            .iter()
            .filter(|r| needs_reconcile(r))
            .map(|request| async move {
                let result = self.reconcile(&request.id).await;
                if let Err(e) = &result {
                    warn!(request = %request.id, error = %e, "Reconcile failed");
                }
                result.is_ok()
            });
        let reconciled = join_all(passes).await.into_iter().filter(|ok| *ok).count();

        self.request_locks.prune();
        self.pipeline.node_locks().prune();
        Ok(reconciled)
    }

    /// Poll loop; returns after `shutdown` resolves and node tasks have stopped
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(poll_interval = ?self.config.poll_interval, "Job controller started");

        loop {
            if let Err(e) = self.reconcile_all().await {
                warn!(error = %e, "Reconcile pass failed");
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.shutdown().await;
        info!("Job controller stopped");
        Ok(())
    }

    /// Reconcile until no request is left in a non-terminal phase
    pub async fn run_until_idle(&self) -> Result<(), ControllerError> {
        loop {
            self.reconcile_all().await?;
            let requests = self.store.list_requests().await?;
            if requests.iter().all(CleanupRequest::is_terminal) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.wake.notified() => {}
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Cancel every running node task and wait for them to stop
    pub async fn shutdown(&self) {
        let active: Vec<ActiveExecution> = self.active_map().drain().map(|(_, a)| a).collect();
        if active.is_empty() {
            return;
        }

        info!(executions = active.len(), "Cancelling node executions");
        for execution in &active {
            execution.cancel.cancel();
        }
        let handles = active.into_iter().map(|execution| execution.handle);
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Node execution task panicked");
            }
        }
    }

    /// Node tasks still running for any request
    pub fn active_executions(&self) -> usize {
        self.active_map()
            .values()
            .filter(|a| !a.handle.is_finished())
            .count()
    }

    async fn start(&self, request: &mut CleanupRequest) -> Result<(), ControllerError> {
        let nodes = self.cluster.list_nodes().await?;
        let selection = select_targets(
            &nodes,
            &self.config.nodes,
            request.options.include_control_plane,
        );
        for (node, reason) in &selection.skipped {
            debug!(request = %request.id, node = %node, reason = %reason, "Node not targeted");
        }

        // executions left behind by an earlier controller keep their attempt history
        let previous: HashMap<String, u32> = self
            .store
            .list_executions(&request.id)
            .await?
            .into_iter()
            .map(|e| (e.node_id, e.attempt))
            .collect();

        request.per_node_status = selection
            .targets
            .iter()
            .map(|node| {
                let mut status = NodeStatus::pending();
                if let Some(attempt) = previous.get(node) {
                    status.attempt = attempt + 1;
                }
                (node.clone(), status)
            })
            .collect();
        request.phase = apply_transition(request.phase, RequestTransition::Start)?;
        request.started_at = Some(Utc::now());
        self.store.update_request(request).await?;

        info!(
            request = %request.id,
            selector = %request.image_selector,
            nodes = selection.targets.len(),
            skipped = selection.skipped.len(),
            "Request running"
        );

        for (node, status) in &request.per_node_status {
            self.spawn_execution(request, node, status.attempt).await?;
        }
        Ok(())
    }

    async fn advance(&self, request: &mut CleanupRequest) -> Result<(), ControllerError> {
        let executions: HashMap<String, NodeExecution> = self
            .store
            .list_executions(&request.id)
            .await?
            .into_iter()
            .map(|e| (e.node_id.clone(), e))
            .collect();
        let deadline_passed = request
            .deadline_at()
            .is_some_and(|deadline| Utc::now() >= deadline);

        let unreachable = self.unreachable_nodes(request).await;
        self.fold_executions(request, &executions, deadline_passed, &unreachable)
            .await?;
        self.handle_unreachable_nodes(request, &unreachable, &executions)
            .await;

        if deadline_passed && has_outstanding(request) {
            let outstanding = finish_outstanding(&mut request.per_node_status, NodePhase::TimedOut);
            self.cancel_nodes(request, &outstanding, &executions, DEADLINE_EXCEEDED)
                .await;
            let message = format!(
                "deadline of {} exceeded with {} node(s) outstanding",
                humantime::format_duration(request.options.deadline),
                outstanding.len()
            );
            return self.finish(request, RequestPhase::TimedOut, message);
        }

        match aggregate(&request.per_node_status, request.options.failure_tolerance) {
            Verdict::Continue => Ok(()),
            Verdict::ToleranceExceeded => {
                let failed = request.count_nodes(NodePhase::is_failed);
                let outstanding = finish_outstanding(
                    &mut request.per_node_status,
                    NodePhase::Failed(ABORTED.to_string()),
                );
                self.cancel_nodes(request, &outstanding, &executions, ABORTED)
                    .await;
                let message = format!(
                    "{failed} node(s) failed, failure tolerance is {}",
                    request.options.failure_tolerance
                );
                self.finish(request, RequestPhase::Failed, message)
            }
            Verdict::Complete(phase) => {
                let message = summarize(request);
                self.finish(request, phase, message)
            }
        }
    }

    /// Fold observed execution records into `perNodeStatus`
    async fn fold_executions(
        &self,
        request: &mut CleanupRequest,
        executions: &HashMap<String, NodeExecution>,
        deadline_passed: bool,
        unreachable: &HashMap<String, &'static str>,
    ) -> Result<(), ControllerError> {
        let outstanding: Vec<(String, NodeStatus)> = request
            .per_node_status
            .iter()
            .filter(|(_, s)| !s.phase.is_terminal())
            .map(|(node, s)| (node.clone(), s.clone()))
            .collect();

        for (node, status) in outstanding {
            let live = self.is_live(&request.id, &node, status.attempt);
            let observed = executions.get(&node).filter(|e| e.attempt == status.attempt);

            let observation = match observed {
                Some(e) => match e.phase {
                    ExecutionPhase::Succeeded => Observation::Finished(NodePhase::Succeeded),
                    ExecutionPhase::Failed if e.retryable => Observation::Retry(reason_of(e)),
                    ExecutionPhase::Failed => Observation::Finished(NodePhase::Failed(reason_of(e))),
                    ExecutionPhase::Cancelled => Observation::Retry(reason_of(e)),
                    ExecutionPhase::Running if live => Observation::Progress(NodePhase::Running),
                    ExecutionPhase::Pending if live => Observation::Progress(NodePhase::Pending),
                    ExecutionPhase::Pending | ExecutionPhase::Running => {
                        Observation::Retry("orphaned execution".to_string())
                    }
                },
                None if live => Observation::Progress(status.phase.clone()),
                None => Observation::Retry("execution record missing".to_string()),
            };

            match observation {
                Observation::Progress(phase) => {
                    if status.phase != phase {
                        record_node_status(&mut request.per_node_status, &node, status.with_phase(phase));
                    }
                }
                Observation::Finished(phase) => {
                    let stages = observed.map(|e| e.stage_results.as_slice()).unwrap_or_default();
                    info!(request = %request.id, node = %node, phase = %phase, "Node finished");
                    record_node_status(
                        &mut request.per_node_status,
                        &node,
                        status.finished(phase, stages),
                    );
                }
                // left to the deadline or the unreachable-node policy
                Observation::Retry(_) if deadline_passed || unreachable.contains_key(&node) => {}
                Observation::Retry(reason) if status.attempt < self.config.max_attempts => {
                    let attempt = status.attempt + 1;
                    info!(
                        request = %request.id,
                        node = %node,
                        attempt,
                        reason = %reason,
                        "Retrying node"
                    );
                    let mut next = status.with_phase(NodePhase::Pending);
                    next.attempt = attempt;
                    record_node_status(&mut request.per_node_status, &node, next);
                    self.spawn_execution(request, &node, attempt).await?;
                }
                Observation::Retry(reason) => {
                    let stages = observed.map(|e| e.stage_results.as_slice()).unwrap_or_default();
                    let phase = NodePhase::Failed(format!(
                        "{reason} (attempt {}/{})",
                        status.attempt, self.config.max_attempts
                    ));
                    warn!(request = %request.id, node = %node, phase = %phase, "Node out of attempts");
                    record_node_status(
                        &mut request.per_node_status,
                        &node,
                        status.finished(phase, stages),
                    );
                }
            }
        }
        Ok(())
    }

    /// Outstanding nodes the cluster reports gone or, when unready nodes are
    /// skipped, no longer ready, with the reason for each
    async fn unreachable_nodes(&self, request: &CleanupRequest) -> HashMap<String, &'static str> {
        if !has_outstanding(request) {
            return HashMap::new();
        }
        let nodes: HashMap<String, bool> = match self.cluster.list_nodes().await {
            Ok(nodes) => nodes.into_iter().map(|n| (n.name, n.ready)).collect(),
            Err(e) => {
                warn!(request = %request.id, error = %e, "Could not list cluster nodes");
                return HashMap::new();
            }
        };

        request
            .per_node_status
            .iter()
            .filter(|(_, s)| !s.phase.is_terminal())
            .filter_map(|(node, _)| match nodes.get(node) {
                None => Some((node.clone(), NODE_DEPARTED)),
                Some(false) if self.config.nodes.skip_unready => Some((node.clone(), NODE_NOT_READY)),
                Some(_) => None,
            })
            .collect()
    }

    /// Stop waiting on unreachable nodes, settling them per the configured policy
    async fn handle_unreachable_nodes(
        &self,
        request: &mut CleanupRequest,
        unreachable: &HashMap<String, &'static str>,
        executions: &HashMap<String, NodeExecution>,
    ) {
        let mut settled = Vec::new();
        for (node, reason) in unreachable {
            let Some(status) = request.per_node_status.get(node) else {
                continue;
            };
            if status.phase.is_terminal() {
                continue;
            }
            let phase = match self.config.unreachable_node_policy {
                UnreachableNodePolicy::TimedOut => NodePhase::TimedOut,
                UnreachableNodePolicy::Failed => NodePhase::Failed(reason.to_string()),
            };
            warn!(request = %request.id, node = %node, reason, phase = %phase, "Node unreachable");
            let next = status.with_phase(phase);
            record_node_status(&mut request.per_node_status, node, next);
            settled.push(node.clone());
        }
        if !settled.is_empty() {
            self.cancel_nodes(request, &settled, executions, NODE_UNREACHABLE)
                .await;
        }
    }

    /// Signal cancellation and mark the current attempt's record cancelled
    async fn cancel_nodes(
        &self,
        request: &CleanupRequest,
        nodes: &[String],
        executions: &HashMap<String, NodeExecution>,
        reason: &str,
    ) {
        for node in nodes {
            self.signal_cancel(&request.id, node);

            let attempt = request
                .per_node_status
                .get(node)
                .map(|s| s.attempt)
                .unwrap_or(1);
            let execution = executions
                .get(node)
                .filter(|e| e.attempt == attempt)
                .cloned()
                .unwrap_or_else(|| NodeExecution::new(&request.id, node, attempt));
            if execution.is_terminal() {
                continue;
            }
            if let Err(e) = self.store.record_execution(&execution.cancelled(reason)).await {
                warn!(request = %request.id, node = %node, error = %e, "Could not record cancellation");
            }
            info!(request = %request.id, node = %node, reason, "Cancelled node execution");
        }
    }

    fn finish(
        &self,
        request: &mut CleanupRequest,
        phase: RequestPhase,
        message: String,
    ) -> Result<(), ControllerError> {
        request.phase = apply_transition(request.phase, RequestTransition::Finish(phase))?;
        request.completed_at = Some(Utc::now());
        info!(request = %request.id, phase = %phase, message = %message, "Request finished");
        request.message = Some(message);
        Ok(())
    }

    /// Delete execution records once the retention window has passed
    async fn collect_garbage(&self, request: &mut CleanupRequest) -> Result<(), ControllerError> {
        if request.executions_deleted_at.is_some() {
            return Ok(());
        }
        let expires = request.completed_at.and_then(|completed| {
            chrono::Duration::from_std(self.config.retention)
                .ok()
                .and_then(|retention| completed.checked_add_signed(retention))
        });
        match expires {
            Some(expires) if Utc::now() >= expires => {}
            _ => return Ok(()),
        }

        if self.has_live_executions(&request.id) {
            debug!(request = %request.id, "Waiting for cancelled executions before cleanup");
            return Ok(());
        }

        let deleted = self.store.delete_executions(&request.id).await?;
        request.executions_deleted_at = Some(Utc::now());
        info!(request = %request.id, deleted, "Deleted node executions past retention");
        Ok(())
    }

    async fn spawn_execution(
        &self,
        request: &CleanupRequest,
        node: &str,
        attempt: u32,
    ) -> Result<(), ControllerError> {
        let execution = NodeExecution::new(&request.id, node, attempt);
        self.store.record_execution(&execution).await?;

        let cancel = CancelSignal::new();
        let handle = tokio::spawn(execute(
            Arc::clone(&self.store),
            self.pipeline.clone(),
            execution,
            request.image_selector.clone(),
            cancel.clone(),
            Arc::clone(&self.wake),
        ));
        debug!(request = %request.id, node, attempt, "Spawned node execution");

        let key = (request.id.clone(), node.to_string());
        let replaced = self.active_map().insert(
            key,
            ActiveExecution {
                attempt,
                cancel,
                handle,
            },
        );
        if let Some(previous) = replaced {
            previous.cancel.cancel();
        }
        Ok(())
    }

    fn active_map(&self) -> MutexGuard<'_, HashMap<ExecutionKey, ActiveExecution>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_live(&self, request_id: &str, node: &str, attempt: u32) -> bool {
        self.active_map()
            .get(&(request_id.to_string(), node.to_string()))
            .is_some_and(|a| a.attempt == attempt && !a.handle.is_finished())
    }

    fn has_live_executions(&self, request_id: &str) -> bool {
        self.active_map()
            .iter()
            .any(|((id, _), a)| id == request_id && !a.handle.is_finished())
    }

    fn signal_cancel(&self, request_id: &str, node: &str) {
        if let Some(active) = self
            .active_map()
            .get(&(request_id.to_string(), node.to_string()))
        {
            active.cancel.cancel();
        }
    }

    fn prune_finished(&self, request_id: &str) {
        self.active_map()
            .retain(|(id, _), a| id != request_id || !a.handle.is_finished());
    }
}

/// Body of one node task: run the pipeline and report through the store
async fn execute(
    store: Arc<dyn StatusStore>,
    pipeline: NodePipeline,
    execution: NodeExecution,
    selector: ImageSelector,
    cancel: CancelSignal,
    wake: Arc<Notify>,
) {
    let request_id = execution.parent_request_id.clone();
    let node = execution.node_id.clone();

    let running = execution.started();
    match store.record_execution(&running).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(request = %request_id, node = %node, "Execution superseded before start");
            return;
        }
        Err(e) => {
            warn!(request = %request_id, node = %node, error = %e, "Could not record execution start");
            return;
        }
    }

    let report = pipeline.run(&node, &selector, &cancel).await;
    let finished = running.finished(report);
    match store.record_execution(&finished).await {
        Ok(true) => {}
        Ok(false) => debug!(request = %request_id, node = %node, "Execution already closed"),
        Err(e) => warn!(request = %request_id, node = %node, error = %e, "Could not record execution result"),
    }
    wake.notify_one();
}

fn needs_reconcile(request: &CleanupRequest) -> bool {
    !request.is_terminal() || request.executions_deleted_at.is_none()
}

fn has_outstanding(request: &CleanupRequest) -> bool {
    request
        .per_node_status
        .values()
        .any(|s| !s.phase.is_terminal())
}

fn reason_of(execution: &NodeExecution) -> String {
    execution
        .reason
        .clone()
        .unwrap_or_else(|| "no reason recorded".to_string())
}

fn summarize(request: &CleanupRequest) -> String {
    let total = request.per_node_status.len();
    let succeeded = request.count_nodes(|p| *p == NodePhase::Succeeded);
    let removed: usize = request
        .per_node_status
        .values()
        .map(|s| s.counts.removed)
        .sum();
    format!("{succeeded}/{total} node(s) succeeded, {removed} image(s) removed")
}
