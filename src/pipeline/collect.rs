use super::cancel::CancelSignal;
use super::selector::ImageSelector;
use super::types::{Disposition, ImageCandidate};
use crate::cri::{CriError, CriResult, Image, ImageClient};
use crate::exclusion::{ExclusionPatterns, ExclusionSet};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub(super) const IN_USE: &str = "in use by a container";
pub(super) const OPERATOR_EXCLUDED: &str = "matches exclusion list";

#[derive(Debug)]
pub(super) enum CollectError {
    Cancelled,
    Runtime(CriError),
}

/// Result of a successful collect: per-image records plus the removable set
#[derive(Debug, Default)]
pub(super) struct Collected {
    pub records: Vec<ImageCandidate>,
    pub candidates: Vec<Image>,
}

pub(super) fn record(image: &Image, disposition: Disposition) -> ImageCandidate {
    ImageCandidate {
        reference: image.display_name().to_string(),
        image_id: image.id.clone(),
        disposition,
    }
}

/// Run one runtime call under the call timeout, giving up early on cancel
async fn bounded<T, F>(
    node: &str,
    timeout: Duration,
    cancel: &CancelSignal,
    call: F,
) -> Result<T, CollectError>
where
    F: Future<Output = CriResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CollectError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CollectError::Runtime(e)),
            Err(_) => Err(CollectError::Runtime(CriError::Timeout {
                node: node.to_string(),
                timeout,
            })),
        },
    }
}

/// Enumerate the node and split in-scope images into excluded and candidates
///
/// Any enumeration failure aborts the stage; a partial listing is never used
/// to decide what is safe to remove.
pub(super) async fn collect(
    client: &dyn ImageClient,
    node: &str,
    selector: &ImageSelector,
    patterns: &ExclusionPatterns,
    call_timeout: Duration,
    cancel: &CancelSignal,
) -> Result<Collected, CollectError> {
    let images = bounded(node, call_timeout, cancel, client.list_images(node)).await?;
    let containers = bounded(node, call_timeout, cancel, client.list_containers(node)).await?;

    let exclusions = ExclusionSet::resolve(&containers, &images);
    debug!(
        node,
        images = images.len(),
        containers = containers.len(),
        excluded_refs = exclusions.len(),
        "Enumerated node runtime"
    );

    let mut collected = Collected::default();
    for image in images.into_iter().filter(|i| selector.selects(i)) {
        if exclusions.covers(&image) {
            collected
                .records
                .push(record(&image, Disposition::Excluded(IN_USE.to_string())));
        } else if patterns.matches(&image) {
            collected.records.push(record(
                &image,
                Disposition::Excluded(OPERATOR_EXCLUDED.to_string()),
            ));
        } else {
            collected.records.push(record(&image, Disposition::Candidate));
            collected.candidates.push(image);
        }
    }

    Ok(collected)
}

/// Re-resolve the exclusion set immediately before Remove
///
/// Containers may have started from a candidate while Scan ran. Returns the
/// candidates that are still unused plus records for the ones now pinned.
/// A failed container listing removes nothing.
pub(super) async fn recheck(
    client: &dyn ImageClient,
    node: &str,
    candidates: Vec<Image>,
    call_timeout: Duration,
    cancel: &CancelSignal,
) -> Result<(Vec<Image>, Vec<ImageCandidate>), CollectError> {
    let containers = bounded(node, call_timeout, cancel, client.list_containers(node)).await?;
    let exclusions = ExclusionSet::resolve(&containers, &candidates);
    if exclusions.is_empty() {
        return Ok((candidates, Vec::new()));
    }

    let (pinned, free): (Vec<Image>, Vec<Image>) =
        candidates.into_iter().partition(|image| exclusions.covers(image));
    let records = pinned
        .iter()
        .map(|image| {
            debug!(node, image = image.display_name(), "Image came into use before removal");
            record(image, Disposition::Excluded(IN_USE.to_string()))
        })
        .collect();
    Ok((free, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::{Container, ContainerState, InMemoryRuntime};

    fn runtime() -> InMemoryRuntime {
        let runtime = InMemoryRuntime::new();
        runtime.add_tagged_image("n1", "nginx:latest");
        runtime.add_tagged_image("n1", "redis:7");
        runtime.add_tagged_image("n1", "registry.k8s.io/pause:3.9");
        runtime.run_container("n1", "web", "nginx:latest");
        runtime
    }

    #[tokio::test]
    async fn test_running_and_listed_images_are_excluded() {
        let runtime = runtime();
        let patterns = ExclusionPatterns::new(&["registry.k8s.io/*"]).unwrap();

        let collected = collect(
            &runtime,
            "n1",
            &ImageSelector::AllUnused,
            &patterns,
            Duration::from_secs(1),
            &CancelSignal::new(),
        )
        .await
        .unwrap();

        let candidates: Vec<&str> = collected.candidates.iter().map(|i| i.display_name()).collect();
        assert_eq!(candidates, vec!["redis:7"]);
        assert_eq!(collected.records.len(), 3);
        assert!(collected.records.iter().any(|r| r.reference == "nginx:latest"
            && r.disposition == Disposition::Excluded(IN_USE.to_string())));
    }

    #[tokio::test]
    async fn test_out_of_scope_images_are_not_recorded() {
        let runtime = runtime();
        let collected = collect(
            &runtime,
            "n1",
            &ImageSelector::from_list(["redis:7", "nginx"]),
            &ExclusionPatterns::default(),
            Duration::from_secs(1),
            &CancelSignal::new(),
        )
        .await
        .unwrap();

        assert_eq!(collected.records.len(), 2);
        assert_eq!(collected.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_container_listing_failure_fails_closed() {
        let runtime = runtime();
        runtime.fail_listing("n1", "socket closed");
        let result = collect(
            &runtime,
            "n1",
            &ImageSelector::AllUnused,
            &ExclusionPatterns::default(),
            Duration::from_secs(1),
            &CancelSignal::new(),
        )
        .await;

        assert!(matches!(result, Err(CollectError::Runtime(e)) if e.is_retryable()));
    }

    #[tokio::test]
    async fn test_hung_runtime_times_out() {
        let runtime = runtime();
        runtime.hang("n1");
        let result = collect(
            &runtime,
            "n1",
            &ImageSelector::AllUnused,
            &ExclusionPatterns::default(),
            Duration::from_millis(20),
            &CancelSignal::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(CollectError::Runtime(CriError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn test_exited_container_releases_image() {
        let runtime = InMemoryRuntime::new();
        runtime.add_tagged_image("n1", "nginx:latest");
        runtime.add_container(
            "n1",
            Container::new("c1", "nginx:latest", ContainerState::Exited),
        );

        let collected = collect(
            &runtime,
            "n1",
            &ImageSelector::AllUnused,
            &ExclusionPatterns::default(),
            Duration::from_secs(1),
            &CancelSignal::new(),
        )
        .await
        .unwrap();
        assert_eq!(collected.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_recheck_drops_images_that_came_into_use() {
        let runtime = runtime();
        let candidates: Vec<Image> = runtime
            .images("n1")
            .into_iter()
            .filter(|i| i.display_name() != "nginx:latest")
            .collect();
        runtime.run_container("n1", "late", "redis:7");

        let (free, records) = recheck(
            &runtime,
            "n1",
            candidates,
            Duration::from_secs(1),
            &CancelSignal::new(),
        )
        .await
        .unwrap();

        let free: Vec<&str> = free.iter().map(|i| i.display_name()).collect();
        assert_eq!(free, vec!["registry.k8s.io/pause:3.9"]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reference, "redis:7");
        assert_eq!(records[0].disposition, Disposition::Excluded(IN_USE.to_string()));
    }
}
