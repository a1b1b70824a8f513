use super::cancel::CancelSignal;
use super::collect::record;
use super::types::{Disposition, ImageCandidate};
use crate::cri::{Image, ImageClient};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct RemoveSummary {
    pub attempted: usize,
    pub removed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RemoveSummary {
    /// Every attempted removal failed and nothing was left for later
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failed == self.attempted && self.cancelled == 0
    }
}

/// Remove candidates one at a time by image id
///
/// A failure on one image never stops the others. An image the runtime no
/// longer has counts as removed. Cancellation is honored between calls.
pub(super) async fn remove(
    client: &dyn ImageClient,
    node: &str,
    candidates: &[Image],
    call_timeout: Duration,
    cancel: &CancelSignal,
) -> (Vec<ImageCandidate>, RemoveSummary) {
    let mut records = Vec::with_capacity(candidates.len());
    let mut summary = RemoveSummary::default();

    for image in candidates {
        if cancel.is_cancelled() {
            summary.cancelled += 1;
            records.push(record(image, Disposition::Cancelled));
            continue;
        }

        summary.attempted += 1;
        let disposition =
            match tokio::time::timeout(call_timeout, client.remove_image(node, &image.id)).await {
                Ok(Ok(())) => {
                    info!(node, image = image.display_name(), "Removed image");
                    Disposition::Removed
                }
                Ok(Err(e)) if e.is_not_found() => {
                    debug!(node, image = image.display_name(), "Image already absent");
                    Disposition::Removed
                }
                Ok(Err(e)) => {
                    warn!(node, image = image.display_name(), error = %e, "Image removal failed");
                    Disposition::RemoveFailed(e.to_string())
                }
                Err(_) => {
                    warn!(node, image = image.display_name(), "Image removal timed out");
                    Disposition::RemoveFailed(format!("timed out after {call_timeout:?}"))
                }
            };

        match disposition {
            Disposition::Removed => summary.removed += 1,
            _ => summary.failed += 1,
        }
        records.push(record(image, disposition));
    }

    (records, summary)
}
