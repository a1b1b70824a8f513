//! Submission and observation of requests from outside the controller

use super::error::ControllerError;
use super::request::{CleanupRequest, RequestOptions, RequestOverrides};
use crate::config::{ControllerConfig, MAX_DEADLINE};
use crate::pipeline::ImageSelector;
use crate::storage::StatusStore;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

pub const REQUEST_ID_PREFIX: &str = "cleanup-";

pub fn new_request_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{REQUEST_ID_PREFIX}{}", &id[..8])
}

/// Create a Pending request and return its id without waiting for it
pub async fn submit(
    store: &dyn StatusStore,
    config: &ControllerConfig,
    selector: ImageSelector,
    overrides: RequestOverrides,
) -> Result<String, ControllerError> {
    let options = RequestOptions::resolve(config, &overrides);
    if options.deadline.is_zero() || options.deadline > MAX_DEADLINE {
        return Err(ControllerError::InvalidDeadline {
            deadline: options.deadline,
            max: MAX_DEADLINE,
        });
    }
    let request = CleanupRequest::new(new_request_id(), selector, options);
    store.create_request(&request).await?;

    info!(
        request = %request.id,
        selector = %request.image_selector,
        failure_tolerance = request.options.failure_tolerance,
        "Submitted cleanup request"
    );
    Ok(request.id)
}

/// Poll the store until the request is terminal
pub async fn wait_for_terminal(
    store: &dyn StatusStore,
    id: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<CleanupRequest, ControllerError> {
    let give_up = Instant::now() + timeout;
    loop {
        let request = store.get_request(id).await?;
        if request.is_terminal() {
            return Ok(request);
        }
        if Instant::now() >= give_up {
            return Err(ControllerError::WaitTimeout {
                id: id.to_string(),
                timeout,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::RequestPhase;
    use crate::storage::MemoryStore;

    #[test]
    fn test_request_id_shape() {
        let id = new_request_id();
        assert!(id.starts_with(REQUEST_ID_PREFIX));
        assert_eq!(id.len(), REQUEST_ID_PREFIX.len() + 8);
        assert_ne!(id, new_request_id());
    }

    #[tokio::test]
    async fn test_submit_returns_immediately_with_pending_request() {
        let store = MemoryStore::new();
        let id = submit(
            &store,
            &ControllerConfig::default(),
            ImageSelector::from_list(["*"]),
            RequestOverrides::default(),
        )
        .await
        .unwrap();

        let request = store.get_request(&id).await.unwrap();
        assert_eq!(request.phase, RequestPhase::Pending);
        assert!(request.image_selector.is_all());
    }

    #[tokio::test]
    async fn test_out_of_range_deadline_is_rejected() {
        let store = MemoryStore::new();
        for deadline in [Duration::ZERO, Duration::from_secs(300_000 * 365 * 86_400)] {
            let err = submit(
                &store,
                &ControllerConfig::default(),
                ImageSelector::AllUnused,
                RequestOverrides {
                    deadline: Some(deadline),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ControllerError::InvalidDeadline { .. }));
        }
        assert!(store.list_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_times_out_on_pending_request() {
        let store = MemoryStore::new();
        let id = submit(
            &store,
            &ControllerConfig::default(),
            ImageSelector::AllUnused,
            RequestOverrides::default(),
        )
        .await
        .unwrap();

        let err = wait_for_terminal(
            &store,
            &id,
            Duration::from_millis(30),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ControllerError::WaitTimeout { .. }));
    }
}
