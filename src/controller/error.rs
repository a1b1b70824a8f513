use super::cluster::ClusterError;
use super::state_machine::StateError;
use crate::storage::StoreError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("deadline {deadline:?} must be greater than zero and at most {max:?}")]
    InvalidDeadline { deadline: Duration, max: Duration },

    #[error("request {id} did not reach a terminal phase within {timeout:?}")]
    WaitTimeout { id: String, timeout: Duration },
}
