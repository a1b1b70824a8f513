//! Container runtime capability boundary
//!
//! The core only ever needs three runtime operations per node: list images,
//! list containers, and remove an image. [`ImageClient`] is that boundary;
//! [`CrictlClient`] drives a real runtime through `crictl` and
//! [`InMemoryRuntime`] stands in for one in tests.

pub mod crictl;
pub mod error;
pub mod memory;
pub mod reference;

pub use crictl::CrictlClient;
pub use error::{CriError, CriResult};
pub use memory::InMemoryRuntime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An image present in a node's local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    #[serde(default)]
    pub repo_digests: Vec<String>,
    #[serde(default)]
    pub size: u64,
}

impl Image {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            repo_tags: Vec::new(),
            repo_digests: Vec::new(),
            size: 0,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.repo_tags.push(tag.into());
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.repo_digests.push(digest.into());
        self
    }

    /// Every normalized reference this image is known under locally
    pub fn aliases(&self) -> BTreeSet<String> {
        std::iter::once(&self.id)
            .chain(self.repo_tags.iter())
            .chain(self.repo_digests.iter())
            .filter(|r| !r.is_empty())
            .map(|r| reference::normalize(r))
            .collect()
    }

    /// Whether `reference` names this image under any alias
    pub fn matches(&self, reference: &str) -> bool {
        self.aliases().contains(&reference::normalize(reference))
    }

    /// Human-facing name: first tag, then first digest, then the id
    pub fn display_name(&self) -> &str {
        self.repo_tags
            .first()
            .or_else(|| self.repo_digests.first())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

impl ContainerState {
    /// Parse the CRI state name (`CONTAINER_RUNNING`, ...)
    pub fn from_cri(state: &str) -> Self {
        match state {
            "CONTAINER_CREATED" => ContainerState::Created,
            "CONTAINER_RUNNING" => ContainerState::Running,
            "CONTAINER_EXITED" => ContainerState::Exited,
            _ => ContainerState::Unknown,
        }
    }

    /// Whether a container in this state pins its image
    ///
    /// Unknown counts as active so the resolver fails closed.
    pub fn pins_image(&self) -> bool {
        !matches!(self, ContainerState::Exited)
    }
}

/// A container known to a node's runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Reference the container was created from
    pub image_ref: String,
    /// Resolved image id or repo digest, when the runtime reports one
    #[serde(default)]
    pub image_id: Option<String>,
    pub state: ContainerState,
}

impl Container {
    pub fn new(id: impl Into<String>, image_ref: impl Into<String>, state: ContainerState) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            image_ref: image_ref.into(),
            image_id: None,
            state,
        }
    }

    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    /// References this container reports for its image
    pub fn image_references(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.image_ref.as_str())
            .chain(self.image_id.as_deref())
            .filter(|r| !r.is_empty())
    }
}

/// Operations the core consumes from a node's container runtime
#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Enumerate every image in the node's local store
    async fn list_images(&self, node: &str) -> CriResult<Vec<Image>>;

    /// Enumerate every container on the node, whatever its state
    async fn list_containers(&self, node: &str) -> CriResult<Vec<Container>>;

    /// Remove an image; an absent image yields [`CriError::NotFound`]
    async fn remove_image(&self, node: &str, image: &str) -> CriResult<()>;
}
