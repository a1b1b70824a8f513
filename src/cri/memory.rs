//! In-memory container runtime
//!
//! Holds an image store and container list per node, behaves like a real
//! runtime on removal (refuses in-use images, reports absent ones as not
//! found) and supports failure and latency injection.

use super::error::{CriError, CriResult};
use super::{Container, ContainerState, Image, ImageClient};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct NodeState {
    images: Vec<Image>,
    containers: Vec<Container>,
    listing_failure: Option<String>,
    removal_failures: HashMap<String, String>,
    latency: Duration,
    hung: bool,
}

/// A recorded `remove_image` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalCall {
    pub node: String,
    pub image: String,
}

#[derive(Clone, Default)]
pub struct InMemoryRuntime {
    nodes: Arc<Mutex<HashMap<String, NodeState>>>,
    removals: Arc<Mutex<Vec<RemovalCall>>>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: &str) {
        self.nodes()
            .entry(node.to_string())
            .or_default();
    }

    pub fn add_image(&self, node: &str, image: Image) {
        let mut nodes = self.nodes();
        nodes.entry(node.to_string()).or_default().images.push(image);
    }

    /// Add an image known only by one tag, with an id derived from the tag
    pub fn add_tagged_image(&self, node: &str, tag: &str) {
        let id = format!("sha256:{}", tag.replace(['/', ':', '.', '@'], "-"));
        self.add_image(node, Image::new(id).with_tag(tag));
    }

    pub fn add_container(&self, node: &str, container: Container) {
        let mut nodes = self.nodes();
        nodes
            .entry(node.to_string())
            .or_default()
            .containers
            .push(container);
    }

    /// Start a running container from `image_ref`
    pub fn run_container(&self, node: &str, name: &str, image_ref: &str) {
        let mut container = Container::new(format!("{node}-{name}"), image_ref, ContainerState::Running);
        container.name = name.to_string();
        self.add_container(node, container);
    }

    /// Mark every container on the node as exited
    pub fn stop_containers(&self, node: &str) {
        if let Some(state) = self.nodes().get_mut(node) {
            for container in &mut state.containers {
                container.state = ContainerState::Exited;
            }
        }
    }

    pub fn fail_listing(&self, node: &str, message: &str) {
        let mut nodes = self.nodes();
        nodes.entry(node.to_string()).or_default().listing_failure = Some(message.to_string());
    }

    pub fn clear_listing_failure(&self, node: &str) {
        if let Some(state) = self.nodes().get_mut(node) {
            state.listing_failure = None;
        }
    }

    /// Make removal of `image` (any alias) fail with `message`
    pub fn fail_removal(&self, node: &str, image: &str, message: &str) {
        let mut nodes = self.nodes();
        nodes
            .entry(node.to_string())
            .or_default()
            .removal_failures
            .insert(super::reference::normalize(image), message.to_string());
    }

    /// Delay every call against the node
    pub fn set_latency(&self, node: &str, latency: Duration) {
        let mut nodes = self.nodes();
        nodes.entry(node.to_string()).or_default().latency = latency;
    }

    /// Make every call against the node block forever
    pub fn hang(&self, node: &str) {
        let mut nodes = self.nodes();
        nodes.entry(node.to_string()).or_default().hung = true;
    }

    pub fn images(&self, node: &str) -> Vec<Image> {
        self.nodes()
            .get(node)
            .map(|s| s.images.clone())
            .unwrap_or_default()
    }

    pub fn has_image(&self, node: &str, reference: &str) -> bool {
        self.images(node).iter().any(|i| i.matches(reference))
    }

    pub fn removal_calls(&self) -> Vec<RemovalCall> {
        self.removals().clone()
    }

    pub fn removal_calls_for(&self, node: &str) -> Vec<String> {
        self.removal_calls()
            .into_iter()
            .filter(|c| c.node == node)
            .map(|c| c.image)
            .collect()
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<String, NodeState>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn removals(&self) -> MutexGuard<'_, Vec<RemovalCall>> {
        self.removals.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self, node: &str) -> CriResult<()> {
        let (latency, hung) = {
            let nodes = self.nodes();
            let state = nodes.get(node).ok_or_else(|| CriError::Unavailable {
                node: node.to_string(),
                message: "node unknown to runtime".to_string(),
            })?;
            (state.latency, state.hung)
        };

        if hung {
            std::future::pending::<()>().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn with_node<T>(
        &self,
        node: &str,
        f: impl FnOnce(&mut NodeState) -> CriResult<T>,
    ) -> CriResult<T> {
        let mut nodes = self.nodes();
        let state = nodes.get_mut(node).ok_or_else(|| CriError::Unavailable {
            node: node.to_string(),
            message: "node unknown to runtime".to_string(),
        })?;
        f(state)
    }
}

#[async_trait]
impl ImageClient for InMemoryRuntime {
    async fn list_images(&self, node: &str) -> CriResult<Vec<Image>> {
        self.delay(node).await?;
        self.with_node(node, |state| match &state.listing_failure {
            Some(message) => Err(CriError::Unavailable {
                node: node.to_string(),
                message: message.clone(),
            }),
            None => Ok(state.images.clone()),
        })
    }

    async fn list_containers(&self, node: &str) -> CriResult<Vec<Container>> {
        self.delay(node).await?;
        self.with_node(node, |state| match &state.listing_failure {
            Some(message) => Err(CriError::Unavailable {
                node: node.to_string(),
                message: message.clone(),
            }),
            None => Ok(state.containers.clone()),
        })
    }

    async fn remove_image(&self, node: &str, image: &str) -> CriResult<()> {
        self.delay(node).await?;
        self.removals().push(RemovalCall {
            node: node.to_string(),
            image: image.to_string(),
        });

        self.with_node(node, |state| {
            let index = state
                .images
                .iter()
                .position(|i| i.matches(image))
                .ok_or_else(|| CriError::NotFound(image.to_string()))?;

            let aliases = state.images[index].aliases();
            if let Some(message) = aliases
                .iter()
                .find_map(|alias| state.removal_failures.get(alias))
            {
                return Err(CriError::Runtime {
                    node: node.to_string(),
                    message: message.clone(),
                });
            }

            let in_use = state.containers.iter().any(|c| {
                c.state.pins_image()
                    && c.image_references()
                        .any(|r| aliases.contains(&super::reference::normalize(r)))
            });
            if in_use {
                return Err(CriError::InUse {
                    image: image.to_string(),
                    message: "image is being used by a container".to_string(),
                });
            }

            state.images.remove(index);
            Ok(())
        })
    }
}
