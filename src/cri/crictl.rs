//! `crictl`-backed runtime client
//!
//! Each call renders one `crictl` invocation, optionally wrapped in the
//! configured exec prefix so the same client can reach any node.

use super::error::{CriError, CriResult};
use super::{Container, ContainerState, Image, ImageClient};
use crate::config::RuntimeConfig;
use crate::subprocess::{ExitStatus, ProcessCommandBuilder, ProcessError, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, trace};

const NODE_PLACEHOLDER: &str = "{node}";

/// crictl's wording for an image the runtime does not have
const IMAGE_ABSENT_MARKERS: [&str; 2] = ["no such image", "notfound desc"];

/// Failures of the exec prefix or the runtime connection
const UNREACHABLE_MARKERS: [&str; 6] = [
    "executable file not found",
    "oci runtime exec failed",
    "no such container",
    "connect:",
    "error while dialing",
    "runtime endpoint",
];

pub struct CrictlClient {
    runner: Arc<dyn ProcessRunner>,
    config: RuntimeConfig,
}

#[derive(Debug, Deserialize)]
struct ImageList {
    #[serde(default)]
    images: Option<Vec<CrictlImage>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrictlImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    repo_digests: Option<Vec<String>>,
    #[serde(default)]
    size: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ContainerList {
    #[serde(default)]
    containers: Option<Vec<CrictlContainer>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrictlContainer {
    id: String,
    #[serde(default)]
    metadata: Option<ContainerMetadata>,
    #[serde(default)]
    image: Option<ImageSpec>,
    #[serde(default)]
    image_ref: Option<String>,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct ContainerMetadata {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ImageSpec {
    #[serde(default)]
    image: String,
}

impl From<CrictlImage> for Image {
    fn from(raw: CrictlImage) -> Self {
        let size = match raw.size {
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
            Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
            _ => 0,
        };
        Image {
            id: raw.id,
            repo_tags: raw.repo_tags.unwrap_or_default(),
            repo_digests: raw.repo_digests.unwrap_or_default(),
            size,
        }
    }
}

impl From<CrictlContainer> for Container {
    fn from(raw: CrictlContainer) -> Self {
        let spec_ref = raw.image.map(|i| i.image).unwrap_or_default();
        let image_ref = raw.image_ref.filter(|r| !r.is_empty());
        // Older runtimes leave the image field empty and only report imageRef
        let (image_ref, image_id) = if spec_ref.is_empty() {
            (image_ref.clone().unwrap_or_default(), image_ref)
        } else {
            (spec_ref, image_ref)
        };
        Container {
            id: raw.id,
            name: raw.metadata.map(|m| m.name).unwrap_or_default(),
            image_ref,
            image_id,
            state: ContainerState::from_cri(&raw.state),
        }
    }
}

impl CrictlClient {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: RuntimeConfig) -> Self {
        Self { runner, config }
    }

    fn build_command(&self, node: &str, args: &[&str]) -> crate::subprocess::ProcessCommand {
        let builder = match ProcessCommandBuilder::from_template(&self.config.exec, NODE_PLACEHOLDER, node) {
            Some(builder) => builder.arg(&self.config.crictl),
            None => ProcessCommandBuilder::new(&self.config.crictl),
        };

        let builder = match &self.config.runtime_endpoint {
            Some(endpoint) => builder.args(["--runtime-endpoint", endpoint.as_str()]),
            None => builder,
        };

        builder
            .args(args)
            .timeout(self.config.call_timeout)
            .build()
    }

    async fn invoke(&self, node: &str, args: &[&str]) -> CriResult<ProcessOutput> {
        let command = self.build_command(node, args);
        trace!("node {}: {}", node, command.display());

        self.runner.run(command).await.map_err(|e| match e {
            ProcessError::Timeout(timeout) => CriError::Timeout {
                node: node.to_string(),
                timeout,
            },
            other => CriError::Process(other),
        })
    }

    fn classify_failure(node: &str, subject: &str, output: &ProcessOutput) -> CriError {
        let message = if output.stderr.trim().is_empty() {
            format!("crictl {}", output.status)
        } else {
            output.stderr.trim().to_string()
        };
        let lowered = message.to_ascii_lowercase();

        // the exec prefix or the runtime socket failed before crictl could answer
        let unreachable = matches!(output.status, ExitStatus::Error(126 | 127))
            || UNREACHABLE_MARKERS.iter().any(|m| lowered.contains(m));
        let image_absent = IMAGE_ABSENT_MARKERS.iter().any(|m| lowered.contains(m))
            || (lowered.contains("image \"") && lowered.contains("\" not found"));

        if unreachable {
            CriError::Unavailable {
                node: node.to_string(),
                message,
            }
        } else if image_absent {
            CriError::NotFound(subject.to_string())
        } else if lowered.contains("in use") || lowered.contains("being used") {
            CriError::InUse {
                image: subject.to_string(),
                message,
            }
        } else {
            CriError::Runtime {
                node: node.to_string(),
                message,
            }
        }
    }
}

#[async_trait]
impl ImageClient for CrictlClient {
    async fn list_images(&self, node: &str) -> CriResult<Vec<Image>> {
        let output = self.invoke(node, &["images", "-o", "json"]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(node, "images", &output));
        }

        let list: ImageList = serde_json::from_str(&output.stdout)
            .map_err(|e| CriError::Malformed(format!("crictl images on {node}: {e}")))?;
        let images: Vec<Image> = list
            .images
            .unwrap_or_default()
            .into_iter()
            .map(Image::from)
            .collect();

        debug!("node {}: runtime reports {} images", node, images.len());
        Ok(images)
    }

    async fn list_containers(&self, node: &str) -> CriResult<Vec<Container>> {
        let output = self.invoke(node, &["ps", "-a", "-o", "json"]).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(node, "containers", &output));
        }

        let list: ContainerList = serde_json::from_str(&output.stdout)
            .map_err(|e| CriError::Malformed(format!("crictl ps on {node}: {e}")))?;
        let containers: Vec<Container> = list
            .containers
            .unwrap_or_default()
            .into_iter()
            .map(Container::from)
            .collect();

        debug!("node {}: runtime reports {} containers", node, containers.len());
        Ok(containers)
    }

    async fn remove_image(&self, node: &str, image: &str) -> CriResult<()> {
        let output = self.invoke(node, &["rmi", image]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::classify_failure(node, image, &output))
        }
    }
}
