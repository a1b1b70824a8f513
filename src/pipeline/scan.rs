//! Scan stage gates
//!
//! A scanner answers, per candidate image, whether removal may proceed. The
//! pipeline treats a deny, an error and a timeout the same way: the image is
//! recorded as `scan-failed` and kept.

use crate::config::ScannerConfig;
use crate::exclusion::ExclusionPatterns;
use crate::subprocess::{ExitStatus, ProcessCommandBuilder, ProcessError, ProcessRunner};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Placeholder replaced with the image reference in scanner commands
pub const IMAGE_PLACEHOLDER: &str = "{image}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Allow,
    Deny(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scanner failed for {image}: {message}")]
    Failed { image: String, message: String },

    #[error("scanner is not configured correctly: {0}")]
    Misconfigured(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[async_trait]
pub trait ImageScanner: Send + Sync {
    async fn evaluate(&self, image: &str) -> Result<ScanVerdict, ScanError>;
}

/// Denies any image matching one of a set of glob patterns
#[derive(Debug, Clone)]
pub struct PatternScanner {
    deny: ExclusionPatterns,
}

impl PatternScanner {
    pub fn new(deny: ExclusionPatterns) -> Self {
        Self { deny }
    }
}

#[async_trait]
impl ImageScanner for PatternScanner {
    async fn evaluate(&self, image: &str) -> Result<ScanVerdict, ScanError> {
        if self.deny.matches_reference(image) {
            Ok(ScanVerdict::Deny("matches scanner deny list".to_string()))
        } else {
            Ok(ScanVerdict::Allow)
        }
    }
}

/// Runs an external command per image
///
/// Exit status 0 allows removal, 1 denies it (stdout becomes the reason),
/// anything else is a scanner error.
pub struct CommandScanner {
    runner: Arc<dyn ProcessRunner>,
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandScanner {
    pub fn new(runner: Arc<dyn ProcessRunner>, argv: Vec<String>, timeout: Duration) -> Self {
        Self {
            runner,
            argv,
            timeout,
        }
    }
}

#[async_trait]
impl ImageScanner for CommandScanner {
    async fn evaluate(&self, image: &str) -> Result<ScanVerdict, ScanError> {
        let mut builder = ProcessCommandBuilder::from_template(&self.argv, IMAGE_PLACEHOLDER, image)
            .ok_or_else(|| ScanError::Misconfigured("empty scanner command".to_string()))?;
        if !self.argv.iter().any(|a| a.contains(IMAGE_PLACEHOLDER)) {
            builder = builder.arg(image);
        }
        let command = builder
            .timeout(self.timeout)
            .build();

        debug!(image, command = %command.display(), "Running scanner");
        let output = self.runner.run(command).await?;

        match output.status {
            ExitStatus::Success => Ok(ScanVerdict::Allow),
            ExitStatus::Error(1) => {
                let reason = output.stdout.trim();
                Ok(ScanVerdict::Deny(if reason.is_empty() {
                    "denied by scanner".to_string()
                } else {
                    reason.to_string()
                }))
            }
            status => Err(ScanError::Failed {
                image: image.to_string(),
                message: format!("{status}: {}", output.stderr.trim()),
            }),
        }
    }
}

/// Evaluates scanners in order; the first deny or error wins
#[derive(Default)]
pub struct ScannerChain {
    scanners: Vec<Arc<dyn ImageScanner>>,
}

impl ScannerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, scanner: Arc<dyn ImageScanner>) -> Self {
        self.scanners.push(scanner);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }

    /// Build the configured scan gate, or `None` when scanning is disabled
    pub fn from_config(
        config: &ScannerConfig,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Option<Arc<dyn ImageScanner>>, glob::PatternError> {
        let mut chain = ScannerChain::new();
        if !config.deny.is_empty() {
            let deny = ExclusionPatterns::new(&config.deny)?;
            chain = chain.with(Arc::new(PatternScanner::new(deny)));
        }
        if !config.command.is_empty() {
            chain = chain.with(Arc::new(CommandScanner::new(
                runner,
                config.command.clone(),
                config.timeout,
            )));
        }

        if chain.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Arc::new(chain)))
        }
    }
}

#[async_trait]
impl ImageScanner for ScannerChain {
    async fn evaluate(&self, image: &str) -> Result<ScanVerdict, ScanError> {
        for scanner in &self.scanners {
            if let ScanVerdict::Deny(reason) = scanner.evaluate(image).await? {
                return Ok(ScanVerdict::Deny(reason));
            }
        }
        Ok(ScanVerdict::Allow)
    }
}
