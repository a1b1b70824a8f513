use super::EraserConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_STATE_DIR: &str = "ERASER_STATE_DIR";
pub const ENV_DEADLINE: &str = "ERASER_DEADLINE";
pub const ENV_FAILURE_TOLERANCE: &str = "ERASER_FAILURE_TOLERANCE";
pub const ENV_KUBECONFIG: &str = "ERASER_KUBECONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {source}")]
    Parse {
        path: Option<PathBuf>,
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Invalid value '{value}' in environment variable {var}")]
    Env { var: String, value: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Load configuration from an optional file, then apply environment overrides
pub async fn load(path: Option<&Path>) -> Result<EraserConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content =
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
            debug!("Loaded config from {}", path.display());
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            })?
        }
        None => EraserConfig::default(),
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration from YAML text without touching the environment
pub fn load_from_str(content: &str) -> Result<EraserConfig, ConfigError> {
    let config: EraserConfig =
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse { path: None, source })?;
    config.validate()?;
    Ok(config)
}

/// Apply `ERASER_*` overrides read through `lookup`
pub fn apply_env_overrides<F>(config: &mut EraserConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup(ENV_STATE_DIR) {
        config.storage.state_dir = PathBuf::from(dir);
    }

    if let Some(value) = lookup(ENV_DEADLINE) {
        config.controller.deadline = parse_duration(ENV_DEADLINE, &value)?;
    }

    if let Some(value) = lookup(ENV_FAILURE_TOLERANCE) {
        config.controller.failure_tolerance =
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_FAILURE_TOLERANCE.to_string(),
                value: value.clone(),
            })?;
    }

    if let Some(path) = lookup(ENV_KUBECONFIG) {
        config.cluster.kubeconfig = Some(PathBuf::from(path));
    }

    Ok(())
}

fn parse_duration(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value.trim()).map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterSource, UnreachableNodePolicy};
    use std::collections::HashMap;

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
controller:
  failure_tolerance: 1
  deadline: 2m
  retention: 30m
  poll_interval: 1s
  unreachable_node_policy: failed
  nodes:
    include_control_plane: true
runtime:
  exec: ["docker", "exec", "{node}"]
  call_timeout: 10s
exclusions:
  images: ["registry.k8s.io/*"]
cluster:
  source: static
  nodes:
    - name: kind-worker
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.controller.failure_tolerance, 1);
        assert_eq!(config.controller.deadline, Duration::from_secs(120));
        assert_eq!(
            config.controller.unreachable_node_policy,
            UnreachableNodePolicy::Failed
        );
        assert!(config.controller.nodes.include_control_plane);
        assert_eq!(config.runtime.exec, vec!["docker", "exec", "{node}"]);
        assert_eq!(config.runtime.call_timeout, Duration::from_secs(10));
        assert_eq!(config.cluster.source, ClusterSource::Static);
        assert_eq!(config.cluster.nodes[0].name, "kind-worker");
        // untouched sections keep their defaults
        assert_eq!(config.controller.max_attempts, 3);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = load_from_str("{}").unwrap();
        assert_eq!(config.controller.deadline, Duration::from_secs(600));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_STATE_DIR, "/tmp/eraser-state"),
            (ENV_DEADLINE, "90s"),
            (ENV_FAILURE_TOLERANCE, "2"),
        ]
        .into_iter()
        .collect();

        let mut config = EraserConfig::default();
        apply_env_overrides(&mut config, |var| env.get(var).map(|v| v.to_string())).unwrap();

        assert_eq!(config.storage.state_dir, PathBuf::from("/tmp/eraser-state"));
        assert_eq!(config.controller.deadline, Duration::from_secs(90));
        assert_eq!(config.controller.failure_tolerance, 2);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = EraserConfig::default();
        let err = apply_env_overrides(&mut config, |var| {
            (var == ENV_FAILURE_TOLERANCE).then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load(Some(Path::new("/nonexistent/eraser.yaml")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
