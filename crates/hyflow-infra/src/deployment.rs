//! Deployments file loading and connector registry construction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hyflow_core::connector::{BoxConnector, ConnectorError, ConnectorRegistry};
use hyflow_types::deployment::{CONTROL_DEPLOYMENT, DeploymentConfig, DeploymentsFile};

use crate::connector::LocalConnector;
use crate::filesystem::deployment_root;

#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid deployments: {0}")]
    Invalid(String),

    #[error("deployment '{deployment}' uses unknown connector '{connector}'")]
    UnknownConnector { deployment: String, connector: String },

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// Load a deployments document. `.toml` files are parsed as TOML, anything
/// else as YAML (which also covers JSON).
pub async fn load_deployments(path: &Path) -> Result<Vec<DeploymentConfig>, DeploymentError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DeploymentError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let is_toml = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let file = if is_toml {
        parse_toml(&content)
    } else {
        parse_yaml(&content)
    }
    .map_err(|message| DeploymentError::Parse {
        path: path.to_path_buf(),
        message,
    })?;

    validate_deployments(&file.deployments)?;
    tracing::debug!(path = %path.display(), count = file.deployments.len(), "deployments loaded");
    Ok(file.deployments)
}

fn parse_toml(content: &str) -> Result<DeploymentsFile, String> {
    // `toml` has no native null, so connector settings go through a TOML value.
    let raw: toml::Value = toml::from_str(content).map_err(|e| e.to_string())?;
    let json = serde_json::to_value(raw).map_err(|e| e.to_string())?;
    serde_json::from_value(json).map_err(|e| e.to_string())
}

fn parse_yaml(content: &str) -> Result<DeploymentsFile, String> {
    serde_yaml_ng::from_str(content).map_err(|e| e.to_string())
}

/// Deployment names are unique, not reserved, and each has at least one
/// uniquely named location.
pub fn validate_deployments(deployments: &[DeploymentConfig]) -> Result<(), DeploymentError> {
    if deployments.is_empty() {
        return Err(DeploymentError::Invalid("no deployments configured".into()));
    }

    let mut names = HashSet::new();
    for deployment in deployments {
        if deployment.name.is_empty() || deployment.name.contains('/') {
            return Err(DeploymentError::Invalid(format!(
                "invalid deployment name '{}'",
                deployment.name
            )));
        }
        if deployment.name == CONTROL_DEPLOYMENT {
            return Err(DeploymentError::Invalid(format!(
                "deployment name '{CONTROL_DEPLOYMENT}' is reserved"
            )));
        }
        if !names.insert(deployment.name.as_str()) {
            return Err(DeploymentError::Invalid(format!(
                "duplicate deployment '{}'",
                deployment.name
            )));
        }
        if deployment.locations.is_empty() {
            return Err(DeploymentError::Invalid(format!(
                "deployment '{}' has no locations",
                deployment.name
            )));
        }

        let mut locations = HashSet::new();
        for location in &deployment.locations {
            if !locations.insert(location.name.as_str()) {
                return Err(DeploymentError::Invalid(format!(
                    "duplicate location '{}' in deployment '{}'",
                    location.name, deployment.name
                )));
            }
        }
    }
    Ok(())
}

/// Build a connector for every deployment.
pub fn build_registry(deployments: &[DeploymentConfig], data_dir: &Path) -> Result<ConnectorRegistry, DeploymentError> {
    let mut registry = ConnectorRegistry::new();
    for deployment in deployments {
        let connector = match deployment.connector.as_str() {
            "local" => {
                let root = deployment_root(data_dir, &deployment.name);
                BoxConnector::new(LocalConnector::from_config(deployment, root)?)
            }
            other => {
                return Err(DeploymentError::UnknownConnector {
                    deployment: deployment.name.clone(),
                    connector: other.to_string(),
                });
            }
        };
        registry.register(connector);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_types::deployment::{LocationConfig, ResourceVector};
    use serde_json::Value;
    use tempfile::tempdir;

    const YAML: &str = r#"
deployments:
  - name: hpc
    connector: local
    locations:
      - name: n1
        capacity: { cores: 4, memory_mb: 8192 }
      - name: n2
  - name: cloud
    connector: local
    config:
      root: /tmp/hyflow-cloud
    locations:
      - name: vm
"#;

    fn deployment(name: &str, locations: &[&str]) -> DeploymentConfig {
        DeploymentConfig {
            name: name.into(),
            connector: "local".into(),
            config: Value::Null,
            locations: locations
                .iter()
                .map(|l| LocationConfig {
                    name: l.to_string(),
                    capacity: ResourceVector::default(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn loads_yaml_deployments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deployments.yaml");
        tokio::fs::write(&path, YAML).await.unwrap();

        let deployments = load_deployments(&path).await.unwrap();
        assert_eq!(deployments.len(), 2);
        assert_eq!(deployments[0].name, "hpc");
        assert_eq!(deployments[0].locations[0].capacity, ResourceVector::new(4.0, 8192));
        assert_eq!(deployments[0].locations[1].capacity, ResourceVector::default());
        assert_eq!(deployments[1].config["root"], "/tmp/hyflow-cloud");
    }

    #[tokio::test]
    async fn loads_toml_deployments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deployments.toml");
        tokio::fs::write(
            &path,
            r#"
[[deployments]]
name = "local"
connector = "local"

[[deployments.locations]]
name = "a"
capacity = { cores = 2.0, memory_mb = 1024 }
"#,
        )
        .await
        .unwrap();

        let deployments = load_deployments(&path).await.unwrap();
        assert_eq!(deployments[0].name, "local");
        assert!(deployments[0].config.is_null());
        assert_eq!(deployments[0].locations[0].capacity, ResourceVector::new(2.0, 1024));
    }

    #[tokio::test]
    async fn missing_and_malformed_files_are_errors() {
        let dir = tempdir().unwrap();
        let err = load_deployments(&dir.path().join("nope.yaml")).await.unwrap_err();
        assert!(matches!(err, DeploymentError::Read { .. }));

        let path = dir.path().join("bad.yaml");
        tokio::fs::write(&path, "deployments: [ {name: x").await.unwrap();
        let err = load_deployments(&path).await.unwrap_err();
        assert!(matches!(err, DeploymentError::Parse { .. }));
    }

    #[test]
    fn rejects_invalid_deployments() {
        assert!(validate_deployments(&[]).is_err());
        assert!(validate_deployments(&[deployment("a", &["x"]), deployment("a", &["y"])]).is_err());
        assert!(validate_deployments(&[deployment(CONTROL_DEPLOYMENT, &["x"])]).is_err());
        assert!(validate_deployments(&[deployment("a", &[])]).is_err());
        assert!(validate_deployments(&[deployment("a", &["x", "x"])]).is_err());
        assert!(validate_deployments(&[deployment("a/b", &["x"])]).is_err());
        assert!(validate_deployments(&[deployment("a", &["x"]), deployment("b", &["x"])]).is_ok());
    }

    #[test]
    fn builds_local_connectors() {
        let dir = tempdir().unwrap();
        let registry = build_registry(&[deployment("hpc", &["n1"]), deployment("cloud", &["vm"])], dir.path()).unwrap();
        assert_eq!(registry.list_names(), vec!["cloud", "hpc"]);
    }

    #[test]
    fn unknown_connector_kind_is_rejected() {
        let dir = tempdir().unwrap();
        let mut d = deployment("hpc", &["n1"]);
        d.connector = "slurm".into();
        let err = build_registry(&[d], dir.path()).unwrap_err();
        assert!(matches!(err, DeploymentError::UnknownConnector { .. }));
    }
}
