//! Connector registry for runtime lookup by deployment name.

use std::collections::HashMap;

use super::box_connector::BoxConnector;
use super::ConnectorError;

/// Registry of deployment connectors, indexed by deployment name.
#[derive(Debug)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, BoxConnector>,
}

impl ConnectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Register a connector under its deployment name, replacing any
    /// existing entry.
    pub fn register(&mut self, connector: BoxConnector) {
        self.connectors.insert(connector.name().to_string(), connector);
    }

    /// Look up the connector serving a deployment.
    pub fn get(&self, deployment: &str) -> Option<&BoxConnector> {
        self.connectors.get(deployment)
    }

    /// All registered deployment names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connectors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Deploy every registered connector, stopping at the first failure.
    pub async fn deploy_all(&self) -> Result<(), ConnectorError> {
        for name in self.list_names() {
            if let Some(connector) = self.connectors.get(name) {
                connector.deploy().await?;
                tracing::debug!(deployment = name, "deployment ready");
            }
        }
        Ok(())
    }

    /// Undeploy every registered connector. Failures are logged and the
    /// remaining connectors are still torn down.
    pub async fn undeploy_all(&self) {
        for name in self.list_names() {
            if let Some(connector) = self.connectors.get(name) {
                match connector.undeploy().await {
                    Ok(()) => tracing::debug!(deployment = name, "deployment torn down"),
                    Err(e) => tracing::warn!(deployment = name, error = %e, "undeploy failed"),
                }
            }
        }
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
