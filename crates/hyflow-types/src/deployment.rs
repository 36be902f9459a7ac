//! Deployments, locations and resource vectors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;

/// Deployment name reserved for the orchestrator's own staging area.
pub const CONTROL_DEPLOYMENT: &str = "@control";

/// Fully qualified address of a location: `<deployment>/<location>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationRef {
    pub deployment: String,
    pub name: String,
}

impl LocationRef {
    pub fn new(deployment: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            name: name.into(),
        }
    }

    /// The local control point that staged copies pass through.
    pub fn control_point() -> Self {
        Self::new(CONTROL_DEPLOYMENT, "local")
    }

    pub fn is_control_point(&self) -> bool {
        self.deployment == CONTROL_DEPLOYMENT
    }
}

impl fmt::Display for LocationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.deployment, self.name)
    }
}

impl FromStr for LocationRef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((deployment, name)) if !deployment.is_empty() && !name.is_empty() => {
                Ok(Self::new(deployment, name))
            }
            _ => Err(ParseError::InvalidLocation(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceVector
// ---------------------------------------------------------------------------

const EPSILON: f64 = 1e-9;

/// Multi-dimensional resource amount: cores, memory and named custom resources.
///
/// Used both for step requirements and for location capacity. A requirement
/// fits an availability only if every component fits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub cores: f64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, f64>,
}

impl ResourceVector {
    pub fn new(cores: f64, memory_mb: u64) -> Self {
        Self {
            cores,
            memory_mb,
            custom: BTreeMap::new(),
        }
    }

    pub fn with_custom(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.custom.insert(name.into(), amount);
        self
    }

    /// Component-wise `self <= available`.
    pub fn fits_within(&self, available: &ResourceVector) -> bool {
        if self.cores > available.cores + EPSILON || self.memory_mb > available.memory_mb {
            return false;
        }
        self.custom.iter().all(|(name, amount)| {
            *amount <= available.custom.get(name).copied().unwrap_or(0.0) + EPSILON
        })
    }

    pub fn add(&mut self, other: &ResourceVector) {
        self.cores += other.cores;
        self.memory_mb = self.memory_mb.saturating_add(other.memory_mb);
        for (name, amount) in &other.custom {
            *self.custom.entry(name.clone()).or_insert(0.0) += amount;
        }
    }

    /// Component-wise subtraction, clamped at zero.
    pub fn subtract(&mut self, other: &ResourceVector) {
        self.cores = (self.cores - other.cores).max(0.0);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
        for (name, amount) in &other.custom {
            if let Some(current) = self.custom.get_mut(name) {
                *current = (*current - amount).max(0.0);
            }
        }
    }

    /// `self - used`, clamped at zero.
    pub fn remaining(&self, used: &ResourceVector) -> ResourceVector {
        let mut out = self.clone();
        out.subtract(used);
        out
    }
}

// ---------------------------------------------------------------------------
// Deployment configuration
// ---------------------------------------------------------------------------

/// One location inside a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub name: String,
    #[serde(default)]
    pub capacity: ResourceVector,
}

/// A named execution environment driven by one connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,
    /// Connector kind, e.g. `local`.
    pub connector: String,
    /// Connector-specific settings.
    #[serde(default)]
    pub config: Value,
    pub locations: Vec<LocationConfig>,
}

impl DeploymentConfig {
    pub fn location_refs(&self) -> impl Iterator<Item = (LocationRef, &ResourceVector)> + '_ {
        self.locations
            .iter()
            .map(|l| (LocationRef::new(&self.name, &l.name), &l.capacity))
    }
}

/// Top-level deployments document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentsFile {
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_ref_parse_and_display() {
        let loc: LocationRef = "hpc/node-1".parse().unwrap();
        assert_eq!(loc.deployment, "hpc");
        assert_eq!(loc.name, "node-1");
        assert_eq!(loc.to_string(), "hpc/node-1");
        assert!("hpc".parse::<LocationRef>().is_err());
        assert!("/x".parse::<LocationRef>().is_err());
    }

    #[test]
    fn control_point_is_reserved() {
        assert!(LocationRef::control_point().is_control_point());
        assert!(!LocationRef::new("local", "a").is_control_point());
    }

    #[test]
    fn fits_checks_every_component() {
        let available = ResourceVector::new(4.0, 8192).with_custom("gpu", 1.0);
        assert!(ResourceVector::new(4.0, 8192).fits_within(&available));
        assert!(!ResourceVector::new(4.5, 1).fits_within(&available));
        assert!(!ResourceVector::new(1.0, 9000).fits_within(&available));
        assert!(ResourceVector::new(1.0, 1).with_custom("gpu", 1.0).fits_within(&available));
        assert!(!ResourceVector::new(1.0, 1).with_custom("gpu", 2.0).fits_within(&available));
        assert!(!ResourceVector::new(0.0, 0).with_custom("fpga", 1.0).fits_within(&available));
    }

    #[test]
    fn add_and_subtract_round_trip() {
        let mut used = ResourceVector::default();
        let req = ResourceVector::new(1.5, 512).with_custom("gpu", 1.0);
        used.add(&req);
        used.add(&req);
        assert!((used.cores - 3.0).abs() < f64::EPSILON);
        assert_eq!(used.memory_mb, 1024);
        used.subtract(&req);
        used.subtract(&req);
        used.subtract(&req);
        assert_eq!(used.cores, 0.0);
        assert_eq!(used.memory_mb, 0);
        assert_eq!(used.custom["gpu"], 0.0);
    }

    #[test]
    fn deployments_file_from_yaml() {
        let yaml = r#"
deployments:
  - name: hpc
    connector: local
    locations:
      - name: n1
        capacity: { cores: 8, memory_mb: 16384, custom: { gpu: 2 } }
      - name: n2
"#;
        let file: DeploymentsFile = serde_yaml_ng::from_str(yaml).unwrap();
        let dep = &file.deployments[0];
        assert_eq!(dep.locations.len(), 2);
        assert_eq!(dep.locations[0].capacity.custom["gpu"], 2.0);
        assert_eq!(dep.locations[1].capacity, ResourceVector::default());
        let refs: Vec<_> = dep.location_refs().map(|(l, _)| l.to_string()).collect();
        assert_eq!(refs, vec!["hpc/n1", "hpc/n2"]);
    }
}
