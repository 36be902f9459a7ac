//! Deployment connector interface.
//!
//! A connector drives one deployment: it submits and monitors jobs and moves
//! data in and out of that deployment's locations. The engine only ever talks
//! to connectors through this trait, so new backends plug in without engine
//! changes.
//!
//! Uses RPITIT (return-position `impl Trait` in traits) for async methods;
//! [`BoxConnector`] provides the type-erased form held by the registry.

pub mod box_connector;
pub mod registry;

#[cfg(test)]
pub mod testing;

use std::future::Future;

use hyflow_types::deployment::{LocationRef, ResourceVector};
use hyflow_types::execution::{CopyRequest, JobHandle, JobSpec, JobState};
use hyflow_types::token::DataRef;

pub use box_connector::BoxConnector;
pub use registry::ConnectorRegistry;

/// Errors reported by connectors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    /// A temporary condition (network blip, busy backend); safe to retry.
    #[error("transient connector error: {0}")]
    Transient(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("deployment error: {0}")]
    Deployment(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

/// Backend driver for one deployment.
pub trait Connector: Send + Sync {
    /// Deployment name this connector serves.
    fn name(&self) -> &str;

    /// Prepare the deployment for use.
    fn deploy(&self) -> impl Future<Output = Result<(), ConnectorError>> + Send;

    /// Tear the deployment down. Must not leave jobs running.
    fn undeploy(&self) -> impl Future<Output = Result<(), ConnectorError>> + Send;

    fn submit(&self, job: &JobSpec) -> impl Future<Output = Result<JobHandle, ConnectorError>> + Send;

    /// Current state of a job. Unknown handles report [`JobState::Unknown`].
    fn poll(&self, handle: &JobHandle) -> impl Future<Output = Result<JobState, ConnectorError>> + Send;

    fn cancel(&self, handle: &JobHandle) -> impl Future<Output = Result<(), ConnectorError>> + Send;

    /// Perform one physical copy and return the reference at the destination.
    fn copy(&self, request: &CopyRequest) -> impl Future<Output = Result<DataRef, ConnectorError>> + Send;

    /// Whether referenced data still exists.
    fn exists(&self, data: &DataRef) -> impl Future<Output = Result<bool, ConnectorError>> + Send;

    /// Live capacity of a location, when the backend can report it.
    fn resource_status(
        &self,
        location: &LocationRef,
    ) -> impl Future<Output = Result<Option<ResourceVector>, ConnectorError>> + Send;
}
