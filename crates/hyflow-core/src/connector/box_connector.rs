//! BoxConnector -- object-safe dynamic dispatch wrapper for Connector.
//!
//! 1. Define an object-safe `ConnectorDyn` trait with boxed futures
//! 2. Blanket-impl `ConnectorDyn` for all `T: Connector`
//! 3. `BoxConnector` wraps `Box<dyn ConnectorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use hyflow_types::deployment::{LocationRef, ResourceVector};
use hyflow_types::execution::{CopyRequest, JobHandle, JobSpec, JobState};
use hyflow_types::token::DataRef;

use super::{Connector, ConnectorError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ConnectorError>> + Send + 'a>>;

/// Object-safe version of [`Connector`] with boxed futures.
pub trait ConnectorDyn: Send + Sync {
    fn name(&self) -> &str;
    fn deploy_boxed(&self) -> BoxFuture<'_, ()>;
    fn undeploy_boxed(&self) -> BoxFuture<'_, ()>;
    fn submit_boxed<'a>(&'a self, job: &'a JobSpec) -> BoxFuture<'a, JobHandle>;
    fn poll_boxed<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, JobState>;
    fn cancel_boxed<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, ()>;
    fn copy_boxed<'a>(&'a self, request: &'a CopyRequest) -> BoxFuture<'a, DataRef>;
    fn exists_boxed<'a>(&'a self, data: &'a DataRef) -> BoxFuture<'a, bool>;
    fn resource_status_boxed<'a>(
        &'a self,
        location: &'a LocationRef,
    ) -> BoxFuture<'a, Option<ResourceVector>>;
}

/// Blanket implementation: any `Connector` automatically implements `ConnectorDyn`.
impl<T: Connector> ConnectorDyn for T {
    fn name(&self) -> &str {
        Connector::name(self)
    }

    fn deploy_boxed(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.deploy())
    }

    fn undeploy_boxed(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.undeploy())
    }

    fn submit_boxed<'a>(&'a self, job: &'a JobSpec) -> BoxFuture<'a, JobHandle> {
        Box::pin(self.submit(job))
    }

    fn poll_boxed<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, JobState> {
        Box::pin(self.poll(handle))
    }

    fn cancel_boxed<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, ()> {
        Box::pin(self.cancel(handle))
    }

    fn copy_boxed<'a>(&'a self, request: &'a CopyRequest) -> BoxFuture<'a, DataRef> {
        Box::pin(self.copy(request))
    }

    fn exists_boxed<'a>(&'a self, data: &'a DataRef) -> BoxFuture<'a, bool> {
        Box::pin(self.exists(data))
    }

    fn resource_status_boxed<'a>(
        &'a self,
        location: &'a LocationRef,
    ) -> BoxFuture<'a, Option<ResourceVector>> {
        Box::pin(self.resource_status(location))
    }
}

/// Type-erased connector for runtime backend selection.
///
/// Since `Connector` uses RPITIT, it cannot be used as a trait object directly.
/// `BoxConnector` provides equivalent methods that delegate to the inner
/// `ConnectorDyn` trait object.
pub struct BoxConnector {
    inner: Box<dyn ConnectorDyn + Send + Sync>,
}

impl BoxConnector {
    /// Wrap a concrete `Connector` in a type-erased box.
    pub fn new<T: Connector + 'static>(connector: T) -> Self {
        Self {
            inner: Box::new(connector),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn deploy(&self) -> Result<(), ConnectorError> {
        self.inner.deploy_boxed().await
    }

    pub async fn undeploy(&self) -> Result<(), ConnectorError> {
        self.inner.undeploy_boxed().await
    }

    pub async fn submit(&self, job: &JobSpec) -> Result<JobHandle, ConnectorError> {
        self.inner.submit_boxed(job).await
    }

    pub async fn poll(&self, handle: &JobHandle) -> Result<JobState, ConnectorError> {
        self.inner.poll_boxed(handle).await
    }

    pub async fn cancel(&self, handle: &JobHandle) -> Result<(), ConnectorError> {
        self.inner.cancel_boxed(handle).await
    }

    pub async fn copy(&self, request: &CopyRequest) -> Result<DataRef, ConnectorError> {
        self.inner.copy_boxed(request).await
    }

    pub async fn exists(&self, data: &DataRef) -> Result<bool, ConnectorError> {
        self.inner.exists_boxed(data).await
    }

    pub async fn resource_status(
        &self,
        location: &LocationRef,
    ) -> Result<Option<ResourceVector>, ConnectorError> {
        self.inner.resource_status_boxed(location).await
    }
}

impl std::fmt::Debug for BoxConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxConnector")
            .field("name", &self.name())
            .finish()
    }
}
