//! Data Transfer Manager.
//!
//! Makes the data referenced by a token's payload available at a location.
//! Copies are planned by where the data lives:
//!
//! - source is the control point: one `local_to_remote` copy
//! - destination is the control point: one `remote_to_local` copy
//! - same deployment: one `remote_to_remote` copy
//! - different deployments: staged through the control point
//!
//! At most one copy per (data reference, destination) is ever in flight.
//! Concurrent requests await the same `OnceCell`, and a completed copy is
//! reused until every token carrying the reference is forgotten. Cache
//! entries are keyed by the original reference, so the items of a scattered
//! token and the list built by a gather share their parent's entries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use hyflow_types::config::TransferConfig;
use hyflow_types::deployment::LocationRef;
use hyflow_types::event::EngineEvent;
use hyflow_types::execution::{CopyKind, CopyRequest};
use hyflow_types::token::{DataRef, Payload, Token};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::connector::{ConnectorError, ConnectorRegistry};
use crate::event::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum DataTransferError {
    #[error("no connector registered for deployment '{0}'")]
    UnknownDeployment(String),

    #[error("copy of {path} to {destination} failed after {attempts} attempts: {source}")]
    CopyFailed {
        path: String,
        destination: LocationRef,
        attempts: u32,
        #[source]
        source: ConnectorError,
    },

    #[error("data {path} of token {token} is no longer available")]
    DataUnavailable { token: Uuid, path: String },

    #[error("could not verify {path}: {source}")]
    Verification {
        path: String,
        #[source]
        source: ConnectorError,
    },
}

pub struct TransferManager {
    registry: Arc<ConnectorRegistry>,
    config: TransferConfig,
    events: EventBus,
    /// Every known copy of a data reference, the original included.
    replicas: DashMap<DataRef, Vec<DataRef>>,
    inflight: DashMap<(DataRef, LocationRef), Arc<OnceCell<DataRef>>>,
    unverified: DashSet<DataRef>,
    /// Registered port tokens still carrying each reference.
    holders: DashMap<DataRef, usize>,
    copies: AtomicU64,
}

impl TransferManager {
    pub fn new(registry: Arc<ConnectorRegistry>, config: TransferConfig, events: EventBus) -> Self {
        Self {
            registry,
            config,
            events,
            replicas: DashMap::new(),
            inflight: DashMap::new(),
            unverified: DashSet::new(),
            holders: DashMap::new(),
            copies: AtomicU64::new(0),
        }
    }

    /// Track a port token's data. Tokens restored from a checkpoint are
    /// registered unverified and checked for existence on first use.
    pub fn register(&self, token: &Token, verified: bool) {
        for data in token.payload.data_refs() {
            *self.holders.entry(data.clone()).or_insert(0) += 1;
            self.replicas
                .entry(data.clone())
                .or_insert_with(|| vec![data.clone()]);
            if !verified {
                self.unverified.insert(data.clone());
            }
        }
    }

    /// Release a port token. Cache entries of a reference are dropped once no
    /// registered token carries it.
    pub fn forget(&self, token: &Token) {
        for data in token.payload.data_refs() {
            let last = match self.holders.get_mut(data) {
                Some(mut count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => true,
            };
            if !last {
                continue;
            }
            self.holders.remove(data);
            self.replicas.remove(data);
            self.inflight.retain(|(original, _), _| original != data);
            self.unverified.remove(data);
        }
    }

    /// Physical copies performed so far.
    pub fn copy_count(&self) -> u64 {
        self.copies.load(Ordering::Relaxed)
    }

    /// Bytes of the given tokens' data already present at `location`.
    pub fn resident_bytes<'a>(&self, tokens: impl IntoIterator<Item = &'a Token>, location: &LocationRef) -> u64 {
        let mut total = 0;
        for token in tokens {
            for data in token.payload.data_refs() {
                let resident = data.location == *location
                    || self
                        .replicas
                        .get(data)
                        .is_some_and(|r| r.iter().any(|d| d.location == *location));
                if resident {
                    total += data.size_bytes;
                }
            }
        }
        total
    }

    /// Make every data reference of `token` available at `location` and
    /// return the payload rewritten to the local references.
    pub async fn ensure_token(&self, token: &Token, location: &LocationRef) -> Result<Payload, DataTransferError> {
        let refs = token.payload.data_refs();
        if refs.is_empty() {
            return Ok(token.payload.clone());
        }
        let mut resolved = Vec::with_capacity(refs.len());
        for data in refs {
            resolved.push(self.ensure(token.id, data, location).await?);
        }
        Ok(token.payload.with_data_refs(&resolved))
    }

    async fn ensure(&self, token_id: Uuid, data: &DataRef, destination: &LocationRef) -> Result<DataRef, DataTransferError> {
        self.replicas
            .entry(data.clone())
            .or_insert_with(|| vec![data.clone()]);
        self.verify(token_id, data).await?;

        if data.location == *destination {
            return Ok(data.clone());
        }
        let resident = self
            .replicas
            .get(data)
            .and_then(|r| r.iter().find(|d| d.location == *destination).cloned());
        if let Some(replica) = resident {
            return Ok(replica);
        }

        let direct = data.location.is_control_point()
            || destination.is_control_point()
            || data.location.deployment == destination.deployment;
        if direct {
            let kind = copy_kind(&data.location, destination);
            return self.copy_once(token_id, data, kind, data, destination).await;
        }

        let control = LocationRef::control_point();
        let staged = self
            .copy_once(token_id, data, CopyKind::RemoteToLocal, data, &control)
            .await?;
        self.copy_once(token_id, data, CopyKind::LocalToRemote, &staged, destination)
            .await
    }

    /// Copy through the in-flight cell for `(original, destination)`.
    async fn copy_once(
        &self,
        token_id: Uuid,
        original: &DataRef,
        kind: CopyKind,
        source: &DataRef,
        destination: &LocationRef,
    ) -> Result<DataRef, DataTransferError> {
        let cell = self
            .inflight
            .entry((original.clone(), destination.clone()))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let copied = cell
            .get_or_try_init(|| self.copy_with_retry(token_id, original, kind, source, destination))
            .await?;
        Ok(copied.clone())
    }

    async fn copy_with_retry(
        &self,
        token_id: Uuid,
        original: &DataRef,
        kind: CopyKind,
        source: &DataRef,
        destination: &LocationRef,
    ) -> Result<DataRef, DataTransferError> {
        let deployment = match kind {
            CopyKind::LocalToRemote => &destination.deployment,
            CopyKind::RemoteToLocal | CopyKind::RemoteToRemote => &source.location.deployment,
        };
        let connector = self
            .registry
            .get(deployment)
            .ok_or_else(|| DataTransferError::UnknownDeployment(deployment.clone()))?;
        let request = CopyRequest {
            kind,
            source: source.clone(),
            destination: destination.clone(),
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match connector.copy(&request).await {
                Ok(copied) => {
                    self.copies.fetch_add(1, Ordering::Relaxed);
                    self.replicas
                        .entry(original.clone())
                        .or_default()
                        .push(copied.clone());
                    tracing::debug!(
                        token_id = %token_id,
                        kind = %kind,
                        source = %source.location,
                        destination = %destination,
                        bytes = source.size_bytes,
                        "data copied"
                    );
                    self.events.publish(EngineEvent::DataCopied {
                        token_id,
                        kind,
                        source: source.location.clone(),
                        destination: destination.clone(),
                        bytes: source.size_bytes,
                    });
                    return Ok(copied);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = Duration::from_millis(self.config.retry_backoff_ms)
                        .saturating_mul(1 << (attempt - 1).min(16));
                    tracing::warn!(
                        path = %source.path,
                        destination = %destination,
                        attempt,
                        error = %e,
                        "copy failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(DataTransferError::CopyFailed {
                        path: source.path.clone(),
                        destination: destination.clone(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    async fn verify(&self, token_id: Uuid, data: &DataRef) -> Result<(), DataTransferError> {
        if !self.unverified.contains(data) {
            return Ok(());
        }
        let exists = if data.location.is_control_point() {
            tokio::fs::try_exists(&data.path)
                .await
                .map_err(|e| DataTransferError::Verification {
                    path: data.path.clone(),
                    source: ConnectorError::Io(e.to_string()),
                })?
        } else {
            let connector = self
                .registry
                .get(&data.location.deployment)
                .ok_or_else(|| DataTransferError::UnknownDeployment(data.location.deployment.clone()))?;
            connector
                .exists(data)
                .await
                .map_err(|source| DataTransferError::Verification {
                    path: data.path.clone(),
                    source,
                })?
        };
        if !exists {
            return Err(DataTransferError::DataUnavailable {
                token: token_id,
                path: data.path.clone(),
            });
        }
        self.unverified.remove(data);
        tracing::debug!(token_id = %token_id, path = %data.path, "restored data verified");
        Ok(())
    }
}

fn copy_kind(source: &LocationRef, destination: &LocationRef) -> CopyKind {
    if source.is_control_point() {
        CopyKind::LocalToRemote
    } else if destination.is_control_point() {
        CopyKind::RemoteToLocal
    } else {
        CopyKind::RemoteToRemote
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("replicas", &self.replicas.len())
            .field("copies", &self.copy_count())
            .finish()
    }
}
