//! Resource-aware placement of invocations onto locations.
//!
//! The scheduler tracks per-location capacity and usage. For a runnable
//! invocation it picks the required number of distinct locations that satisfy
//! the requirement vector and the binding policy, preferring locations that
//! already hold the invocation's input data, then the least loaded, then by
//! name. Decisions are committed once per invocation; scheduling the same
//! invocation again returns the committed binding.
//!
//! When nothing fits, the request waits with exponential backoff, woken early
//! whenever resources are released, until the retry ceiling.

mod backoff;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hyflow_types::config::SchedulerConfig;
use hyflow_types::deployment::{DeploymentConfig, LocationRef, ResourceVector};
use hyflow_types::execution::{Binding, InvocationKey};
use hyflow_types::workflow::BindingPolicy;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::connector::ConnectorRegistry;

pub use backoff::Backoff;

#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("no feasible location for {key} after {attempts} retries")]
    NoFeasibleLocation { key: InvocationKey, attempts: u32 },

    #[error("requirements of {key} exceed the capacity of every eligible location")]
    Unsatisfiable { key: InvocationKey },

    #[error("scheduling of {0} was cancelled")]
    Cancelled(InvocationKey),
}

/// What an invocation asks the scheduler for.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleRequest<'a> {
    pub key: &'a InvocationKey,
    pub requirements: &'a ResourceVector,
    pub policy: &'a BindingPolicy,
}

#[derive(Debug)]
struct LocationState {
    capacity: ResourceVector,
    used: ResourceVector,
    active: usize,
}

impl LocationState {
    fn available(&self) -> ResourceVector {
        self.capacity.remaining(&self.used)
    }

    fn load(&self) -> f64 {
        if self.capacity.cores > 0.0 {
            self.used.cores / self.capacity.cores
        } else {
            0.0
        }
    }

    fn reserve(&mut self, grant: &ResourceVector) {
        self.used.add(grant);
        self.active += 1;
    }

    fn free(&mut self, grant: &ResourceVector) {
        self.used.subtract(grant);
        self.active = self.active.saturating_sub(1);
    }
}

/// Placement state shared by every invocation of a run.
#[derive(Debug)]
pub struct Scheduler {
    locations: BTreeMap<LocationRef, Mutex<LocationState>>,
    bindings: DashMap<InvocationKey, Binding>,
    released: Notify,
    config: SchedulerConfig,
}

fn lock(state: &Mutex<LocationState>) -> MutexGuard<'_, LocationState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Scheduler {
    pub fn new(deployments: &[DeploymentConfig], config: SchedulerConfig) -> Self {
        let locations = deployments
            .iter()
            .flat_map(|d| d.location_refs())
            .map(|(location, capacity)| {
                (
                    location,
                    Mutex::new(LocationState {
                        capacity: capacity.clone(),
                        used: ResourceVector::default(),
                        active: 0,
                    }),
                )
            })
            .collect();
        Self {
            locations,
            bindings: DashMap::new(),
            released: Notify::new(),
            config,
        }
    }

    pub fn locations(&self) -> impl Iterator<Item = &LocationRef> {
        self.locations.keys()
    }

    pub fn binding(&self, key: &InvocationKey) -> Option<Binding> {
        self.bindings.get(key).map(|b| b.clone())
    }

    /// Unreserved resources at a location.
    pub fn available(&self, location: &LocationRef) -> Option<ResourceVector> {
        self.locations.get(location).map(|s| lock(s).available())
    }

    pub fn active_jobs(&self, location: &LocationRef) -> usize {
        self.locations.get(location).map(|s| lock(s).active).unwrap_or(0)
    }

    fn eligible<'a>(
        &'a self,
        policy: &'a BindingPolicy,
    ) -> impl Iterator<Item = (&'a LocationRef, &'a Mutex<LocationState>)> + 'a {
        self.locations.iter().filter(move |(loc, _)| {
            policy.deployment.as_deref().is_none_or(|d| d == loc.deployment)
                && policy.location.as_deref().is_none_or(|n| n == loc.name)
        })
    }

    /// Bind an invocation, waiting for resources if necessary.
    ///
    /// `locality` reports how many bytes of the invocation's inputs are
    /// already resident at a location.
    pub async fn schedule(
        &self,
        request: ScheduleRequest<'_>,
        locality: &(dyn Fn(&LocationRef) -> u64 + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Binding, SchedulingError> {
        let key = request.key;
        let wanted = request.policy.locations.max(1);
        let satisfiable = self
            .eligible(request.policy)
            .filter(|(_, s)| request.requirements.fits_within(&lock(s).capacity))
            .count();
        if satisfiable < wanted && self.binding(key).is_none() {
            return Err(SchedulingError::Unsatisfiable { key: key.clone() });
        }

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
            self.config.backoff_multiplier,
        );
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(binding) = self.try_bind(request, locality) {
                tracing::debug!(
                    invocation = %key,
                    locations = ?binding.locations.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
                    "invocation bound"
                );
                return Ok(binding);
            }

            if backoff.attempts() >= self.config.max_retries {
                return Err(SchedulingError::NoFeasibleLocation {
                    key: key.clone(),
                    attempts: backoff.attempts(),
                });
            }

            let delay = backoff.current();
            tracing::debug!(
                invocation = %key,
                retry = backoff.attempts() + 1,
                delay_ms = delay.as_millis() as u64,
                "no location available, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(SchedulingError::Cancelled(key.clone())),
                _ = &mut notified => {}
                _ = tokio::time::sleep(delay) => backoff.advance(),
            }
        }
    }

    /// Try to commit a binding right now. Returns the existing binding when
    /// the invocation is already bound.
    fn try_bind(
        &self,
        request: ScheduleRequest<'_>,
        locality: &(dyn Fn(&LocationRef) -> u64 + Send + Sync),
    ) -> Option<Binding> {
        if let Some(existing) = self.binding(request.key) {
            return Some(existing);
        }
        let wanted = request.policy.locations.max(1);

        let mut candidates: Vec<(u64, f64, usize, &LocationRef, &Mutex<LocationState>)> = self
            .eligible(request.policy)
            .filter_map(|(loc, state)| {
                let s = lock(state);
                request
                    .requirements
                    .fits_within(&s.available())
                    .then(|| (locality(loc), s.load(), s.active, loc, state))
            })
            .collect();
        if candidates.len() < wanted {
            return None;
        }
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(b.3))
        });

        let mut committed: Vec<(&LocationRef, &Mutex<LocationState>)> = Vec::with_capacity(wanted);
        for (_, _, _, loc, state) in candidates {
            if committed.len() == wanted {
                break;
            }
            let mut s = lock(state);
            if request.requirements.fits_within(&s.available()) {
                s.reserve(request.requirements);
                committed.push((loc, state));
            }
        }

        let rollback = |committed: &[(&LocationRef, &Mutex<LocationState>)]| {
            for (_, state) in committed {
                lock(state).free(request.requirements);
            }
        };

        if committed.len() < wanted {
            rollback(&committed);
            return None;
        }

        let binding = Binding {
            key: request.key.clone(),
            locations: committed.iter().map(|(loc, _)| (*loc).clone()).collect(),
            grant: request.requirements.clone(),
        };
        match self.bindings.entry(request.key.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get().clone();
                rollback(&committed);
                Some(existing)
            }
            Entry::Vacant(slot) => {
                slot.insert(binding.clone());
                Some(binding)
            }
        }
    }

    /// Return an invocation's resources. Releasing an unbound invocation is a
    /// no-op, so release is idempotent.
    pub fn release(&self, key: &InvocationKey) {
        let Some((_, binding)) = self.bindings.remove(key) else {
            return;
        };
        for location in &binding.locations {
            if let Some(state) = self.locations.get(location) {
                lock(state).free(&binding.grant);
            }
        }
        tracing::debug!(invocation = %key, "binding released");
        self.released.notify_waiters();
    }

    /// Re-install a binding committed before a restart. The reservation is
    /// honoured even if it exceeds current availability.
    pub fn restore(&self, binding: Binding) {
        if self.bindings.contains_key(&binding.key) {
            return;
        }
        for location in &binding.locations {
            match self.locations.get(location) {
                Some(state) => lock(state).reserve(&binding.grant),
                None => tracing::warn!(
                    invocation = %binding.key,
                    location = %location,
                    "restored binding names an unknown location"
                ),
            }
        }
        self.bindings.insert(binding.key.clone(), binding);
    }

    /// Refresh capacities from connectors that can report them. Transient
    /// failures keep the last known capacity.
    pub async fn refresh_capacity(&self, registry: &ConnectorRegistry) {
        for (location, state) in &self.locations {
            let Some(connector) = registry.get(&location.deployment) else {
                continue;
            };
            match connector.resource_status(location).await {
                Ok(Some(capacity)) => lock(state).capacity = capacity,
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    location = %location,
                    error = %e,
                    "resource status unavailable, keeping last known capacity"
                ),
            }
        }
        self.released.notify_waiters();
    }
}

/// Releases an invocation's binding when dropped.
pub struct BindingGuard {
    scheduler: Arc<Scheduler>,
    key: InvocationKey,
}

impl BindingGuard {
    pub fn new(scheduler: Arc<Scheduler>, key: InvocationKey) -> Self {
        Self { scheduler, key }
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.scheduler.release(&self.key);
    }
}
