//! Scripted in-memory connector for engine tests.
//!
//! Jobs "run" for a scripted delay and then complete or fail according to a
//! per-step script. Every submission and copy is recorded so tests can count
//! them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyflow_types::deployment::{LocationRef, ResourceVector};
use hyflow_types::execution::{CopyRequest, JobHandle, JobSpec, JobState, ProducedArtifact};
use hyflow_types::token::{DataRef, Payload};
use serde_json::json;
use tokio::time::Instant;

use super::{Connector, ConnectorError};

type DelayFn = Arc<dyn Fn(&JobSpec) -> Duration + Send + Sync>;
type OutputFn = Arc<dyn Fn(&JobSpec) -> Vec<ProducedArtifact> + Send + Sync>;

#[derive(Clone, Default)]
struct StepScript {
    delay: Option<DelayFn>,
    /// Attempts numbered up to this value fail.
    fail_attempts: u32,
    outputs: Option<OutputFn>,
}

struct ScriptedJob {
    spec: JobSpec,
    ready_at: Instant,
    fails: bool,
    cancelled: bool,
    finished: bool,
}

#[derive(Default)]
struct Inner {
    name: String,
    deployed: AtomicBool,
    scripts: Mutex<HashMap<String, StepScript>>,
    jobs: Mutex<HashMap<String, ScriptedJob>>,
    next_job: AtomicU64,
    submitted: Mutex<Vec<JobSpec>>,
    cancelled: AtomicU32,
    copies: Mutex<Vec<CopyRequest>>,
    copy_delay: Mutex<Duration>,
    copy_failures: AtomicU32,
    poll_failures: AtomicU32,
    status_failures: AtomicU32,
    missing: Mutex<HashSet<String>>,
    capacity: Mutex<HashMap<LocationRef, ResourceVector>>,
    active: Mutex<HashMap<LocationRef, usize>>,
    max_active: Mutex<HashMap<LocationRef, usize>>,
}

/// Connector whose behaviour is scripted per step.
#[derive(Clone)]
pub struct ScriptedConnector {
    inner: Arc<Inner>,
}

impl ScriptedConnector {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                ..Inner::default()
            }),
        }
    }

    fn script(&self, step: &str, f: impl FnOnce(&mut StepScript)) {
        let mut scripts = self.inner.scripts.lock().unwrap();
        f(scripts.entry(step.to_string()).or_default());
    }

    pub fn with_delay(
        self,
        step: &str,
        delay: impl Fn(&JobSpec) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.script(step, |s| s.delay = Some(Arc::new(delay)));
        self
    }

    /// The first `attempts` attempts of every invocation of `step` fail.
    pub fn failing(self, step: &str, attempts: u32) -> Self {
        self.script(step, |s| s.fail_attempts = attempts);
        self
    }

    pub fn with_outputs(
        self,
        step: &str,
        outputs: impl Fn(&JobSpec) -> Vec<ProducedArtifact> + Send + Sync + 'static,
    ) -> Self {
        self.script(step, |s| s.outputs = Some(Arc::new(outputs)));
        self
    }

    pub fn with_capacity(self, location: LocationRef, capacity: ResourceVector) -> Self {
        self.inner.capacity.lock().unwrap().insert(location, capacity);
        self
    }

    pub fn with_copy_delay(self, delay: Duration) -> Self {
        *self.inner.copy_delay.lock().unwrap() = delay;
        self
    }

    pub fn fail_next_copies(&self, n: u32) {
        self.inner.copy_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_polls(&self, n: u32) {
        self.inner.poll_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_status(&self, n: u32) {
        self.inner.status_failures.store(n, Ordering::SeqCst);
    }

    pub fn mark_missing(&self, path: &str) {
        self.inner.missing.lock().unwrap().insert(path.to_string());
    }

    /// Forget every job, as if the backend restarted.
    pub fn lose_jobs(&self) {
        self.inner.jobs.lock().unwrap().clear();
        self.inner.active.lock().unwrap().clear();
    }

    pub fn is_deployed(&self) -> bool {
        self.inner.deployed.load(Ordering::SeqCst)
    }

    pub fn submissions(&self, step: &str) -> usize {
        self.inner
            .submitted
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.key.step == step)
            .count()
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.inner.submitted.lock().unwrap().clone()
    }

    pub fn cancellations(&self) -> u32 {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn copies(&self) -> Vec<CopyRequest> {
        self.inner.copies.lock().unwrap().clone()
    }

    /// Highest number of simultaneously active jobs seen at a location.
    pub fn max_active(&self, location: &LocationRef) -> usize {
        self.inner
            .max_active
            .lock()
            .unwrap()
            .get(location)
            .copied()
            .unwrap_or(0)
    }

    fn finish(&self, job: &mut ScriptedJob) {
        if job.finished {
            return;
        }
        job.finished = true;
        if let Some(location) = job.spec.locations.first() {
            let mut active = self.inner.active.lock().unwrap();
            if let Some(count) = active.get_mut(location) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Default outputs: one JSON value per output slot echoing the invocation.
fn echo_outputs(spec: &JobSpec) -> Vec<ProducedArtifact> {
    let inputs: serde_json::Map<String, serde_json::Value> = spec
        .inputs
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    spec.outputs
        .iter()
        .map(|slot| ProducedArtifact {
            slot: slot.clone(),
            payload: Payload::Value(json!({
                "step": spec.key.step,
                "tag": spec.tag.to_string(),
                "inputs": inputs,
            })),
        })
        .collect()
}

impl Connector for ScriptedConnector {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn deploy(&self) -> Result<(), ConnectorError> {
        self.inner.deployed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn undeploy(&self) -> Result<(), ConnectorError> {
        self.inner.deployed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn submit(&self, job: &JobSpec) -> Result<JobHandle, ConnectorError> {
        let script = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .get(&job.key.step)
            .cloned()
            .unwrap_or_default();
        let delay = script.delay.as_ref().map(|f| f(job)).unwrap_or(Duration::ZERO);
        let job_id = format!(
            "{}-{}",
            self.inner.name,
            self.inner.next_job.fetch_add(1, Ordering::SeqCst)
        );

        if let Some(location) = job.locations.first() {
            let mut active = self.inner.active.lock().unwrap();
            let count = active.entry(location.clone()).or_insert(0);
            *count += 1;
            let mut max = self.inner.max_active.lock().unwrap();
            let entry = max.entry(location.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }

        self.inner.submitted.lock().unwrap().push(job.clone());
        self.inner.jobs.lock().unwrap().insert(
            job_id.clone(),
            ScriptedJob {
                spec: job.clone(),
                ready_at: Instant::now() + delay,
                fails: job.attempt <= script.fail_attempts,
                cancelled: false,
                finished: false,
            },
        );

        Ok(JobHandle {
            deployment: self.inner.name.clone(),
            job_id,
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobState, ConnectorError> {
        let remaining = self.inner.poll_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.poll_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectorError::Transient("scripted poll failure".into()));
        }

        let mut jobs = self.inner.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&handle.job_id) else {
            return Ok(JobState::Unknown);
        };
        if job.cancelled {
            return Ok(JobState::Cancelled);
        }
        if Instant::now() < job.ready_at {
            return Ok(JobState::Running);
        }
        self.finish(job);
        if job.fails {
            return Ok(JobState::Failed {
                exit_code: Some(1),
                message: format!("scripted failure of {}", job.spec.key),
            });
        }
        let outputs = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .get(&job.spec.key.step)
            .and_then(|s| s.outputs.clone());
        let outputs = match outputs {
            Some(f) => f(&job.spec),
            None => echo_outputs(&job.spec),
        };
        Ok(JobState::Completed { outputs })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), ConnectorError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&handle.job_id) {
            job.cancelled = true;
            self.finish(job);
            self.inner.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn copy(&self, request: &CopyRequest) -> Result<DataRef, ConnectorError> {
        self.inner.copies.lock().unwrap().push(request.clone());
        let delay = *self.inner.copy_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.inner.copy_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.copy_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectorError::Transient("scripted copy failure".into()));
        }
        let file = request
            .source
            .path
            .rsplit('/')
            .next()
            .unwrap_or(&request.source.path)
            .to_string();
        Ok(DataRef {
            location: request.destination.clone(),
            path: format!(
                "/{}/{}/{}",
                request.destination.deployment, request.destination.name, file
            ),
            size_bytes: request.source.size_bytes,
        })
    }

    async fn exists(&self, data: &DataRef) -> Result<bool, ConnectorError> {
        Ok(!self.inner.missing.lock().unwrap().contains(&data.path))
    }

    async fn resource_status(
        &self,
        location: &LocationRef,
    ) -> Result<Option<ResourceVector>, ConnectorError> {
        let remaining = self.inner.status_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.status_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectorError::Transient("scripted status failure".into()));
        }
        Ok(self.inner.capacity.lock().unwrap().get(location).cloned())
    }
}
