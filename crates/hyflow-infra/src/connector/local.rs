//! Local process connector.
//!
//! Every location of a local deployment is a directory under the deployment
//! root. Jobs are host processes spawned with `tokio::process` in a per-job
//! working directory; copies are filesystem copies between location
//! directories.
//!
//! A step's `command` for this connector:
//!
//! ```yaml
//! command:
//!   program: sh
//!   args: ["-c", "wc -l < $HYFLOW_IN_READS > count.txt"]
//!   outputs:
//!     count: { file: count.txt }
//! ```
//!
//! Each input is exported as `HYFLOW_IN_<SLOT>`: strings verbatim, data
//! references as their path, anything else as JSON. Output sources are
//! `stdout` (JSON if it parses, else the trimmed text), `{file: <relative
//! path>}` or `{value: <json>}`. Slots without a declared source take stdout.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use hyflow_core::connector::{Connector, ConnectorError};
use hyflow_types::deployment::{DeploymentConfig, LocationRef, ResourceVector};
use hyflow_types::execution::{CopyRequest, JobHandle, JobSpec, JobState, ProducedArtifact};
use hyflow_types::token::{DataRef, Payload};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Directory name of the control point's staging area under the root.
const CONTROL_DIR: &str = "_control";

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Default, Deserialize)]
struct LocalSettings {
    #[serde(default)]
    root: Option<PathBuf>,
}

/// Command document understood by the local connector.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSource>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Stdout,
    File(String),
    Value(Value),
}

struct LocalJob {
    state: JobState,
    cancel: CancellationToken,
}

/// What the watcher needs to turn a finished process into artifacts.
struct Completion {
    slots: Vec<String>,
    sources: BTreeMap<String, OutputSource>,
    work_dir: PathBuf,
    location: LocationRef,
}

pub struct LocalConnector {
    name: String,
    root: PathBuf,
    capacity: HashMap<String, ResourceVector>,
    jobs: Arc<DashMap<String, LocalJob>>,
    next_job: AtomicU64,
}

impl LocalConnector {
    /// Build from a deployment entry. `config.root` overrides `default_root`.
    pub fn from_config(deployment: &DeploymentConfig, default_root: PathBuf) -> Result<Self, ConnectorError> {
        let settings: LocalSettings = if deployment.config.is_null() {
            LocalSettings::default()
        } else {
            serde_json::from_value(deployment.config.clone()).map_err(|e| {
                ConnectorError::Deployment(format!("invalid settings for deployment '{}': {e}", deployment.name))
            })?
        };
        Ok(Self {
            name: deployment.name.clone(),
            root: settings.root.unwrap_or(default_root),
            capacity: deployment
                .locations
                .iter()
                .map(|l| (l.name.clone(), l.capacity.clone()))
                .collect(),
            jobs: Arc::new(DashMap::new()),
            next_job: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing a location.
    pub fn location_dir(&self, location: &LocationRef) -> PathBuf {
        if location.is_control_point() {
            self.root.join(CONTROL_DIR)
        } else {
            self.root.join(&location.name)
        }
    }

    fn work_dir(&self, job: &JobSpec, location: &LocationRef) -> PathBuf {
        self.location_dir(location)
            .join("jobs")
            .join(job.run_id.to_string())
            .join(format!("{}-{}-{}", job.key.step, job.key.ordinal, job.attempt))
    }
}

impl Connector for LocalConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self) -> Result<(), ConnectorError> {
        let mut dirs: Vec<PathBuf> = self.capacity.keys().map(|l| self.root.join(l)).collect();
        dirs.push(self.root.join(CONTROL_DIR));
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ConnectorError::Deployment(format!("cannot create {}: {e}", dir.display())))?;
        }
        tracing::debug!(deployment = %self.name, root = %self.root.display(), "local deployment ready");
        Ok(())
    }

    async fn undeploy(&self) -> Result<(), ConnectorError> {
        for job in self.jobs.iter() {
            job.cancel.cancel();
        }
        self.jobs.clear();
        Ok(())
    }

    async fn submit(&self, job: &JobSpec) -> Result<JobHandle, ConnectorError> {
        let command: LocalCommand = serde_json::from_value(job.command.clone())
            .map_err(|e| ConnectorError::Rejected(format!("invalid command for {}: {e}", job.key)))?;
        let location = job
            .locations
            .first()
            .ok_or_else(|| ConnectorError::Rejected(format!("{} has no bound location", job.key)))?;

        let work_dir = self.work_dir(job, location);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| ConnectorError::Io(format!("cannot create {}: {e}", work_dir.display())))?;

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&work_dir)
            .env("HYFLOW_WORK_DIR", &work_dir)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (slot, payload) in &job.inputs {
            cmd.env(input_var(slot), env_value(payload));
        }
        let child = cmd
            .spawn()
            .map_err(|e| ConnectorError::Rejected(format!("failed to spawn '{}': {e}", command.program)))?;

        let job_id = format!("{}-{}", self.name, self.next_job.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        self.jobs.insert(
            job_id.clone(),
            LocalJob {
                state: JobState::Running,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(job_id = %job_id, invocation = %job.key, work_dir = %work_dir.display(), "local job spawned");

        let completion = Completion {
            slots: job.outputs.clone(),
            sources: command.outputs,
            work_dir,
            location: location.clone(),
        };
        tokio::spawn(watch(child, cancel, self.jobs.clone(), job_id.clone(), completion));

        Ok(JobHandle {
            deployment: self.name.clone(),
            job_id,
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobState, ConnectorError> {
        Ok(self
            .jobs
            .get(&handle.job_id)
            .map(|job| job.state.clone())
            .unwrap_or(JobState::Unknown))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), ConnectorError> {
        if let Some(mut job) = self.jobs.get_mut(&handle.job_id) {
            if !job.state.is_terminal() {
                job.cancel.cancel();
                job.state = JobState::Cancelled;
            }
        }
        Ok(())
    }

    async fn copy(&self, request: &CopyRequest) -> Result<DataRef, ConnectorError> {
        let source = PathBuf::from(&request.source.path);
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let staged = Uuid::new_v5(&Uuid::NAMESPACE_URL, request.source.path.as_bytes()).simple();
        let destination = self
            .location_dir(&request.destination)
            .join("staged")
            .join(format!("{staged}-{file_name}"));

        copy_path(&source, &destination).await.map_err(|e| {
            ConnectorError::Io(format!("copy {} -> {}: {e}", source.display(), destination.display()))
        })?;

        Ok(DataRef {
            location: request.destination.clone(),
            path: destination.display().to_string(),
            size_bytes: request.source.size_bytes,
        })
    }

    async fn exists(&self, data: &DataRef) -> Result<bool, ConnectorError> {
        tokio::fs::try_exists(&data.path)
            .await
            .map_err(|e| ConnectorError::Io(format!("stat {}: {e}", data.path)))
    }

    async fn resource_status(&self, location: &LocationRef) -> Result<Option<ResourceVector>, ConnectorError> {
        if location.deployment != self.name {
            return Ok(None);
        }
        Ok(self.capacity.get(&location.name).cloned())
    }
}

/// Wait for a process (or its cancellation) and record the final state.
async fn watch(
    child: tokio::process::Child,
    cancel: CancellationToken,
    jobs: Arc<DashMap<String, LocalJob>>,
    job_id: String,
    completion: Completion,
) {
    let state = tokio::select! {
        _ = cancel.cancelled() => JobState::Cancelled,
        output = child.wait_with_output() => match output {
            Ok(output) if output.status.success() => collect_outputs(&completion, &output.stdout).await,
            Ok(output) => JobState::Failed {
                exit_code: output.status.code(),
                message: stderr_tail(&output.stderr),
            },
            Err(e) => JobState::Failed {
                exit_code: None,
                message: format!("failed to wait for process: {e}"),
            },
        },
    };

    tracing::debug!(job_id = %job_id, state = ?state, "local job ended");
    if let Some(mut job) = jobs.get_mut(&job_id) {
        if !job.state.is_terminal() {
            job.state = state;
        }
    }
}

async fn collect_outputs(completion: &Completion, stdout: &[u8]) -> JobState {
    let mut outputs = Vec::with_capacity(completion.slots.len());
    for slot in &completion.slots {
        let payload = match completion.sources.get(slot).unwrap_or(&OutputSource::Stdout) {
            OutputSource::Stdout => Payload::Value(parse_stdout(stdout)),
            OutputSource::Value(value) => Payload::Value(value.clone()),
            OutputSource::File(relative) => {
                let path = completion.work_dir.join(relative);
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => Payload::Data(DataRef {
                        location: completion.location.clone(),
                        path: path.display().to_string(),
                        size_bytes: if meta.is_file() { meta.len() } else { 0 },
                    }),
                    Err(e) => {
                        return JobState::Failed {
                            exit_code: Some(0),
                            message: format!("output '{slot}' file {} not readable: {e}", path.display()),
                        };
                    }
                }
            }
        };
        outputs.push(ProducedArtifact {
            slot: slot.clone(),
            payload,
        });
    }
    JobState::Completed { outputs }
}

fn parse_stdout(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .find(|i| trimmed.len() - i <= STDERR_TAIL)
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

fn input_var(slot: &str) -> String {
    let name: String = slot
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("HYFLOW_IN_{name}")
}

fn env_value(payload: &Payload) -> String {
    match payload.to_json() {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Copy a file or a directory tree.
fn copy_path<'a>(from: &'a Path, to: &'a Path) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let meta = tokio::fs::metadata(from).await?;
        if meta.is_dir() {
            tokio::fs::create_dir_all(to).await?;
            let mut entries = tokio::fs::read_dir(from).await?;
            while let Some(entry) = entries.next_entry().await? {
                let target = to.join(entry.file_name());
                copy_path(&entry.path(), &target).await?;
            }
        } else {
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(from, to).await?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_types::deployment::LocationConfig;
    use hyflow_types::execution::{CopyKind, InvocationKey};
    use hyflow_types::token::Tag;
    use serde_json::json;
    use std::time::Duration;

    fn connector(root: &Path) -> LocalConnector {
        let deployment = DeploymentConfig {
            name: "local".into(),
            connector: "local".into(),
            config: json!({ "root": root }),
            locations: ["n1", "n2"]
                .iter()
                .map(|n| LocationConfig {
                    name: n.to_string(),
                    capacity: ResourceVector::new(2.0, 1024),
                })
                .collect(),
        };
        LocalConnector::from_config(&deployment, PathBuf::from("/unused")).unwrap()
    }

    fn job(command: Value, inputs: BTreeMap<String, Payload>, outputs: &[&str]) -> JobSpec {
        JobSpec {
            run_id: Uuid::now_v7(),
            key: InvocationKey::new("s", 0),
            tag: Tag::root(),
            attempt: 1,
            command,
            inputs,
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            locations: vec![LocationRef::new("local", "n1")],
            grant: ResourceVector::default(),
        }
    }

    async fn wait(connector: &LocalConnector, handle: &JobHandle) -> JobState {
        for _ in 0..1_000 {
            let state = connector.poll(handle).await.unwrap();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn stdout_json_becomes_a_value_output() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        c.deploy().await.unwrap();

        let spec = job(json!({"program": "sh", "args": ["-c", "echo '{\"n\": 1}'"]}), BTreeMap::new(), &["y"]);
        let handle = c.submit(&spec).await.unwrap();
        let JobState::Completed { outputs } = wait(&c, &handle).await else {
            panic!("job did not complete");
        };
        assert_eq!(outputs[0].slot, "y");
        assert_eq!(outputs[0].payload, Payload::Value(json!({"n": 1})));
    }

    #[tokio::test]
    async fn inputs_are_exported_and_file_outputs_are_data() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        c.deploy().await.unwrap();

        let inputs = BTreeMap::from([
            ("sample-name".to_string(), Payload::Value(json!("abc"))),
            ("n".to_string(), Payload::Value(json!(3))),
        ]);
        let command = json!({
            "program": "sh",
            "args": ["-c", "printf '%s:%s' \"$HYFLOW_IN_SAMPLE_NAME\" \"$HYFLOW_IN_N\" > out.txt"],
            "outputs": { "result": { "file": "out.txt" }, "flag": { "value": true } }
        });
        let handle = c.submit(&job(command, inputs, &["result", "flag"])).await.unwrap();
        let JobState::Completed { outputs } = wait(&c, &handle).await else {
            panic!("job did not complete");
        };

        let Payload::Data(data) = &outputs[0].payload else {
            panic!("expected a data output");
        };
        assert_eq!(data.location, LocationRef::new("local", "n1"));
        assert_eq!(data.size_bytes, 5);
        assert_eq!(tokio::fs::read_to_string(&data.path).await.unwrap(), "abc:3");
        assert!(data.path.starts_with(dir.path().join("n1").to_str().unwrap()));
        assert_eq!(outputs[1].payload, Payload::Value(json!(true)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        c.deploy().await.unwrap();

        let spec = job(json!({"program": "sh", "args": ["-c", "echo boom >&2; exit 3"]}), BTreeMap::new(), &[]);
        let handle = c.submit(&spec).await.unwrap();
        match wait(&c, &handle).await {
            JobState::Failed { exit_code, message } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_output_file_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        c.deploy().await.unwrap();

        let command = json!({"program": "true", "outputs": {"y": {"file": "never.txt"}}});
        let handle = c.submit(&job(command, BTreeMap::new(), &["y"])).await.unwrap();
        assert!(matches!(wait(&c, &handle).await, JobState::Failed { .. }));
    }

    #[tokio::test]
    async fn cancel_kills_a_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        c.deploy().await.unwrap();

        let spec = job(json!({"program": "sleep", "args": ["30"]}), BTreeMap::new(), &[]);
        let handle = c.submit(&spec).await.unwrap();
        assert_eq!(c.poll(&handle).await.unwrap(), JobState::Running);
        c.cancel(&handle).await.unwrap();
        assert_eq!(c.poll(&handle).await.unwrap(), JobState::Cancelled);
    }

    #[tokio::test]
    async fn bad_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        c.deploy().await.unwrap();

        let err = c.submit(&job(json!({"args": []}), BTreeMap::new(), &[])).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Rejected(_)));
        let err = c
            .submit(&job(json!({"program": "/definitely/not/here"}), BTreeMap::new(), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Rejected(_)));
    }

    #[tokio::test]
    async fn unknown_job_after_undeploy() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        c.deploy().await.unwrap();
        let handle = c
            .submit(&job(json!({"program": "sleep", "args": ["30"]}), BTreeMap::new(), &[]))
            .await
            .unwrap();
        c.undeploy().await.unwrap();
        assert_eq!(c.poll(&handle).await.unwrap(), JobState::Unknown);
    }

    #[tokio::test]
    async fn copy_between_locations_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        c.deploy().await.unwrap();

        let source_path = dir.path().join("n1").join("reads.fq");
        tokio::fs::write(&source_path, "ACGT").await.unwrap();
        let source = DataRef {
            location: LocationRef::new("local", "n1"),
            path: source_path.display().to_string(),
            size_bytes: 4,
        };
        assert!(c.exists(&source).await.unwrap());

        let request = CopyRequest {
            kind: CopyKind::RemoteToRemote,
            source: source.clone(),
            destination: LocationRef::new("local", "n2"),
        };
        let copied = c.copy(&request).await.unwrap();
        assert_eq!(copied.location, LocationRef::new("local", "n2"));
        assert!(copied.path.ends_with("reads.fq"));
        assert!(copied.path.starts_with(dir.path().join("n2").to_str().unwrap()));
        assert_eq!(tokio::fs::read_to_string(&copied.path).await.unwrap(), "ACGT");

        let staged = c
            .copy(&CopyRequest {
                kind: CopyKind::RemoteToLocal,
                source,
                destination: LocationRef::control_point(),
            })
            .await
            .unwrap();
        assert!(staged.path.starts_with(dir.path().join(CONTROL_DIR).to_str().unwrap()));

        let missing = DataRef {
            location: LocationRef::new("local", "n1"),
            path: dir.path().join("nope").display().to_string(),
            size_bytes: 0,
        };
        assert!(!c.exists(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn resource_status_reports_configured_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let c = connector(dir.path());
        let capacity = c.resource_status(&LocationRef::new("local", "n1")).await.unwrap();
        assert_eq!(capacity, Some(ResourceVector::new(2.0, 1024)));
        assert_eq!(c.resource_status(&LocationRef::new("other", "n1")).await.unwrap(), None);
    }

    #[test]
    fn input_variable_names() {
        assert_eq!(input_var("reads"), "HYFLOW_IN_READS");
        assert_eq!(input_var("sample-name.v2"), "HYFLOW_IN_SAMPLE_NAME_V2");
    }
}
