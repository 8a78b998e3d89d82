//! Runner facade
//!
//! Composes the launch pipeline (catalog, options, admission, secrets,
//! launcher, registry, relay) with the query, kill and join operations
//! exposed to callers.

use crate::admission::{canonical_job_name, AdmissionController};
use crate::broker::{Join, RoomBroker, StreamMessage};
use crate::catalog::{JobCatalog, JobDefinition};
use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::events::{EventLog, EventRecord, JOB_START};
use crate::launcher::{LaunchSpec, Launcher};
use crate::options::{AnsibleOptions, OptionsTranslator, TranslatedOptions};
use crate::registry::RunRegistry;
use crate::relay::{OutputRelay, RelayPlan};
use crate::secret::SecretFile;
use crate::termination::{KillOutcome, TerminationController};
use crate::types::{now_millis, Run, RunFilter, RunId};
use crate::workflow::{Workflow, WorkflowHandle, WorkflowSequencer};
use nix::sys::signal::{killpg, Signal};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Path prefix under which runs are addressed
pub const PLAYS_LOCATION: &str = "/api/v2/plays";

/// Returned by a successful launch
#[derive(Debug)]
pub struct LaunchTicket {
    pub id: RunId,
    pub step: u32,

    /// Where the run's record can be fetched
    pub location: String,

    /// Resolves to the exit code once the run has been torn down
    pub completion: JoinHandle<i32>,
}

/// A launch over an already resolved invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Job name; drives admission and is recorded with the run
    pub job_name: String,
    pub program: String,
    pub args: Vec<String>,

    /// Arguments shown in the run record; `args` when absent
    pub display_args: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,

    /// Vault passphrase, handed to the tool through a secret file
    pub passphrase: Option<String>,
}

impl LaunchRequest {
    pub fn new(job_name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            job_name: canonical_job_name(&job_name.into()),
            program: program.into(),
            args: Vec::new(),
            display_args: None,
            cwd: None,
            env: Vec::new(),
            passphrase: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Combine a catalog entry with translated options
    pub fn from_job(definition: JobDefinition, options: TranslatedOptions) -> Self {
        let mut args = definition.args.clone();
        args.extend(options.args);
        let mut display_args = definition.args;
        display_args.extend(options.display_args);

        Self {
            job_name: definition.name,
            program: definition.program,
            args,
            display_args: Some(display_args),
            cwd: definition.cwd,
            env: definition.env,
            passphrase: options.passphrase,
        }
    }

    fn command_string(&self, extra: &[String]) -> String {
        let shown = self.display_args.as_ref().unwrap_or(&self.args);
        std::iter::once(&self.program)
            .chain(shown)
            .chain(extra)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Launches, tracks and streams runs
pub struct Runner {
    config: RunnerConfig,
    catalog: Arc<dyn JobCatalog>,
    translator: Arc<dyn OptionsTranslator>,
    admission: AdmissionController,
    launcher: Launcher,
    registry: Arc<RunRegistry>,
    broker: Arc<RoomBroker>,
    events: Arc<EventLog>,
    termination: TerminationController,
}

impl Runner {
    /// Open a runner over `config.log_dir`, recovering orphaned records
    pub fn open(config: RunnerConfig, catalog: Arc<dyn JobCatalog>) -> Result<Self> {
        let registry = Arc::new(RunRegistry::open(&config.log_dir)?);
        std::fs::create_dir_all(&config.secret_dir)?;

        info!(
            log_dir = %config.log_dir.display(),
            exclusive = ?config.exclusive_jobs,
            "Runner opened"
        );

        Ok(Self {
            catalog,
            translator: Arc::new(AnsibleOptions::new()),
            admission: AdmissionController::new(&config.exclusive_jobs),
            launcher: Launcher::new(),
            broker: Arc::new(RoomBroker::new(config.room_capacity)),
            events: Arc::new(EventLog::new(&config.log_dir)),
            termination: TerminationController::new(config.termination.clone(), registry.clone()),
            registry,
            config,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub(crate) fn broker(&self) -> &RoomBroker {
        &self.broker
    }

    pub(crate) fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Launch `job` with options `body`.
    ///
    /// With a `correlation_id` the launch becomes the next step of that id.
    pub async fn launch(
        &self,
        job: &str,
        body: Value,
        correlation_id: Option<RunId>,
    ) -> Result<LaunchTicket> {
        let (id, step) = self.assign(correlation_id).await?;
        self.launch_step(job, &body, id, step, false).await
    }

    async fn assign(&self, correlation_id: Option<RunId>) -> Result<(RunId, u32)> {
        match correlation_id {
            Some(id) => {
                let step = self.next_step(&id).await?;
                Ok((id, step))
            }
            None => Ok((RunId::generate(), 0)),
        }
    }

    /// Step number for the next launch under `id`
    pub(crate) async fn next_step(&self, id: &RunId) -> Result<u32> {
        if !id.is_valid() {
            return Err(RunnerError::InvalidOptions(format!("invalid run id: {}", id)));
        }
        match self.registry.get(id).await {
            Ok(run) => Ok(run.step + 1),
            Err(RunnerError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Launch a resolved invocation, bypassing the catalog and translator
    pub async fn launch_request(
        &self,
        request: LaunchRequest,
        correlation_id: Option<RunId>,
    ) -> Result<LaunchTicket> {
        let (id, step) = self.assign(correlation_id).await?;
        self.start(request, id, step, false).await
    }

    pub(crate) async fn launch_step(
        &self,
        job: &str,
        body: &Value,
        id: RunId,
        step: u32,
        keep_room_open: bool,
    ) -> Result<LaunchTicket> {
        let definition = self.catalog.resolve(job).await?;
        let options = self.translator.translate(&definition, body)?;
        self.start(LaunchRequest::from_job(definition, options), id, step, keep_room_open)
            .await
    }

    async fn start(
        &self,
        request: LaunchRequest,
        id: RunId,
        step: u32,
        keep_room_open: bool,
    ) -> Result<LaunchTicket> {
        let name = request.job_name.clone();

        if self.registry.is_active(&id) {
            return Err(RunnerError::DuplicateRun(id));
        }
        let reservation = self.admission.reserve(&name, &id)?;

        let secret = request
            .passphrase
            .as_deref()
            .map(|p| SecretFile::create(&self.config.secret_dir, p))
            .transpose()?;
        let vault_args = secret
            .as_ref()
            .map(|s| s.vault_args().to_vec())
            .unwrap_or_default();

        let mut spec = LaunchSpec::new(id.clone(), &request.program)
            .args(request.args.iter().chain(&vault_args).cloned());
        if let Some(cwd) = &request.cwd {
            spec = spec.cwd(cwd);
        }
        for (key, value) in &request.env {
            spec = spec.env(key, value);
        }
        let mut handle = self.launcher.spawn(&spec)?;
        let exit = handle.exit_watch();
        let Some(output) = handle.take_output() else {
            let _ = killpg(exit.process_id(), Signal::SIGKILL);
            return Err(RunnerError::ProcessSpawn("output stream unavailable".to_string()));
        };

        let run = Run {
            id: id.clone(),
            step,
            start_time: now_millis(),
            command_string: request.command_string(&vault_args),
            pid: handle.pid,
            job_name: name.clone(),
            killed: false,
            end_time: None,
            exit_code: None,
            log_size_bytes: None,
        };
        if let Err(e) = self.registry.create(run, exit.clone()).await {
            warn!(run_id = %id, error = %e, "Registration failed, killing orphan process");
            let _ = killpg(exit.process_id(), Signal::SIGKILL);
            return Err(e);
        }

        self.broker.open(&id);
        match self.events.record(&id, JOB_START, &name).await {
            Ok(record) => {
                self.broker.publish(&id, StreamMessage::Event(record));
            }
            Err(e) => warn!(run_id = %id, error = %e, "Failed to record start event"),
        }

        let completion = OutputRelay {
            run_id: id.clone(),
            plan: RelayPlan {
                job_name: name.clone(),
                keep_room_open,
            },
            registry: self.registry.clone(),
            broker: self.broker.clone(),
            events: self.events.clone(),
            exit,
            reservation,
            secret,
        }
        .spawn(output);

        info!(run_id = %id, step, job = %name, pid = handle.pid, "Launched run");

        Ok(LaunchTicket {
            location: format!("{}/{}", PLAYS_LOCATION, id),
            id,
            step,
            completion,
        })
    }

    /// Run several jobs in sequence under one id
    pub async fn run_workflow(
        self: &Arc<Self>,
        workflow: Workflow,
    ) -> Result<(LaunchTicket, WorkflowHandle)> {
        WorkflowSequencer::new(self.clone()).start(workflow).await
    }

    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        self.registry.list(filter).await
    }

    pub async fn get(&self, id: &RunId) -> Result<Run> {
        self.registry.get(id).await
    }

    pub async fn kill(&self, id: &RunId) -> Result<KillOutcome> {
        self.termination.kill(id).await
    }

    /// Full log of `id` as written so far
    pub async fn get_log(&self, id: &RunId) -> Result<String> {
        if !id.is_valid() {
            return Err(RunnerError::NotFound(id.clone()));
        }
        match tokio::fs::read(self.registry.log_path(id)).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A run that has not written anything yet has an empty log
                self.registry.get(id).await.map(|_| String::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every event recorded for `id`, oldest first
    pub async fn get_events(&self, id: &RunId) -> Result<Vec<EventRecord>> {
        self.registry.get(id).await?;
        self.events.list(id)
    }

    /// Record an event for `id` and forward it to the room
    pub async fn record_event(&self, id: &RunId, event: &str, job_name: &str) -> Result<EventRecord> {
        if !id.is_valid() {
            return Err(RunnerError::NotFound(id.clone()));
        }
        let record = self.events.record(id, event, job_name).await?;
        self.broker.publish(id, StreamMessage::Event(record.clone()));
        Ok(record)
    }

    /// Replay the log and compacted events of `id`, then follow it live if
    /// it is still running
    pub async fn join(&self, id: &RunId) -> Result<Join> {
        let replay = self.get_log(id).await?;
        let events = self.events.compacted(id)?;
        Ok(self.broker.attach(id, replay, events))
    }

    /// Names of every runnable job
    pub async fn list_jobs(&self) -> Result<Vec<String>> {
        self.catalog.list().await
    }
}
