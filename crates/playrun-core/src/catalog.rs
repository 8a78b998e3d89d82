//! Job catalogs
//!
//! A catalog maps a job name to the program invocation that runs it. The
//! directory catalog follows the on-disk layout of a deployment: ordinary
//! jobs are `<name>.yml` files in the jobs directory, and a fixed set of
//! static jobs lives in a directory that exists before deployment.

use crate::admission::canonical_job_name;
use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::warn;

const JOB_EXTENSION: &str = "yml";

/// How to run one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    /// Canonical job name
    pub name: String,
    pub program: String,

    /// Arguments placed before the translated options
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,

    /// Environment overrides, passed to the program unchanged
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// Whether the job is run from the pre-deployment directory
    pub static_job: bool,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: canonical_job_name(&name.into()),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            static_job: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
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

    pub fn static_job(mut self, static_job: bool) -> Self {
        self.static_job = static_job;
        self
    }
}

/// Source of runnable jobs
#[async_trait]
pub trait JobCatalog: Send + Sync {
    /// Resolve `job` to its invocation; unknown jobs are a `Launch` error
    async fn resolve(&self, job: &str) -> Result<JobDefinition>;

    /// Names of every runnable job, sorted
    async fn list(&self) -> Result<Vec<String>>;
}

/// Jobs stored as `<name>.yml` files
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    jobs_dir: PathBuf,
    pre_jobs_dir: PathBuf,
    static_jobs: BTreeSet<String>,
    program: String,
    mock_command: Option<String>,
}

impl DirectoryCatalog {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            jobs_dir: config.jobs_dir.clone(),
            pre_jobs_dir: config.pre_jobs_dir.clone(),
            static_jobs: config
                .static_jobs
                .iter()
                .map(|j| canonical_job_name(j))
                .collect(),
            program: config.program.clone(),
            mock_command: config
                .mock
                .enabled
                .then(|| config.mock.command.clone())
                .flatten(),
        }
    }

    fn is_static(&self, name: &str) -> bool {
        self.static_jobs.contains(name)
    }
}

#[async_trait]
impl JobCatalog for DirectoryCatalog {
    async fn resolve(&self, job: &str) -> Result<JobDefinition> {
        let name = canonical_job_name(job);
        let static_job = self.is_static(&name);
        let dir = if static_job {
            &self.pre_jobs_dir
        } else {
            &self.jobs_dir
        };

        let file_name = format!("{}.{}", name, JOB_EXTENSION);
        let is_file = tokio::fs::metadata(dir.join(&file_name))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(RunnerError::unknown_job(&name));
        }

        let definition = match &self.mock_command {
            Some(mock) => JobDefinition::new(&name, mock).arg(&self.program),
            None => JobDefinition::new(&name, &self.program),
        };
        Ok(definition.arg(file_name).cwd(dir).static_job(static_job))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut jobs = self.static_jobs.clone();

        match tokio::fs::read_dir(&self.jobs_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let file_name = entry.file_name();
                    let file_name = file_name.to_string_lossy();
                    if file_name.starts_with('_') {
                        continue;
                    }
                    if let Some(name) = file_name.strip_suffix(".yml") {
                        jobs.insert(name.to_string());
                    }
                }
            }
            Err(e) => warn!(
                dir = %self.jobs_dir.display(),
                error = %e,
                "Jobs directory unavailable, listing static jobs only"
            ),
        }

        Ok(jobs.into_iter().collect())
    }
}

/// In-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    jobs: HashMap<String, JobDefinition>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, definition: JobDefinition) -> Self {
        self.insert(definition);
        self
    }

    pub fn insert(&mut self, definition: JobDefinition) {
        self.jobs.insert(definition.name.clone(), definition);
    }
}

#[async_trait]
impl JobCatalog for StaticCatalog {
    async fn resolve(&self, job: &str) -> Result<JobDefinition> {
        let name = canonical_job_name(job);
        self.jobs
            .get(&name)
            .cloned()
            .ok_or_else(|| RunnerError::unknown_job(&name))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
