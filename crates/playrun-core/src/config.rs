//! Configuration for the runner core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Directory holding run logs, metadata records and event lists
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Directory in which vault password files are created
    #[serde(default = "default_secret_dir")]
    pub secret_dir: PathBuf,

    /// Directory of jobs that only exist once the deployment is ready
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,

    /// Directory of jobs that exist before the deployment is ready
    #[serde(default = "default_pre_jobs_dir")]
    pub pre_jobs_dir: PathBuf,

    /// Executable each job is handed to
    #[serde(default = "default_program")]
    pub program: String,

    /// Jobs resolved from `pre_jobs_dir`
    #[serde(default = "default_static_jobs")]
    pub static_jobs: Vec<String>,

    /// Jobs limited to one active run at a time
    #[serde(default = "default_exclusive_jobs")]
    pub exclusive_jobs: Vec<String>,

    /// Messages buffered per room before slow subscribers lag
    #[serde(default = "default_room_capacity")]
    pub room_capacity: usize,

    /// Kill escalation settings
    #[serde(default)]
    pub termination: TerminationConfig,

    /// Mock command settings for development
    #[serde(default)]
    pub mock: MockConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            secret_dir: default_secret_dir(),
            jobs_dir: default_jobs_dir(),
            pre_jobs_dir: default_pre_jobs_dir(),
            program: default_program(),
            static_jobs: default_static_jobs(),
            exclusive_jobs: default_exclusive_jobs(),
            room_capacity: default_room_capacity(),
            termination: TerminationConfig::default(),
            mock: MockConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Configuration rooted in a single directory, used by tests and demos
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            log_dir: root.join("logs"),
            secret_dir: root.join("secrets"),
            jobs_dir: root.join("jobs"),
            pre_jobs_dir: root.join("pre-jobs"),
            ..Default::default()
        }
    }
}

/// Kill escalation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationConfig {
    /// Delay between liveness checks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Liveness checks after SIGINT before escalating
    #[serde(default = "default_attempts")]
    pub interrupt_attempts: u32,

    /// Liveness checks after SIGKILL before giving up
    #[serde(default = "default_attempts")]
    pub kill_attempts: u32,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            interrupt_attempts: default_attempts(),
            kill_attempts: default_attempts(),
        }
    }
}

impl TerminationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Replaces the real executable with a stand-in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Executable run in place of `program`; receives the same arguments
    #[serde(default)]
    pub command: Option<String>,
}

// Default value helpers
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/playrun")
}

fn default_secret_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("scratch/ansible/next/ardana/ansible")
}

fn default_pre_jobs_dir() -> PathBuf {
    PathBuf::from("openstack/ardana/ansible")
}

fn default_program() -> String {
    "ansible-playbook".to_string()
}

fn default_static_jobs() -> Vec<String> {
    [
        "config-processor-run",
        "config-processor-clean",
        "ready-deployment",
        "dayzero-os-provision",
        "dayzero-pre-deployment",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclusive_jobs() -> Vec<String> {
    [
        "site",
        "config-processor-run",
        "config-processor-clean",
        "ready-deployment",
        "dayzero-os-provision",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_room_capacity() -> usize {
    4096
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_attempts() -> u32 {
    5
}
