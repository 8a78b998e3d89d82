//! Process launching
//!
//! Children write stdout and stderr to the same pipe so the log keeps the
//! order in which the tool emitted them. Each child leads its own process
//! group; signals go to the group so helpers it forks die with it.

use crate::error::{Result, RunnerError};
use crate::types::RunId;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Exit code reported when the child could not be waited on
pub const UNKNOWN_EXIT: i32 = -1;

/// What to run for one launch
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub run_id: RunId,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(run_id: RunId, program: impl Into<String>) -> Self {
        Self {
            run_id,
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
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
}

/// Spawns child processes with merged output
#[derive(Debug, Clone, Default)]
pub struct Launcher;

impl Launcher {
    pub fn new() -> Self {
        Self
    }

    /// Spawn the process described by `spec`.
    ///
    /// Must be called from within a tokio runtime: a reaper task is started
    /// to collect the exit status.
    pub fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| RunnerError::ProcessSpawn(format!("pipe: {}", e)))?;
        let stderr_end = write_end
            .try_clone()
            .map_err(|e| RunnerError::ProcessSpawn(format!("pipe: {}", e)))?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end))
            .env("PYTHONUNBUFFERED", "1")
            .env("PLAY_ID", spec.run_id.as_str())
            .process_group(0)
            .kill_on_drop(false);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let spawned = cmd.spawn();
        // Drop our copies of the write end so EOF arrives when the child exits.
        drop(cmd);

        let mut child = spawned
            .map_err(|e| RunnerError::ProcessSpawn(format!("{}: {}", spec.program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| RunnerError::ProcessSpawn("failed to get process ID".to_string()))?;

        let output = pipe::Receiver::from_owned_fd(read_end)
            .map_err(|e| RunnerError::ProcessSpawn(format!("pipe: {}", e)))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let run_id = spec.run_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    error!(run_id = %run_id, pid, error = %e, "Failed to wait on child");
                    UNKNOWN_EXIT
                }
            };
            debug!(run_id = %run_id, pid, code, "Child exited");
            let _ = exit_tx.send(Some(code));
        });

        info!(
            run_id = %spec.run_id,
            pid,
            program = %spec.program,
            "Spawned process"
        );

        Ok(ProcessHandle {
            pid,
            output: Some(output),
            exit: ExitWatch { pid, rx: exit_rx },
        })
    }
}

/// Exit code, or the negated signal number for a signalled child
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(UNKNOWN_EXIT)
}

/// A live child process
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    output: Option<pipe::Receiver>,
    exit: ExitWatch,
}

impl ProcessHandle {
    /// Take the merged output stream; `None` once taken
    pub fn take_output(&mut self) -> Option<pipe::Receiver> {
        self.output.take()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }
}

/// Observes the exit of one child process
#[derive(Debug, Clone)]
pub struct ExitWatch {
    pid: u32,
    rx: watch::Receiver<Option<i32>>,
}

impl ExitWatch {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code if the child has been reaped
    pub fn code(&self) -> Option<i32> {
        *self.rx.borrow()
    }

    /// Wait for the child to be reaped
    pub async fn wait(&self) -> i32 {
        let mut rx = self.rx.clone();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(UNKNOWN_EXIT),
            Err(_) => UNKNOWN_EXIT,
        };
        code
    }

    /// Whether the child still exists
    pub fn is_alive(&self) -> bool {
        self.code().is_none() && signal::kill(self.process_id(), None).is_ok()
    }

    /// Whether any member of the child's process group still exists.
    ///
    /// Outlives [`ExitWatch::is_alive`] when the leader has exited but a
    /// background helper it started keeps running.
    pub fn group_alive(&self) -> bool {
        !matches!(signal::killpg(self.process_id(), None), Err(Errno::ESRCH))
    }

    pub(crate) fn process_id(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }
}
