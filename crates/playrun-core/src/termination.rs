//! Signal-escalation termination
//!
//! A kill interrupts the whole process group first so the tool can clean
//! up, then falls back to SIGKILL. Liveness is polled at a fixed interval
//! with a bounded number of attempts per phase.

use crate::config::TerminationConfig;
use crate::error::{Result, RunnerError};
use crate::launcher::ExitWatch;
use crate::registry::RunRegistry;
use crate::types::RunId;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a kill request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillOutcome {
    pub run_id: RunId,

    /// False when the process survived both signals
    pub terminated: bool,

    /// Whether SIGKILL was needed
    pub escalated: bool,
}

/// Kills active runs
pub struct TerminationController {
    config: TerminationConfig,
    registry: Arc<RunRegistry>,
}

impl TerminationController {
    pub fn new(config: TerminationConfig, registry: Arc<RunRegistry>) -> Self {
        Self { config, registry }
    }

    /// Terminate the active run for `id`
    pub async fn kill(&self, id: &RunId) -> Result<KillOutcome> {
        let (Some(exit), Some(step)) = (self.registry.exit_watch(id), self.registry.active_step(id))
        else {
            // Fails with NotFound for an unknown id
            self.registry.get(id).await?;
            return Err(RunnerError::Gone(id.clone()));
        };
        if !exit.group_alive() {
            return Err(RunnerError::Gone(id.clone()));
        }

        self.registry.mark_killed(id).await?;
        info!(run_id = %id, pid = exit.pid(), "Interrupting run");

        let mut escalated = false;
        self.signal(id, &exit, Signal::SIGINT)?;
        let mut dead = self.wait_dead(&exit, self.config.interrupt_attempts).await;

        if !dead {
            warn!(run_id = %id, pid = exit.pid(), "Process group survived SIGINT, sending SIGKILL");
            escalated = true;
            self.signal(id, &exit, Signal::SIGKILL)?;
            dead = self.wait_dead(&exit, self.config.kill_attempts).await;
        }

        if !dead {
            warn!(run_id = %id, pid = exit.pid(), "Run survived SIGKILL");
            return Ok(KillOutcome {
                run_id: id.clone(),
                terminated: false,
                escalated,
            });
        }

        self.await_finalize(id, step, &exit).await?;
        Ok(KillOutcome {
            run_id: id.clone(),
            terminated: true,
            escalated,
        })
    }

    fn signal(&self, id: &RunId, exit: &ExitWatch, signal: Signal) -> Result<()> {
        match killpg(exit.process_id(), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(RunnerError::Termination(format!(
                "{} to run {} (pid {}): {}",
                signal,
                id,
                exit.pid(),
                e
            ))),
        }
    }

    /// Poll until every member of the run's process group is gone
    async fn wait_dead(&self, exit: &ExitWatch, attempts: u32) -> bool {
        for _ in 0..attempts {
            if !exit.group_alive() {
                return true;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
        !exit.group_alive()
    }

    /// Give the relay a bounded time to finalize, then finalize here
    async fn await_finalize(&self, id: &RunId, step: u32, exit: &ExitWatch) -> Result<()> {
        let attempts = self.config.interrupt_attempts.max(1);
        for _ in 0..attempts {
            if self.registry.active_step(id) != Some(step) {
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
        if self.registry.active_step(id) != Some(step) {
            return Ok(());
        }

        warn!(run_id = %id, "Relay has not finalized killed run, finalizing");
        let size = self.registry.log_size(id);
        self.registry.finalize(id, exit.code(), size).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LaunchSpec, Launcher};
    use crate::types::{now_millis, Run};

    fn fast() -> TerminationConfig {
        TerminationConfig {
            poll_interval_ms: 50,
            interrupt_attempts: 10,
            kill_attempts: 10,
        }
    }

    async fn start(registry: &RunRegistry, id: &str, script: &str) -> ExitWatch {
        let spec = LaunchSpec::new(RunId::new(id), "sh").args(["-c", script]);
        let handle = Launcher::new().spawn(&spec).unwrap();
        let exit = handle.exit_watch();
        registry
            .create(
                Run {
                    id: RunId::new(id),
                    step: 0,
                    start_time: now_millis(),
                    command_string: script.to_string(),
                    pid: handle.pid,
                    job_name: "site".to_string(),
                    killed: false,
                    end_time: None,
                    exit_code: None,
                    log_size_bytes: None,
                },
                exit.clone(),
            )
            .await
            .unwrap();
        exit
    }

    #[tokio::test]
    async fn test_kill_interruptible_run() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RunRegistry::open(dir.path()).unwrap());
        let controller = TerminationController::new(fast(), registry.clone());
        let exit = start(&registry, "1", "sleep 30").await;

        let outcome = controller.kill(&RunId::new("1")).await.unwrap();
        assert!(outcome.terminated);
        assert!(!outcome.escalated);
        assert!(!exit.is_alive());

        // No relay in this test, so the termination path finalizes
        let run = registry.get(&RunId::new("1")).await.unwrap();
        assert!(run.killed);
        assert!(run.end_time.is_some());
    }

    #[tokio::test]
    async fn test_kill_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RunRegistry::open(dir.path()).unwrap());
        let controller = TerminationController::new(fast(), registry.clone());
        start(&registry, "2", "trap '' INT; sleep 30").await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let outcome = controller.kill(&RunId::new("2")).await.unwrap();
        assert!(outcome.terminated);
        assert!(outcome.escalated);
    }

    #[tokio::test]
    async fn test_kill_escalates_while_group_member_survives() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RunRegistry::open(dir.path()).unwrap());
        let controller = TerminationController::new(fast(), registry.clone());
        // The background sleep ignores SIGINT, the waiting shell does not
        let exit = start(&registry, "4", "sleep 30 & wait").await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let outcome = controller.kill(&RunId::new("4")).await.unwrap();
        assert!(outcome.terminated);
        assert!(outcome.escalated);
        assert!(!exit.group_alive());
        assert!(registry.get(&RunId::new("4")).await.unwrap().end_time.is_some());
    }

    #[tokio::test]
    async fn test_kill_unknown_and_finished() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RunRegistry::open(dir.path()).unwrap());
        let controller = TerminationController::new(fast(), registry.clone());

        assert!(matches!(
            controller.kill(&RunId::new("404")).await,
            Err(RunnerError::NotFound(_))
        ));

        let exit = start(&registry, "3", "true").await;
        exit.wait().await;
        registry.finalize(&RunId::new("3"), exit.code(), 0).await.unwrap();

        assert!(matches!(
            controller.kill(&RunId::new("3")).await,
            Err(RunnerError::Gone(_))
        ));
    }
}
