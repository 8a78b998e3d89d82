//! Workflow sequencing
//!
//! A workflow is several jobs run one after another under a single run id,
//! so observers follow one log and one room for the whole operation. Each
//! step starts only after the previous one has been torn down with exit
//! code zero; the first failure ends the workflow.

use crate::error::{Result, RunnerError};
use crate::relay::announce;
use crate::runner::{LaunchTicket, Runner};
use crate::types::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One job in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub job_name: String,

    /// Options passed to the job, as for a single launch
    #[serde(default)]
    pub options: Value,
}

impl WorkflowStep {
    pub fn new(job_name: impl Into<String>, options: Value) -> Self {
        Self {
            job_name: job_name.into(),
            options,
        }
    }
}

/// Jobs to run in order under one id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    /// Run id to use; generated when absent
    #[serde(default)]
    pub id: Option<RunId>,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn new(steps: Vec<WorkflowStep>) -> Self {
        Self { id: None, steps }
    }
}

/// Progress of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum WorkflowState {
    Pending,
    Running { step: usize },
    Succeeded,
    Failed { step: usize, reason: String },
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Observes a workflow started by [`WorkflowSequencer::start`]
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    pub id: RunId,
    state: watch::Receiver<WorkflowState>,
}

impl WorkflowHandle {
    pub fn state(&self) -> WorkflowState {
        self.state.borrow().clone()
    }

    /// Wait until the workflow has succeeded or failed
    pub async fn wait(&self) -> WorkflowState {
        let mut state = self.state.clone();
        let final_state = match state.wait_for(WorkflowState::is_terminal).await {
            Ok(final_state) => final_state.clone(),
            Err(_) => self.state(),
        };
        final_state
    }
}

/// Drives workflows through the runner
pub struct WorkflowSequencer {
    runner: Arc<Runner>,
}

impl WorkflowSequencer {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }

    /// Launch the first step and drive the rest in the background.
    ///
    /// A failure to launch the first step is returned directly; later
    /// failures are reported through the handle and the run's log.
    pub async fn start(&self, workflow: Workflow) -> Result<(LaunchTicket, WorkflowHandle)> {
        if workflow.steps.is_empty() {
            return Err(RunnerError::InvalidOptions(
                "workflow has no steps".to_string(),
            ));
        }

        let id = match workflow.id {
            Some(id) => id,
            None => RunId::generate(),
        };
        let base_step = self.runner.next_step(&id).await?;
        let steps = workflow.steps;
        let (state_tx, state_rx) = watch::channel(WorkflowState::Pending);

        let first = &steps[0];
        let LaunchTicket {
            step,
            location,
            completion,
            ..
        } = self
            .runner
            .launch_step(&first.job_name, &first.options, id.clone(), base_step, steps.len() > 1)
            .await?;
        let _ = state_tx.send(WorkflowState::Running { step: 0 });
        info!(run_id = %id, steps = steps.len(), "Workflow started");

        let driver = Driver {
            runner: self.runner.clone(),
            id: id.clone(),
            base_step,
            steps,
            state: state_tx,
        };
        let ticket = LaunchTicket {
            id: id.clone(),
            step,
            location,
            completion: tokio::spawn(driver.run(completion)),
        };

        Ok((
            ticket,
            WorkflowHandle {
                id,
                state: state_rx,
            },
        ))
    }
}

struct Driver {
    runner: Arc<Runner>,
    id: RunId,
    base_step: u32,
    steps: Vec<WorkflowStep>,
    state: watch::Sender<WorkflowState>,
}

impl Driver {
    /// Resolves to the exit code of the last step that ran
    async fn run(self, mut completion: JoinHandle<i32>) -> i32 {
        let last = self.steps.len() - 1;
        let mut index = 0;
        loop {
            let code = match completion.await {
                Ok(code) => code,
                Err(e) => {
                    self.fail(index, format!("relay task failed: {}", e)).await;
                    return crate::launcher::UNKNOWN_EXIT;
                }
            };
            if code != 0 {
                let reason = format!("{} exited with code {}", self.steps[index].job_name, code);
                self.fail(index, reason).await;
                return code;
            }
            if index == last {
                info!(run_id = %self.id, "Workflow succeeded");
                let _ = self.state.send(WorkflowState::Succeeded);
                return code;
            }

            index += 1;
            let step = &self.steps[index];
            match self
                .runner
                .launch_step(
                    &step.job_name,
                    &step.options,
                    self.id.clone(),
                    self.base_step + index as u32,
                    index < last,
                )
                .await
            {
                Ok(ticket) => {
                    let _ = self.state.send(WorkflowState::Running { step: index });
                    completion = ticket.completion;
                }
                Err(e) => {
                    self.fail(index, format!("{} failed to launch: {}", step.job_name, e))
                        .await;
                    return crate::launcher::UNKNOWN_EXIT;
                }
            }
        }
    }

    async fn fail(&self, step: usize, reason: String) {
        warn!(run_id = %self.id, step, reason = %reason, "Workflow failed");
        let line = format!("Workflow stopped at step {}: {}\n", step + 1, reason);
        let broker = self.runner.broker();
        announce(broker, &self.runner.registry().log_path(&self.id), &self.id, line).await;
        broker.end(&self.id);
        let _ = self.state.send(WorkflowState::Failed { step, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{JobCatalog, JobDefinition, StaticCatalog};
    use crate::config::RunnerConfig;
    use crate::types::RunFilter;

    fn shell_job(name: &str, script: &str) -> JobDefinition {
        JobDefinition::new(name, "sh").arg("-c").arg(script).arg(name)
    }

    fn runner(dir: &std::path::Path) -> Arc<Runner> {
        let catalog: Arc<dyn JobCatalog> = Arc::new(
            StaticCatalog::new()
                .with_job(shell_job("prepare", "echo preparing"))
                .with_job(shell_job("deploy", "echo deploying"))
                .with_job(shell_job("broken", "echo breaking; exit 2")),
        );
        Arc::new(Runner::open(RunnerConfig::rooted_at(dir), catalog).unwrap())
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let workflow = Workflow::new(vec![
            WorkflowStep::new("prepare", Value::Null),
            WorkflowStep::new("deploy", Value::Null),
        ]);
        let (ticket, handle) = runner.run_workflow(workflow).await.unwrap();
        assert_eq!(handle.wait().await, WorkflowState::Succeeded);
        assert_eq!(ticket.completion.await.unwrap(), 0);

        let log = runner.get_log(&ticket.id).await.unwrap();
        assert!(log.starts_with("preparing"));
        assert!(log.contains("deploying"));

        let latest = runner.get(&ticket.id).await.unwrap();
        assert_eq!(latest.step, 1);
        assert_eq!(latest.job_name, "deploy");
        assert_eq!(runner.list(&RunFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_step_stops_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let workflow = Workflow::new(vec![
            WorkflowStep::new("broken", Value::Null),
            WorkflowStep::new("deploy", Value::Null),
        ]);
        let (ticket, handle) = runner.run_workflow(workflow).await.unwrap();

        match handle.wait().await {
            WorkflowState::Failed { step, reason } => {
                assert_eq!(step, 0);
                assert!(reason.contains("code 2"));
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert_eq!(ticket.completion.await.unwrap(), 2);

        let log = runner.get_log(&ticket.id).await.unwrap();
        assert!(log.contains("Workflow stopped at step 1"));
        assert!(!log.contains("deploying"));
        assert_eq!(runner.get(&ticket.id).await.unwrap().step, 0);
    }

    #[tokio::test]
    async fn test_later_launch_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let workflow = Workflow::new(vec![
            WorkflowStep::new("prepare", Value::Null),
            WorkflowStep::new("missing", Value::Null),
        ]);
        let (ticket, handle) = runner.run_workflow(workflow).await.unwrap();

        assert!(matches!(handle.wait().await, WorkflowState::Failed { step: 1, .. }));
        ticket.completion.await.unwrap();
        let mut join = runner.join(&ticket.id).await.unwrap();
        assert!(!join.is_live());
        assert_eq!(join.next().await, Some(crate::broker::StreamMessage::End));
    }

    #[tokio::test]
    async fn test_first_step_failure_returned_directly() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());

        let err = runner
            .run_workflow(Workflow::new(vec![WorkflowStep::new("missing", Value::Null)]))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Launch(_)));

        let err = runner.run_workflow(Workflow::default()).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidOptions(_)));
    }
}
