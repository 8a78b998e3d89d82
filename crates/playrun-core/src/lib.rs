//! # Playrun Core
//!
//! Execution and streaming core for an operator-facing automation runner.
//! Each run is one invocation of an external configuration tool; the core
//! tracks its lifecycle, persists its output and streams that output to any
//! number of observers, including observers that attach late.
//!
//! ## Key Components
//!
//! - [`Runner`]: facade composing every subsystem below
//! - [`LaunchRequest`]: an explicit program, argv and working directory for one launch
//! - [`AdmissionController`]: at most one active run per exclusive job
//! - [`SecretFile`]: passphrase handed to the tool by path, removed exactly once
//! - [`Launcher`]: spawns the tool with stdout and stderr merged on one pipe
//! - [`RunRegistry`]: active runs plus their durable metadata records
//! - [`OutputRelay`]: drains output into the log file and the run's room
//! - [`RoomBroker`]: per-run broadcast rooms and the join/replay protocol
//! - [`EventLog`]: compacted start/stop milestones per run id
//! - [`TerminationController`]: SIGINT, then SIGKILL, with bounded polling
//! - [`WorkflowSequencer`]: several launches sharing one run id
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use playrun_core::{DirectoryCatalog, Runner, RunnerConfig};
//!
//! # async fn example() -> playrun_core::Result<()> {
//! let config = RunnerConfig::default();
//! let catalog = Arc::new(DirectoryCatalog::from_config(&config));
//! let runner = Runner::open(config, catalog)?;
//!
//! let ticket = runner
//!     .launch("site", serde_json::json!({ "limit": "compute-0001" }), None)
//!     .await?;
//!
//! let join = runner.join(&ticket.id).await?;
//! print!("{}", join.replay);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod admission;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod options;
pub mod registry;
pub mod relay;
pub mod runner;
pub mod secret;
pub mod termination;
pub mod types;
pub mod workflow;

// Re-exports
pub use admission::{canonical_job_name, AdmissionController, Reservation};
pub use broker::{Join, RoomBroker, StreamMessage};
pub use catalog::{DirectoryCatalog, JobCatalog, JobDefinition, StaticCatalog};
pub use config::{MockConfig, RunnerConfig, TerminationConfig};
pub use error::{Result, RunnerError};
pub use events::{compact, EventLog, EventRecord, JOB_START, JOB_STOP};
pub use launcher::{ExitWatch, LaunchSpec, Launcher, ProcessHandle};
pub use options::{AnsibleOptions, OptionsTranslator, TranslatedOptions};
pub use registry::RunRegistry;
pub use relay::{OutputRelay, RelayPlan};
pub use runner::{LaunchRequest, LaunchTicket, Runner, PLAYS_LOCATION};
pub use secret::SecretFile;
pub use termination::{KillOutcome, TerminationController};
pub use types::{Run, RunFilter, RunId};
pub use workflow::{Workflow, WorkflowHandle, WorkflowSequencer, WorkflowState, WorkflowStep};
