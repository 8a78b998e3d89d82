//! Lifecycle event log
//!
//! Each run id keeps a JSON array of milestones (`job-start`, `job-stop`,
//! and anything posted by external listeners) at `<log_dir>/<id>.events`.
//! Late joiners only need the latest state of each job, so replays are
//! compacted first.

use crate::error::Result;
use crate::registry::write_atomic;
use crate::types::{now_millis, RunId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

/// Event recorded when a job's process is spawned
pub const JOB_START: &str = "job-start";

/// Event recorded when a job's process has exited
pub const JOB_STOP: &str = "job-stop";

/// One lifecycle milestone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event: String,
    pub job_name: String,
    pub timestamp: i64,
}

/// Keep only the last event of each job, in the order jobs first appeared
pub fn compact(events: &[EventRecord]) -> Vec<EventRecord> {
    let mut order: Vec<&str> = Vec::new();
    let mut last: HashMap<&str, &EventRecord> = HashMap::new();

    for record in events {
        if last.insert(record.job_name.as_str(), record).is_none() {
            order.push(record.job_name.as_str());
        }
    }

    order
        .into_iter()
        .filter_map(|job| last.get(job).map(|r| (*r).clone()))
        .collect()
}

/// Per-id event lists on disk
#[derive(Debug)]
pub struct EventLog {
    dir: PathBuf,
    writer: Mutex<()>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writer: Mutex::new(()),
        }
    }

    fn path(&self, id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.events", id))
    }

    /// Append an event to the list for `id`
    pub async fn record(&self, id: &RunId, event: &str, job_name: &str) -> Result<EventRecord> {
        let record = EventRecord {
            event: event.to_string(),
            job_name: job_name.to_string(),
            timestamp: now_millis(),
        };

        let _guard = self.writer.lock().await;
        let mut events = self.list(id)?;
        events.push(record.clone());
        write_atomic(&self.path(id), &serde_json::to_vec(&events)?)?;

        debug!(run_id = %id, event, job = job_name, "Recorded event");
        Ok(record)
    }

    /// Every event recorded for `id`, oldest first
    pub fn list(&self, id: &RunId) -> Result<Vec<EventRecord>> {
        let path = self.path(id);
        if !id.is_valid() || !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Events for `id` compacted for replay
    pub fn compacted(&self, id: &RunId) -> Result<Vec<EventRecord>> {
        Ok(compact(&self.list(id)?))
    }
}
