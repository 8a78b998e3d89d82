//! Run records and identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Last id handed out by [`RunId::generate`]
static LAST_GENERATED: AtomicI64 = AtomicI64::new(0);

/// Caller-visible run identifier.
///
/// Generated ids are millisecond timestamps, bumped so that two launches in
/// the same millisecond still get distinct, increasing ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id from the current time
    pub fn generate() -> Self {
        let now = now_millis();
        let mut last = LAST_GENERATED.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match LAST_GENERATED.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Self(next.to_string()),
                Err(current) => last = current,
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is safe to use as a file name component
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RunId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Metadata record of one launch.
///
/// Written when the process is spawned, then at most twice more: when a
/// kill is requested and when the process exits. `end_time`, `exit_code`
/// and `log_size_bytes` are always written together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,

    /// Position of this launch within a workflow sharing `id`
    #[serde(default)]
    pub step: u32,

    /// Unix milliseconds
    pub start_time: i64,

    /// Command line with secrets redacted
    pub command_string: String,

    pub pid: u32,

    pub job_name: String,

    #[serde(default)]
    pub killed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_size_bytes: Option<u64>,
}

impl Run {
    /// Whether the record has been finalized
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Filters for [`crate::RunRegistry::list`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    /// Maximum number of records returned
    pub max_count: Option<usize>,

    /// Exclude runs that ended more than this many seconds ago
    pub max_age: Option<u64>,

    /// Only runs that are still active
    #[serde(default)]
    pub live_only: bool,

    /// Only runs of this job (compared after canonicalization)
    pub job_name: Option<String>,
}

impl RunFilter {
    pub fn live() -> Self {
        Self {
            live_only: true,
            ..Default::default()
        }
    }

    pub fn for_job(job_name: impl Into<String>) -> Self {
        Self {
            job_name: Some(job_name.into()),
            ..Default::default()
        }
    }
}

/// Current time in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
