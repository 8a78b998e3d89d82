//! Run registry
//!
//! The authoritative set of active runs. Every run has a metadata record on
//! disk at `<log_dir>/<id>.<step>.json`; active runs also keep their record
//! in memory behind a per-run async mutex so that a kill request and the
//! natural end of the process never overwrite each other's update.

use crate::admission::canonical_job_name;
use crate::error::{Result, RunnerError};
use crate::launcher::ExitWatch;
use crate::types::{now_millis, Run, RunFilter, RunId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "json";

struct ActiveRun {
    step: u32,
    record: Arc<tokio::sync::Mutex<Run>>,
    exit: ExitWatch,
}

/// Active runs plus their durable metadata records
pub struct RunRegistry {
    log_dir: PathBuf,
    active: Mutex<HashMap<RunId, ActiveRun>>,
}

impl RunRegistry {
    /// Open the registry over `log_dir`, finalizing records left unfinished
    /// by a previous instance
    pub fn open(log_dir: impl Into<PathBuf>) -> Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;

        let registry = Self {
            log_dir,
            active: Mutex::new(HashMap::new()),
        };
        let recovered = registry.recover_orphans()?;
        if recovered > 0 {
            info!(count = recovered, "Recovered orphaned run records");
        }
        Ok(registry)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn log_path(&self, id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.log", id))
    }

    fn record_path(&self, id: &RunId, step: u32) -> PathBuf {
        self.log_dir
            .join(format!("{}.{}.{}", id, step, RECORD_EXTENSION))
    }

    /// Current size of the run's log file, zero if it does not exist
    pub fn log_size(&self, id: &RunId) -> u64 {
        std::fs::metadata(self.log_path(id))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn is_active(&self, id: &RunId) -> bool {
        self.active.lock().contains_key(id)
    }

    /// Step of the active run for `id`
    pub fn active_step(&self, id: &RunId) -> Option<u32> {
        self.active.lock().get(id).map(|a| a.step)
    }

    pub fn exit_watch(&self, id: &RunId) -> Option<ExitWatch> {
        self.active.lock().get(id).map(|a| a.exit.clone())
    }

    fn record(&self, id: &RunId) -> Option<Arc<tokio::sync::Mutex<Run>>> {
        self.active.lock().get(id).map(|a| a.record.clone())
    }

    /// Register a freshly spawned run and write its first record.
    ///
    /// Fails with `DuplicateRun` if `id` is active or already has a record
    /// for this step; a step record is never written over by a later run.
    pub async fn create(&self, run: Run, exit: ExitWatch) -> Result<()> {
        let id = run.id.clone();
        let step = run.step;
        let record = Arc::new(tokio::sync::Mutex::new(run));
        {
            let mut active = self.active.lock();
            if active.contains_key(&id) || self.record_path(&id, step).exists() {
                return Err(RunnerError::DuplicateRun(id));
            }
            active.insert(
                id.clone(),
                ActiveRun {
                    step,
                    record: record.clone(),
                    exit,
                },
            );
        }

        let run = record.lock().await;
        self.persist_logged(&run);
        debug!(run_id = %id, step = run.step, pid = run.pid, "Registered run");
        Ok(())
    }

    /// Latest record for `id`
    pub async fn get(&self, id: &RunId) -> Result<Run> {
        if let Some(record) = self.record(id) {
            return Ok(record.lock().await.clone());
        }
        self.load_latest(id)?
            .ok_or_else(|| RunnerError::NotFound(id.clone()))
    }

    /// Runs matching `filter`, most recent start first
    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut runs: HashMap<RunId, Run> = HashMap::new();

        if !filter.live_only {
            for run in self.load_all()? {
                match runs.get(&run.id) {
                    Some(existing) if existing.step >= run.step => {}
                    _ => {
                        runs.insert(run.id.clone(), run);
                    }
                }
            }
        }

        let records: Vec<_> = self
            .active
            .lock()
            .values()
            .map(|a| a.record.clone())
            .collect();
        for record in records {
            let run = record.lock().await.clone();
            runs.insert(run.id.clone(), run);
        }

        let job = filter.job_name.as_deref().map(canonical_job_name);
        let cutoff = filter
            .max_age
            .map(|secs| now_millis() - (secs as i64).saturating_mul(1000));

        let mut runs: Vec<Run> = runs
            .into_values()
            .filter(|run| !filter.live_only || !run.is_finished())
            .filter(|run| match (&job, &run.job_name) {
                (Some(job), name) => &canonical_job_name(name) == job,
                (None, _) => true,
            })
            .filter(|run| match (cutoff, run.end_time) {
                (Some(cutoff), Some(end)) => end >= cutoff,
                _ => true,
            })
            .collect();

        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if let Some(max) = filter.max_count {
            runs.truncate(max);
        }
        Ok(runs)
    }

    /// Write the exit of an active run and drop it from the active set.
    ///
    /// Returns the final record, or `None` if the run was already
    /// finalized (or never active).
    pub async fn finalize(
        &self,
        id: &RunId,
        exit_code: Option<i32>,
        log_size: u64,
    ) -> Result<Option<Run>> {
        let Some(record) = self.record(id) else {
            return Ok(None);
        };

        let mut run = record.lock().await;
        if run.is_finished() {
            return Ok(None);
        }
        run.end_time = Some(now_millis());
        run.exit_code = exit_code;
        run.log_size_bytes = Some(log_size);
        self.persist_logged(&run);

        {
            let mut active = self.active.lock();
            if active
                .get(id)
                .is_some_and(|a| Arc::ptr_eq(&a.record, &record))
            {
                active.remove(id);
            }
        }

        info!(run_id = %id, step = run.step, exit_code = ?exit_code, "Run finished");
        Ok(Some(run.clone()))
    }

    /// Flag an active run as killed
    pub async fn mark_killed(&self, id: &RunId) -> Result<Run> {
        let Some(record) = self.record(id) else {
            return match self.load_latest(id)? {
                Some(_) => Err(RunnerError::Gone(id.clone())),
                None => Err(RunnerError::NotFound(id.clone())),
            };
        };

        let mut run = record.lock().await;
        if run.is_finished() {
            return Err(RunnerError::Gone(id.clone()));
        }
        run.killed = true;
        self.persist_logged(&run);
        Ok(run.clone())
    }

    /// Finalize every on-disk record without an end time.
    ///
    /// Only called before any run is registered, so every such record
    /// belongs to a process this instance never owned.
    pub fn recover_orphans(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut run in self.load_all()? {
            if run.is_finished() || self.is_active(&run.id) {
                continue;
            }
            warn!(run_id = %run.id, step = run.step, pid = run.pid, "Finalizing orphaned run");
            run.end_time = Some(now_millis());
            run.log_size_bytes = Some(self.log_size(&run.id));
            self.persist(&run)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    fn persist(&self, run: &Run) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(run).map_err(|e| RunnerError::persist(&run.id, e))?;
        write_atomic(&self.record_path(&run.id, run.step), &json)
            .map_err(|e| RunnerError::persist(&run.id, e))
    }

    fn persist_logged(&self, run: &Run) {
        if let Err(e) = self.persist(run) {
            warn!(run_id = %run.id, error = %e, "Metadata write failed");
        }
    }

    fn load_latest(&self, id: &RunId) -> Result<Option<Run>> {
        if !id.is_valid() {
            return Ok(None);
        }
        let mut latest = None;
        let mut step = 0;
        loop {
            let path = self.record_path(id, step);
            if !path.exists() {
                break;
            }
            latest = Some(read_record(&path)?);
            step += 1;
        }
        Ok(latest)
    }

    fn load_all(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match read_record(&path) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run record"),
            }
        }
        Ok(runs)
    }
}

fn read_record(path: &Path) -> Result<Run> {
    let contents = std::fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

/// Replace `path` with `contents` via a temp file and rename
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LaunchSpec, Launcher};

    fn run(id: &str, step: u32, job: &str, start_time: i64) -> Run {
        Run {
            id: RunId::new(id),
            step,
            start_time,
            command_string: format!("ansible-playbook {}.yml", job),
            pid: 1,
            job_name: job.to_string(),
            killed: false,
            end_time: None,
            exit_code: None,
            log_size_bytes: None,
        }
    }

    fn exit_watch() -> ExitWatch {
        let spec = LaunchSpec::new(RunId::new("w"), "true");
        Launcher::new().spawn(&spec).unwrap().exit_watch()
    }

    #[tokio::test]
    async fn test_create_get_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        let id = RunId::new("100");

        registry.create(run("100", 0, "site", 1), exit_watch()).await.unwrap();
        assert!(registry.is_active(&id));
        assert!(registry.get(&id).await.unwrap().end_time.is_none());

        let done = registry.finalize(&id, Some(0), 12).await.unwrap().unwrap();
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.log_size_bytes, Some(12));
        assert!(!registry.is_active(&id));

        let first = serde_json::to_vec(&registry.get(&id).await.unwrap()).unwrap();
        let second = serde_json::to_vec(&registry.get(&id).await.unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        let id = RunId::new("100");

        registry.create(run("100", 0, "site", 1), exit_watch()).await.unwrap();
        assert!(registry.finalize(&id, Some(1), 0).await.unwrap().is_some());
        assert!(registry.finalize(&id, Some(0), 5).await.unwrap().is_none());
        assert_eq!(registry.get(&id).await.unwrap().exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_active_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();

        registry.create(run("1", 0, "site", 1), exit_watch()).await.unwrap();
        let err = registry
            .create(run("1", 1, "status", 2), exit_watch())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::DuplicateRun(_)));
    }

    #[tokio::test]
    async fn test_finished_step_record_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        let id = RunId::new("12");

        registry.create(run("12", 1, "site", 1), exit_watch()).await.unwrap();
        let finished = registry.finalize(&id, Some(0), 4).await.unwrap().unwrap();

        let err = registry
            .create(run("12", 1, "status", 2), exit_watch())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::DuplicateRun(_)));
        assert!(!registry.is_active(&id));
        assert_eq!(read_record(&registry.record_path(&id, 1)).unwrap(), finished);
    }

    #[tokio::test]
    async fn test_mark_killed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        let id = RunId::new("5");

        assert!(matches!(
            registry.mark_killed(&id).await,
            Err(RunnerError::NotFound(_))
        ));

        registry.create(run("5", 0, "site", 1), exit_watch()).await.unwrap();
        assert!(registry.mark_killed(&id).await.unwrap().killed);
        registry.finalize(&id, None, 0).await.unwrap();

        assert!(matches!(
            registry.mark_killed(&id).await,
            Err(RunnerError::Gone(_))
        ));
        assert!(registry.get(&id).await.unwrap().killed);
    }

    #[tokio::test]
    async fn test_workflow_steps_keep_separate_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        let id = RunId::new("9");

        registry.create(run("9", 0, "config-processor-run", 1), exit_watch()).await.unwrap();
        let step0 = registry.finalize(&id, Some(0), 3).await.unwrap().unwrap();

        registry.create(run("9", 1, "ready-deployment", 2), exit_watch()).await.unwrap();
        registry.finalize(&id, Some(0), 6).await.unwrap();

        assert_eq!(registry.get(&id).await.unwrap().job_name, "ready-deployment");
        let on_disk = read_record(&registry.record_path(&id, 0)).unwrap();
        assert_eq!(on_disk, step0);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();

        for (id, job, start) in [("1", "site", 10), ("2", "status.yml", 20), ("3", "site", 30)] {
            registry.create(run(id, 0, job, start), exit_watch()).await.unwrap();
        }
        registry.finalize(&RunId::new("1"), Some(0), 0).await.unwrap();

        let all = registry.list(&RunFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);

        let live = registry.list(&RunFilter::live()).await.unwrap();
        assert_eq!(live.len(), 2);

        let site = registry.list(&RunFilter::for_job("site.yml")).await.unwrap();
        assert_eq!(site.len(), 2);

        let status = registry.list(&RunFilter::for_job("status")).await.unwrap();
        assert_eq!(status.len(), 1);

        let limited = registry
            .list(&RunFilter {
                max_count: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited[0].id.as_str(), "3");
    }

    #[tokio::test]
    async fn test_list_excludes_old_runs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();

        let mut old = run("1", 0, "site", 0);
        old.end_time = Some(now_millis() - 3_600_000);
        registry.persist(&old).unwrap();
        let mut recent = run("2", 0, "site", 1);
        recent.end_time = Some(now_millis());
        registry.persist(&recent).unwrap();

        let runs = registry
            .list(&RunFilter {
                max_age: Some(60),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id.as_str(), "2");
    }

    #[tokio::test]
    async fn test_orphans_finalized_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = RunRegistry::open(dir.path()).unwrap();
            registry.persist(&run("7", 0, "site", 1)).unwrap();
            std::fs::write(registry.log_path(&RunId::new("7")), "partial\n").unwrap();
        }

        let registry = RunRegistry::open(dir.path()).unwrap();
        let recovered = registry.get(&RunId::new("7")).await.unwrap();
        assert!(recovered.end_time.is_some());
        assert_eq!(recovered.exit_code, None);
        assert_eq!(recovered.log_size_bytes, Some(8));
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::open(dir.path()).unwrap();
        assert!(matches!(
            registry.get(&RunId::new("../x")).await,
            Err(RunnerError::NotFound(_))
        ));
    }
}
