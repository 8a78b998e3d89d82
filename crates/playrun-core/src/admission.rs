//! Admission control for exclusive jobs
//!
//! Some jobs must never run twice at the same time. The controller
//! keeps one slot per exclusive job; taking the slot is a single
//! compare-and-insert under a mutex, so two concurrent launches cannot both
//! pass. The first request wins and every later one is rejected until the
//! slot is released.

use crate::error::{Result, RunnerError};
use crate::types::RunId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

type Slots = Arc<Mutex<HashMap<String, RunId>>>;

/// Strip directory and `.yml`/`.yaml` extension from a job identifier
pub fn canonical_job_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());

    base.strip_suffix(".yml")
        .or_else(|| base.strip_suffix(".yaml"))
        .map(str::to_string)
        .unwrap_or(base)
}

/// Enforces at most one active run per exclusive job
#[derive(Debug, Clone)]
pub struct AdmissionController {
    exclusive: HashSet<String>,
    slots: Slots,
}

impl AdmissionController {
    pub fn new<I, S>(exclusive: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            exclusive: exclusive
                .into_iter()
                .map(|s| canonical_job_name(s.as_ref()))
                .collect(),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_exclusive(&self, job: &str) -> bool {
        self.exclusive.contains(&canonical_job_name(job))
    }

    /// Reserve the slot for `job` on behalf of `run_id`.
    ///
    /// Jobs outside the exclusive set always succeed with an inert
    /// reservation.
    pub fn reserve(&self, job: &str, run_id: &RunId) -> Result<Reservation> {
        let job = canonical_job_name(job);
        if !self.exclusive.contains(&job) {
            return Ok(Reservation::inert(job, run_id.clone()));
        }

        let mut slots = self.slots.lock();
        if let Some(holder) = slots.get(&job) {
            return Err(RunnerError::AdmissionConflict {
                job,
                holder: holder.clone(),
            });
        }
        slots.insert(job.clone(), run_id.clone());
        debug!(job = %job, run_id = %run_id, "Reserved exclusive job slot");

        Ok(Reservation {
            slots: Some(self.slots.clone()),
            job,
            run_id: run_id.clone(),
        })
    }

    /// Free the slot for `job` if `run_id` holds it
    pub fn release(&self, job: &str, run_id: &RunId) -> bool {
        release_slot(&self.slots, &canonical_job_name(job), run_id)
    }

    /// Run currently holding the slot for `job`
    pub fn holder(&self, job: &str) -> Option<RunId> {
        self.slots.lock().get(&canonical_job_name(job)).cloned()
    }
}

fn release_slot(slots: &Slots, job: &str, run_id: &RunId) -> bool {
    let mut slots = slots.lock();
    if slots.get(job) == Some(run_id) {
        slots.remove(job);
        debug!(job = %job, run_id = %run_id, "Released exclusive job slot");
        true
    } else {
        false
    }
}

/// A held admission slot, freed when dropped.
///
/// The launch path hands the reservation to the run's output relay, which
/// drops it once the run is finalized. Any early return before that (or a
/// panicking relay) frees the slot as well.
#[derive(Debug)]
pub struct Reservation {
    slots: Option<Slots>,
    job: String,
    run_id: RunId,
}

impl Reservation {
    fn inert(job: String, run_id: RunId) -> Self {
        Self {
            slots: None,
            job,
            run_id,
        }
    }

    /// Whether dropping this reservation frees an exclusive slot
    pub fn is_exclusive(&self) -> bool {
        self.slots.is_some()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(slots) = &self.slots {
            release_slot(slots, &self.job, &self.run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdmissionController {
        AdmissionController::new(["site", "config-processor-run"])
    }

    #[test]
    fn test_canonical_job_name() {
        assert_eq!(canonical_job_name("site"), "site");
        assert_eq!(canonical_job_name("site.yml"), "site");
        assert_eq!(canonical_job_name("/opt/ansible/site.yml"), "site");
        assert_eq!(canonical_job_name("hosts/deploy.yaml"), "deploy");
        assert_eq!(canonical_job_name("ready-deployment"), "ready-deployment");
    }

    #[test]
    fn test_second_reservation_conflicts() {
        let admission = controller();
        let first = RunId::new("1");
        let _reservation = admission.reserve("site", &first).unwrap();

        let err = admission.reserve("site.yml", &RunId::new("2")).unwrap_err();
        match err {
            RunnerError::AdmissionConflict { job, holder } => {
                assert_eq!(job, "site");
                assert_eq!(holder, first);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reservation_is_released_on_drop() {
        let admission = controller();
        {
            let _reservation = admission.reserve("site", &RunId::new("1")).unwrap();
            assert!(admission.holder("site").is_some());
        }
        assert!(admission.holder("site").is_none());
        assert!(admission.reserve("site", &RunId::new("2")).is_ok());
    }

    #[test]
    fn test_release_requires_matching_holder() {
        let admission = controller();
        let reservation = admission.reserve("site", &RunId::new("1")).unwrap();
        assert!(reservation.is_exclusive());

        assert!(!admission.release("site", &RunId::new("2")));
        assert_eq!(admission.holder("site"), Some(RunId::new("1")));
        assert!(admission.release("site", &RunId::new("1")));
        assert!(admission.holder("site").is_none());
        drop(reservation);
    }

    #[test]
    fn test_non_exclusive_jobs_never_conflict() {
        let admission = controller();
        let first = admission.reserve("status", &RunId::new("1")).unwrap();
        let _second = admission.reserve("status", &RunId::new("2")).unwrap();
        assert!(!first.is_exclusive());
        assert!(!admission.is_exclusive("status"));
        assert!(admission.holder("status").is_none());
    }

    #[test]
    fn test_concurrent_reservations_admit_exactly_one() {
        let admission = controller();
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let admission = admission.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    admission.reserve("site", &RunId::new(i.to_string())).ok()
                })
            })
            .collect();

        let admitted: Vec<Reservation> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(admitted.len(), 1);
    }
}
