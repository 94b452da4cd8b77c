use super::{Job, JobState, JobsFile, ScheduleKind, StateFile};
use crate::config::PathsConfig;
use crate::error::StoreError;
use crate::executor::ExecutionResult;
use crate::schedule;
use crate::util::{process_alive, write_atomic};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::Mutex;

/// Owner of all persisted job and run state. Single writer of record:
/// the scheduler loop, gateway listener and CLI commands all mutate
/// through this API, never through direct field writes.
///
/// Control protocol: external commands mutate `jobs.toml` atomically in
/// their own process; the running daemon notices the mtime change on its
/// next tick via [`JobStore::reload_if_changed`].
///
/// Every mutation re-reads the persisted files before writing, so a
/// snapshot held across an in-flight execution never overwrites what
/// another process persisted in the meantime. Running claims are recorded
/// in `state.toml` with the claiming pid, which makes the one-execution-
/// per-id invariant hold across processes; a claim whose pid is dead is
/// stale and may be taken over.
pub struct JobStore {
    jobs_path: PathBuf,
    state_path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    jobs: Vec<Job>,
    state: StateFile,
    running: HashSet<String>,
    jobs_mtime: Option<SystemTime>,
}

/// Read snapshot of one job plus its run state, for listings and status.
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: Job,
    pub state: JobState,
    pub running: bool,
}

impl JobStore {
    /// Load durable state. Malformed persisted data fails loudly; the
    /// daemon must never silently drop jobs.
    pub fn open(paths: &PathsConfig) -> Result<Self, StoreError> {
        let jobs_path = paths.jobs_file();
        let state_path = paths.state_file();

        let jobs = load_jobs_file(&jobs_path)?;
        let state = load_state_file(&state_path)?;
        let jobs_mtime = file_mtime(&jobs_path);

        Ok(Self {
            jobs_path,
            state_path,
            inner: Mutex::new(Inner {
                jobs,
                state,
                running: HashSet::new(),
                jobs_mtime,
            }),
        })
    }

    /// Re-read `jobs.toml` when its mtime moved since the last load.
    /// Returns true when a reload happened.
    pub async fn reload_if_changed(&self) -> Result<bool, StoreError> {
        let current = file_mtime(&self.jobs_path);
        let mut inner = self.inner.lock().await;
        if current == inner.jobs_mtime {
            return Ok(false);
        }
        inner.jobs = load_jobs_file(&self.jobs_path)?;
        inner.jobs_mtime = current;
        tracing::info!("job definitions reloaded from {}", self.jobs_path.display());
        Ok(true)
    }

    /// Enabled jobs that are due at `now` and not currently running.
    /// `started_at` is the fallback reference for recurring jobs that have
    /// never run.
    pub async fn due_candidates(
        &self,
        now: DateTime<Utc>,
        started_at: DateTime<Utc>,
    ) -> Vec<Job> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .iter()
            .filter(|job| job.enabled && !claimed(&inner, &job.id))
            .filter(|job| {
                let state = inner.state.jobs.get(&job.id);
                is_due(job, state, now, started_at)
            })
            .cloned()
            .collect()
    }

    /// Claim an id for execution. A second claim while one is outstanding,
    /// from this process or any other live one, fails with
    /// [`StoreError::AlreadyRunning`]. The claim is recorded durably with
    /// the claiming pid before this returns.
    pub async fn mark_running(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner)?;
        if !inner.jobs.iter().any(|j| j.id == id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if claimed(&inner, id) {
            return Err(StoreError::AlreadyRunning(id.to_string()));
        }

        let entry = inner.state.jobs.entry(id.to_string()).or_default();
        entry.running_pid = Some(std::process::id());
        persist_state(&self.state_path, &inner.state)?;
        inner.running.insert(id.to_string());
        Ok(())
    }

    /// Record a completed execution and release the running claim. Once
    /// jobs are additionally consumed (terminal, never re-triggered) and
    /// disabled in the definitions file for operator visibility.
    pub async fn mark_finished(
        &self,
        id: &str,
        result: &ExecutionResult,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.running.remove(id);
        self.refresh(&mut inner)?;

        let Some(kind) = inner
            .jobs
            .iter()
            .find(|j| j.id == id)
            .map(|j| j.schedule_kind)
        else {
            // Removed while the execution was in flight.
            return Ok(());
        };
        let consume = kind == ScheduleKind::Once;

        let entry = inner.state.jobs.entry(id.to_string()).or_default();
        entry.last_run_at = Some(result.ended_at);
        entry.last_status = Some(result.status.label().to_string());
        entry.running_pid = None;
        if consume {
            entry.consumed = true;
        }
        persist_state(&self.state_path, &inner.state)?;

        if consume {
            if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
                job.enabled = false;
            }
            persist_jobs(&self.jobs_path, &inner.jobs)?;
            inner.jobs_mtime = file_mtime(&self.jobs_path);
        }
        Ok(())
    }

    /// Validate and persist a new job. Fails with DuplicateId or a
    /// ValidationError before anything is written.
    pub async fn add(&self, job: Job) -> Result<(), StoreError> {
        job.validate()?;
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner)?;
        if inner.jobs.iter().any(|j| j.id == job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        inner.jobs.push(job);
        persist_jobs(&self.jobs_path, &inner.jobs)?;
        inner.jobs_mtime = file_mtime(&self.jobs_path);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner)?;
        let before = inner.jobs.len();
        inner.jobs.retain(|j| j.id != id);
        if inner.jobs.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner.state.jobs.remove(id);
        persist_jobs(&self.jobs_path, &inner.jobs)?;
        persist_state(&self.state_path, &inner.state)?;
        inner.jobs_mtime = file_mtime(&self.jobs_path);
        Ok(())
    }

    /// Idempotent: enabling an enabled job (or disabling a disabled one)
    /// is a no-op returning success.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner)?;
        let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        if job.enabled == enabled {
            return Ok(());
        }
        job.enabled = enabled;
        persist_jobs(&self.jobs_path, &inner.jobs)?;
        inner.jobs_mtime = file_mtime(&self.jobs_path);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        let inner = self.inner.lock().await;
        inner.jobs.iter().find(|j| j.id == id).cloned()
    }

    pub async fn list(&self) -> Vec<JobView> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .iter()
            .map(|job| JobView {
                job: job.clone(),
                state: inner.state.jobs.get(&job.id).cloned().unwrap_or_default(),
                running: claimed(&inner, &job.id),
            })
            .collect()
    }

    /// Re-read both persisted files before a mutation, so the write that
    /// follows starts from what is actually on disk rather than from this
    /// process's last snapshot.
    fn refresh(&self, inner: &mut Inner) -> Result<(), StoreError> {
        inner.jobs = load_jobs_file(&self.jobs_path)?;
        inner.jobs_mtime = file_mtime(&self.jobs_path);
        inner.state = load_state_file(&self.state_path)?;
        Ok(())
    }
}

/// A job is claimed when this process holds it, or when another live
/// process recorded a claim in the state file.
fn claimed(inner: &Inner, id: &str) -> bool {
    if inner.running.contains(id) {
        return true;
    }
    inner
        .state
        .jobs
        .get(id)
        .and_then(|s| s.running_pid)
        .is_some_and(process_alive)
}

fn is_due(
    job: &Job,
    state: Option<&JobState>,
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
) -> bool {
    match job.schedule_kind {
        ScheduleKind::Recurring => {
            let Some(ref expr) = job.schedule else {
                return false;
            };
            let last_ref = state.and_then(|s| s.last_run_at).unwrap_or(started_at);
            match schedule::is_due_recurring(expr, last_ref, now) {
                Ok(due) => due,
                Err(error) => {
                    tracing::warn!(job = %job.id, %error, "skipping job with invalid schedule");
                    false
                }
            }
        }
        ScheduleKind::Once => {
            let consumed = state.is_some_and(|s| s.consumed);
            let Some(run_at) = job.run_at.as_deref().and_then(schedule::parse_run_at) else {
                return false;
            };
            schedule::is_due_once(run_at, consumed, now)
        }
    }
}

// ─── Durable storage ─────────────────────────────────────────────────────────

fn load_jobs_file(path: &PathBuf) -> Result<Vec<Job>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let file: JobsFile = toml::from_str(&content).map_err(|e| {
        StoreError::Persistence(format!("malformed jobs file {}: {e}", path.display()))
    })?;

    // Ids must be unique; a hand-edited file that repeats one would make
    // two records share a single state entry and running claim.
    let mut seen = HashSet::new();
    for job in &file.jobs {
        if !seen.insert(job.id.as_str()) {
            return Err(StoreError::Persistence(format!(
                "duplicate job id '{}' in {}",
                job.id,
                path.display()
            )));
        }
    }
    Ok(file.jobs)
}

fn load_state_file(path: &PathBuf) -> Result<StateFile, StoreError> {
    if !path.exists() {
        return Ok(StateFile::default());
    }
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| {
        StoreError::Persistence(format!("malformed state file {}: {e}", path.display()))
    })
}

fn persist_jobs(path: &PathBuf, jobs: &[Job]) -> Result<(), StoreError> {
    let file = JobsFile {
        jobs: jobs.to_vec(),
    };
    let content = toml::to_string_pretty(&file)
        .map_err(|e| StoreError::Persistence(format!("failed serializing jobs: {e}")))?;
    write_atomic(path, &content).map_err(|e| StoreError::Persistence(e.to_string()))
}

fn persist_state(path: &PathBuf, state: &StateFile) -> Result<(), StoreError> {
    let content = toml::to_string_pretty(state)
        .map_err(|e| StoreError::Persistence(format!("failed serializing state: {e}")))?;
    write_atomic(path, &content).map_err(|e| StoreError::Persistence(e.to_string()))
}

fn file_mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
