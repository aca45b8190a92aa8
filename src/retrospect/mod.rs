//! Background retrospects
//!
//! Each scheduled retrospect becomes a job on a bounded worker pool that
//! runs independently of the coordinator. Job status only moves forward:
//! `pending -> running -> {ok, failed}`. A failed job whose spec asks for
//! downstream invalidation hands a ticket to the replay manager from inside
//! the worker; every failure is kept in the job table either way.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::checks::{CheckInput, CheckRegistry};
use crate::core::config::millis;
use crate::core::errors::{CoordError, Result};
use crate::plan::{RetroOnFail, RetrospectSpec};
use crate::predicate::{PredicateContext, PredicateEvaluator};
use crate::replay::{InvalidationTicket, ReplayManager, ReplayOutcome};

const SUPERSEDED: &str = "superseded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Ok,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Ok | JobStatus::Failed)
    }

    /// Allowed forward moves of the job state machine
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Ok)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Ok => "ok",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The artifact a retrospect inspects
#[derive(Debug, Clone, Default)]
pub struct RetroTarget {
    pub plan_id: String,
    pub plan_version: u64,
    pub step_id: String,
    pub artifact_id: String,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrospectJob {
    pub id: String,
    pub retro_id: String,
    pub plan_id: String,
    pub plan_version: u64,
    pub step_id: String,
    pub artifact_id: String,
    pub checks: Vec<String>,
    pub status: JobStatus,
    /// Populated on failure
    pub reason: Option<String>,
    pub on_fail: RetroOnFail,
    pub timeout_ms: u64,
    /// Artifact value under inspection
    pub input: Value,
    /// What happened after a failure (replay, cancel, recorded only)
    pub resolution: Option<String>,
    pub superseded: bool,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetroStats {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
}

struct RunnerInner {
    jobs: DashMap<String, RetrospectJob>,
    /// (plan_id, retro_id) -> most recently scheduled job
    latest: DashMap<(String, String), String>,
    cancels: DashMap<String, oneshot::Sender<()>>,
    semaphore: Arc<Semaphore>,
    checks: CheckRegistry,
    predicate: Arc<dyn PredicateEvaluator>,
    replay: Option<Arc<ReplayManager>>,
    default_timeout: Duration,
    changed: Notify,
    spawned: AtomicUsize,
}

/// Concurrent runner for retrospect jobs. Cloning shares the job table.
#[derive(Clone)]
pub struct RetrospectRunner {
    inner: Arc<RunnerInner>,
}

impl RetrospectRunner {
    pub fn new(
        workers: usize,
        default_timeout: Duration,
        checks: CheckRegistry,
        predicate: Arc<dyn PredicateEvaluator>,
        replay: Option<Arc<ReplayManager>>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                jobs: DashMap::new(),
                latest: DashMap::new(),
                cancels: DashMap::new(),
                semaphore: Arc::new(Semaphore::new(workers.max(1))),
                checks,
                predicate,
                replay,
                default_timeout,
                changed: Notify::new(),
                spawned: AtomicUsize::new(0),
            }),
        }
    }

    /// Schedule a retrospect on an artifact and return the job id. The
    /// caller never waits for the checks themselves.
    pub fn schedule(&self, target: RetroTarget, spec: &RetrospectSpec) -> String {
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.inner.default_timeout);
        let job = RetrospectJob {
            id: cuid2::create_id(),
            retro_id: spec.id.clone(),
            plan_id: target.plan_id,
            plan_version: target.plan_version,
            step_id: target.step_id,
            artifact_id: target.artifact_id,
            checks: spec.checks.clone(),
            status: JobStatus::Pending,
            reason: None,
            on_fail: spec.on_fail.clone(),
            timeout_ms: millis(timeout),
            input: target.output,
            resolution: None,
            superseded: false,
            scheduled_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let job_id = job.id.clone();
        info!(
            "Scheduling retrospect {} ({}) on {} of plan {} v{}",
            job.retro_id, job_id, job.step_id, job.plan_id, job.plan_version
        );
        self.inner
            .latest
            .insert((job.plan_id.clone(), job.retro_id.clone()), job_id.clone());
        self.inner.jobs.insert(job_id.clone(), job);
        self.spawn_worker(job_id.clone());
        job_id
    }

    fn spawn_worker(&self, job_id: String) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.inner.cancels.insert(job_id.clone(), cancel_tx);
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_job(job_id, cancel_rx).await;
        });
    }

    /// Cancel pending or running jobs of `plan_id` tied to versions older
    /// than `new_version`. Jobs on artifacts carried into the new version
    /// keep running. Cancelled jobs fail with reason "superseded" and never
    /// trigger replay.
    pub fn supersede(&self, plan_id: &str, new_version: u64, carried: &HashSet<String>) -> Vec<String> {
        let candidates: Vec<String> = self
            .inner
            .jobs
            .iter()
            .filter(|job| {
                job.plan_id == plan_id
                    && job.plan_version < new_version
                    && !job.status.is_terminal()
                    && !carried.contains(&job.artifact_id)
            })
            .map(|job| job.id.clone())
            .collect();

        let mut cancelled = Vec::new();
        for job_id in candidates {
            if self.inner.transition(&job_id, JobStatus::Failed, Some(SUPERSEDED.to_string())) {
                if let Some(mut job) = self.inner.jobs.get_mut(&job_id) {
                    job.superseded = true;
                    job.resolution = Some(format!("superseded by v{}", new_version));
                }
                if let Some((_, tx)) = self.inner.cancels.remove(&job_id) {
                    let _ = tx.send(());
                }
                cancelled.push(job_id);
            }
        }
        if !cancelled.is_empty() {
            info!(
                "Superseded {} retrospect job(s) of plan {} below v{}",
                cancelled.len(),
                plan_id,
                new_version
            );
        }
        cancelled
    }

    pub fn get(&self, job_id: &str) -> Option<RetrospectJob> {
        self.inner.jobs.get(job_id).map(|j| j.clone())
    }

    pub fn get_stats(&self) -> RetroStats {
        let mut stats = RetroStats::default();
        for job in self.inner.jobs.iter() {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Ok => stats.ok += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn get_all_failed(&self) -> Vec<String> {
        let mut failed: Vec<(DateTime<Utc>, String)> = self
            .inner
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .map(|job| (job.scheduled_at, job.id.clone()))
            .collect();
        failed.sort();
        failed.into_iter().map(|(_, id)| id).collect()
    }

    /// Status of the most recent job for a retrospect id
    pub fn status_of(&self, plan_id: &str, retro_id: &str) -> Option<JobStatus> {
        let job_id = self
            .inner
            .latest
            .get(&(plan_id.to_string(), retro_id.to_string()))?
            .clone();
        self.inner.jobs.get(&job_id).map(|job| job.status)
    }

    /// Latest status of every retrospect id of a plan
    pub fn statuses_for(&self, plan_id: &str) -> HashMap<String, JobStatus> {
        self.inner
            .latest
            .iter()
            .filter(|e| e.key().0 == plan_id)
            .filter_map(|e| {
                let status = self.inner.jobs.get(e.value())?.status;
                Some((e.key().1.clone(), status))
            })
            .collect()
    }

    /// Wait until a job reaches a terminal status
    pub async fn wait_for(&self, job_id: &str, timeout: Duration) -> Result<JobStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            let status = self
                .inner
                .jobs
                .get(job_id)
                .map(|j| j.status)
                .ok_or_else(|| CoordError::JobNotFound(job_id.to_string()))?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(CoordError::timeout(
                    format!("retrospect job {}", job_id),
                    millis(timeout),
                ));
            }
        }
    }

    /// Wait until the named retrospects of a plan are all terminal, or the
    /// timeout passes. Returns their statuses at that point.
    pub async fn wait_for_retros(
        &self,
        plan_id: &str,
        retro_ids: &[String],
        timeout: Duration,
    ) -> HashMap<String, JobStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            let statuses = self.statuses_for(plan_id);
            let settled = retro_ids
                .iter()
                .all(|id| statuses.get(id).map_or(true, |s| s.is_terminal()));
            if settled || tokio::time::timeout_at(deadline, notified).await.is_err() {
                return statuses;
            }
        }
    }

    /// Wait until no job is pending or running
    pub async fn wait_idle(&self, timeout: Duration) -> Result<RetroStats> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            let stats = self.get_stats();
            if stats.pending == 0 && stats.running == 0 {
                return Ok(stats);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(CoordError::timeout("retrospects idle", millis(timeout)));
            }
        }
    }

    pub fn snapshot(&self) -> Vec<RetrospectJob> {
        let mut jobs: Vec<RetrospectJob> = self.inner.jobs.iter().map(|j| j.clone()).collect();
        jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        jobs
    }

    /// Load a job table. Jobs that were pending or running are reset to
    /// pending and re-spawned.
    pub fn restore(&self, jobs: Vec<RetrospectJob>) -> usize {
        let mut respawn = Vec::new();
        for mut job in jobs {
            if !job.status.is_terminal() {
                job.status = JobStatus::Pending;
                job.started_at = None;
                respawn.push(job.id.clone());
            }
            let key = (job.plan_id.clone(), job.retro_id.clone());
            let newer = self
                .inner
                .latest
                .get(&key)
                .and_then(|id| self.inner.jobs.get(id.value()).map(|j| j.scheduled_at > job.scheduled_at))
                .unwrap_or(false);
            if !newer {
                self.inner.latest.insert(key, job.id.clone());
            }
            self.inner.jobs.insert(job.id.clone(), job);
        }
        for job_id in &respawn {
            self.spawn_worker(job_id.clone());
        }
        info!("Restored retrospect table, {} job(s) re-spawned", respawn.len());
        respawn.len()
    }

    /// Number of workers spawned so far
    pub fn spawned(&self) -> usize {
        self.inner.spawned.load(Ordering::Relaxed)
    }
}

impl RunnerInner {
    /// Apply a forward transition; returns false if it is not allowed
    fn transition(&self, job_id: &str, next: JobStatus, reason: Option<String>) -> bool {
        let applied = match self.jobs.get_mut(job_id) {
            Some(mut job) if job.status.can_transition_to(next) => {
                debug!("Retrospect job {} {} -> {}", job_id, job.status, next);
                job.status = next;
                match next {
                    JobStatus::Running => job.started_at = Some(Utc::now()),
                    JobStatus::Ok | JobStatus::Failed => {
                        job.finished_at = Some(Utc::now());
                        job.reason = reason;
                    }
                    JobStatus::Pending => {}
                }
                true
            }
            _ => false,
        };
        if applied {
            self.changed.notify_waiters();
        }
        applied
    }

    async fn run_job(&self, job_id: String, mut cancel_rx: oneshot::Receiver<()>) {
        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.transition(&job_id, JobStatus::Failed, Some("worker pool closed".into()));
                    return;
                }
            },
            _ = &mut cancel_rx => return,
        };

        if !self.transition(&job_id, JobStatus::Running, None) {
            return;
        }
        let Some(job) = self.jobs.get(&job_id).map(|j| j.clone()) else {
            return;
        };

        let timeout = Duration::from_millis(job.timeout_ms);
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.run_checks(&job)) => result,
            _ = &mut cancel_rx => {
                debug!("Retrospect job {} cancelled while running", job_id);
                return;
            }
        };

        let failure = match result {
            Ok(None) => None,
            Ok(Some(reason)) => Some(reason),
            Err(_) => Some(format!("timed out after {}ms", job.timeout_ms)),
        };

        match failure {
            None => {
                if self.transition(&job_id, JobStatus::Ok, None) {
                    info!("Retrospect {} on {} is green", job.retro_id, job.step_id);
                }
            }
            Some(reason) => {
                if self.transition(&job_id, JobStatus::Failed, Some(reason.clone())) {
                    self.on_failure(&job, reason);
                }
            }
        }
        self.cancels.remove(&job_id);
    }

    /// Run every check concurrently; returns the failure reason, if any
    async fn run_checks(&self, job: &RetrospectJob) -> Option<String> {
        let input = CheckInput {
            plan_id: job.plan_id.clone(),
            step_id: job.step_id.clone(),
            artifact_id: job.artifact_id.clone(),
            output: job.input.clone(),
            args: Value::Null,
        };
        let ctx = PredicateContext::new()
            .with("output", job.input.clone())
            .with(
                "step",
                json!({"id": job.step_id, "artifact_id": job.artifact_id, "plan_version": job.plan_version}),
            );

        let verdicts = join_all(job.checks.iter().map(|reference| {
            self.checks
                .run(reference, &input, self.predicate.as_ref(), &ctx)
        }))
        .await;

        let reasons: Vec<String> = job
            .checks
            .iter()
            .zip(verdicts)
            .filter(|(_, verdict)| !verdict.passed)
            .map(|(reference, verdict)| {
                verdict
                    .reason
                    .unwrap_or_else(|| format!("check '{}' failed", reference))
            })
            .collect();
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }

    fn on_failure(&self, job: &RetrospectJob, reason: String) {
        let failure = CoordError::RetrospectFailure {
            retro_id: job.retro_id.clone(),
            step_id: job.step_id.clone(),
            reason: reason.clone(),
        };
        warn!("{}", failure);

        let resolution = if !job.on_fail.invalidate_downstream {
            "recorded".to_string()
        } else if let Some(replay) = &self.replay {
            let mut ticket = InvalidationTicket::new(
                job.plan_id.clone(),
                job.plan_version,
                job.step_id.clone(),
                job.artifact_id.clone(),
                format!("retrospect {} failed: {}", job.retro_id, reason),
            );
            if let Some(from) = &job.on_fail.replay_from {
                ticket = ticket.replay_from(from.clone());
            }
            ticket.patch = job.on_fail.patch.clone();
            ticket.escalate = job.on_fail.escalate.clone();
            ticket.source_job = Some(job.id.clone());

            match replay.handle(ticket) {
                Ok(ReplayOutcome::Replay { plan, .. }) => format!("replay queued as v{}", plan.version),
                Ok(ReplayOutcome::Cancel { published, .. }) if !published.is_empty() => {
                    format!("cancelled, side effects already published by {:?}", published)
                }
                Ok(ReplayOutcome::Cancel { .. }) => "cancelled".to_string(),
                Err(e) => {
                    error!("Replay for retrospect job {} failed: {}", job.id, e);
                    format!("replay failed: {}", e)
                }
            }
        } else {
            warn!("No replay manager configured, failure of {} only recorded", job.id);
            "recorded".to_string()
        };

        if let Some(mut entry) = self.jobs.get_mut(&job.id) {
            entry.resolution = Some(resolution);
        }
        self.changed.notify_waiters();
    }
}
