//! Parallel job scheduling over a validated DAG.
//!
//! A bounded pool of workers consumes the ready set. Completion of a job
//! decrements its dependents' in-degrees; whoever reaches zero becomes
//! ready. The ready set, in-degree map, and result table share a single
//! lock, and critical sections touch only one job's dependents.

use crate::dag::JobGraph;
use crate::executor::ExecutorRegistry;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tarmac_cache::{CacheStore, derive_key, hash_inputs};
use tarmac_core::ports::{StepContext, ToolVersions};
use tarmac_core::run::{CacheOutcome, JobOutcome, JobResult, RunPlan, RunSummary};
use tarmac_core::workflow::{Job, Workflow};
use tarmac_core::{Error, Result};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

pub struct Scheduler {
    pub(crate) workspace: PathBuf,
    pub(crate) cache: CacheStore,
    pub(crate) cache_enabled: bool,
    pub(crate) tools: Arc<dyn ToolVersions>,
    pub(crate) registry: ExecutorRegistry,
    pub(crate) workers: usize,
    pub(crate) fail_fast: bool,
    pub(crate) cancel: watch::Receiver<bool>,
}

/// Mutable state shared between the issue loop and job tasks.
struct Shared {
    indeg: HashMap<String, usize>,
    ready: Vec<String>,
    /// Jobs with a recorded terminal outcome.
    done: HashSet<String>,
    results: Vec<JobResult>,
    /// Set under fail-fast once any job fails; no further issuance.
    stop: bool,
}

impl Scheduler {
    /// Execute the plan to completion and collect per-job results.
    pub async fn run(
        &self,
        workflow: &Workflow,
        plan: &RunPlan,
        graph: &JobGraph,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let workers = self.workers.max(1);
        info!(
            jobs = plan.selected.len(),
            skipped = plan.skipped.len(),
            workers,
            fail_fast = self.fail_fast,
            "starting run"
        );

        // Selection skips are vacuous successes and part of the result set.
        let skipped_results: Vec<JobResult> = plan
            .skipped
            .iter()
            .map(|s| JobResult::skipped(&s.name))
            .collect();

        let indeg = graph.in_degrees();
        let mut seed: Vec<String> = indeg
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(name, _)| name.clone())
            .collect();
        seed.sort_by_key(|name| graph.position(name));

        let dependents: Arc<HashMap<String, Vec<String>>> = Arc::new(
            plan.selected
                .iter()
                .map(|name| (name.clone(), graph.dependents(name)))
                .collect(),
        );
        let positions: Arc<HashMap<String, usize>> = Arc::new(
            plan.selected
                .iter()
                .map(|name| (name.clone(), graph.position(name)))
                .collect(),
        );

        let shared = Arc::new(Mutex::new(Shared {
            indeg,
            ready: seed,
            done: HashSet::new(),
            results: Vec::new(),
            stop: false,
        }));
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            let issue_now: Vec<String> = {
                let mut state = self.lock(&shared)?;
                if state.stop || *self.cancel.borrow() {
                    Vec::new()
                } else {
                    std::mem::take(&mut state.ready)
                }
            };

            for name in issue_now {
                let job = workflow
                    .job(&name)
                    .ok_or_else(|| Error::Internal(format!("planned job '{name}' not in workflow")))?
                    .clone();
                self.spawn_job(
                    &mut join_set,
                    job,
                    Arc::clone(&shared),
                    Arc::clone(&semaphore),
                    Arc::clone(&dependents),
                    Arc::clone(&positions),
                );
            }

            if join_set.join_next().await.is_none() {
                let state = self.lock(&shared)?;
                if state.stop || *self.cancel.borrow() || state.ready.is_empty() {
                    break;
                }
            }
        }

        let mut state = Arc::try_unwrap(shared)
            .map_err(|_| Error::Internal("scheduler tasks still hold state".to_string()))?
            .into_inner()
            .map_err(|_| Error::Internal("scheduler state lock poisoned".to_string()))?;

        // Whatever never reached a terminal state was cut off by
        // fail-fast or cancellation.
        for name in &plan.selected {
            if !state.done.contains(name) {
                state.results.push(JobResult::cancelled(name));
            }
        }

        let mut results = skipped_results;
        results.extend(state.results);
        let summary = RunSummary {
            results,
            started_at,
            finished_at: Utc::now(),
        };
        info!(success = summary.success(), "run finished");
        Ok(summary)
    }

    fn lock<'a>(&self, shared: &'a Mutex<Shared>) -> Result<std::sync::MutexGuard<'a, Shared>> {
        shared
            .lock()
            .map_err(|_| Error::Internal("scheduler state lock poisoned".to_string()))
    }

    fn spawn_job(
        &self,
        join_set: &mut JoinSet<()>,
        job: Job,
        shared: Arc<Mutex<Shared>>,
        semaphore: Arc<Semaphore>,
        dependents: Arc<HashMap<String, Vec<String>>>,
        positions: Arc<HashMap<String, usize>>,
    ) {
        let worker = JobWorker {
            workspace: self.workspace.clone(),
            cache: self.cache.clone(),
            cache_enabled: self.cache_enabled,
            tools: Arc::clone(&self.tools),
            registry: self.registry.clone(),
            cancel: self.cancel.clone(),
        };
        let fail_fast = self.fail_fast;

        join_set.spawn(async move {
            let name = job.name.clone();
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => worker.run_job(&job).await,
                Err(_) => JobResult::cancelled(&name),
            };

            let Ok(mut state) = shared.lock() else {
                return;
            };
            let outcome = result.outcome;
            state.done.insert(name.clone());
            state.results.push(result);

            match outcome {
                JobOutcome::Ok | JobOutcome::Skipped => {
                    if let Some(deps) = dependents.get(&name) {
                        for dependent in deps {
                            let Some(degree) = state.indeg.get_mut(dependent) else {
                                continue;
                            };
                            *degree = degree.saturating_sub(1);
                            if *degree == 0 && !state.done.contains(dependent) {
                                state.ready.push(dependent.clone());
                                state
                                    .ready
                                    .sort_by_key(|n| positions.get(n).copied().unwrap_or(usize::MAX));
                            }
                        }
                    }
                }
                JobOutcome::Failed => {
                    if fail_fast {
                        state.stop = true;
                    } else {
                        taint_dependents(&mut state, &name, &dependents);
                    }
                }
                JobOutcome::Cancelled => {}
            }
        });
    }
}

/// Mark every transitive dependent of `failed` as cancelled so it is
/// never scheduled and its own dependents propagate the same.
fn taint_dependents(
    state: &mut Shared,
    failed: &str,
    dependents: &HashMap<String, Vec<String>>,
) {
    let mut queue: VecDeque<String> = dependents
        .get(failed)
        .map(|deps| deps.iter().cloned().collect())
        .unwrap_or_default();

    while let Some(name) = queue.pop_front() {
        if state.done.contains(&name) {
            continue;
        }
        warn!(job = %name, upstream = failed, "cancelled by upstream failure");
        state.done.insert(name.clone());
        state.results.push(JobResult::cancelled(&name));
        state.ready.retain(|r| *r != name);
        if let Some(next) = dependents.get(&name) {
            queue.extend(next.iter().cloned());
        }
    }
}

/// Everything one job task needs, detached from the scheduler's lifetime.
struct JobWorker {
    workspace: PathBuf,
    cache: CacheStore,
    cache_enabled: bool,
    tools: Arc<dyn ToolVersions>,
    registry: ExecutorRegistry,
    cancel: watch::Receiver<bool>,
}

impl JobWorker {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn run_job(&self, job: &Job) -> JobResult {
        let start = Instant::now();
        if self.cancelled() {
            return JobResult::cancelled(&job.name);
        }

        let cache_applicable = self.cache_enabled && !job.cache_dirs.is_empty();
        let mut key = None;
        if cache_applicable {
            match self.derive_job_key(job).await {
                Ok(derived) => {
                    if let Some(result) = self.try_restore(job, &derived, start).await {
                        return result;
                    }
                    key = Some(derived);
                }
                Err(e) => {
                    warn!(job = %job.name, error = %e, "input hashing failed; caching disabled for this job");
                }
            }
        }

        let miss_outcome = if key.is_some() {
            CacheOutcome::Miss
        } else {
            CacheOutcome::NotApplicable
        };

        let ctx = StepContext {
            workspace: self.workspace.clone(),
            env: job.env.clone(),
        };
        for step in &job.steps {
            if self.cancelled() {
                return JobResult::cancelled(&job.name);
            }
            match self.registry.execute(&job.name, step, &ctx).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    if self.cancelled() {
                        // A non-zero exit after the kill signal is the
                        // cancellation, not a real failure.
                        return JobResult::cancelled(&job.name);
                    }
                    warn!(
                        job = %job.name,
                        step = %step.name,
                        exit_code = output.exit_code,
                        "step failed"
                    );
                    return self.failed(job, step, Some(output.exit_code), miss_outcome, start);
                }
                Err(e) => {
                    warn!(job = %job.name, step = %step.name, error = %e, "step executor error");
                    return self.failed(job, step, None, miss_outcome, start);
                }
            }
        }

        if let Some(key) = &key {
            self.persist(job, key).await;
        }

        JobResult {
            name: job.name.clone(),
            outcome: JobOutcome::Ok,
            cache: miss_outcome,
            failed_step: None,
            exit_code: None,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn derive_job_key(&self, job: &Job) -> Result<String> {
        let workspace = self.workspace.clone();
        let inputs = job.inputs.clone();
        let digest = tokio::task::spawn_blocking(move || hash_inputs(&workspace, &inputs, &[]))
            .await
            .map_err(|e| Error::Internal(format!("hash task failed: {e}")))??;
        Ok(derive_key(job, self.tools.as_ref(), &digest).await)
    }

    /// On a hit, restore and report; a failed restore degrades to a miss.
    async fn try_restore(&self, job: &Job, key: &str, start: Instant) -> Option<JobResult> {
        match self.cache.lookup(&job.name, key).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(job = %job.name, error = %e, "cache lookup failed; treating as miss");
                return None;
            }
        }
        match self.cache.restore(&job.name, key, &self.workspace).await {
            Ok(()) => {
                info!(job = %job.name, "cache hit, steps skipped");
                Some(JobResult {
                    name: job.name.clone(),
                    outcome: JobOutcome::Ok,
                    cache: CacheOutcome::Hit,
                    failed_step: None,
                    exit_code: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "cache restore failed; running steps");
                None
            }
        }
    }

    /// Store then prune. Cache failures never fail a successful job.
    async fn persist(&self, job: &Job, key: &str) {
        match self
            .cache
            .store(&job.name, key, &self.workspace, &job.cache_dirs)
            .await
        {
            Ok(_) => {
                if let Err(e) = self.cache.prune(&job.name, job.cache_keep).await {
                    warn!(job = %job.name, error = %e, "cache prune failed");
                }
            }
            Err(e) => {
                warn!(job = %job.name, error = %e, "cache store failed; result not cached");
            }
        }
    }

    fn failed(
        &self,
        job: &Job,
        step: &tarmac_core::workflow::Step,
        exit_code: Option<i32>,
        cache: CacheOutcome,
        start: Instant,
    ) -> JobResult {
        JobResult {
            name: job.name.clone(),
            outcome: JobOutcome::Failed,
            cache,
            failed_step: Some(step.name.clone()),
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}
