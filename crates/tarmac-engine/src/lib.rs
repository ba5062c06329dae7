//! Tarmac execution engine.
//!
//! Couples change-aware job selection, DAG validation, and the parallel
//! scheduler into one entry point. The engine is handed an already-built
//! [`Workflow`]; how workflows are authored and loaded is the front-end's
//! concern.

pub mod config;
pub mod dag;
pub mod executor;
pub mod scheduler;
pub mod select;
pub mod tools;

pub use config::EngineConfig;
pub use dag::{DagBuilder, DagError, JobGraph};
pub use executor::{ExecutorRegistry, ShellKind};
pub use select::{SelectionMode, select};
pub use tools::SystemToolVersions;

use scheduler::Scheduler;
use std::collections::BTreeSet;
use std::sync::Arc;
use tarmac_cache::CacheStore;
use tarmac_core::ports::{StepKind, ToolVersions};
use tarmac_core::run::{RunPlan, RunSummary};
use tarmac_core::workflow::Workflow;
use tarmac_core::{Error, Result};
use tarmac_repo::GitRepo;
use tokio::sync::watch;
use tracing::info;

/// Handle for requesting cancellation of a running engine.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Stop issuing new jobs and terminate the children of running ones.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// The assembled execution engine.
pub struct Engine {
    config: EngineConfig,
    cache: CacheStore,
    tools: Arc<dyn ToolVersions>,
    registry: ExecutorRegistry,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut registry = ExecutorRegistry::with_log_root(config.log_root.clone());
        registry.register(Arc::new(ShellKind::new(cancel_rx.clone())));
        Self {
            cache: CacheStore::new(&config.cache_root),
            tools: Arc::new(SystemToolVersions::new()),
            registry,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            config,
        }
    }

    /// Swap in a different tool-version resolver.
    pub fn with_tools(mut self, tools: Arc<dyn ToolVersions>) -> Self {
        self.tools = tools;
        self
    }

    /// Register an extension step kind.
    pub fn register_kind(&mut self, kind: Arc<dyn StepKind>) {
        self.registry.register(kind);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Validate the workflow and resolve the plan for this invocation.
    ///
    /// DAG validation always runs on the full workflow, so a cycle or an
    /// unknown `needs` aborts even when selection would have pruned the
    /// jobs involved.
    pub fn plan(&self, workflow: &Workflow) -> Result<(RunPlan, JobGraph)> {
        DagBuilder::build(workflow.jobs())?;

        let changed = match self.config.mode {
            SelectionMode::All => None,
            SelectionMode::Diff => Some(self.changed_paths()?),
        };
        select(workflow, self.config.mode, changed.as_ref())
    }

    fn changed_paths(&self) -> Result<BTreeSet<String>> {
        let repo = GitRepo::discover(&self.config.workspace)?;
        let snapshot = repo.snapshot(&self.config.compare_ref)?;
        info!(
            head = %snapshot.head,
            current_ref = %snapshot.current_ref,
            dirty = snapshot.dirty,
            changed = snapshot.changed_paths.len(),
            "captured repository snapshot"
        );
        Ok(snapshot.changed_paths)
    }

    /// Execute a plan produced by [`Engine::plan`].
    pub async fn execute(
        &self,
        workflow: &Workflow,
        plan: &RunPlan,
        graph: &JobGraph,
    ) -> Result<RunSummary> {
        let scheduler = Scheduler {
            workspace: self.config.workspace.clone(),
            cache: self.cache.clone(),
            cache_enabled: self.config.cache_enabled,
            tools: Arc::clone(&self.tools),
            registry: self.registry.clone(),
            workers: self.config.workers,
            fail_fast: self.config.fail_fast,
            cancel: self.cancel_rx.clone(),
        };
        scheduler.run(workflow, plan, graph).await
    }

    /// Plan and execute the workflow.
    pub async fn run(&self, workflow: &Workflow) -> Result<(RunPlan, RunSummary)> {
        let (plan, graph) = self.plan(workflow)?;
        let summary = self.execute(workflow, &plan, &graph).await?;
        Ok((plan, summary))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl From<DagError> for Error {
    fn from(err: DagError) -> Self {
        match err {
            DagError::DuplicateJob(name) => Error::DuplicateJob(name),
            DagError::UnknownNeed { job, missing } => Error::UnknownNeed { job, missing },
            DagError::Cycle(path) => Error::Cycle(path),
        }
    }
}
