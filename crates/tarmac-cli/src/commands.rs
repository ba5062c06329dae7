//! CLI command definitions and dispatch.

use clap::Subcommand;
use console::style;
use std::path::PathBuf;
use tarmac_agent::{Agent, AgentConfig, ApiClient};
use tarmac_core::run::{CacheOutcome, JobOutcome, RunPlan, RunSummary};
use tarmac_core::{Error, Result};
use tarmac_engine::{Engine, EngineConfig, SelectionMode};
use tarmac_repo::GitRepo;
use tarmac_server::ServerConfig;

use crate::workflow_file;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow locally
    Run {
        /// Workflow file (suffix optional)
        #[arg(default_value = "tarmac.yaml")]
        workflow: String,

        /// Number of parallel workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Cache directory
        #[arg(long, default_value = ".tarmac/cache")]
        cache_root: PathBuf,

        /// Keep scheduling after a failure
        #[arg(long)]
        no_fail_fast: bool,

        /// Execute every job's steps even when a cache entry exists
        #[arg(long)]
        no_cache: bool,

        /// Select jobs by git diff against the compare ref
        #[arg(long)]
        diff: bool,

        /// Ref to diff against
        #[arg(long, default_value = "origin/main")]
        compare_ref: String,

        /// Do not print the selected/skipped plan
        #[arg(long)]
        no_print_plan: bool,
    },

    /// Poll the coordination plane and execute leased jobs
    Agent {
        /// API base URL
        #[arg(long)]
        api: String,

        /// Unique agent identifier (defaults to the hostname)
        #[arg(long)]
        agent_id: Option<String>,

        /// Seconds between polls when idle
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,

        /// Working directory for checkouts and the agent cache
        #[arg(long, default_value = ".tarmac/agent")]
        work_dir: PathBuf,
    },

    /// Serve the coordination plane
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:7700")]
        bind: String,

        /// Database URL
        #[arg(long, default_value = "sqlite://tarmac.db?mode=rwc")]
        database_url: String,

        /// Lease TTL in seconds
        #[arg(long, default_value_t = 600)]
        lease_seconds: i64,
    },

    /// Submit a workflow run to the coordination plane
    Submit {
        /// Workflow file (suffix optional)
        #[arg(default_value = "tarmac.yaml")]
        workflow: String,

        /// API base URL
        #[arg(long)]
        api: String,

        /// Repository URL (defaults to the origin remote)
        #[arg(long)]
        repo: Option<String>,

        /// Git ref (defaults to the current branch)
        #[arg(long)]
        git_ref: Option<String>,
    },
}

/// Exit codes: 0 success, 1 job failure, 2 workflow load, 3 DAG
/// validation, 4 repo facts.
fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::WorkflowLoad(_) | Error::InvalidJob { .. } | Error::UnconfinedCacheDir { .. } => 2,
        Error::DuplicateJob(_) | Error::UnknownNeed { .. } | Error::Cycle(_) => 3,
        Error::NotARepository | Error::UnknownRef(_) | Error::Git(_) => 4,
        _ => 1,
    }
}

pub async fn dispatch(command: Commands) -> i32 {
    let result = match command {
        Commands::Run {
            workflow,
            workers,
            cache_root,
            no_fail_fast,
            no_cache,
            diff,
            compare_ref,
            no_print_plan,
        } => {
            run_workflow(
                &workflow,
                workers,
                cache_root,
                !no_fail_fast,
                !no_cache,
                diff,
                compare_ref,
                !no_print_plan,
            )
            .await
        }
        Commands::Agent {
            api,
            agent_id,
            poll_interval,
            work_dir,
        } => {
            let mut config = AgentConfig::new(api);
            if let Some(agent_id) = agent_id {
                config.agent_id = agent_id;
            }
            config.poll_interval_secs = poll_interval;
            config.work_dir = work_dir;
            Agent::new(config).run().await.map(|_| 0)
        }
        Commands::Serve {
            bind,
            database_url,
            lease_seconds,
        } => tarmac_server::serve(ServerConfig {
            bind_addr: bind,
            database_url,
            lease_seconds,
        })
        .await
        .map(|_| 0),
        Commands::Submit {
            workflow,
            api,
            repo,
            git_ref,
        } => submit_workflow(&workflow, &api, repo, git_ref).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", style("error:").red().bold());
            exit_code_for(&e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_workflow(
    workflow_arg: &str,
    workers: Option<usize>,
    cache_root: PathBuf,
    fail_fast: bool,
    cache_enabled: bool,
    diff: bool,
    compare_ref: String,
    print_plan: bool,
) -> Result<i32> {
    let path = workflow_file::resolve(workflow_arg)?;
    let (workflow, _) = workflow_file::load(&path)?;

    // The workspace is the enclosing repository root when there is one.
    let cwd = std::env::current_dir()?;
    let workspace = match GitRepo::discover(&cwd) {
        Ok(repo) => repo.root().to_path_buf(),
        Err(_) if !diff => cwd,
        Err(e) => return Err(e),
    };

    let mut config = EngineConfig {
        workspace,
        cache_root,
        fail_fast,
        cache_enabled,
        compare_ref,
        mode: if diff {
            SelectionMode::Diff
        } else {
            SelectionMode::All
        },
        ..EngineConfig::default()
    };
    if let Some(workers) = workers {
        config.workers = workers.max(1);
    }

    let engine = Engine::new(config);
    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, stopping new jobs and terminating children");
            cancel.cancel();
        }
    });

    let (plan, graph) = engine.plan(&workflow)?;
    if print_plan {
        print_run_plan(&plan);
    }
    let summary = engine.execute(&workflow, &plan, &graph).await?;
    print_summary(&summary);

    Ok(if summary.success() { 0 } else { 1 })
}

fn print_run_plan(plan: &RunPlan) {
    println!("\n{} plan", style("▶").cyan().bold());
    for (index, level) in plan.levels.iter().enumerate() {
        println!(
            "  level {}: {}",
            index + 1,
            style(level.join(", ")).bold()
        );
    }
    for skipped in &plan.skipped {
        println!(
            "  {} {} ({})",
            style("⏭").yellow(),
            skipped.name,
            style(skipped.reason).dim()
        );
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\nResults:");
    for result in &summary.results {
        let mark = match result.outcome {
            JobOutcome::Ok => style("✓").green(),
            JobOutcome::Failed => style("✗").red(),
            JobOutcome::Skipped => style("⏭").yellow(),
            JobOutcome::Cancelled => style("⊘").yellow(),
        };
        let cache = match result.cache {
            CacheOutcome::Hit => " (cache hit)",
            CacheOutcome::Miss => " (cache miss)",
            CacheOutcome::NotApplicable => "",
        };
        let mut line = format!(
            "  {mark} {name}{cache} {dur}",
            name = style(&result.name).bold(),
            dur = style(format!("{}ms", result.duration_ms)).dim()
        );
        if let Some(step) = &result.failed_step {
            let code = result
                .exit_code
                .map(|c| format!(" exit={c}"))
                .unwrap_or_default();
            line.push_str(&format!(" [step '{step}'{code}]"));
        }
        println!("{line}");
    }
}

async fn submit_workflow(
    workflow_arg: &str,
    api: &str,
    repo: Option<String>,
    git_ref: Option<String>,
) -> Result<i32> {
    let path = workflow_file::resolve(workflow_arg)?;
    let (workflow, raw) = workflow_file::load(&path)?;
    println!("loaded {} job(s) from {}", workflow.len(), path.display());

    let (repo, git_ref) = match (repo, git_ref) {
        (Some(repo), Some(git_ref)) => (repo, git_ref),
        (repo, git_ref) => {
            let discovered = GitRepo::discover(&std::env::current_dir()?)?;
            let repo = match repo {
                Some(repo) => repo,
                None => discovered.remote_url("origin")?.ok_or_else(|| {
                    Error::Git("no origin remote; pass --repo".to_string())
                })?,
            };
            let git_ref = match git_ref {
                Some(git_ref) => git_ref,
                None => discovered.current_ref()?,
            };
            (repo, git_ref)
        }
    };

    let client = ApiClient::new(api, "submit");
    let submitted = client.submit_run(&repo, &git_ref, &raw).await?;
    println!(
        "{} submitted run {} ({} job(s))",
        style("✓").green().bold(),
        style(&submitted.run_id).bold(),
        submitted.job_ids.len()
    );
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_for(&Error::WorkflowLoad("x".into())), 2);
        assert_eq!(
            exit_code_for(&Error::UnconfinedCacheDir {
                job: "a".into(),
                dir: "../x".into()
            }),
            2
        );
        assert_eq!(exit_code_for(&Error::DuplicateJob("a".into())), 3);
        assert_eq!(
            exit_code_for(&Error::UnknownNeed {
                job: "a".into(),
                missing: "b".into()
            }),
            3
        );
        assert_eq!(exit_code_for(&Error::Cycle("a -> b -> a".into())), 3);
        assert_eq!(exit_code_for(&Error::NotARepository), 4);
        assert_eq!(exit_code_for(&Error::UnknownRef("origin/x".into())), 4);
        assert_eq!(exit_code_for(&Error::Internal("x".into())), 1);
    }
}
