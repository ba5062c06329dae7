//! SQLite-backed queue store.
//!
//! Three tables: `runs`, `jobs`, `leases`. A lease past its `expires_at`
//! counts as returned to the queue, so the lease query can hand the job
//! to another agent without any reaper process.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tarmac_core::ids::{JobId, RunId};
use tarmac_core::{Error, Result};

/// Status domain shared by runs and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Leased,
    Running,
    Ok,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Running => "running",
            JobStatus::Ok => "ok",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ok | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "leased" => Ok(JobStatus::Leased),
            "running" => Ok(JobStatus::Running),
            "ok" => Ok(JobStatus::Ok),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::Internal(format!("unknown status '{other}'"))),
        }
    }
}

/// One stored run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: RunId,
    pub repo: String,
    pub status: JobStatus,
    pub created_at: i64,
}

/// One stored job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub run_id: RunId,
    pub job_name: String,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub logs: Option<String>,
    pub created_at: i64,
}

/// A job handed to an agent, with its lease expiry.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job_id: JobId,
    pub run_id: RunId,
    pub job_name: String,
    pub payload: serde_json::Value,
    pub lease_expires_at: i64,
}

/// An active lease row.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub agent_id: String,
    pub leased_at: i64,
    pub expires_at: i64,
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Database {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Create the schema when it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                job_name TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                logs TEXT,
                created_at INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS leases (
                job_id TEXT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
                agent_id TEXT NOT NULL,
                leased_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )"#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Insert a run and its queued jobs.
    pub async fn create_run(
        &self,
        repo: &str,
        jobs: &[(String, serde_json::Value)],
    ) -> Result<(RunId, Vec<JobId>)> {
        let run_id = RunId::new();
        let now = now_epoch();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("INSERT INTO runs (id, repo, status, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(run_id.as_uuid().to_string())
            .bind(repo)
            .bind(JobStatus::Queued.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut job_ids = Vec::with_capacity(jobs.len());
        for (job_name, payload) in jobs {
            let job_id = JobId::new();
            sqlx::query(
                "INSERT INTO jobs (id, run_id, job_name, status, payload, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(job_id.as_uuid().to_string())
            .bind(run_id.as_uuid().to_string())
            .bind(job_name)
            .bind(JobStatus::Queued.as_str())
            .bind(payload.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            job_ids.push(job_id);
        }

        tx.commit().await.map_err(db_err)?;
        Ok((run_id, job_ids))
    }

    pub async fn get_run(&self, id: RunId) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT id, repo, status, created_at FROM runs WHERE id = ?1")
            .bind(id.as_uuid().to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| {
            Ok(RunRecord {
                id,
                repo: r.get("repo"),
                status: r.get::<String, _>("status").parse()?,
                created_at: r.get("created_at"),
            })
        })
        .transpose()
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT id, run_id, job_name, status, payload, logs, created_at \
             FROM jobs WHERE id = ?1",
        )
        .bind(id.as_uuid().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| self.row_to_job(&r)).transpose()
    }

    fn row_to_job(&self, r: &sqlx::sqlite::SqliteRow) -> Result<JobRecord> {
        let run_id: String = r.get("run_id");
        let payload: String = r.get("payload");
        Ok(JobRecord {
            id: r
                .get::<String, _>("id")
                .parse()
                .map_err(|e| Error::Internal(format!("bad job id: {e}")))?,
            run_id: run_id
                .parse()
                .map_err(|e| Error::Internal(format!("bad run id: {e}")))?,
            job_name: r.get("job_name"),
            status: r.get::<String, _>("status").parse()?,
            payload: serde_json::from_str(&payload)?,
            logs: r.get("logs"),
            created_at: r.get("created_at"),
        })
    }

    /// Hand the oldest leasable job to `agent_id`.
    ///
    /// A job is leasable when it is queued, or leased with an expired
    /// lease. The whole claim happens in one transaction so two agents
    /// polling at once cannot take the same job.
    pub async fn lease_job(
        &self,
        agent_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<LeasedJob>> {
        let now = now_epoch();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "SELECT j.id, j.run_id, j.job_name, j.payload FROM jobs j \
             LEFT JOIN leases l ON l.job_id = j.id \
             WHERE j.status IN ('queued', 'leased') \
               AND (l.job_id IS NULL OR l.expires_at <= ?1) \
             ORDER BY j.created_at, j.id LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job_id: String = row.get("id");
        let run_id: String = row.get("run_id");
        let job_name: String = row.get("job_name");
        let payload: String = row.get("payload");
        let expires_at = now + lease_seconds;

        sqlx::query(
            "INSERT INTO leases (job_id, agent_id, leased_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(job_id) DO UPDATE SET \
               agent_id = excluded.agent_id, \
               leased_at = excluded.leased_at, \
               expires_at = excluded.expires_at",
        )
        .bind(&job_id)
        .bind(agent_id)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("UPDATE jobs SET status = 'leased' WHERE id = ?1")
            .bind(&job_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query("UPDATE runs SET status = 'running' WHERE id = ?1 AND status = 'queued'")
            .bind(&run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(Some(LeasedJob {
            job_id: job_id
                .parse()
                .map_err(|e| Error::Internal(format!("bad job id: {e}")))?,
            run_id: run_id
                .parse()
                .map_err(|e| Error::Internal(format!("bad run id: {e}")))?,
            job_name,
            payload: serde_json::from_str(&payload)?,
            lease_expires_at: expires_at,
        }))
    }

    /// The lease currently held on a job, if any.
    pub async fn get_lease(&self, job_id: JobId) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            "SELECT agent_id, leased_at, expires_at FROM leases WHERE job_id = ?1",
        )
        .bind(job_id.as_uuid().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| LeaseRecord {
            agent_id: r.get("agent_id"),
            leased_at: r.get("leased_at"),
            expires_at: r.get("expires_at"),
        }))
    }

    /// Record a completion: terminal job status, logs, lease release, and
    /// run-status rollup (`failed` wins; otherwise `ok` once every job is
    /// out of the queue).
    pub async fn finish_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        logs: Option<&str>,
    ) -> Result<()> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::Database(format!("job not found: {job_id}")))?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("UPDATE jobs SET status = ?1, logs = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(logs)
            .bind(job_id.as_uuid().to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query("DELETE FROM leases WHERE job_id = ?1")
            .bind(job_id.as_uuid().to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let run_id = job.run_id.as_uuid().to_string();
        if status == JobStatus::Failed {
            sqlx::query("UPDATE runs SET status = 'failed' WHERE id = ?1")
                .bind(&run_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        } else {
            let remaining: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM jobs \
                 WHERE run_id = ?1 AND id != ?2 AND status NOT IN ('ok', 'cancelled')",
            )
            .bind(&run_id)
            .bind(job_id.as_uuid().to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("n");

            if remaining == 0 {
                sqlx::query("UPDATE runs SET status = 'ok' WHERE id = ?1 AND status != 'failed'")
                    .bind(&run_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
