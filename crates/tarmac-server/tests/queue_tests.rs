//! Queue-store contract: leasing, expiry reclaim, ownership, rollup.

use tarmac_server::{Database, JobStatus};

async fn make_db(dir: &tempfile::TempDir) -> Database {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("q.db").display());
    let db = Database::connect(&url).await.unwrap();
    db.migrate().await.unwrap();
    db
}

fn payload(name: &str) -> (String, serde_json::Value) {
    (
        name.to_string(),
        serde_json::json!({ "repo": "r", "ref": "main", "job": { "name": name } }),
    )
}

#[tokio::test]
async fn test_lease_oldest_first_and_empty_queue() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(&dir).await;
    let (_, job_ids) = db
        .create_run("repo", &[payload("first"), payload("second")])
        .await
        .unwrap();

    let a = db.lease_job("agent-1", 600).await.unwrap().unwrap();
    assert_eq!(a.job_id, job_ids[0]);
    assert_eq!(a.job_name, "first");

    let b = db.lease_job("agent-2", 600).await.unwrap().unwrap();
    assert_eq!(b.job_id, job_ids[1]);

    assert!(db.lease_job("agent-3", 600).await.unwrap().is_none());
}

#[tokio::test]
async fn test_active_lease_not_reclaimed_expired_is() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(&dir).await;
    let (_, job_ids) = db.create_run("repo", &[payload("only")]).await.unwrap();

    // Zero-TTL lease expires immediately and is reclaimable.
    let first = db.lease_job("agent-1", 0).await.unwrap().unwrap();
    assert_eq!(first.job_id, job_ids[0]);

    let reclaimed = db.lease_job("agent-2", 600).await.unwrap().unwrap();
    assert_eq!(reclaimed.job_id, job_ids[0]);
    assert_eq!(
        db.get_lease(job_ids[0]).await.unwrap().unwrap().agent_id,
        "agent-2"
    );

    // The fresh lease is not reclaimable.
    assert!(db.lease_job("agent-3", 600).await.unwrap().is_none());
}

#[tokio::test]
async fn test_complete_releases_lease_and_rolls_up_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(&dir).await;
    let (run_id, job_ids) = db
        .create_run("repo", &[payload("a"), payload("b")])
        .await
        .unwrap();

    let a = db.lease_job("agent", 600).await.unwrap().unwrap();
    db.finish_job(a.job_id, JobStatus::Ok, Some("log text"))
        .await
        .unwrap();

    assert!(db.get_lease(a.job_id).await.unwrap().is_none());
    let stored = db.get_job(a.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Ok);
    assert_eq!(stored.logs.as_deref(), Some("log text"));

    // Run stays running until the last job lands.
    assert_eq!(db.get_run(run_id).await.unwrap().unwrap().status, JobStatus::Running);

    let b = db.lease_job("agent", 600).await.unwrap().unwrap();
    assert_eq!(b.job_id, job_ids[1]);
    db.finish_job(b.job_id, JobStatus::Ok, None).await.unwrap();
    assert_eq!(db.get_run(run_id).await.unwrap().unwrap().status, JobStatus::Ok);
}

#[tokio::test]
async fn test_failed_job_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(&dir).await;
    let (run_id, _) = db
        .create_run("repo", &[payload("a"), payload("b")])
        .await
        .unwrap();

    let a = db.lease_job("agent", 600).await.unwrap().unwrap();
    db.finish_job(a.job_id, JobStatus::Failed, Some("boom"))
        .await
        .unwrap();
    assert_eq!(db.get_run(run_id).await.unwrap().unwrap().status, JobStatus::Failed);

    // A later success does not resurrect the run.
    let b = db.lease_job("agent", 600).await.unwrap().unwrap();
    db.finish_job(b.job_id, JobStatus::Ok, None).await.unwrap();
    assert_eq!(db.get_run(run_id).await.unwrap().unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_completed_jobs_are_never_leased_again() {
    let dir = tempfile::tempdir().unwrap();
    let db = make_db(&dir).await;
    db.create_run("repo", &[payload("a")]).await.unwrap();

    let a = db.lease_job("agent", 600).await.unwrap().unwrap();
    db.finish_job(a.job_id, JobStatus::Ok, None).await.unwrap();
    assert!(db.lease_job("agent", 600).await.unwrap().is_none());
}
