//! Cache-key derivation.
//!
//! A key is the SHA-256 of a canonical serialization of everything that
//! should invalidate a job's cached result: the job identity, its step
//! descriptors, environment, required tool versions, and the input
//! digest. Every field is length-prefixed so no two distinct field
//! sequences can serialize to the same byte stream.

use sha2::{Digest, Sha256};
use tarmac_core::ports::ToolVersions;
use tarmac_core::workflow::Job;

/// Bumped whenever the canonical form below changes.
pub const KEY_SCHEMA_VERSION: u32 = 2;

/// Participates for tools the resolver cannot find.
const ABSENT: &str = "<absent>";

/// Derive the cache key for `job`.
pub async fn derive_key(
    job: &Job,
    tools: &dyn ToolVersions,
    input_digest: &str,
) -> String {
    let mut hasher = Sha256::new();

    absorb(&mut hasher, job.name.as_bytes());

    absorb_count(&mut hasher, job.steps.len());
    for step in &job.steps {
        absorb(&mut hasher, step.name.as_bytes());
        absorb(&mut hasher, step.kind.as_bytes());
        absorb(&mut hasher, step.run.as_deref().unwrap_or("").as_bytes());
        absorb(&mut hasher, step.cwd.as_deref().unwrap_or(".").as_bytes());
        // serde_json maps iterate sorted by key, so this dump is stable.
        let options = serde_json::to_string(&step.with).unwrap_or_default();
        absorb(&mut hasher, options.as_bytes());
    }

    absorb_count(&mut hasher, job.env.len());
    for (name, value) in &job.env {
        absorb(&mut hasher, name.as_bytes());
        absorb(&mut hasher, value.as_bytes());
    }

    let mut requires: Vec<&String> = job.requires.iter().collect();
    requires.sort();
    requires.dedup();
    absorb_count(&mut hasher, requires.len());
    for tool in requires {
        let version = tools.version(tool).await;
        absorb(&mut hasher, tool.as_bytes());
        absorb(&mut hasher, version.as_deref().unwrap_or(ABSENT).as_bytes());
    }

    absorb(&mut hasher, input_digest.as_bytes());
    absorb(&mut hasher, &KEY_SCHEMA_VERSION.to_be_bytes());

    hex::encode(hasher.finalize())
}

fn absorb(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn absorb_count(hasher: &mut Sha256, count: usize) {
    hasher.update((count as u64).to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tarmac_core::ports::StaticToolVersions;
    use tarmac_core::workflow::Step;

    const DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    fn make_job() -> Job {
        Job::builder("build")
            .sh("compile", "make all")
            .env("CC", "gcc")
            .requires(["make"])
            .build()
    }

    fn tools() -> StaticToolVersions {
        StaticToolVersions::new(BTreeMap::from([(
            "make".to_string(),
            "GNU Make 4.4".to_string(),
        )]))
    }

    #[tokio::test]
    async fn test_deterministic() {
        let job = make_job();
        let a = derive_key(&job, &tools(), DIGEST).await;
        let b = derive_key(&job, &tools(), DIGEST).await;
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_every_field_is_load_bearing() {
        let base = derive_key(&make_job(), &tools(), DIGEST).await;

        // Step command
        let mut job = make_job();
        job.steps[0].run = Some("make fast".to_string());
        assert_ne!(base, derive_key(&job, &tools(), DIGEST).await);

        // Step name
        let mut job = make_job();
        job.steps[0].name = "compile2".to_string();
        assert_ne!(base, derive_key(&job, &tools(), DIGEST).await);

        // Env entry
        let mut job = make_job();
        job.env.insert("CC".to_string(), "clang".to_string());
        assert_ne!(base, derive_key(&job, &tools(), DIGEST).await);

        // Tool version
        let newer = StaticToolVersions::default().with("make", "GNU Make 4.5");
        assert_ne!(base, derive_key(&make_job(), &newer, DIGEST).await);

        // Input digest
        let other = "f".repeat(64);
        assert_ne!(base, derive_key(&make_job(), &tools(), &other).await);
    }

    #[tokio::test]
    async fn test_absent_tool_still_participates() {
        let job = make_job();
        let missing = StaticToolVersions::default();
        let with_absent = derive_key(&job, &missing, DIGEST).await;
        let with_version = derive_key(&job, &tools(), DIGEST).await;
        assert_ne!(with_absent, with_version);
        // And the absent marker itself is stable.
        assert_eq!(with_absent, derive_key(&job, &missing, DIGEST).await);
    }

    #[tokio::test]
    async fn test_no_concatenation_collision_between_steps() {
        let a = Job::builder("j")
            .step(Step::shell("ab", "c"))
            .build();
        let b = Job::builder("j")
            .step(Step::shell("a", "bc"))
            .build();
        let no_tools = StaticToolVersions::default();
        assert_ne!(
            derive_key(&a, &no_tools, DIGEST).await,
            derive_key(&b, &no_tools, DIGEST).await
        );
    }
}
