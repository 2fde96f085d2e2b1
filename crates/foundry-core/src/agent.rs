use anyhow::Result;
use async_trait::async_trait;

use crate::types::{PrRef, ReviewVerdict, Verdict, WorkRequest, WorkStatus};

/// External code-generation worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Start a new unit of work; returns the worker's opaque task id.
    async fn dispatch(&self, request: &WorkRequest) -> Result<String>;

    async fn poll(&self, external_task_id: &str) -> Result<WorkStatus>;

    async fn post_feedback(&self, external_task_id: &str, text: &str) -> Result<()>;

    async fn review_pr(&self, pr: &PrRef, verdict: Verdict, body: &str) -> Result<()>;

    async fn merge_pr(&self, pr: &PrRef) -> Result<()>;

    /// Ask the worker to put `green_patch` back on the PR before it is merged.
    async fn fallback_to_green(&self, pr: &PrRef, green_patch: &str) -> Result<()>;
}

/// Architectural reviewer. Receives whole files, never bare diffs.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, file_path: &str, full_source: &str, context: &str) -> Result<ReviewVerdict>;
}

/// Sampling and equivalence oracle for the uncertainty detector.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn sample(&self, prompt: &str, n: usize, temperature: f64) -> Result<Vec<String>>;

    async fn entails_both_ways(&self, a: &str, b: &str, context: &str) -> Result<bool>;
}

/// Read-only view of the repository the worker is changing.
pub trait SourceTree: Send + Sync {
    /// `Ok(None)` when the path does not exist.
    fn read(&self, path: &str) -> Result<Option<String>>;

    fn exists(&self, path: &str) -> bool {
        matches!(self.read(path), Ok(Some(_)))
    }

    /// True when `dir` holds at least one entry.
    fn has_dir(&self, dir: &str) -> bool;
}
