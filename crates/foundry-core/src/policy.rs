//! Retry, refactor-cap and circuit-breaker rules.
//!
//! Pure decisions over [`TaskExecutionState`]; the lifecycle applies them.

use crate::types::{EntropyRecord, TaskExecutionState};

/// Architectural rejections that may be answered with a refactor before the
/// green patch is accepted as-is.
pub const MAX_ARCHITECT_REFACTOR_ATTEMPTS: u32 = 1;

/// Expected, retryable outcomes that consume one retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFailure {
    TestFailure,
    ArchitecturalRejection,
    Tunneling,
    /// Worker finished with an empty diff.
    NoOp,
    /// Nothing in the change or context looks like a test.
    NoTestTarget,
}

impl ContentFailure {
    pub fn label(self) -> &'static str {
        match self {
            Self::TestFailure => "functional verification failed",
            Self::ArchitecturalRejection => "architectural review failed",
            Self::Tunneling => "semantic entropy too high",
            Self::NoOp => "no-op completion",
            Self::NoTestTarget => "no test target",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Post feedback and keep watching the same external task.
    Retry,
    /// Budget exhausted; the ticket fails and is escalated.
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionDecision {
    /// Keep the passing diff as the green patch and ask for one refactor.
    Refactor,
    /// Refactor budget spent; merge the green patch with a tech-debt marker.
    AcceptGreen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFailureDecision {
    Feedback,
    /// A refactor broke tests that the green patch passed.
    RestoreGreen,
}

/// Count one content failure against the budget.
pub fn record_content_failure(exec: &mut TaskExecutionState) -> RetryDecision {
    exec.retry_count += 1;
    if exec.retry_count >= exec.max_retries {
        RetryDecision::Escalate
    } else {
        RetryDecision::Retry
    }
}

pub fn on_rejection(exec: &TaskExecutionState) -> RejectionDecision {
    if exec.architect_refactor_attempts >= MAX_ARCHITECT_REFACTOR_ATTEMPTS {
        RejectionDecision::AcceptGreen
    } else {
        RejectionDecision::Refactor
    }
}

pub fn on_test_failure(exec: &TaskExecutionState) -> TestFailureDecision {
    if exec.is_refactoring && exec.green_patch.is_some() {
        TestFailureDecision::RestoreGreen
    } else {
        TestFailureDecision::Feedback
    }
}

/// The breaker reflects only the most recent uncertainty check.
pub fn circuit_breaker(history: &[EntropyRecord]) -> bool {
    history.last().is_some_and(|r| r.triggered_breaker)
}
