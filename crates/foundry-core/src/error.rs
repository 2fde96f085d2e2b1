use std::path::PathBuf;

use thiserror::Error;

/// Failures that must not consume a retry. They park the orchestrator for an
/// operator instead of feeding back into the worker loop.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("sandbox unavailable: {0}")]
    Sandbox(String),
    #[error("patch could not be applied: {0}")]
    Patch(#[from] DiffError),
    #[error("worker transport error: {0}")]
    Worker(String),
    #[error("reviewer unavailable: {0}")]
    Reviewer(String),
    #[error("judge unavailable: {0}")]
    Judge(String),
    #[error("source tree unreadable: {0}")]
    Source(String),
    #[error("permission denied: {0}")]
    Permission(#[from] ContainmentError),
}

impl InfraError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sandbox(_) => "sandbox",
            Self::Patch(_) => "patch",
            Self::Worker(_) => "worker",
            Self::Reviewer(_) => "reviewer",
            Self::Judge(_) => "judge",
            Self::Source(_) => "source",
            Self::Permission(_) => "permission",
        }
    }
}

#[derive(Debug, Error)]
pub enum ContainmentError {
    #[error("ACL violation: {} is outside {}", .path.display(), .root.display())]
    Escapes { path: PathBuf, root: PathBuf },
    #[error("cannot resolve {}: {reason}", .path.display())]
    Unresolvable { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("malformed diff for {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("hunks for {path} do not apply at any strip level")]
    Apply { path: String },
    #[error("diff modifies {path} but no original content was supplied")]
    MissingOriginal { path: String },
}
