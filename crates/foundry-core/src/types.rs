use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextSlice;

/// Bumped whenever a persisted field changes meaning. Older and newer files
/// still load; unknown fields are ignored and missing ones take defaults.
pub const STATE_SCHEMA_VERSION: u32 = 1;

// ── Backlog ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    #[default]
    Open,
    InProgress,
    Done,
    Failed,
}

/// A unit of backlog work. Only the orchestrator writes `status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Lower values are planned first.
    pub priority: u32,
    pub dependencies: BTreeSet<String>,
    pub source_section_id: String,
    pub status: TicketStatus,
}

impl Ticket {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }
}

// ── Task execution ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Queued,
    Working,
    Verifying,
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    #[default]
    Feature,
    Refactor,
    /// The green patch restored by the stability protocol.
    Restore,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratedArtifact {
    pub diff_content: String,
    pub change_type: ChangeType,
    pub pr_link: Option<String>,
    pub pr_number: Option<u64>,
    /// Commit hash reported by the worker, or a digest of the diff when the
    /// worker did not report one. Used to dedup repeated polls.
    pub output_key: String,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl GeneratedArtifact {
    pub fn pr(&self) -> Option<PrRef> {
        self.pr_number.map(|number| PrRef {
            number,
            url: self.pr_link.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyRecord {
    pub score: f64,
    pub threshold: f64,
    pub triggered_breaker: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRunResult {
    pub passed: bool,
    pub total: u32,
    pub failed: u32,
    pub log: String,
    pub target: String,
}

/// Live state of one dispatched unit of work. Mutated only by lifecycle nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskExecutionState {
    pub session_id: String,
    pub external_task_id: Option<String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub architect_refactor_attempts: u32,
    pub is_refactoring: bool,
    pub green_patch: Option<String>,
    /// Violations from the first rejection, carried into the tech-debt
    /// marker if the refactor is abandoned.
    pub deferred_violations: Vec<Violation>,
    pub last_verified_commit: Option<String>,
    pub last_verified_pr_number: Option<u64>,
    pub active_context_slice: ContextSlice,
    pub generated_artifacts: Vec<GeneratedArtifact>,
    pub feedback_log: Vec<String>,
    pub entropy_history: Vec<EntropyRecord>,
    pub test_results_history: Vec<TestRunResult>,
    /// Last infrastructure failure, cleared when an operator resumes.
    pub infra_error: Option<String>,
}

impl TaskExecutionState {
    pub fn new(session_id: impl Into<String>, max_retries: u32, slice: ContextSlice) -> Self {
        Self {
            session_id: session_id.into(),
            max_retries,
            active_context_slice: slice,
            ..Self::default()
        }
    }

    pub fn latest_artifact(&self) -> Option<&GeneratedArtifact> {
        self.generated_artifacts.last()
    }

    pub fn latest_diff(&self) -> Option<&str> {
        self.latest_artifact().map(|a| a.diff_content.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    #[default]
    Pending,
    Green,
    Red,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationGate {
    pub status: GateStatus,
    pub blocking_reason: Option<String>,
}

impl VerificationGate {
    pub fn green(&mut self) {
        self.status = GateStatus::Green;
        self.blocking_reason = None;
    }

    pub fn red(&mut self, reason: impl Into<String>) {
        self.status = GateStatus::Red;
        self.blocking_reason = Some(reason.into());
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Result of one uncertainty check. Appended to `entropy_history` in summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticHealthMetric {
    pub entropy_score: f64,
    pub threshold: f64,
    pub sample_size: usize,
    pub is_tunneling: bool,
    pub cluster_distribution: BTreeMap<String, f64>,
}

// ── Review ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    #[default]
    Approved,
    ApprovedWithTechDebt,
    NeedsRefactor,
    Rejected,
}

impl Verdict {
    pub fn is_green(self) -> bool {
        matches!(self, Self::Approved | Self::ApprovedWithTechDebt)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Approved => 0,
            Self::ApprovedWithTechDebt => 1,
            Self::NeedsRefactor => 2,
            Self::Rejected => 3,
        }
    }

    /// The more severe of the two verdicts.
    pub fn worst(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::ApprovedWithTechDebt => "APPROVED_WITH_TECH_DEBT",
            Self::NeedsRefactor => "NEEDS_REFACTOR",
            Self::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Violation {
    pub rule_id: String,
    pub severity: String,
    pub description: String,
    pub file_path: String,
    pub suggested_fix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewVerdict {
    pub verdict: Verdict,
    pub quality_score: f64,
    pub violations: Vec<Violation>,
}

impl ReviewVerdict {
    pub fn approved() -> Self {
        Self {
            verdict: Verdict::Approved,
            quality_score: 10.0,
            violations: Vec::new(),
        }
    }

    /// Fold per-file verdicts: the worst verdict and lowest score win,
    /// violations accumulate.
    pub fn combine(self, other: ReviewVerdict) -> Self {
        let mut violations = self.violations;
        violations.extend(other.violations);
        Self {
            verdict: self.verdict.worst(other.verdict),
            quality_score: self.quality_score.min(other.quality_score),
            violations,
        }
    }
}

// ── Worker protocol ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRef {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub ticket_id: String,
    pub title: String,
    pub session_id: String,
    pub context: ContextSlice,
    /// Hard constraints from earlier attempts, highest priority first.
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    #[default]
    Queued,
    Working,
    ReviewReady,
    Completed,
    Blocked,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkStatus {
    pub status: WorkerStatus,
    pub diff: Option<String>,
    pub pr: Option<PrRef>,
    pub commit_hash: Option<String>,
    /// Why the worker is blocked, when it says so.
    pub note: Option<String>,
}

// ── Orchestration ────────────────────────────────────────────────────────

/// Durable record of a finished ticket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketRecord {
    pub ticket: Ticket,
    pub retry_count: u32,
    pub feedback_log: Vec<String>,
    pub entropy_history: Vec<EntropyRecord>,
    pub tech_debt: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TicketRecord {
    pub fn from_execution(ticket: Ticket, exec: &TaskExecutionState, tech_debt: bool) -> Self {
        Self {
            ticket,
            retry_count: exec.retry_count,
            feedback_log: exec.feedback_log.clone(),
            entropy_history: exec.entropy_history.clone(),
            tech_debt,
            finished_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationState {
    pub task_queue: Vec<Ticket>,
    pub sprint_backlog: Vec<Ticket>,
    pub completed_tasks_log: Vec<TicketRecord>,
    pub failed_tasks_log: Vec<TicketRecord>,
    pub escalation_triggered: bool,
    pub circuit_breaker_triggered: bool,
    /// Finished-ticket count at the last retrospective.
    pub retrospective_watermark: usize,
}

impl OrchestrationState {
    pub fn is_finished(&self, id: &str) -> bool {
        self.completed_tasks_log.iter().any(|r| r.ticket.id == id)
            || self.failed_tasks_log.iter().any(|r| r.ticket.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.task_queue.iter().any(|t| t.id == id)
            || self.sprint_backlog.iter().any(|t| t.id == id)
            || self.is_finished(id)
    }

    pub fn finished_count(&self) -> usize {
        self.completed_tasks_log.len() + self.failed_tasks_log.len()
    }

    /// A ticket id may appear in at most one collection, at most once.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let ids = self
            .task_queue
            .iter()
            .chain(self.sprint_backlog.iter())
            .map(|t| t.id.as_str())
            .chain(self.completed_tasks_log.iter().map(|r| r.ticket.id.as_str()))
            .chain(self.failed_tasks_log.iter().map(|r| r.ticket.id.as_str()));
        for id in ids {
            if id.is_empty() {
                return Err("ticket with empty id".into());
            }
            if !seen.insert(id) {
                return Err(format!("ticket {id} appears in more than one place"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Dispatch,
    Watch,
    UncertaintyGuard,
    FunctionalVerify,
    StructuralGate,
    Feedback,
}

impl Node {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Watch => "watch",
            Self::UncertaintyGuard => "uncertainty_guard",
            Self::FunctionalVerify => "functional_verify",
            Self::StructuralGate => "structural_gate",
            Self::Feedback => "feedback",
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineeringState {
    pub active_ticket: Option<String>,
    pub task: Option<TaskExecutionState>,
    pub gate: VerificationGate,
    /// Node to run next for the active ticket.
    pub resume_at: Option<Node>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStatus {
    #[default]
    Running,
    AwaitingOperator,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMeta {
    pub system_version: String,
    pub system_status: SystemStatus,
    pub operator_note: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_retrospective: Option<RetrospectiveReport>,
}

/// The full persisted snapshot. Only the orchestrator persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateState {
    pub schema_version: u32,
    pub orchestration: OrchestrationState,
    pub engineering: EngineeringState,
    pub meta: SystemMeta,
}

impl Default for AggregateState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            orchestration: OrchestrationState::default(),
            engineering: EngineeringState::default(),
            meta: SystemMeta {
                system_version: env!("CARGO_PKG_VERSION").to_string(),
                ..SystemMeta::default()
            },
        }
    }
}

impl AggregateState {
    pub fn validate(&self) -> Result<(), String> {
        self.orchestration.validate()?;
        if let Some(id) = &self.engineering.active_ticket {
            if !self.orchestration.sprint_backlog.iter().any(|t| &t.id == id)
                && !self.orchestration.is_finished(id)
            {
                return Err(format!("active ticket {id} is not in the sprint backlog"));
            }
        }
        if let Some(task) = &self.engineering.task {
            if task.max_retries > 0 && task.retry_count > task.max_retries {
                return Err(format!(
                    "retry_count {} exceeds max_retries {}",
                    task.retry_count, task.max_retries
                ));
            }
        }
        Ok(())
    }
}

// ── Retrospective ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptimization {
    pub target_role: String,
    pub issue_detected: String,
    pub suggested_update: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrospectiveReport {
    pub sprint_id: String,
    pub success_rate: f64,
    pub summary: String,
    pub optimizations: Vec<ProcessOptimization>,
}

// ── Events ───────────────────────────────────────────────────────────────

/// Emitted by lifecycle nodes, applied by the orchestrator and rebroadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Dispatched {
        ticket_id: String,
        external_task_id: String,
    },
    OutputRecorded {
        ticket_id: String,
        output_key: String,
    },
    EntropyMeasured {
        ticket_id: String,
        score: f64,
        threshold: f64,
        tripped: bool,
    },
    TestsRun {
        ticket_id: String,
        target: String,
        passed: bool,
    },
    Reviewed {
        ticket_id: String,
        file_path: String,
        verdict: Verdict,
    },
    Merged {
        ticket_id: String,
        pr_number: u64,
        tech_debt: bool,
    },
    FeedbackPosted {
        ticket_id: String,
        retry_count: u32,
    },
    Escalated {
        ticket_id: String,
        retry_count: u32,
    },
    InfraFailure {
        ticket_id: String,
        node: Node,
        message: String,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::Dispatched { .. } => "dispatched",
            Self::OutputRecorded { .. } => "output_recorded",
            Self::EntropyMeasured { .. } => "entropy_measured",
            Self::TestsRun { .. } => "tests_run",
            Self::Reviewed { .. } => "reviewed",
            Self::Merged { .. } => "merged",
            Self::FeedbackPosted { .. } => "feedback_posted",
            Self::Escalated { .. } => "escalated",
            Self::InfraFailure { .. } => "infra_failure",
        }
    }

    pub fn ticket_id(&self) -> &str {
        match self {
            Self::Dispatched { ticket_id, .. }
            | Self::OutputRecorded { ticket_id, .. }
            | Self::EntropyMeasured { ticket_id, .. }
            | Self::TestsRun { ticket_id, .. }
            | Self::Reviewed { ticket_id, .. }
            | Self::Merged { ticket_id, .. }
            | Self::FeedbackPosted { ticket_id, .. }
            | Self::Escalated { ticket_id, .. }
            | Self::InfraFailure { ticket_id, .. } => ticket_id,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Dispatched { external_task_id, .. } => format!("dispatched as {external_task_id}"),
            Self::OutputRecorded { output_key, .. } => format!("new output {output_key}"),
            Self::EntropyMeasured { score, threshold, tripped, .. } => {
                format!("entropy {score:.4} (threshold {threshold:.4}, tripped={tripped})")
            }
            Self::TestsRun { target, passed, .. } => format!("tests {target}: passed={passed}"),
            Self::Reviewed { file_path, verdict, .. } => format!("{file_path}: {}", verdict.as_str()),
            Self::Merged { pr_number, tech_debt, .. } => format!("merged PR #{pr_number} (tech_debt={tech_debt})"),
            Self::FeedbackPosted { retry_count, .. } => format!("feedback posted, retry {retry_count}"),
            Self::Escalated { retry_count, .. } => format!("escalated after {retry_count} retries"),
            Self::InfraFailure { node, message, .. } => format!("{node}: {message}"),
        }
    }
}
