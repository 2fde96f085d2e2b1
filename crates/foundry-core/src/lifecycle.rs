//! Per-ticket state machine: dispatch → watch → uncertainty guard →
//! functional verify → structural gate, with feedback looping back to watch.
//!
//! Each node mutates the working [`TaskExecutionState`] and
//! [`VerificationGate`] it is handed and returns a [`Transition`]. The
//! orchestrator owns persistence and applies the emitted events.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::{
    agent::{Reviewer, SourceTree, WorkerClient},
    diff::{self, PatchedFiles},
    entropy::UncertaintyDetector,
    error::InfraError,
    policy::{self, ContentFailure, RejectionDecision, RetryDecision, TestFailureDecision},
    sandbox::{Sandbox, SandboxHandle},
    types::{
        ChangeType, EntropyRecord, GeneratedArtifact, LifecycleEvent, Node, ReviewVerdict,
        TaskExecutionState, TaskStatus, TestRunResult, Ticket, VerificationGate, Verdict,
        Violation, WorkRequest, WorkerStatus,
    },
    verify,
};

/// Tail of the test log quoted back to the worker.
pub const FEEDBACK_EVIDENCE_CHARS: usize = 1000;
const CLAIM_DIFF_CHARS: usize = 8000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Merged { tech_debt: bool },
    /// Retry budget exhausted.
    Escalated,
    /// Attempt stopped without consuming a retry; resume at `node`.
    Infrastructure { node: Node, reason: String },
    /// Worker says it cannot proceed without a human.
    Blocked { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Run(Node),
    /// Suspend, then run `node`. The only suspension point in the machine.
    Wait { node: Node, delay: Duration },
    Finish(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Step,
    pub events: Vec<LifecycleEvent>,
}

impl Transition {
    fn run(node: Node) -> Self {
        Self { next: Step::Run(node), events: Vec::new() }
    }

    fn wait(node: Node, delay: Duration) -> Self {
        Self { next: Step::Wait { node, delay }, events: Vec::new() }
    }

    fn finish(outcome: Outcome) -> Self {
        Self { next: Step::Finish(outcome), events: Vec::new() }
    }

    fn with_event(mut self, event: LifecycleEvent) -> Self {
        self.events.push(event);
        self
    }

    fn with_events(mut self, mut events: Vec<LifecycleEvent>) -> Self {
        events.append(&mut self.events);
        self.events = events;
        self
    }
}

pub struct TaskLifecycle {
    worker: Arc<dyn WorkerClient>,
    sandbox: Arc<dyn Sandbox>,
    reviewer: Arc<dyn Reviewer>,
    source: Arc<dyn SourceTree>,
    detector: UncertaintyDetector,
    poll_interval: Duration,
}

impl TaskLifecycle {
    pub fn new(
        worker: Arc<dyn WorkerClient>,
        sandbox: Arc<dyn Sandbox>,
        reviewer: Arc<dyn Reviewer>,
        source: Arc<dyn SourceTree>,
        detector: UncertaintyDetector,
    ) -> Self {
        Self {
            worker,
            sandbox,
            reviewer,
            source,
            detector,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn source(&self) -> Arc<dyn SourceTree> {
        Arc::clone(&self.source)
    }

    /// Run one node. Infrastructure errors become a terminal
    /// [`Outcome::Infrastructure`] and never touch `retry_count`.
    pub async fn step(
        &self,
        node: Node,
        ticket: &Ticket,
        exec: &mut TaskExecutionState,
        gate: &mut VerificationGate,
    ) -> Transition {
        let result = match node {
            Node::Dispatch => self.dispatch(ticket, exec).await,
            Node::Watch => self.watch(ticket, exec, gate).await,
            Node::UncertaintyGuard => self.uncertainty_guard(ticket, exec, gate).await,
            Node::FunctionalVerify => self.functional_verify(ticket, exec, gate).await,
            Node::StructuralGate => self.structural_gate(ticket, exec, gate).await,
            Node::Feedback => self.feedback(ticket, exec, gate).await,
        };
        match result {
            Ok(t) => t,
            Err(e) => {
                let reason = e.to_string();
                error!(ticket_id = %ticket.id, node = %node, kind = e.kind(), "infrastructure failure: {reason}");
                exec.status = TaskStatus::Failed;
                exec.infra_error = Some(reason.clone());
                Transition::finish(Outcome::Infrastructure { node, reason: reason.clone() }).with_event(
                    LifecycleEvent::InfraFailure {
                        ticket_id: ticket.id.clone(),
                        node,
                        message: reason,
                    },
                )
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    async fn dispatch(&self, ticket: &Ticket, exec: &mut TaskExecutionState) -> Result<Transition, InfraError> {
        if let Some(id) = &exec.external_task_id {
            info!(ticket_id = %ticket.id, external_task_id = %id, "reusing existing worker task");
            exec.status = TaskStatus::Working;
            return Ok(Transition::run(Node::Watch));
        }

        let request = build_work_request(ticket, exec);
        let id = self
            .worker
            .dispatch(&request)
            .await
            .map_err(|e| InfraError::Worker(format!("dispatch failed: {e:#}")))?;

        info!(ticket_id = %ticket.id, external_task_id = %id, "dispatched to worker");
        exec.external_task_id = Some(id.clone());
        exec.status = TaskStatus::Working;
        Ok(Transition::run(Node::Watch).with_event(LifecycleEvent::Dispatched {
            ticket_id: ticket.id.clone(),
            external_task_id: id,
        }))
    }

    // ── Watch ────────────────────────────────────────────────────────────

    async fn watch(
        &self,
        ticket: &Ticket,
        exec: &mut TaskExecutionState,
        gate: &mut VerificationGate,
    ) -> Result<Transition, InfraError> {
        let Some(id) = exec.external_task_id.clone() else {
            return Ok(Transition::run(Node::Dispatch));
        };
        let status = self
            .worker
            .poll(&id)
            .await
            .map_err(|e| InfraError::Worker(format!("poll failed: {e:#}")))?;

        match status.status {
            WorkerStatus::Queued | WorkerStatus::Working => {
                exec.status = TaskStatus::Working;
                Ok(Transition::wait(Node::Watch, self.poll_interval))
            }
            WorkerStatus::Blocked => {
                exec.status = TaskStatus::Blocked;
                let reason = status
                    .note
                    .unwrap_or_else(|| format!("worker task {id} reported BLOCKED"));
                warn!(ticket_id = %ticket.id, "worker blocked: {reason}");
                Ok(Transition::finish(Outcome::Blocked { reason }))
            }
            WorkerStatus::ReviewReady | WorkerStatus::Completed => {
                let diff_text = status.diff.unwrap_or_default();
                let key = status
                    .commit_hash
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| format!("diff:{}", digest(&diff_text)));

                if exec.last_verified_commit.as_deref() == Some(key.as_str()) {
                    exec.status = TaskStatus::Working;
                    return Ok(Transition::wait(Node::Watch, self.poll_interval));
                }

                let mut transition = Transition::run(Node::UncertaintyGuard);
                let already_recorded = exec.latest_artifact().is_some_and(|a| a.output_key == key);
                if !already_recorded {
                    info!(ticket_id = %ticket.id, output = %key, "new worker output");
                    exec.generated_artifacts.push(GeneratedArtifact {
                        diff_content: diff_text.clone(),
                        change_type: if exec.is_refactoring { ChangeType::Refactor } else { ChangeType::Feature },
                        pr_link: status.pr.as_ref().map(|p| p.url.clone()),
                        pr_number: status.pr.as_ref().map(|p| p.number),
                        output_key: key.clone(),
                        recorded_at: Some(Utc::now()),
                    });
                    transition = transition.with_event(LifecycleEvent::OutputRecorded {
                        ticket_id: ticket.id.clone(),
                        output_key: key,
                    });
                }
                exec.status = TaskStatus::Verifying;
                gate.reset();

                if diff_text.trim().is_empty() {
                    warn!(ticket_id = %ticket.id, "worker completed with an empty diff");
                    exec.status = TaskStatus::Failed;
                    exec.feedback_log.push(
                        "No-op completion: the task was reported complete but the diff is empty. \
                         Nothing changed, so nothing can be verified. Implement the requested change."
                            .to_string(),
                    );
                    gate.red(ContentFailure::NoOp.label());
                    transition.next = Step::Run(Node::Feedback);
                }
                Ok(transition)
            }
        }
    }

    // ── Uncertainty guard ────────────────────────────────────────────────

    async fn uncertainty_guard(
        &self,
        ticket: &Ticket,
        exec: &mut TaskExecutionState,
        gate: &mut VerificationGate,
    ) -> Result<Transition, InfraError> {
        let diff_text = exec.latest_diff().unwrap_or_default().to_string();
        let intent = exec.active_context_slice.intent.clone();
        let metric = self.detector.measure(&claim_prompt(&intent, &diff_text), &intent).await?;

        exec.entropy_history.push(EntropyRecord {
            score: metric.entropy_score,
            threshold: metric.threshold,
            triggered_breaker: metric.is_tunneling,
        });
        let event = LifecycleEvent::EntropyMeasured {
            ticket_id: ticket.id.clone(),
            score: metric.entropy_score,
            threshold: metric.threshold,
            tripped: metric.is_tunneling,
        };

        if metric.is_tunneling {
            warn!(
                ticket_id = %ticket.id,
                entropy = metric.entropy_score,
                threshold = metric.threshold,
                "tunneling detected, skipping verification"
            );
            exec.status = TaskStatus::Failed;
            exec.feedback_log.push(format!(
                "CRITICAL: Your previous output showed circular reasoning (High Semantic Entropy: {:.4} > {:.4}). \
                 Propose a fundamentally different approach.",
                metric.entropy_score, metric.threshold
            ));
            gate.red(ContentFailure::Tunneling.label());
            return Ok(Transition::run(Node::Feedback).with_event(event));
        }
        Ok(Transition::run(Node::FunctionalVerify).with_event(event))
    }

    // ── Functional verify ────────────────────────────────────────────────

    async fn functional_verify(
        &self,
        ticket: &Ticket,
        exec: &mut TaskExecutionState,
        gate: &mut VerificationGate,
    ) -> Result<Transition, InfraError> {
        let diff_text = exec.latest_diff().unwrap_or_default().to_string();
        let patched = self.reconstruct(&diff_text)?;
        let present: Vec<String> = patched.files.keys().cloned().collect();

        let target = match verify::infer_test_target(&present, &exec.active_context_slice, self.source.as_ref()) {
            Ok(t) => t,
            Err(diagnostic) => {
                warn!(ticket_id = %ticket.id, "{diagnostic}");
                exec.status = TaskStatus::Failed;
                exec.feedback_log.push(format!(
                    "Functional Verification Failed.\n\n{diagnostic}. Add or update a test that exercises the change."
                ));
                gate.red(ContentFailure::NoTestTarget.label());
                return Ok(Transition::run(Node::Feedback));
            }
        };

        let run = self.run_suite(&patched, &present, &target).await?;
        info!(
            ticket_id = %ticket.id,
            target = %target,
            passed = run.passed,
            total = run.total,
            failed = run.failed,
            "functional verification finished"
        );
        let event = LifecycleEvent::TestsRun {
            ticket_id: ticket.id.clone(),
            target: target.clone(),
            passed: run.passed,
        };
        let log_tail = tail_chars(&run.log, FEEDBACK_EVIDENCE_CHARS);
        exec.test_results_history.push(run.clone());

        if run.passed {
            exec.status = TaskStatus::Completed;
            gate.green();
            return Ok(Transition::run(Node::StructuralGate).with_event(event));
        }

        if policy::on_test_failure(exec) == TestFailureDecision::RestoreGreen {
            warn!(ticket_id = %ticket.id, "refactor broke functional verification, restoring green patch");
            let restored = self
                .restore_green(ticket, exec, gate, "Refactor broke functional verification", &[])
                .await?;
            return Ok(restored.with_events(vec![event]));
        }

        exec.status = TaskStatus::Failed;
        exec.feedback_log.push(format!(
            "Functional Verification Failed.\n\nEVIDENCE SNIPPETS:\n```\n{log_tail}\n```"
        ));
        gate.red(ContentFailure::TestFailure.label());
        Ok(Transition::run(Node::Feedback).with_event(event))
    }

    async fn run_suite(
        &self,
        patched: &PatchedFiles,
        affected: &[String],
        target: &str,
    ) -> Result<TestRunResult, InfraError> {
        let handle = self
            .sandbox
            .provision()
            .await
            .map_err(|e| InfraError::Sandbox(format!("provision failed: {e:#}")))?;
        let result = self.exercise(&handle, patched, affected, target).await;
        if let Err(e) = self.sandbox.dispose(&handle).await {
            warn!(sandbox = %handle.id, "failed to dispose sandbox: {e:#}");
        }
        result
    }

    async fn exercise(
        &self,
        handle: &SandboxHandle,
        patched: &PatchedFiles,
        affected: &[String],
        target: &str,
    ) -> Result<TestRunResult, InfraError> {
        let sandbox_err = |e: anyhow::Error| InfraError::Sandbox(format!("{e:#}"));

        self.sandbox
            .load_files(handle, &patched.files)
            .await
            .map_err(sandbox_err)?;
        for path in &patched.removed {
            self.sandbox
                .run(handle, &format!("rm -f -- {}", verify::shell_quote(path)))
                .await
                .map_err(sandbox_err)?;
        }
        for cmd in verify::install_commands(affected) {
            let out = self.sandbox.run(handle, cmd).await.map_err(sandbox_err)?;
            if !out.success() {
                return Ok(TestRunResult {
                    passed: false,
                    total: 0,
                    failed: 0,
                    log: format!("dependency install failed: {cmd}\n{}", out.combined_output()),
                    target: target.to_string(),
                });
            }
        }
        self.sandbox.run_tests(handle, target).await.map_err(sandbox_err)
    }

    // ── Structural gate ──────────────────────────────────────────────────

    async fn structural_gate(
        &self,
        ticket: &Ticket,
        exec: &mut TaskExecutionState,
        gate: &mut VerificationGate,
    ) -> Result<Transition, InfraError> {
        let diff_text = exec.latest_diff().unwrap_or_default().to_string();
        let patched = self.reconstruct(&diff_text)?;
        let context = review_context(ticket, exec);

        let mut combined = ReviewVerdict::approved();
        let mut events = Vec::new();
        for (path, source) in &patched.files {
            let verdict = self
                .reviewer
                .review(path, source, &context)
                .await
                .map_err(|e| InfraError::Reviewer(format!("{path}: {e:#}")))?;
            events.push(LifecycleEvent::Reviewed {
                ticket_id: ticket.id.clone(),
                file_path: path.clone(),
                verdict: verdict.verdict,
            });
            combined = combined.combine(verdict);
        }
        info!(
            ticket_id = %ticket.id,
            verdict = combined.verdict.as_str(),
            quality = combined.quality_score,
            violations = combined.violations.len(),
            "structural review finished"
        );

        let pr = exec.latest_artifact().and_then(GeneratedArtifact::pr);

        if combined.verdict.is_green() {
            let pr = pr.ok_or_else(|| InfraError::Worker("approved output has no pull request to merge".into()))?;
            self.worker
                .review_pr(&pr, combined.verdict, &review_body(&combined))
                .await
                .map_err(|e| InfraError::Worker(format!("review_pr failed: {e:#}")))?;
            self.worker
                .merge_pr(&pr)
                .await
                .map_err(|e| InfraError::Worker(format!("merge failed: {e:#}")))?;

            let tech_debt = combined.verdict == Verdict::ApprovedWithTechDebt;
            if tech_debt {
                exec.feedback_log.push(tech_debt_marker("Approved with tech debt", &combined.violations));
            }
            exec.status = TaskStatus::Completed;
            exec.is_refactoring = false;
            gate.green();
            conclude(exec);
            info!(ticket_id = %ticket.id, pr = pr.number, tech_debt, "merged");
            events.push(LifecycleEvent::Merged {
                ticket_id: ticket.id.clone(),
                pr_number: pr.number,
                tech_debt,
            });
            return Ok(Transition::finish(Outcome::Merged { tech_debt }).with_events(events));
        }

        match policy::on_rejection(exec) {
            RejectionDecision::Refactor => {
                // post the review before touching state so a transport failure
                // resumes into the same decision
                if let Some(pr) = &pr {
                    self.worker
                        .review_pr(pr, combined.verdict, &review_body(&combined))
                        .await
                        .map_err(|e| InfraError::Worker(format!("review_pr failed: {e:#}")))?;
                }
                exec.architect_refactor_attempts += 1;
                exec.green_patch = Some(diff_text);
                exec.deferred_violations = combined.violations.clone();
                exec.is_refactoring = true;
                exec.status = TaskStatus::Failed;
                exec.feedback_log.push(rejection_narrative(&combined));
                gate.red(ContentFailure::ArchitecturalRejection.label());
                warn!(ticket_id = %ticket.id, "architectural review failed, requesting one refactor");
                Ok(Transition::run(Node::Feedback).with_events(events))
            }
            RejectionDecision::AcceptGreen => {
                warn!(ticket_id = %ticket.id, "refactor limit reached, falling back to green patch");
                let restored = self
                    .restore_green(ticket, exec, gate, "Refactor limit reached", &combined.violations)
                    .await?;
                Ok(restored.with_events(events))
            }
        }
    }

    /// Stability protocol fallback: merge the green patch and record the
    /// deferred violations as tech debt.
    async fn restore_green(
        &self,
        ticket: &Ticket,
        exec: &mut TaskExecutionState,
        gate: &mut VerificationGate,
        reason: &str,
        violations: &[Violation],
    ) -> Result<Transition, InfraError> {
        let pr = exec
            .latest_artifact()
            .and_then(GeneratedArtifact::pr)
            .ok_or_else(|| InfraError::Worker("no pull request to restore the green patch on".into()))?;
        let green = exec
            .green_patch
            .clone()
            .unwrap_or_else(|| exec.latest_diff().unwrap_or_default().to_string());

        self.worker
            .fallback_to_green(&pr, &green)
            .await
            .map_err(|e| InfraError::Worker(format!("fallback_to_green failed: {e:#}")))?;
        self.worker
            .merge_pr(&pr)
            .await
            .map_err(|e| InfraError::Worker(format!("merge failed: {e:#}")))?;

        let mut deferred = exec.deferred_violations.clone();
        for v in violations {
            if !deferred.iter().any(|d| d.description == v.description) {
                deferred.push(v.clone());
            }
        }
        exec.feedback_log.push(tech_debt_marker(reason, &deferred));
        conclude(exec);
        exec.generated_artifacts.push(GeneratedArtifact {
            output_key: format!("restore:{}", digest(&green)),
            diff_content: green,
            change_type: ChangeType::Restore,
            pr_link: Some(pr.url.clone()),
            pr_number: Some(pr.number),
            recorded_at: Some(Utc::now()),
        });
        exec.is_refactoring = false;
        exec.status = TaskStatus::Completed;
        gate.green();

        Ok(Transition::finish(Outcome::Merged { tech_debt: true }).with_event(LifecycleEvent::Merged {
            ticket_id: ticket.id.clone(),
            pr_number: pr.number,
            tech_debt: true,
        }))
    }

    // ── Feedback ─────────────────────────────────────────────────────────

    async fn feedback(
        &self,
        ticket: &Ticket,
        exec: &mut TaskExecutionState,
        gate: &mut VerificationGate,
    ) -> Result<Transition, InfraError> {
        let id = exec
            .external_task_id
            .clone()
            .ok_or_else(|| InfraError::Worker("feedback requested before dispatch".into()))?;
        let text = exec
            .feedback_log
            .last()
            .cloned()
            .or_else(|| gate.blocking_reason.clone())
            .unwrap_or_else(|| "Verification failed.".to_string());

        self.worker
            .post_feedback(&id, &text)
            .await
            .map_err(|e| InfraError::Worker(format!("post_feedback failed: {e:#}")))?;
        conclude(exec);

        match policy::record_content_failure(exec) {
            RetryDecision::Escalate => {
                exec.status = TaskStatus::Failed;
                error!(
                    ticket_id = %ticket.id,
                    retry_count = exec.retry_count,
                    max_retries = exec.max_retries,
                    "retry budget exhausted, escalating"
                );
                Ok(Transition::finish(Outcome::Escalated).with_event(LifecycleEvent::Escalated {
                    ticket_id: ticket.id.clone(),
                    retry_count: exec.retry_count,
                }))
            }
            RetryDecision::Retry => {
                exec.status = TaskStatus::Working;
                info!(
                    ticket_id = %ticket.id,
                    retry_count = exec.retry_count,
                    max_retries = exec.max_retries,
                    "feedback posted, waiting for a new attempt"
                );
                Ok(Transition::wait(Node::Watch, self.poll_interval).with_event(
                    LifecycleEvent::FeedbackPosted {
                        ticket_id: ticket.id.clone(),
                        retry_count: exec.retry_count,
                    },
                ))
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Full post-patch content of every file the diff touches.
    fn reconstruct(&self, diff_text: &str) -> Result<PatchedFiles, InfraError> {
        let mut originals = BTreeMap::new();
        for path in diff::candidate_paths(diff_text) {
            let content = self
                .source
                .read(&path)
                .map_err(|e| InfraError::Source(format!("{path}: {e:#}")))?;
            if let Some(content) = content {
                originals.insert(path, content);
            }
        }
        Ok(diff::apply_diff(&originals, diff_text)?)
    }
}

/// Work order for the worker. On retry the latest failure narrative leads.
pub fn build_work_request(ticket: &Ticket, exec: &TaskExecutionState) -> WorkRequest {
    let mut constraints = Vec::new();
    if let Some(last) = exec.feedback_log.last() {
        constraints.push(format!("CRITICAL FEEDBACK FROM PREVIOUS ATTEMPT: {last}"));
    }
    WorkRequest {
        ticket_id: ticket.id.clone(),
        title: ticket.title.clone(),
        session_id: exec.session_id.clone(),
        context: exec.active_context_slice.clone(),
        constraints,
    }
}

/// Prompt whose sampled answers are clustered by the uncertainty detector.
pub fn claim_prompt(intent: &str, diff_text: &str) -> String {
    let diff_text: String = diff_text.chars().take(CLAIM_DIFF_CHARS).collect();
    format!(
        "A code change was produced for the task below.\n\
         In one or two sentences, state what the change does and whether it accomplishes the task.\n\n\
         TASK:\n{intent}\n\nDIFF:\n{diff_text}"
    )
}

fn review_context(ticket: &Ticket, exec: &TaskExecutionState) -> String {
    let mut ctx = format!("Ticket {}: {}\n\n{}", ticket.id, ticket.title, exec.active_context_slice.intent);
    if exec.is_refactoring {
        ctx.push_str("\n\nThis is a refactor of a change that already passes its tests.");
    }
    ctx
}

fn review_body(verdict: &ReviewVerdict) -> String {
    let mut body = format!(
        "Architectural review: {} (quality {:.1})",
        verdict.verdict.as_str(),
        verdict.quality_score
    );
    for v in &verdict.violations {
        body.push_str(&format!("\n- [{}] {} {}: {}", v.severity, v.rule_id, v.file_path, v.description));
        if let Some(fix) = &v.suggested_fix {
            body.push_str(&format!(" (fix: {fix})"));
        }
    }
    body
}

fn rejection_narrative(verdict: &ReviewVerdict) -> String {
    let mut text = format!(
        "ARCHITECTURAL REVIEW FAILED ({}, quality {:.1}). Refactor the change to resolve:",
        verdict.verdict.as_str(),
        verdict.quality_score
    );
    for v in &verdict.violations {
        text.push_str(&format!("\n- {} in {}: {}", v.rule_id, v.file_path, v.description));
        if let Some(fix) = &v.suggested_fix {
            text.push_str(&format!(" Suggested fix: {fix}"));
        }
    }
    text
}

pub fn tech_debt_marker(reason: &str, violations: &[Violation]) -> String {
    if violations.is_empty() {
        return format!("#TODO: Tech Debt - {reason}.");
    }
    let items: Vec<String> = violations
        .iter()
        .map(|v| format!("{} ({}): {}", v.rule_id, v.file_path, v.description))
        .collect();
    format!("#TODO: Tech Debt - {reason}. Deferred: {}", items.join("; "))
}

fn conclude(exec: &mut TaskExecutionState) {
    if let Some(a) = exec.latest_artifact() {
        let (key, pr) = (a.output_key.clone(), a.pr_number);
        exec.last_verified_commit = Some(key);
        exec.last_verified_pr_number = pr;
    }
}

fn digest(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    hex::encode(&hash[..8])
}

fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}
