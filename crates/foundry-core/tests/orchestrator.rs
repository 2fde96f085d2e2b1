//! End-to-end runs of the backlog orchestrator against in-memory
//! collaborators.

mod common;

use std::sync::{atomic::Ordering, Arc};

use anyhow::Result;
use async_trait::async_trait;
use common::*;
use foundry_core::{
    containment::{ContainmentGuard, GuidanceStore},
    lifecycle::Outcome,
    pipeline::{Pipeline, PipelineSettings, TickOutcome},
    retro::{GuidanceOptimizer, RetroStrategy, RetrospectiveAnalyst, SprintMetrics},
    store::StateStore,
    types::{
        LifecycleEvent, Node, ProcessOptimization, RetrospectiveReport, SystemStatus, TaskStatus, Ticket,
        TicketStatus, Verdict,
    },
};
use tempfile::TempDir;

// ── helpers ──────────────────────────────────────────────────────────────────

fn ticket(id: &str) -> Ticket {
    Ticket::new(
        id,
        "Fix add",
        "add() in src/calc.py subtracts instead of adding, see #12.",
    )
}

fn settings(max_retries: u32) -> PipelineSettings {
    PipelineSettings {
        max_retries,
        sprint_size: 5,
    }
}

fn open(dir: &TempDir, rig: &Rig, max_retries: u32) -> Pipeline {
    let store = StateStore::new(dir.path().join("state.json"));
    let (pipeline, _rx) = Pipeline::open(store, rig.lifecycle(), settings(max_retries));
    pipeline
}

fn finished(outcome: &TickOutcome) -> Option<&Outcome> {
    match outcome {
        TickOutcome::Finished { outcome, .. } => Some(outcome),
        _ => None,
    }
}

// ── happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn approved_change_is_merged_and_logged() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let store = StateStore::new(dir.path().join("state.json"));
    let (mut pipeline, mut rx) = Pipeline::open(store, rig.lifecycle(), settings(3));
    assert!(pipeline.enqueue(ticket("T-1")).unwrap());

    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: false }));

    let state = pipeline.state();
    assert!(state.orchestration.sprint_backlog.is_empty());
    assert_eq!(state.orchestration.completed_tasks_log.len(), 1);
    let record = &state.orchestration.completed_tasks_log[0];
    assert_eq!(record.ticket.status, TicketStatus::Done);
    assert_eq!(record.retry_count, 0);
    assert!(!record.tech_debt);
    assert!(state.engineering.task.is_none());

    assert_eq!(*rig.worker.merged.lock().unwrap(), vec![7]);
    assert_eq!(*rig.sandbox.targets.lock().unwrap(), vec!["tests/".to_string()]);
    assert_eq!(rig.sandbox.disposed.load(Ordering::SeqCst), 1);
    let loaded = rig.sandbox.loaded.lock().unwrap();
    assert_eq!(loaded[0]["src/calc.py"], "def add(a, b):\n    return a + b\n");

    // the work order carried the context slice
    let dispatched = rig.worker.dispatched.lock().unwrap();
    assert_eq!(dispatched[0].context.files, vec!["src/calc.py".to_string()]);
    assert_eq!(dispatched[0].context.issues, vec![12]);

    let mut kinds = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.push(ev.kind().to_string());
    }
    assert_eq!(kinds.first().map(String::as_str), Some("dispatched"));
    assert_eq!(kinds.last().map(String::as_str), Some("merged"));

    // persisted
    let (reloaded, _) = StateStore::new(dir.path().join("state.json")).load();
    assert_eq!(reloaded.orchestration.completed_tasks_log.len(), 1);

    assert_eq!(pipeline.tick().await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn duplicate_ticket_ids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(FakeWorker::scripted(vec![working()]), FakeSandbox::passing(), FakeReviewer::with(&[Verdict::Approved]));
    let mut pipeline = open(&dir, &rig, 3);
    assert!(pipeline.enqueue(ticket("T-1")).unwrap());
    assert!(!pipeline.enqueue(ticket("T-1")).unwrap());
    assert!(pipeline.enqueue(Ticket::new("", "nameless", "")).is_err());
    assert_eq!(pipeline.state().orchestration.task_queue.len(), 1);
}

#[tokio::test]
async fn sprint_planning_respects_priority_and_dependencies() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1").with_priority(5)).unwrap();
    pipeline.enqueue(ticket("T-2").with_priority(0).depends_on("T-1")).unwrap();
    pipeline.enqueue(ticket("T-3").with_priority(1)).unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        match pipeline.tick().await.unwrap() {
            TickOutcome::Finished { ticket_id, .. } => order.push(ticket_id),
            other => panic!("unexpected tick outcome {other:?}"),
        }
    }
    assert_eq!(order, vec!["T-3", "T-1", "T-2"]);
    assert_eq!(pipeline.tick().await.unwrap(), TickOutcome::Idle);
}

// ── retry and escalation ─────────────────────────────────────────────────────

#[tokio::test]
async fn retry_budget_exhaustion_escalates() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![
            completed("c1", FIX_DIFF, 7),
            completed("c2", REFACTOR_DIFF, 7),
            completed("c3", FIX_DIFF, 7),
        ]),
        FakeSandbox::failing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let mut pipeline = open(&dir, &rig, 2);
    pipeline.enqueue(ticket("T-1")).unwrap();

    let first = pipeline.tick().await.unwrap();
    assert!(matches!(first, TickOutcome::Waiting { .. }));
    let task = pipeline.state().engineering.task.as_ref().unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(pipeline.state().engineering.resume_at, Some(Node::Watch));

    let second = pipeline.tick().await.unwrap();
    assert_eq!(finished(&second), Some(&Outcome::Escalated));

    let orch = &pipeline.state().orchestration;
    assert!(orch.escalation_triggered);
    assert!(orch.completed_tasks_log.is_empty());
    let record = &orch.failed_tasks_log[0];
    assert_eq!(record.ticket.status, TicketStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert!(record.feedback_log[0].starts_with("Functional Verification Failed."));
    assert!(record.feedback_log[0].contains("EVIDENCE SNIPPETS"));
    assert_eq!(rig.worker.feedback_count(), 2);
    assert!(rig.worker.merged.lock().unwrap().is_empty());

    // the next tick acknowledges the escalation
    assert_eq!(pipeline.tick().await.unwrap(), TickOutcome::Idle);
    assert!(!pipeline.state().orchestration.escalation_triggered);
}

#[tokio::test]
async fn failed_attempt_feedback_goes_to_running_task() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7), completed("c2", FIX_DIFF, 7)]),
        FakeSandbox::with_results(&[false, true]),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    let posted = rig.worker.feedback.lock().unwrap()[0].clone();
    assert!(posted.contains("1 failed"));

    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: false }));
    assert_eq!(pipeline.state().orchestration.completed_tasks_log[0].retry_count, 1);
    // feedback goes to the running task; no second dispatch
    assert_eq!(rig.worker.dispatched.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_commit_is_not_reverified() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::failing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    for _ in 0..3 {
        assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    }
    assert_eq!(rig.sandbox.runs(), 1);
    assert_eq!(rig.worker.feedback_count(), 1);
    let task = pipeline.state().engineering.task.as_ref().unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.generated_artifacts.len(), 1);
    assert_eq!(task.last_verified_commit.as_deref(), Some("c1"));
}

#[tokio::test]
async fn empty_diff_is_a_content_failure() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", "", 7), completed("c2", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    assert!(rig.worker.feedback.lock().unwrap()[0].starts_with("No-op completion"));
    assert_eq!(rig.sandbox.runs(), 0);

    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: false }));
}

// ── uncertainty guard ────────────────────────────────────────────────────────

#[tokio::test]
async fn tunneling_skips_verification() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    )
    .with_judge(FakeJudge::scattered());
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    assert_eq!(rig.sandbox.runs(), 0);
    assert_eq!(rig.reviewer.calls.load(Ordering::SeqCst), 0);
    assert!(pipeline.state().orchestration.circuit_breaker_triggered);

    let feedback = rig.worker.feedback.lock().unwrap()[0].clone();
    assert!(feedback.starts_with("CRITICAL"));
    assert!(feedback.contains("High Semantic Entropy"));

    let task = pipeline.state().engineering.task.as_ref().unwrap();
    assert_eq!(task.retry_count, 1);
    assert!(task.entropy_history[0].triggered_breaker);
    assert!((task.entropy_history[0].score - 5f64.log2()).abs() < 1e-9);
}

#[tokio::test]
async fn breaker_clears_when_the_next_attempt_is_consistent() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7), completed("c2", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    )
    .with_judge(FakeJudge::scattered());
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    assert!(pipeline.state().orchestration.circuit_breaker_triggered);

    rig.judge.answer_with(&["fixes the sign"; 5]);
    let outcome = pipeline.tick().await.unwrap();
    assert_eq!(finished(&outcome), Some(&Outcome::Merged { tech_debt: false }));
    assert!(!pipeline.state().orchestration.circuit_breaker_triggered);

    let record = &pipeline.state().orchestration.completed_tasks_log[0];
    let tripped: Vec<bool> = record.entropy_history.iter().map(|e| e.triggered_breaker).collect();
    assert_eq!(tripped, vec![true, false]);
}

// ── stability protocol ───────────────────────────────────────────────────────

#[tokio::test]
async fn second_rejection_merges_green_patch_with_tech_debt() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7), completed("c2", REFACTOR_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::NeedsRefactor]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    let task = pipeline.state().engineering.task.as_ref().unwrap();
    assert!(task.is_refactoring);
    assert_eq!(task.architect_refactor_attempts, 1);
    assert_eq!(task.green_patch.as_deref(), Some(FIX_DIFF));
    assert!(rig.worker.feedback.lock().unwrap()[0].starts_with("ARCHITECTURAL REVIEW FAILED"));

    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: true }));

    assert_eq!(*rig.worker.restored.lock().unwrap(), vec![FIX_DIFF.to_string()]);
    assert_eq!(*rig.worker.merged.lock().unwrap(), vec![7]);
    // one refactor request only
    assert_eq!(rig.worker.feedback_count(), 1);

    let record = &pipeline.state().orchestration.completed_tasks_log[0];
    assert!(record.tech_debt);
    let marker = record.feedback_log.last().unwrap();
    assert!(marker.starts_with("#TODO: Tech Debt - Refactor limit reached"));
    assert!(marker.contains("Arithmetic mixed with formatting"));
}

#[tokio::test]
async fn refactor_that_breaks_tests_restores_green() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7), completed("c2", REFACTOR_DIFF, 7)]),
        FakeSandbox::with_results(&[true, false]),
        FakeReviewer::with(&[Verdict::Rejected]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: true }));

    let record = &pipeline.state().orchestration.completed_tasks_log[0];
    assert_eq!(record.retry_count, 1);
    assert!(record
        .feedback_log
        .last()
        .unwrap()
        .starts_with("#TODO: Tech Debt - Refactor broke functional verification"));
    assert_eq!(*rig.worker.restored.lock().unwrap(), vec![FIX_DIFF.to_string()]);
}

#[tokio::test]
async fn tech_debt_approval_merges_with_marker() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::ApprovedWithTechDebt]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: true }));
    assert!(rig.worker.restored.lock().unwrap().is_empty());
    assert_eq!(rig.worker.reviews.lock().unwrap()[0], (7, Verdict::ApprovedWithTechDebt));
}

// ── test target inference ────────────────────────────────────────────────────

#[tokio::test]
async fn config_only_change_falls_back_to_tests_dir() {
    let dir = TempDir::new().unwrap();
    let diff = format!(
        "--- /dev/null\n+++ b/pytest.ini\n@@ -0,0 +1,2 @@\n+[pytest]\n+addopts = -q\n{FIX_DIFF}"
    );
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", &diff, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(Ticket::new("T-1", "Quiet pytest", "Make the suite quieter.")).unwrap();

    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: false }));
    assert_eq!(*rig.sandbox.targets.lock().unwrap(), vec!["tests/".to_string()]);
    let loaded = rig.sandbox.loaded.lock().unwrap();
    assert_eq!(loaded[0]["pytest.ini"], "[pytest]\naddopts = -q\n");
}

#[tokio::test]
async fn missing_test_target_is_fed_back() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    )
    .with_tree(MemTree::default().with("src/calc.py", CALC_PY));
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
    assert_eq!(rig.sandbox.runs(), 0);
    assert!(rig.worker.feedback.lock().unwrap()[0].contains("No test target found"));
}

// ── infrastructure failures and recovery ─────────────────────────────────────

#[tokio::test]
async fn infrastructure_failure_parks_without_consuming_a_retry() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    rig.sandbox.fail_provision.store(true, Ordering::SeqCst);
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    let out = pipeline.tick().await.unwrap();
    assert!(matches!(
        finished(&out),
        Some(Outcome::Infrastructure { node: Node::FunctionalVerify, .. })
    ));

    let state = pipeline.state();
    assert_eq!(state.meta.system_status, SystemStatus::AwaitingOperator);
    assert_eq!(state.engineering.resume_at, Some(Node::FunctionalVerify));
    assert_eq!(state.orchestration.sprint_backlog.len(), 1);
    let task = state.engineering.task.as_ref().unwrap();
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.infra_error.as_deref().unwrap().contains("docker daemon not reachable"));
    assert_eq!(rig.worker.feedback_count(), 0);

    assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Parked { .. }));

    rig.sandbox.fail_provision.store(false, Ordering::SeqCst);
    pipeline.resume().unwrap();
    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: false }));
    assert_eq!(pipeline.state().orchestration.completed_tasks_log[0].retry_count, 0);
    assert_eq!(rig.worker.dispatched.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn merge_failure_is_infrastructure() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    rig.worker.fail_merge.store(true, Ordering::SeqCst);
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    let out = pipeline.tick().await.unwrap();
    assert!(matches!(
        finished(&out),
        Some(Outcome::Infrastructure { node: Node::StructuralGate, .. })
    ));
    assert!(pipeline.state().orchestration.completed_tasks_log.is_empty());
    assert_eq!(pipeline.state().engineering.task.as_ref().unwrap().retry_count, 0);
}

#[tokio::test]
async fn restart_resumes_without_redispatch() {
    let dir = TempDir::new().unwrap();
    {
        let rig = Rig::new(
            FakeWorker::scripted(vec![working()]),
            FakeSandbox::passing(),
            FakeReviewer::with(&[Verdict::Approved]),
        );
        let mut pipeline = open(&dir, &rig, 3);
        pipeline.enqueue(ticket("T-1")).unwrap();
        assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting { .. }));
        assert_eq!(rig.worker.dispatched.lock().unwrap().len(), 1);
    }

    // new process: fresh collaborators, same state file
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    assert_eq!(pipeline.state().engineering.resume_at, Some(Node::Watch));
    assert_eq!(
        pipeline.state().engineering.task.as_ref().unwrap().external_task_id.as_deref(),
        Some("task-1")
    );

    let out = pipeline.tick().await.unwrap();
    assert_eq!(finished(&out), Some(&Outcome::Merged { tech_debt: false }));
    assert!(rig.worker.dispatched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn blocked_worker_parks_for_operator() {
    let dir = TempDir::new().unwrap();
    let blocked = foundry_core::types::WorkStatus {
        status: foundry_core::types::WorkerStatus::Blocked,
        note: Some("needs database credentials".into()),
        ..Default::default()
    };
    let rig = Rig::new(
        FakeWorker::scripted(vec![blocked]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let mut pipeline = open(&dir, &rig, 3);
    pipeline.enqueue(ticket("T-1")).unwrap();

    let out = pipeline.tick().await.unwrap();
    assert!(matches!(finished(&out), Some(Outcome::Blocked { .. })));
    let state = pipeline.state();
    assert_eq!(state.meta.system_status, SystemStatus::AwaitingOperator);
    assert!(state.meta.operator_note.as_deref().unwrap().contains("needs database credentials"));
    assert_eq!(state.engineering.task.as_ref().unwrap().status, TaskStatus::Blocked);
    assert_eq!(state.engineering.resume_at, Some(Node::Watch));
}

// ── retrospective ────────────────────────────────────────────────────────────

struct FixedAnalyst;

#[async_trait]
impl RetrospectiveAnalyst for FixedAnalyst {
    async fn analyze(&self, strategy: RetroStrategy, metrics: &SprintMetrics) -> Result<RetrospectiveReport> {
        assert_eq!(strategy, RetroStrategy::Stable);
        assert_eq!(metrics.total, 3);
        Ok(RetrospectiveReport {
            sprint_id: "s1".into(),
            optimizations: vec![ProcessOptimization {
                target_role: "The Engineer".into(),
                issue_detected: "sign errors".into(),
                suggested_update: "Run the arithmetic tests before submitting.".into(),
            }],
            ..RetrospectiveReport::default()
        })
    }
}

#[tokio::test]
async fn retrospective_updates_guidance_after_backlog_drains() {
    let dir = TempDir::new().unwrap();
    let guidance_root = dir.path().join("prompts");
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    );
    let optimizer = GuidanceOptimizer::new(GuidanceStore::new(ContainmentGuard::create(&guidance_root).unwrap()));
    let mut pipeline = open(&dir, &rig, 3).with_retrospective(Arc::new(FixedAnalyst), optimizer);
    for id in ["T-1", "T-2", "T-3"] {
        pipeline.enqueue(ticket(id)).unwrap();
    }
    for _ in 0..3 {
        assert!(finished(&pipeline.tick().await.unwrap()).is_some());
    }

    assert_eq!(pipeline.tick().await.unwrap(), TickOutcome::Idle);
    let guidance = std::fs::read_to_string(guidance_root.join("engineer.md")).unwrap();
    assert!(guidance.contains("## Learned Rules"));
    assert!(guidance.contains("Run the arithmetic tests before submitting."));
    let state = pipeline.state();
    assert_eq!(state.orchestration.retrospective_watermark, 3);
    assert_eq!(state.meta.last_retrospective.as_ref().unwrap().success_rate, 1.0);

    // no new tickets finished: nothing to do
    assert_eq!(pipeline.tick().await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn events_mirror_state_flags() {
    let dir = TempDir::new().unwrap();
    let rig = Rig::new(
        FakeWorker::scripted(vec![completed("c1", FIX_DIFF, 7)]),
        FakeSandbox::passing(),
        FakeReviewer::with(&[Verdict::Approved]),
    )
    .with_judge(FakeJudge::scattered());
    let store = StateStore::new(dir.path().join("state.json"));
    let (mut pipeline, mut rx) = Pipeline::open(store, rig.lifecycle(), settings(3));
    pipeline.enqueue(ticket("T-1")).unwrap();
    pipeline.tick().await.unwrap();

    let mut tripped = None;
    while let Ok(ev) = rx.try_recv() {
        if let LifecycleEvent::EntropyMeasured { tripped: t, .. } = ev {
            tripped = Some(t);
        }
    }
    assert_eq!(tripped, Some(true));
}
