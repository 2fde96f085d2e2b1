#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use foundry_core::{
    agent::{Judge, Reviewer, SourceTree, WorkerClient},
    entropy::{Threshold, UncertaintyDetector},
    lifecycle::TaskLifecycle,
    sandbox::{ExecResult, Sandbox, SandboxHandle},
    types::{PrRef, ReviewVerdict, TestRunResult, Verdict, Violation, WorkRequest, WorkStatus, WorkerStatus},
};

// ── source tree ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemTree {
    pub files: BTreeMap<String, String>,
}

impl MemTree {
    pub fn with(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }
}

impl SourceTree for MemTree {
    fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.files.get(path).cloned())
    }

    fn has_dir(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files.keys().any(|k| k.starts_with(&prefix))
    }
}

pub const CALC_PY: &str = "def add(a, b):\n    return a - b\n";
pub const TEST_CALC_PY: &str = "from src.calc import add\n\ndef test_add():\n    assert add(1, 2) == 3\n";

pub fn calc_tree() -> MemTree {
    MemTree::default()
        .with("src/calc.py", CALC_PY)
        .with("tests/test_calc.py", TEST_CALC_PY)
}

/// Fix for `src/calc.py`, git-style headers.
pub const FIX_DIFF: &str = "diff --git a/src/calc.py b/src/calc.py
index 1111111..2222222 100644
--- a/src/calc.py
+++ b/src/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";

/// A second, different attempt at the same fix.
pub const REFACTOR_DIFF: &str = "--- a/src/calc.py
+++ b/src/calc.py
@@ -1,2 +1,3 @@
 def add(a, b):
-    return a - b
+    total = a + b
+    return total
";

// ── worker ───────────────────────────────────────────────────────────────────

/// Scripted worker. `script[k]` is what every poll returns after `k`
/// feedback posts (the last entry repeats).
#[derive(Default)]
pub struct FakeWorker {
    pub script: Mutex<Vec<WorkStatus>>,
    pub attempt: AtomicUsize,
    pub polls: AtomicUsize,
    pub dispatched: Mutex<Vec<WorkRequest>>,
    pub feedback: Mutex<Vec<String>>,
    pub reviews: Mutex<Vec<(u64, Verdict)>>,
    pub merged: Mutex<Vec<u64>>,
    pub restored: Mutex<Vec<String>>,
    pub fail_dispatch: AtomicBool,
    pub fail_merge: AtomicBool,
}

impl FakeWorker {
    pub fn scripted(script: Vec<WorkStatus>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    pub fn feedback_count(&self) -> usize {
        self.feedback.lock().unwrap().len()
    }
}

pub fn completed(commit: &str, diff: &str, pr: u64) -> WorkStatus {
    WorkStatus {
        status: WorkerStatus::Completed,
        diff: Some(diff.to_string()),
        pr: Some(PrRef {
            number: pr,
            url: format!("https://github.com/acme/app/pull/{pr}"),
        }),
        commit_hash: Some(commit.to_string()),
        note: None,
    }
}

pub fn working() -> WorkStatus {
    WorkStatus {
        status: WorkerStatus::Working,
        ..WorkStatus::default()
    }
}

#[async_trait]
impl WorkerClient for FakeWorker {
    async fn dispatch(&self, request: &WorkRequest) -> Result<String> {
        if self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let mut d = self.dispatched.lock().unwrap();
        d.push(request.clone());
        Ok(format!("task-{}", d.len()))
    }

    async fn poll(&self, _external_task_id: &str) -> Result<WorkStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        let k = self.attempt.load(Ordering::SeqCst).min(script.len().saturating_sub(1));
        Ok(script.get(k).cloned().unwrap_or_else(working))
    }

    async fn post_feedback(&self, _external_task_id: &str, text: &str) -> Result<()> {
        self.feedback.lock().unwrap().push(text.to_string());
        self.attempt.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn review_pr(&self, pr: &PrRef, verdict: Verdict, _body: &str) -> Result<()> {
        self.reviews.lock().unwrap().push((pr.number, verdict));
        Ok(())
    }

    async fn merge_pr(&self, pr: &PrRef) -> Result<()> {
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(anyhow!("merge API returned 502"));
        }
        self.merged.lock().unwrap().push(pr.number);
        Ok(())
    }

    async fn fallback_to_green(&self, _pr: &PrRef, green_patch: &str) -> Result<()> {
        self.restored.lock().unwrap().push(green_patch.to_string());
        Ok(())
    }
}

// ── sandbox ──────────────────────────────────────────────────────────────────

/// Records loaded files and targets; test outcomes are popped from `results`
/// (the last one repeats).
#[derive(Default)]
pub struct FakeSandbox {
    pub results: Mutex<VecDeque<bool>>,
    pub loaded: Mutex<Vec<BTreeMap<String, String>>>,
    pub targets: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<String>>,
    pub disposed: AtomicUsize,
    pub fail_provision: AtomicBool,
}

impl FakeSandbox {
    pub fn passing() -> Arc<Self> {
        Self::with_results(&[true])
    }

    pub fn failing() -> Arc<Self> {
        Self::with_results(&[false])
    }

    pub fn with_results(results: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.iter().copied().collect()),
            ..Self::default()
        })
    }

    pub fn runs(&self) -> usize {
        self.targets.lock().unwrap().len()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn provision(&self) -> Result<SandboxHandle> {
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(anyhow!("docker daemon not reachable"));
        }
        Ok(SandboxHandle {
            id: "fake".into(),
            root: std::env::temp_dir(),
        })
    }

    async fn load_files(&self, _handle: &SandboxHandle, files: &BTreeMap<String, String>) -> Result<()> {
        self.loaded.lock().unwrap().push(files.clone());
        Ok(())
    }

    async fn run(&self, _handle: &SandboxHandle, command: &str) -> Result<ExecResult> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn run_tests(&self, _handle: &SandboxHandle, target: &str) -> Result<TestRunResult> {
        self.targets.lock().unwrap().push(target.to_string());
        let passed = {
            let mut r = self.results.lock().unwrap();
            if r.len() > 1 {
                r.pop_front().unwrap_or(true)
            } else {
                r.front().copied().unwrap_or(true)
            }
        };
        let log = if passed {
            "1 passed in 0.01s".to_string()
        } else {
            "E   assert -1 == 3\nFAILED tests/test_calc.py::test_add\n1 failed in 0.02s".to_string()
        };
        Ok(TestRunResult {
            passed,
            total: 1,
            failed: u32::from(!passed),
            log,
            target: target.to_string(),
        })
    }

    async fn dispose(&self, _handle: &SandboxHandle) -> Result<()> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── reviewer ─────────────────────────────────────────────────────────────────

/// Verdicts popped per review call (the last one repeats).
#[derive(Default)]
pub struct FakeReviewer {
    pub verdicts: Mutex<VecDeque<Verdict>>,
    pub calls: AtomicUsize,
}

impl FakeReviewer {
    pub fn with(verdicts: &[Verdict]) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.iter().copied().collect()),
            ..Self::default()
        })
    }
}

#[async_trait]
impl Reviewer for FakeReviewer {
    async fn review(&self, file_path: &str, _full_source: &str, _context: &str) -> Result<ReviewVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let verdict = {
            let mut v = self.verdicts.lock().unwrap();
            if v.len() > 1 {
                v.pop_front().unwrap_or_default()
            } else {
                v.front().copied().unwrap_or_default()
            }
        };
        let violations = if verdict.is_green() && verdict != Verdict::ApprovedWithTechDebt {
            Vec::new()
        } else {
            vec![Violation {
                rule_id: "SRP".into(),
                severity: "high".into(),
                description: "Arithmetic mixed with formatting".into(),
                file_path: file_path.to_string(),
                suggested_fix: Some("Extract a helper".into()),
            }]
        };
        Ok(ReviewVerdict {
            verdict,
            quality_score: if verdict.is_green() { 8.0 } else { 4.0 },
            violations,
        })
    }
}

// ── judge ────────────────────────────────────────────────────────────────────

/// Returns fixed samples; two samples are equivalent when their first word
/// matches.
pub struct FakeJudge {
    pub samples: Mutex<Vec<String>>,
    pub entailment_calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeJudge {
    pub fn new(samples: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(samples.iter().map(|s| s.to_string()).collect()),
            entailment_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    /// Five answers that all say the same thing.
    pub fn consistent() -> Arc<Self> {
        Self::new(&["fixes the sign"; 5])
    }

    /// Five mutually incompatible answers.
    pub fn scattered() -> Arc<Self> {
        Self::new(&["alpha", "bravo", "charlie", "delta", "echo"])
    }

    /// Answers returned from the next `sample` call on.
    pub fn answer_with(&self, samples: &[&str]) {
        *self.samples.lock().unwrap() = samples.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl Judge for FakeJudge {
    async fn sample(&self, _prompt: &str, n: usize, _temperature: f64) -> Result<Vec<String>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("model endpoint timed out"));
        }
        Ok(self.samples.lock().unwrap().iter().take(n).cloned().collect())
    }

    async fn entails_both_ways(&self, a: &str, b: &str, _context: &str) -> Result<bool> {
        self.entailment_calls.fetch_add(1, Ordering::SeqCst);
        let first = |s: &str| s.split_whitespace().next().unwrap_or("").to_string();
        Ok(first(a) == first(b))
    }
}

// ── assembly ─────────────────────────────────────────────────────────────────

pub struct Rig {
    pub worker: Arc<FakeWorker>,
    pub sandbox: Arc<FakeSandbox>,
    pub reviewer: Arc<FakeReviewer>,
    pub judge: Arc<FakeJudge>,
    pub tree: Arc<MemTree>,
}

impl Rig {
    pub fn new(worker: Arc<FakeWorker>, sandbox: Arc<FakeSandbox>, reviewer: Arc<FakeReviewer>) -> Self {
        Self {
            worker,
            sandbox,
            reviewer,
            judge: FakeJudge::consistent(),
            tree: Arc::new(calc_tree()),
        }
    }

    pub fn with_judge(mut self, judge: Arc<FakeJudge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_tree(mut self, tree: MemTree) -> Self {
        self.tree = Arc::new(tree);
        self
    }

    pub fn lifecycle(&self) -> TaskLifecycle {
        let detector = UncertaintyDetector::new(self.judge.clone()).with_threshold(Threshold::FractionOfMax(0.8));
        TaskLifecycle::new(
            self.worker.clone(),
            self.sandbox.clone(),
            self.reviewer.clone(),
            self.tree.clone(),
            detector,
        )
        .with_poll_interval(Duration::from_millis(1))
    }
}
