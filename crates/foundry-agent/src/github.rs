//! Worker client that drives a code-generation bot through GitHub issues
//! and pull requests.
//!
//! A ticket becomes an issue mentioning the bot account. The bot's pull
//! request is found through the issue timeline; its files are stitched back
//! into a unified diff for verification.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use foundry_core::{
    agent::WorkerClient,
    containment::GuidanceStore,
    types::{PrRef, Verdict, WorkRequest, WorkStatus, WorkerStatus},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::instruction::{build_issue_body, issue_title};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("foundry/", env!("CARGO_PKG_VERSION"));

pub struct GitHubWorker {
    api_base: String,
    token: String,
    /// `owner/name`.
    repository: String,
    worker_username: String,
    guidance: Option<GuidanceStore>,
    http: reqwest::Client,
}

// ── API shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IssueRef {
    number: u64,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TimelineEvent {
    #[serde(default)]
    event: String,
    source: Option<TimelineSource>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TimelineSource {
    issue: Option<TimelineIssue>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TimelineIssue {
    number: u64,
    pull_request: Option<serde_json::Value>,
    user: Option<Account>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Account {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    state: String,
    html_url: String,
    head: Head,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct Head {
    sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PrFile {
    pub filename: String,
    #[serde(default)]
    pub status: String,
    pub previous_filename: Option<String>,
    pub patch: Option<String>,
}

impl GitHubWorker {
    pub fn new(token: impl Into<String>, repository: impl Into<String>, worker_username: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.into(),
            token: token.into(),
            repository: repository.into(),
            worker_username: worker_username.into(),
            guidance: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Engineer guidance from retrospectives is appended to every issue.
    pub fn with_guidance(mut self, store: GuidanceStore) -> Self {
        self.guidance = Some(store);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, self.repository, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
    }

    fn send_json(&self, method: reqwest::Method, path: &str, body: serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        self.send_json(reqwest::Method::POST, &format!("issues/{number}/comments"), json!({ "body": body }))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("commenting on #{number}"))?;
        Ok(())
    }

    async fn linked_pr(&self, issue: u64) -> Result<Option<u64>> {
        let events: Vec<TimelineEvent> = self
            .get(&format!("issues/{issue}/timeline?per_page=100"))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("reading timeline of #{issue}"))?
            .json()
            .await?;
        Ok(find_linked_pr(&events, &self.worker_username))
    }

    async fn pr_files(&self, pr: u64) -> Result<Vec<PrFile>> {
        let mut files = Vec::new();
        for page in 1..=30 {
            let batch: Vec<PrFile> = self
                .get(&format!("pulls/{pr}/files?per_page=100&page={page}"))
                .send()
                .await?
                .error_for_status()
                .with_context(|| format!("listing files of PR #{pr}"))?
                .json()
                .await?;
            let done = batch.len() < 100;
            files.extend(batch);
            if done {
                break;
            }
        }
        Ok(files)
    }

    fn team_rules(&self) -> Option<String> {
        let store = self.guidance.as_ref()?;
        match store.read("engineer") {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to read engineer guidance: {e:#}");
                None
            }
        }
    }
}

#[async_trait]
impl WorkerClient for GitHubWorker {
    async fn dispatch(&self, request: &WorkRequest) -> Result<String> {
        let rules = self.team_rules();
        let body = build_issue_body(&self.worker_username, request, rules.as_deref());
        let issue: IssueRef = self
            .send_json(
                reqwest::Method::POST,
                "issues",
                json!({
                    "title": issue_title(request),
                    "body": body,
                    "labels": ["foundry", self.worker_username],
                }),
            )
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("creating issue for {}", request.ticket_id))?
            .json()
            .await?;
        info!(ticket_id = %request.ticket_id, issue = issue.number, "issue created");
        Ok(issue.number.to_string())
    }

    async fn poll(&self, external_task_id: &str) -> Result<WorkStatus> {
        let number = parse_issue_number(external_task_id)?;
        let issue: IssueRef = self
            .get(&format!("issues/{number}"))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("reading issue #{number}"))?
            .json()
            .await?;

        let Some(pr_number) = self.linked_pr(number).await? else {
            if issue.state == "closed" {
                return Ok(WorkStatus {
                    status: WorkerStatus::Blocked,
                    note: Some(format!("issue #{number} was closed without a pull request")),
                    ..WorkStatus::default()
                });
            }
            debug!(issue = number, "no pull request yet");
            return Ok(WorkStatus {
                status: WorkerStatus::Working,
                ..WorkStatus::default()
            });
        };

        let pr: PullRequest = self
            .get(&format!("pulls/{pr_number}"))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("reading PR #{pr_number}"))?
            .json()
            .await?;
        let files = self.pr_files(pr.number).await?;

        let status = match (pr.state.as_str(), pr.merged) {
            ("open", _) => WorkerStatus::ReviewReady,
            (_, true) => WorkerStatus::Completed,
            _ => WorkerStatus::Blocked,
        };
        let note = (status == WorkerStatus::Blocked)
            .then(|| format!("PR #{} was closed without merging", pr.number));

        Ok(WorkStatus {
            status,
            diff: Some(assemble_diff(&files)),
            pr: Some(PrRef {
                number: pr.number,
                url: pr.html_url,
            }),
            commit_hash: Some(pr.head.sha),
            note,
        })
    }

    async fn post_feedback(&self, external_task_id: &str, text: &str) -> Result<()> {
        let number = parse_issue_number(external_task_id)?;
        let body = format!("@{} ### QA Verification Failed\n\n{text}", self.worker_username);
        self.comment(number, &body).await?;
        info!(issue = number, "feedback posted");
        Ok(())
    }

    async fn review_pr(&self, pr: &PrRef, verdict: Verdict, body: &str) -> Result<()> {
        let event = if verdict.is_green() { "APPROVE" } else { "REQUEST_CHANGES" };
        self.send_json(
            reqwest::Method::POST,
            &format!("pulls/{}/reviews", pr.number),
            json!({ "event": event, "body": body }),
        )
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("reviewing PR #{}", pr.number))?;
        info!(pr = pr.number, event, "review submitted");
        Ok(())
    }

    async fn merge_pr(&self, pr: &PrRef) -> Result<()> {
        let resp = self
            .send_json(
                reqwest::Method::PUT,
                &format!("pulls/{}/merge", pr.number),
                json!({ "merge_method": "squash" }),
            )
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("merge of PR #{} failed ({status}): {body}", pr.number));
        }
        info!(pr = pr.number, "merged");
        Ok(())
    }

    async fn fallback_to_green(&self, pr: &PrRef, green_patch: &str) -> Result<()> {
        let body = format!(
            "@{} The refactor is not accepted. Restore this branch to exactly the previously \
             verified patch below, with no other changes, so it can be merged.\n\n```diff\n{}\n```",
            self.worker_username,
            green_patch.trim_end()
        );
        self.comment(pr.number, &body).await?;
        warn!(pr = pr.number, "requested restore of green patch");
        Ok(())
    }
}

fn parse_issue_number(id: &str) -> Result<u64> {
    id.trim()
        .trim_start_matches('#')
        .parse()
        .with_context(|| format!("not an issue number: {id}"))
}

/// First pull request cross-referenced from the issue, preferring ones
/// opened by the worker account.
pub(crate) fn find_linked_pr(events: &[TimelineEvent], worker_username: &str) -> Option<u64> {
    let prs: Vec<&TimelineIssue> = events
        .iter()
        .filter(|e| e.event == "cross-referenced")
        .filter_map(|e| e.source.as_ref()?.issue.as_ref())
        .filter(|i| i.pull_request.is_some())
        .collect();
    prs.iter()
        .find(|i| {
            i.user
                .as_ref()
                .is_some_and(|u| u.login.eq_ignore_ascii_case(worker_username) || u.login.starts_with(worker_username))
        })
        .or_else(|| prs.first())
        .map(|i| i.number)
}

/// Rebuild a unified diff from per-file patches. GitHub omits headers and
/// sometimes the leading space of context lines; both are restored.
pub(crate) fn assemble_diff(files: &[PrFile]) -> String {
    let mut out = String::new();
    for f in files {
        let Some(patch) = f.patch.as_deref().filter(|p| !p.is_empty()) else {
            if f.status == "removed" {
                out.push_str(&format!("--- a/{0}\n+++ /dev/null\n", f.filename));
            }
            continue;
        };
        let header = match f.status.as_str() {
            "added" => format!("--- /dev/null\n+++ b/{}\n", f.filename),
            "removed" => format!("--- a/{}\n+++ /dev/null\n", f.filename),
            "renamed" => format!(
                "--- a/{}\n+++ b/{}\n",
                f.previous_filename.as_deref().unwrap_or(&f.filename),
                f.filename
            ),
            _ => format!("--- a/{0}\n+++ b/{0}\n", f.filename),
        };
        out.push_str(&header);
        for line in patch.lines() {
            match line.chars().next() {
                None => out.push(' '),
                Some('+' | '-' | '@' | '\\' | ' ') => out.push_str(line),
                Some(_) => {
                    out.push(' ');
                    out.push_str(line);
                }
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(json: &str) -> Vec<TimelineEvent> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn linked_pr_prefers_worker_account() {
        let ev = events(
            r#"[
                {"event": "labeled"},
                {"event": "cross-referenced", "source": {"issue": {"number": 40, "user": {"login": "someone"}}}},
                {"event": "cross-referenced", "source": {"issue": {"number": 41, "pull_request": {}, "user": {"login": "someone"}}}},
                {"event": "cross-referenced", "source": {"issue": {"number": 42, "pull_request": {}, "user": {"login": "google-jules[bot]"}}}}
            ]"#,
        );
        assert_eq!(find_linked_pr(&ev, "google-jules"), Some(42));
        assert_eq!(find_linked_pr(&ev, "other-bot"), Some(41));
        assert_eq!(find_linked_pr(&events("[]"), "google-jules"), None);
    }

    #[test]
    fn diff_is_rebuilt_with_headers() {
        let files = vec![
            PrFile {
                filename: "src/calc.py".into(),
                status: "modified".into(),
                previous_filename: None,
                patch: Some("@@ -1,2 +1,2 @@\ndef add(a, b):\n-    return a - b\n+    return a + b".into()),
            },
            PrFile {
                filename: "tests/test_new.py".into(),
                status: "added".into(),
                previous_filename: None,
                patch: Some("@@ -0,0 +1 @@\n+def test_x(): pass".into()),
            },
            PrFile {
                filename: "old.py".into(),
                status: "removed".into(),
                previous_filename: None,
                patch: None,
            },
        ];
        let diff = assemble_diff(&files);
        assert_eq!(
            diff,
            "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n\
             --- /dev/null\n+++ b/tests/test_new.py\n@@ -0,0 +1 @@\n+def test_x(): pass\n\
             --- a/old.py\n+++ /dev/null\n"
        );
    }

    #[test]
    fn issue_numbers() {
        assert_eq!(parse_issue_number("#17").unwrap(), 17);
        assert!(parse_issue_number("task-1").is_err());
    }
}
