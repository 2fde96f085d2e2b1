//! Model-backed collaborators on a local Ollama chat endpoint: the semantic
//! judge, the architectural reviewer and the retrospective analyst.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use foundry_core::{
    agent::{Judge, Reviewer},
    containment::GuidanceStore,
    retro::{RetroStrategy, RetrospectiveAnalyst, SprintMetrics},
    types::{ProcessOptimization, RetrospectiveReport, ReviewVerdict, Verdict, Violation},
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Score at or above which a refactor request without critical violations
/// is downgraded to an approval with tech debt.
pub const GOOD_ENOUGH_SCORE: f64 = 8.0;
const MAX_GUIDANCE_CHARS: usize = 10_000;

/// Calls a locally-hosted Ollama model via its native chat API.
#[derive(Clone)]
pub struct OllamaChat {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f64,
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

impl OllamaChat {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout_secs: 300,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub async fn chat(&self, system: Option<&str>, user: &str, temperature: f64) -> Result<String> {
        self.send(system, user, temperature, None).await
    }

    /// Same as [`chat`](Self::chat) with Ollama's JSON mode on.
    pub async fn chat_json(&self, system: Option<&str>, user: &str) -> Result<String> {
        self.send(system, user, 0.0, Some("json")).await
    }

    async fn send(&self, system: Option<&str>, user: &str, temperature: f64, format: Option<&'static str>) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = system.filter(|s| !s.is_empty()) {
            messages.push(OllamaMessage {
                role: "system".into(),
                content: system.to_string(),
            });
        }
        messages.push(OllamaMessage {
            role: "user".into(),
            content: user.to_string(),
        });

        let request_body = OllamaChatRequest {
            model: self.model.clone(),
            messages,
            stream: false,
            options: OllamaOptions { temperature },
            format,
        };

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("ollama request timed out after {}s", self.timeout_secs)
                } else {
                    anyhow!("ollama request failed: {e}")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(model = %self.model, status = %status, "ollama returned non-200: {}", body);
            return Err(anyhow!("ollama error {status}: {body}"));
        }

        let parsed: OllamaChatResponse = response.json().await.context("failed to parse ollama response")?;
        Ok(parsed.message.content)
    }
}

// ── Judge ────────────────────────────────────────────────────────────────

pub struct LlmJudge {
    chat: OllamaChat,
}

impl LlmJudge {
    pub fn new(chat: OllamaChat) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn sample(&self, prompt: &str, n: usize, temperature: f64) -> Result<Vec<String>> {
        let mut set = JoinSet::new();
        for _ in 0..n {
            let chat = self.chat.clone();
            let prompt = prompt.to_string();
            set.spawn(async move { chat.chat(None, &prompt, temperature).await });
        }
        let mut samples = Vec::with_capacity(n);
        while let Some(joined) = set.join_next().await {
            let text = joined.context("sampling task panicked")??;
            samples.push(text.trim().to_string());
        }
        Ok(samples)
    }

    async fn entails_both_ways(&self, a: &str, b: &str, context: &str) -> Result<bool> {
        let reply = self.chat.chat(None, &entailment_prompt(a, b, context), 0.0).await?;
        Ok(parse_true_false(&reply))
    }
}

fn entailment_prompt(a: &str, b: &str, context: &str) -> String {
    format!(
        "You are a semantic logic judge.\nContext/Intent: {context}\n\n\
         Statement A: \"{a}\"\nStatement B: \"{b}\"\n\n\
         Does A imply B and B imply A with respect to the intent? \
         Ignore phrasing; compare the core logic and facts.\n\nAnswer strictly: TRUE or FALSE."
    )
}

/// `TRUE` anywhere wins unless the reply also says `FALSE` first.
pub fn parse_true_false(reply: &str) -> bool {
    let upper = reply.to_ascii_uppercase();
    match (upper.find("TRUE"), upper.find("FALSE")) {
        (Some(t), Some(f)) => t < f,
        (Some(_), None) => true,
        _ => false,
    }
}

// ── Reviewer ─────────────────────────────────────────────────────────────

pub struct LlmReviewer {
    chat: OllamaChat,
    guidance: Option<GuidanceStore>,
}

#[derive(Deserialize)]
struct RawVerdict {
    #[serde(alias = "status")]
    verdict: String,
    #[serde(default)]
    quality_score: f64,
    #[serde(default)]
    violations: Vec<Violation>,
}

impl LlmReviewer {
    pub fn new(chat: OllamaChat) -> Self {
        Self { chat, guidance: None }
    }

    /// Architect guidance (the house rules) is prepended to every review.
    pub fn with_guidance(mut self, store: GuidanceStore) -> Self {
        self.guidance = Some(store);
        self
    }

    fn constitution(&self) -> String {
        let Some(store) = &self.guidance else {
            return String::new();
        };
        match store.read("architect") {
            Ok(Some(text)) => text.chars().take(MAX_GUIDANCE_CHARS).collect(),
            Ok(None) => String::new(),
            Err(e) => {
                warn!("failed to read architect guidance: {e:#}");
                String::new()
            }
        }
    }
}

#[async_trait]
impl Reviewer for LlmReviewer {
    async fn review(&self, file_path: &str, full_source: &str, context: &str) -> Result<ReviewVerdict> {
        let system = format!(
            "You are the software architect. Review the file against these rules.\n\n{}\n\n\
             Reply with JSON only: {{\"verdict\": \"APPROVED\"|\"APPROVED_WITH_TECH_DEBT\"|\"NEEDS_REFACTOR\"|\"REJECTED\", \
             \"quality_score\": 0-10, \"violations\": [{{\"rule_id\", \"severity\": \"MINOR\"|\"MAJOR\"|\"CRITICAL\", \
             \"description\", \"file_path\", \"suggested_fix\"}}]}}",
            self.constitution()
        );
        let user = format!("TICKET CONTEXT:\n{context}\n\nFILE: {file_path}\n```\n{full_source}\n```");
        let reply = self.chat.chat_json(Some(&system), &user).await?;
        let verdict = parse_review(&reply, file_path)?;
        info!(
            file = file_path,
            verdict = verdict.verdict.as_str(),
            score = verdict.quality_score,
            "architect review"
        );
        Ok(verdict)
    }
}

/// Parse a JSON verdict (code fences tolerated) and apply the good-enough
/// threshold.
pub fn parse_review(reply: &str, file_path: &str) -> Result<ReviewVerdict> {
    let raw: RawVerdict = serde_json::from_str(strip_fences(reply))
        .with_context(|| format!("reviewer reply for {file_path} is not a verdict"))?;
    let verdict = match raw.verdict.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
        "APPROVED" => Verdict::Approved,
        "APPROVED_WITH_TECH_DEBT" => Verdict::ApprovedWithTechDebt,
        "NEEDS_REFACTOR" => Verdict::NeedsRefactor,
        "REJECTED" => Verdict::Rejected,
        other => return Err(anyhow!("unknown verdict {other:?} for {file_path}")),
    };
    let mut violations = raw.violations;
    for v in &mut violations {
        if v.file_path.is_empty() {
            v.file_path = file_path.to_string();
        }
    }
    Ok(good_enough(ReviewVerdict {
        verdict,
        quality_score: raw.quality_score,
        violations,
    }))
}

/// A high-scoring refactor request with no critical violation is accepted
/// as tech debt.
pub fn good_enough(mut verdict: ReviewVerdict) -> ReviewVerdict {
    let critical = verdict
        .violations
        .iter()
        .any(|v| v.severity.eq_ignore_ascii_case("critical"));
    if verdict.verdict == Verdict::NeedsRefactor && verdict.quality_score >= GOOD_ENOUGH_SCORE && !critical {
        verdict.verdict = Verdict::ApprovedWithTechDebt;
    }
    verdict
}

/// Body of a ```` ```json ```` block if present, else the trimmed text.
pub fn strip_fences(text: &str) -> &str {
    let t = text.trim();
    let Some(start) = t.find("```") else {
        return t;
    };
    let after = &t[start + 3..];
    let after = after.find('\n').map_or(after, |nl| &after[nl + 1..]);
    match after.rfind("```") {
        Some(end) => after[..end].trim(),
        None => after.trim(),
    }
}

// ── Retrospective analyst ────────────────────────────────────────────────

pub struct LlmAnalyst {
    chat: OllamaChat,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawReport {
    summary: String,
    optimizations: Vec<ProcessOptimization>,
}

impl LlmAnalyst {
    pub fn new(chat: OllamaChat) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl RetrospectiveAnalyst for LlmAnalyst {
    async fn analyze(&self, strategy: RetroStrategy, metrics: &SprintMetrics) -> Result<RetrospectiveReport> {
        let focus = match strategy {
            RetroStrategy::HighFailure => {
                "The failure rate is high. Find the root causes of the failed tickets and propose \
                 strict rules that prevent them."
            }
            RetroStrategy::Stable => {
                "The sprint went well. Propose small process refinements that reduce retries."
            }
        };
        let system = "You are the scrum master running a sprint retrospective. Reply with JSON only: \
                      {\"summary\": string, \"optimizations\": [{\"target_role\": \"The Engineer\"|\"The Architect\"|\"Product Owner\", \
                      \"issue_detected\": string, \"suggested_update\": string}]}";
        let user = format!("{focus}\n\nSPRINT LOG:\n{}", metrics.summary());
        let reply = self.chat.chat_json(Some(system), &user).await?;
        let raw: RawReport = serde_json::from_str(strip_fences(&reply)).context("retrospective reply is not a report")?;
        Ok(RetrospectiveReport {
            sprint_id: String::new(),
            success_rate: metrics.success_rate,
            summary: raw.summary,
            optimizations: raw.optimizations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_fences("Here you go:\n```\n{}\n```\nthanks"), "{}");
        assert_eq!(strip_fences("  {\"a\": 2} "), "{\"a\": 2}");
    }

    #[test]
    fn true_false_parsing() {
        assert!(parse_true_false("TRUE"));
        assert!(parse_true_false("true."));
        assert!(!parse_true_false("FALSE, not TRUE"));
        assert!(!parse_true_false("unsure"));
    }

    #[test]
    fn review_json_is_parsed() {
        let reply = r#"```json
{"verdict": "REJECTED", "quality_score": 9.0,
 "violations": [{"rule_id": "SEC", "severity": "CRITICAL", "description": "SQL built by concatenation"}]}
```"#;
        let v = parse_review(reply, "app/db.py").unwrap();
        assert_eq!(v.verdict, Verdict::Rejected);
        assert_eq!(v.violations[0].file_path, "app/db.py");
        assert!(parse_review("looks fine to me", "x.py").is_err());
        assert!(parse_review(r#"{"verdict": "MAYBE"}"#, "x.py").is_err());
    }

    #[test]
    fn good_enough_threshold() {
        let minor = Violation {
            rule_id: "SRP".into(),
            severity: "MINOR".into(),
            description: "Slightly long method".into(),
            ..Violation::default()
        };
        let v = good_enough(ReviewVerdict {
            verdict: Verdict::NeedsRefactor,
            quality_score: 8.5,
            violations: vec![minor.clone()],
        });
        assert_eq!(v.verdict, Verdict::ApprovedWithTechDebt);

        let v = good_enough(ReviewVerdict {
            verdict: Verdict::NeedsRefactor,
            quality_score: 7.5,
            violations: vec![minor.clone()],
        });
        assert_eq!(v.verdict, Verdict::NeedsRefactor);

        let critical = Violation {
            severity: "CRITICAL".into(),
            ..minor
        };
        let v = good_enough(ReviewVerdict {
            verdict: Verdict::NeedsRefactor,
            quality_score: 9.0,
            violations: vec![critical],
        });
        assert_eq!(v.verdict, Verdict::NeedsRefactor);
    }
}
