use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    containment::GuidanceStore,
    types::{RetrospectiveReport, TicketRecord},
};

/// Failure rate above which the retrospective focuses on root causes.
pub const HIGH_FAILURE_RATE_THRESHOLD: f64 = 0.2;
/// Finished tickets needed before a retrospective is worth running.
pub const MIN_TICKETS_FOR_RETROSPECTIVE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetroStrategy {
    /// Failure rate above threshold: find what keeps breaking.
    HighFailure,
    /// Sprint went fine: look for efficiency gains.
    Stable,
}

impl RetroStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighFailure => "high_failure",
            Self::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SprintMetrics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub mean_retries: f64,
    pub mean_entropy: f64,
    pub tech_debt_merges: usize,
    /// One line per ticket: `[PASS] id: title (Retries: n)` or
    /// `[FAIL] id: title -> reason`.
    pub lines: Vec<String>,
}

impl SprintMetrics {
    pub fn from_records(completed: &[TicketRecord], failed: &[TicketRecord]) -> Self {
        let total = completed.len() + failed.len();
        if total == 0 {
            return Self::default();
        }

        let mut lines = Vec::with_capacity(total);
        for r in completed {
            let debt = if r.tech_debt { " [tech debt]" } else { "" };
            lines.push(format!(
                "[PASS] {}: {} (Retries: {}){debt}",
                r.ticket.id, r.ticket.title, r.retry_count
            ));
        }
        for r in failed {
            let reason = r
                .feedback_log
                .last()
                .map(|s| s.lines().next().unwrap_or_default().to_string())
                .unwrap_or_else(|| "unknown".into());
            lines.push(format!("[FAIL] {}: {} -> {reason}", r.ticket.id, r.ticket.title));
        }

        let all = completed.iter().chain(failed.iter());
        let retries: u32 = all.clone().map(|r| r.retry_count).sum();
        let scores: Vec<f64> = all
            .flat_map(|r| r.entropy_history.iter().map(|e| e.score))
            .collect();
        let mean_entropy = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        Self {
            total,
            succeeded: completed.len(),
            failed: failed.len(),
            success_rate: completed.len() as f64 / total as f64,
            failure_rate: failed.len() as f64 / total as f64,
            mean_retries: f64::from(retries) / total as f64,
            mean_entropy,
            tech_debt_merges: completed.iter().filter(|r| r.tech_debt).count(),
            lines,
        }
    }

    pub fn strategy(&self) -> RetroStrategy {
        if self.failure_rate > HIGH_FAILURE_RATE_THRESHOLD {
            RetroStrategy::HighFailure
        } else {
            RetroStrategy::Stable
        }
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} tickets, {} passed, {} failed (success rate {:.0}%), mean retries {:.2}, mean entropy {:.3}, tech-debt merges {}",
            self.total,
            self.succeeded,
            self.failed,
            self.success_rate * 100.0,
            self.mean_retries,
            self.mean_entropy,
            self.tech_debt_merges
        );
        for line in &self.lines {
            out.push('\n');
            out.push_str(line);
        }
        out
    }
}

/// Turns sprint metrics into process changes. Typically LLM-backed.
#[async_trait]
pub trait RetrospectiveAnalyst: Send + Sync {
    async fn analyze(&self, strategy: RetroStrategy, metrics: &SprintMetrics) -> Result<RetrospectiveReport>;
}

/// Applies retrospective rules to role guidance through the containment guard.
pub struct GuidanceOptimizer {
    store: GuidanceStore,
}

impl GuidanceOptimizer {
    pub fn new(store: GuidanceStore) -> Self {
        Self { store }
    }

    /// Map a role name from a report to its guidance key.
    pub fn registry_key(role: &str) -> String {
        let trimmed = role.trim();
        let bare = trimmed.strip_prefix("The ").unwrap_or(trimmed);
        match bare.to_ascii_lowercase().as_str() {
            "engineer" => "engineer".into(),
            "architect" => "architect".into(),
            "product owner" => "product_owner".into(),
            "scrum master" => "scrum_master".into(),
            other => other.replace(' ', "_"),
        }
    }

    /// Append each suggested rule to its role's guidance. Returns the keys
    /// that changed. A containment or IO failure aborts the whole report.
    pub fn apply(&self, report: &RetrospectiveReport) -> Result<Vec<String>> {
        let mut updated = Vec::new();
        for opt in &report.optimizations {
            if opt.suggested_update.trim().is_empty() {
                warn!(role = %opt.target_role, "skipping empty optimization");
                continue;
            }
            let key = Self::registry_key(&opt.target_role);
            let current = self.store.read(&key)?.unwrap_or_default();
            let rule = format!("- {} (sprint {}: {})", opt.suggested_update.trim(), report.sprint_id, opt.issue_detected.trim());
            if current.contains(opt.suggested_update.trim()) {
                continue;
            }
            let mut next = current;
            if !next.contains(LEARNED_RULES_HEADING) {
                if !next.is_empty() && !next.ends_with('\n') {
                    next.push('\n');
                }
                if !next.is_empty() {
                    next.push('\n');
                }
                next.push_str(LEARNED_RULES_HEADING);
                next.push('\n');
            }
            if !next.ends_with('\n') {
                next.push('\n');
            }
            next.push_str(&rule);
            next.push('\n');
            self.store.write(&key, &next)?;
            info!(role = %key, "learned rule recorded");
            if !updated.contains(&key) {
                updated.push(key);
            }
        }
        Ok(updated)
    }
}

const LEARNED_RULES_HEADING: &str = "## Learned Rules";
