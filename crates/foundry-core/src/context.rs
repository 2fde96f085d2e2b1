use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{agent::SourceTree, types::Ticket};

/// Lines of runtime log handed to the worker with each task.
pub const MAX_LOG_EXCERPT_LINES: usize = 500;

/// Bounded bundle of files, prior issues, intent and log excerpt for one task.
///
/// Equality is by [`ContextSlice::footprint`], so two slices listing the same
/// files and issues in different orders compare equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSlice {
    pub intent: String,
    pub files: Vec<String>,
    pub issues: Vec<u64>,
    pub log_excerpt: String,
}

impl ContextSlice {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Self::default()
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_issues(mut self, issues: impl IntoIterator<Item = u64>) -> Self {
        self.issues = issues.into_iter().collect();
        self
    }

    pub fn with_log(mut self, log: &str) -> Self {
        self.log_excerpt = tail_lines(log, MAX_LOG_EXCERPT_LINES);
        self
    }

    /// Hex SHA-256 over the intent, sorted files, sorted issues and log excerpt.
    pub fn footprint(&self) -> String {
        let mut files: Vec<&str> = self.files.iter().map(String::as_str).collect();
        files.sort_unstable();
        let mut issues = self.issues.clone();
        issues.sort_unstable();

        let mut hasher = Sha256::new();
        feed(&mut hasher, self.intent.as_bytes());
        hasher.update((files.len() as u64).to_le_bytes());
        for f in files {
            feed(&mut hasher, f.as_bytes());
        }
        hasher.update((issues.len() as u64).to_le_bytes());
        for i in issues {
            hasher.update(i.to_le_bytes());
        }
        feed(&mut hasher, self.log_excerpt.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Build the slice for a ticket: files are path-like tokens in the
    /// description that exist in `tree`, issues are `#N` references.
    pub fn for_ticket(ticket: &Ticket, tree: &dyn SourceTree, log: &str) -> Self {
        let mut files = Vec::new();
        let mut issues = Vec::new();
        for raw in ticket.description.split_whitespace() {
            let token = raw.trim_matches(|c: char| {
                matches!(c, '`' | '\'' | '"' | '(' | ')' | ',' | ';' | ':' | '[' | ']')
            });
            let token = token.trim_end_matches('.');
            if let Some(n) = token.strip_prefix('#').and_then(|n| n.parse::<u64>().ok()) {
                issues.push(n);
                continue;
            }
            if looks_like_path(token) && tree.exists(token) {
                files.push(token.to_string());
            }
        }
        files.sort();
        files.dedup();
        issues.sort_unstable();
        issues.dedup();

        let intent = if ticket.description.trim().is_empty() {
            ticket.title.clone()
        } else {
            format!("{}\n\n{}", ticket.title, ticket.description)
        };

        Self {
            intent,
            files,
            issues,
            log_excerpt: tail_lines(log, MAX_LOG_EXCERPT_LINES),
        }
    }
}

impl PartialEq for ContextSlice {
    fn eq(&self, other: &Self) -> bool {
        self.footprint() == other.footprint()
    }
}

impl Eq for ContextSlice {}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn looks_like_path(token: &str) -> bool {
    if token.is_empty() || token.contains("://") || token.starts_with('/') {
        return false;
    }
    if token.split('/').any(|seg| seg == "..") {
        return false;
    }
    let name = token.rsplit('/').next().unwrap_or(token);
    token.contains('/') || (name.contains('.') && !name.starts_with('.') && !name.ends_with('.'))
}

/// Last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
