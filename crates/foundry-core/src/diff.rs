//! In-memory unified-diff application.
//!
//! Worker output is frequently slightly malformed (missing context prefixes,
//! bare blank lines inside hunks), so every diff is normalized hunk by hunk
//! before it reaches `diffy`. Reconstruction never touches the filesystem.

use std::collections::BTreeMap;

use crate::error::DiffError;

pub const DEV_NULL: &str = "/dev/null";

/// Post-patch view of every path the diff touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchedFiles {
    /// Full content after the patch, for modified and created paths.
    pub files: BTreeMap<String, String>,
    /// Paths the diff deletes (or renames away from).
    pub removed: Vec<String>,
}

/// One `---`/`+++` section of a multi-file diff, already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSection {
    old_raw: String,
    new_raw: String,
    hunks: String,
    /// Set when a change line shows up after its hunk's counts ran out.
    overflow: Option<String>,
}

impl FileSection {
    fn is_create(&self) -> bool {
        self.old_raw == DEV_NULL
    }

    fn is_delete(&self) -> bool {
        self.new_raw == DEV_NULL
    }
}

/// Paths named by the diff's header pairs, `a/`/`b/` prefixes stripped,
/// `/dev/null` ignored. Order of first appearance, no duplicates.
pub fn extract_affected_paths(diff: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for section in split_sections(diff) {
        for raw in [&section.old_raw, &section.new_raw] {
            if raw == DEV_NULL {
                continue;
            }
            let path = strip_level(raw, 0);
            if !path.is_empty() && !out.contains(&path) {
                out.push(path);
            }
        }
    }
    out
}

/// Every path the diff might refer to at any supported strip level. Callers
/// use this to fetch originals before [`apply_diff`].
pub fn candidate_paths(diff: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for section in split_sections(diff) {
        for raw in [&section.old_raw, &section.new_raw] {
            if raw == DEV_NULL {
                continue;
            }
            for level in STRIP_LEVELS {
                let path = strip_level(raw, level);
                if !path.is_empty() && !out.contains(&path) {
                    out.push(path);
                }
            }
        }
    }
    out
}

/// Re-prefix context lines that lost their leading space and turn blank
/// lines inside a hunk into empty context lines. Git metadata and anything
/// outside a hunk is dropped.
pub fn normalize(diff: &str) -> String {
    let mut out = String::new();
    for section in split_sections(diff) {
        out.push_str(&format!("--- {}\n+++ {}\n", section.old_raw, section.new_raw));
        out.push_str(&section.hunks);
    }
    out
}

/// Apply `diff` to `originals` and return the full post-patch content of
/// every affected path.
///
/// Each section is tried at strip level 0 (header path minus `a/`/`b/`) and
/// then level 1 (first path component dropped). Failure at every level is an
/// error; nothing is silently skipped.
pub fn apply_diff(originals: &BTreeMap<String, String>, diff: &str) -> Result<PatchedFiles, DiffError> {
    let sections = split_sections(diff);
    if sections.is_empty() && !diff.trim().is_empty() {
        return Err(DiffError::Parse {
            path: String::new(),
            reason: "no ---/+++ file headers found".into(),
        });
    }

    let mut result = PatchedFiles::default();
    for section in &sections {
        apply_section(originals, section, &mut result)?;
    }
    Ok(result)
}

const STRIP_LEVELS: [usize; 2] = [0, 1];

fn apply_section(
    originals: &BTreeMap<String, String>,
    section: &FileSection,
    result: &mut PatchedFiles,
) -> Result<(), DiffError> {
    let display = if section.is_delete() {
        strip_level(&section.old_raw, 0)
    } else {
        strip_level(&section.new_raw, 0)
    };

    if let Some(reason) = &section.overflow {
        return Err(DiffError::Parse {
            path: display,
            reason: reason.clone(),
        });
    }

    if section.is_delete() {
        let path = STRIP_LEVELS
            .iter()
            .map(|&l| strip_level(&section.old_raw, l))
            .find(|p| originals.contains_key(p))
            .unwrap_or(display);
        result.files.remove(&path);
        if !result.removed.contains(&path) {
            result.removed.push(path);
        }
        return Ok(());
    }

    let text = format!("--- {}\n+++ {}\n{}", section.old_raw, section.new_raw, section.hunks);
    let patch = diffy::Patch::from_str(&text).map_err(|e| DiffError::Parse {
        path: display.clone(),
        reason: e.to_string(),
    })?;

    let mut saw_original = false;
    for level in STRIP_LEVELS {
        let target = strip_level(&section.new_raw, level);
        let source = strip_level(&section.old_raw, level);
        let base = if section.is_create() {
            // a patch chained onto a file created earlier in the same diff
            result.files.get(&target).map(String::as_str).unwrap_or("")
        } else if let Some(prev) = result.files.get(&source) {
            prev.as_str()
        } else if let Some(orig) = originals.get(&source) {
            orig.as_str()
        } else {
            continue;
        };
        saw_original = true;

        if let Ok(patched) = diffy::apply(base, &patch) {
            if !section.is_create() && source != target {
                result.files.remove(&source);
                if !result.removed.contains(&source) {
                    result.removed.push(source);
                }
            }
            result.removed.retain(|p| p != &target);
            result.files.insert(target, patched);
            return Ok(());
        }
    }

    if saw_original {
        Err(DiffError::Apply { path: display })
    } else {
        Err(DiffError::MissingOriginal { path: display })
    }
}

/// Path for a header at the given strip level. Level 0 removes a leading
/// `a/` or `b/`; level 1 removes the first component whatever it is.
fn strip_level(raw: &str, level: usize) -> String {
    let raw = raw.trim();
    let raw = raw.strip_prefix("./").unwrap_or(raw);
    match level {
        0 => raw
            .strip_prefix("a/")
            .or_else(|| raw.strip_prefix("b/"))
            .unwrap_or(raw)
            .to_string(),
        _ => {
            let mut rest = raw;
            for _ in 0..level {
                match rest.split_once('/') {
                    Some((_, tail)) => rest = tail,
                    None => break,
                }
            }
            rest.to_string()
        }
    }
}

/// Path part of a `---`/`+++` header line: no marker, no trailing timestamp.
fn header_path(line: &str, marker: &str) -> String {
    let rest = line.strip_prefix(marker).unwrap_or(line);
    let rest = rest.split('\t').next().unwrap_or(rest);
    rest.trim().trim_matches('"').to_string()
}

/// Old and new line counts from `@@ -l[,s] +l[,s] @@`.
fn parse_hunk_header(line: &str) -> Option<(usize, usize)> {
    let inner = line.strip_prefix("@@ -")?;
    let end = inner.find(" @@")?;
    let (old, new) = inner[..end].split_once(" +")?;
    let count = |range: &str| -> Option<usize> {
        match range.split_once(',') {
            Some((_, n)) => n.trim().parse().ok(),
            None => range.trim().parse::<usize>().ok().map(|_| 1),
        }
    };
    Some((count(old)?, count(new)?))
}

fn split_sections(diff: &str) -> Vec<FileSection> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut sections: Vec<FileSection> = Vec::new();
    let mut current: Option<FileSection> = None;
    // remaining old/new lines in the open hunk
    let mut remaining: Option<(usize, usize)> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let hunk_open = matches!(remaining, Some((old, new)) if old > 0 || new > 0);

        // inside a hunk `--- `/`+++ ` are ordinary change lines unless a hunk
        // header follows them
        let is_header = line.starts_with("--- ")
            && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "))
            && (!hunk_open || lines.get(i + 2).is_some_and(|after| after.starts_with("@@")));
        if is_header {
            if let Some(done) = current.take() {
                sections.push(done);
            }
            current = Some(FileSection {
                old_raw: header_path(line, "--- "),
                new_raw: header_path(lines[i + 1], "+++ "),
                hunks: String::new(),
                overflow: None,
            });
            remaining = None;
            i += 2;
            continue;
        }

        let Some(section) = current.as_mut() else {
            i += 1;
            continue;
        };

        if line.starts_with("@@") {
            remaining = parse_hunk_header(line);
            if remaining.is_some() {
                section.hunks.push_str(line);
                section.hunks.push('\n');
            }
            i += 1;
            continue;
        }

        match remaining {
            Some((old, new)) if hunk_open => {
                let (normalized, takes_old, takes_new) = normalize_body_line(line);
                section.hunks.push_str(&normalized);
                section.hunks.push('\n');
                remaining = Some((
                    old.saturating_sub(usize::from(takes_old)),
                    new.saturating_sub(usize::from(takes_new)),
                ));
            }
            Some(_) if line.starts_with(['+', '-', ' ']) => {
                if section.overflow.is_none() {
                    section.overflow = Some(format!(
                        "line {} ({line:?}) lies past the end of its hunk; the hunk header undercounts",
                        i + 1
                    ));
                }
            }
            _ => {
                if line.starts_with('\\') && !section.hunks.is_empty() {
                    section.hunks.push_str(line);
                    section.hunks.push('\n');
                }
                // anything else between hunks is git metadata or noise
            }
        }
        i += 1;
    }
    if let Some(done) = current.take() {
        sections.push(done);
    }
    sections
}

/// Normalized line plus whether it consumes an old and/or new line.
fn normalize_body_line(line: &str) -> (String, bool, bool) {
    match line.chars().next() {
        None => (" ".to_string(), true, true),
        Some('+') => (line.to_string(), false, true),
        Some('-') => (line.to_string(), true, false),
        Some(' ') => (line.to_string(), true, true),
        Some('\\') => (line.to_string(), false, false),
        Some(_) => (format!(" {line}"), true, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hunk_header_counts() {
        assert_eq!(parse_hunk_header("@@ -1,5 +1,6 @@"), Some((5, 6)));
        assert_eq!(parse_hunk_header("@@ -3 +3 @@ fn main()"), Some((1, 1)));
        assert_eq!(parse_hunk_header("@@ -0,0 +1,2 @@"), Some((0, 2)));
        assert_eq!(parse_hunk_header("@@ garbage"), None);
    }

    #[test]
    fn strip_levels() {
        assert_eq!(strip_level("a/src/app.py", 0), "src/app.py");
        assert_eq!(strip_level("src/app.py", 0), "src/app.py");
        assert_eq!(strip_level("src/app.py", 1), "app.py");
        assert_eq!(strip_level("app.py", 1), "app.py");
    }

    #[test]
    fn header_path_drops_timestamp() {
        assert_eq!(header_path("--- a/x.py\t2024-01-01 10:00:00", "--- "), "a/x.py");
    }

    #[test]
    fn normalize_reprefixes_context() {
        let raw = "--- a/f.txt\n+++ b/f.txt\n@@ -1,3 +1,3 @@\none\n-two\n+TWO\n\n";
        let norm = normalize(raw);
        assert_eq!(norm, "--- a/f.txt\n+++ b/f.txt\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n \n");
    }

    #[test]
    fn git_metadata_is_dropped() {
        let raw = "diff --git a/f.txt b/f.txt\nindex 123..456 100644\n--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(normalize(raw), "--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-a\n+b\n");
    }
}
