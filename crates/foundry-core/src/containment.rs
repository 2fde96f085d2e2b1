//! Write-access control for learned artifacts.
//!
//! Every write of guidance text goes through [`ContainmentGuard`]; nothing
//! else in the crate opens those files for writing.

use std::{
    io::Write,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::ContainmentError;

#[derive(Debug, Clone)]
pub struct ContainmentGuard {
    root: PathBuf,
}

impl ContainmentGuard {
    /// `root` must exist; it is canonicalized once here.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ContainmentError> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| ContainmentError::Unresolvable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self { root: canonical })
    }

    /// Create `root` if needed, then guard it.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, ContainmentError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| ContainmentError::Unresolvable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (symlinks followed for every existing prefix, `..`
    /// applied after resolution) and require it to be strictly inside root.
    /// Relative paths resolve against the process working directory.
    pub fn verify_write_permission(&self, path: impl AsRef<Path>) -> Result<PathBuf, ContainmentError> {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| ContainmentError::Unresolvable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?
                .join(path)
        };
        let resolved = resolve(&absolute);
        if resolved != self.root && resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(ContainmentError::Escapes {
                path: resolved,
                root: self.root.clone(),
            })
        }
    }

    /// Like [`verify_write_permission`](Self::verify_write_permission) with
    /// `relative` interpreted against the root.
    pub fn resolve_within(&self, relative: impl AsRef<Path>) -> Result<PathBuf, ContainmentError> {
        self.verify_write_permission(self.root.join(relative))
    }
}

/// Canonicalize each existing prefix in turn so symlinks cannot hide an
/// escape; components past the last existing one are applied lexically.
fn resolve(absolute: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for comp in absolute.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => resolved.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(seg) => {
                resolved.push(seg);
                if let Ok(real) = resolved.canonicalize() {
                    resolved = real;
                }
            }
        }
    }
    resolved
}

// ── Guidance store ───────────────────────────────────────────────────────

/// Role guidance documents (`<role>.md`) under the containment root.
#[derive(Debug, Clone)]
pub struct GuidanceStore {
    guard: ContainmentGuard,
}

impl GuidanceStore {
    pub fn new(guard: ContainmentGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &ContainmentGuard {
        &self.guard
    }

    fn path_for(&self, role: &str) -> Result<PathBuf> {
        validate_role(role)?;
        Ok(self.guard.resolve_within(format!("{role}.md"))?)
    }

    pub fn read(&self, role: &str) -> Result<Option<String>> {
        let path = self.path_for(role)?;
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Replace the guidance for `role` atomically.
    pub fn write(&self, role: &str, text: &str) -> Result<PathBuf> {
        let path = self.path_for(role)?;
        write_atomic(&self.guard, &path, text)?;
        info!(role, path = %path.display(), "guidance updated");
        Ok(path)
    }
}

/// Write `text` to an already-verified `path` via a sibling temp file.
pub fn write_atomic(guard: &ContainmentGuard, path: &Path, text: &str) -> Result<()> {
    let path = guard.verify_write_permission(path)?;
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| guard.root().to_path_buf());
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut temp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    temp.write_all(text.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(&path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Role keys are plain file stems: no separators, no traversal, no dots.
pub fn validate_role(role: &str) -> Result<()> {
    if role.is_empty() {
        anyhow::bail!("empty role name");
    }
    if !role
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        anyhow::bail!("invalid role name: {role}");
    }
    Ok(())
}
