use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use crate::agent::SourceTree;

/// [`SourceTree`] over a working directory on disk.
pub struct FsTree {
    root: PathBuf,
}

impl FsTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Relative paths without traversal only; anything else is treated as absent.
    fn locate(&self, rel: &str) -> Option<PathBuf> {
        let path = Path::new(rel);
        if rel.is_empty()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return None;
        }
        Some(self.root.join(path))
    }
}

impl SourceTree for FsTree {
    fn read(&self, path: &str) -> Result<Option<String>> {
        let Some(full) = self.locate(path) else {
            return Ok(None);
        };
        if !full.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&full)
            .with_context(|| format!("failed to read {}", full.display()))?;
        Ok(Some(text))
    }

    fn exists(&self, path: &str) -> bool {
        self.locate(path).is_some_and(|p| p.is_file())
    }

    fn has_dir(&self, dir: &str) -> bool {
        self.locate(dir.trim_end_matches('/'))
            .and_then(|p| std::fs::read_dir(p).ok())
            .is_some_and(|mut entries| entries.next().is_some())
    }
}
