use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::{agent::SourceTree, sandbox::ExecResult};

/// Read-only access to a local clone of the target repository.
pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_path);
        cmd.args(args);

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {} {}", self.repo_path, args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub fn rev_parse_head(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        let result = self.exec(&["rev-parse", refname])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse {refname} failed: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn fetch_origin(&self) -> Result<()> {
        let result = self.exec(&["fetch", "origin"])?;
        if !result.success() {
            return Err(anyhow!("git fetch origin failed: {}", result.combined_output()));
        }
        Ok(())
    }

    /// Content of `path` at `rev`, `None` if the path is absent there.
    pub fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>> {
        let spec = format!("{rev}:{path}");
        let result = self.exec(&["cat-file", "-e", &spec])?;
        if !result.success() {
            return Ok(None);
        }
        let result = self.exec(&["show", &spec])?;
        if !result.success() {
            return Err(anyhow!("git show {spec} failed: {}", result.combined_output()));
        }
        Ok(Some(result.stdout))
    }

    pub fn ls_tree(&self, rev: &str, dir: &str) -> Result<Vec<String>> {
        let result = self.exec(&["ls-tree", "--name-only", rev, &format!("{}/", dir.trim_end_matches('/'))])?;
        if !result.success() {
            return Ok(Vec::new());
        }
        Ok(result.stdout.lines().map(str::to_string).collect())
    }
}

/// [`SourceTree`] pinned to a git revision, so originals for diff
/// reconstruction match the base the worker branched from.
pub struct GitTree {
    git: Git,
    rev: String,
}

impl GitTree {
    pub fn new(repo_path: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            git: Git::new(repo_path),
            rev: rev.into(),
        }
    }
}

impl SourceTree for GitTree {
    fn read(&self, path: &str) -> Result<Option<String>> {
        self.git.show_file(&self.rev, path)
    }

    fn has_dir(&self, dir: &str) -> bool {
        self.git
            .ls_tree(&self.rev, dir)
            .map(|entries| !entries.is_empty())
            .unwrap_or(false)
    }
}
