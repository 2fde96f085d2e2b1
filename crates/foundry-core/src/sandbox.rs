//! Ephemeral sandboxes for functional verification.
//!
//! [`ProcessSandbox`] gives each handle its own temp workspace and runs
//! commands in it through one of three isolation backends (preferred order
//! when `auto`):
//! 1. **bwrap**: bubblewrap namespace isolation, host filesystem read-only
//!    with the workspace bound read-write.
//! 2. **docker**: `docker run` with the workspace mounted at `/workspace`.
//! 3. **direct**: plain `sh -c` in the workspace, no isolation.
//!
//! Set `SANDBOX_BACKEND=auto|bwrap|docker|direct` in the environment.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{containment::ContainmentGuard, types::TestRunResult};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub root: PathBuf,
}

/// Isolated execution environment. One handle per verification attempt.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn provision(&self) -> Result<SandboxHandle>;

    /// Write `files` (relative path → content) into the workspace.
    async fn load_files(&self, handle: &SandboxHandle, files: &BTreeMap<String, String>) -> Result<()>;

    async fn run(&self, handle: &SandboxHandle, command: &str) -> Result<ExecResult>;

    async fn run_tests(&self, handle: &SandboxHandle, target: &str) -> Result<TestRunResult>;

    async fn dispose(&self, handle: &SandboxHandle) -> Result<()>;
}

/// Which isolation backend to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxMode {
    Bwrap,
    Docker,
    Direct,
}

impl SandboxMode {
    /// Parse from env/config string. `auto` and unknown values return `None`.
    pub fn from_str_or_auto(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bwrap" => Some(Self::Bwrap),
            "docker" => Some(Self::Docker),
            "none" | "direct" => Some(Self::Direct),
            _ => None,
        }
    }

    /// bwrap → docker → direct unless `preferred` forces one.
    pub async fn detect(preferred: &str) -> Self {
        if let Some(forced) = Self::from_str_or_auto(preferred) {
            return forced;
        }
        if bwrap_available().await {
            info!("sandbox: bwrap detected, using namespace sandbox");
            Self::Bwrap
        } else if docker_available().await {
            info!("sandbox: bwrap not found, falling back to docker");
            Self::Docker
        } else {
            warn!("sandbox: neither bwrap nor docker available, running tests directly (no isolation)");
            Self::Direct
        }
    }
}

pub async fn bwrap_available() -> bool {
    if cfg!(not(target_os = "linux")) {
        return false;
    }
    Command::new("bwrap")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

pub async fn docker_available() -> bool {
    Command::new("docker")
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// bwrap argument list: read-only root, fresh /dev and /proc, the
/// workspace and /tmp writable, own PID namespace, dies with the parent.
pub fn bwrap_args(workspace: &str, command: &[String]) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    args.extend(["--ro-bind", "/", "/", "--dev", "/dev"].map(str::to_string));
    args.extend(["--bind", workspace, workspace].map(str::to_string));
    args.extend(["--bind", "/tmp", "/tmp"].map(str::to_string));
    args.extend(
        [
            "--unshare-pid",
            "--new-session",
            "--die-with-parent",
            "--proc",
            "/proc",
        ]
        .map(str::to_string),
    );
    args.extend(["--chdir", workspace].map(str::to_string));
    args.push("--".into());
    args.extend_from_slice(command);
    args
}

pub fn docker_args(image: &str, workspace: &str, command: &[String]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--pids-limit".to_string(),
        "256".to_string(),
    ];
    if cfg!(target_os = "linux") {
        args.extend(
            [
                "--security-opt",
                "no-new-privileges:true",
                "--cap-drop",
                "ALL",
                "--network",
                "host",
            ]
            .map(str::to_string),
        );
    }
    args.push("-v".to_string());
    args.push(format!("{workspace}:/workspace"));
    args.push("-w".to_string());
    args.push("/workspace".to_string());
    args.push(image.to_string());
    args.extend_from_slice(command);
    args
}

/// Temp-directory sandbox driven through `sh -c`.
pub struct ProcessSandbox {
    mode: SandboxMode,
    image: String,
    /// Test command with a `{target}` placeholder.
    test_command: String,
    /// Repository copied into every fresh workspace.
    seed_root: Option<PathBuf>,
    timeout: Duration,
    workspaces: Mutex<HashMap<String, tempfile::TempDir>>,
}

impl ProcessSandbox {
    pub fn new(mode: SandboxMode, test_command: impl Into<String>) -> Self {
        Self {
            mode,
            image: "foundry-sandbox".into(),
            test_command: test_command.into(),
            seed_root: None,
            timeout: Duration::from_secs(900),
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_seed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.seed_root = Some(root.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command_for(&self, workspace: &str, shell: &str) -> Command {
        let argv = vec!["sh".to_string(), "-c".to_string(), shell.to_string()];
        match self.mode {
            SandboxMode::Bwrap => {
                let mut cmd = Command::new("bwrap");
                cmd.args(bwrap_args(workspace, &argv));
                cmd
            }
            SandboxMode::Docker => {
                let mut cmd = Command::new("docker");
                cmd.args(docker_args(&self.image, workspace, &argv));
                cmd
            }
            SandboxMode::Direct => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(shell).current_dir(workspace);
                cmd
            }
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn provision(&self) -> Result<SandboxHandle> {
        let dir = tempfile::Builder::new()
            .prefix("foundry-sandbox-")
            .tempdir()
            .context("failed to create sandbox workspace")?;
        if let Some(seed) = &self.seed_root {
            let (from, to) = (seed.clone(), dir.path().to_path_buf());
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .context("workspace copy task panicked")??;
        }
        let root = dir.path().to_path_buf();
        let id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.to_string_lossy().into_owned());
        debug!(sandbox = %id, mode = ?self.mode, "sandbox provisioned");
        self.workspaces.lock().await.insert(id.clone(), dir);
        Ok(SandboxHandle { id, root })
    }

    async fn load_files(&self, handle: &SandboxHandle, files: &BTreeMap<String, String>) -> Result<()> {
        let guard = ContainmentGuard::new(&handle.root)?;
        for (rel, content) in files {
            let path = guard.resolve_within(rel)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("failed to write {rel} into sandbox {}", handle.id))?;
        }
        Ok(())
    }

    async fn run(&self, handle: &SandboxHandle, command: &str) -> Result<ExecResult> {
        let workspace = handle.root.to_string_lossy().into_owned();
        let mut cmd = self.command_for(&workspace, command);
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("sandbox command timed out after {}s: {command}", self.timeout.as_secs()))?
            .with_context(|| format!("failed to spawn sandbox command: {command}"))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    async fn run_tests(&self, handle: &SandboxHandle, target: &str) -> Result<TestRunResult> {
        let command = self.test_command.replace("{target}", target);
        let result = self.run(handle, &command).await?;
        let log = result.combined_output();
        let (passed_count, failed_count) = parse_test_counts(&log);
        Ok(TestRunResult {
            passed: result.success(),
            total: passed_count + failed_count,
            failed: if result.success() { failed_count } else { failed_count.max(1) },
            log,
            target: target.to_string(),
        })
    }

    async fn dispose(&self, handle: &SandboxHandle) -> Result<()> {
        if let Some(dir) = self.workspaces.lock().await.remove(&handle.id) {
            dir.close()
                .with_context(|| format!("failed to remove sandbox {}", handle.id))?;
        }
        Ok(())
    }
}

const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from).with_context(|| format!("cannot read {}", from.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let file_type = entry.file_type()?;
        let dest = to.join(&name);
        if file_type.is_dir() {
            if SKIP_DIRS.iter().any(|s| name.as_os_str() == *s) {
                continue;
            }
            std::fs::create_dir_all(&dest)?;
            copy_tree(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Last `N passed` / `N failed` (or `errors`) counts in a runner summary.
pub fn parse_test_counts(log: &str) -> (u32, u32) {
    let mut passed = 0;
    let mut failed = 0;
    let words: Vec<&str> = log
        .split(|c: char| c.is_whitespace() || c == ',' || c == '=')
        .filter(|w| !w.is_empty())
        .collect();
    for pair in words.windows(2) {
        let Ok(n) = pair[0].parse::<u32>() else { continue };
        let label = pair[1].trim_matches(|c: char| !c.is_ascii_alphabetic());
        match label {
            "passed" => passed = n,
            "failed" | "error" | "errors" => failed = n,
            _ => {}
        }
    }
    (passed, failed)
}
