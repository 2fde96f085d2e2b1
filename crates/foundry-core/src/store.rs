use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::types::AggregateState;

/// Where a loaded snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Seed,
    Default,
}

/// Crash-safe persistence for [`AggregateState`].
///
/// Loads fall back primary → seed → built-in default and never return a
/// partially-populated state. Saves go through a temp file in the target
/// directory followed by an atomic rename.
#[derive(Debug, Clone)]
pub struct StateStore {
    primary: PathBuf,
    seed: Option<PathBuf>,
}

/// A fully-written snapshot that has not yet replaced the primary file.
/// Dropping it without [`StagedSnapshot::commit`] leaves the primary intact.
pub struct StagedSnapshot {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedSnapshot {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically rename the staged file over the primary.
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to replace {}", target.display()))?;
        Ok(())
    }
}

impl StateStore {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: impl Into<PathBuf>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    pub fn load(&self) -> (AggregateState, LoadSource) {
        match read_valid(&self.primary) {
            Ok(state) => return (state, LoadSource::Primary),
            Err(e) => warn!("state file unusable, trying seed: {e:#}"),
        }
        if let Some(seed) = &self.seed {
            match read_valid(seed) {
                Ok(state) => {
                    info!("loaded seed snapshot from {}", seed.display());
                    return (state, LoadSource::Seed);
                }
                Err(e) => warn!("seed snapshot unusable, using defaults: {e:#}"),
            }
        }
        (AggregateState::default(), LoadSource::Default)
    }

    /// Write `state` to a temp file next to the primary and fsync it.
    pub fn stage(&self, state: &AggregateState) -> Result<StagedSnapshot> {
        let dir = match self.primary.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(state).context("failed to serialize state")?;
        let mut temp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        temp.write_all(&json).context("failed to write state snapshot")?;
        temp.as_file().sync_all().context("failed to fsync state snapshot")?;

        Ok(StagedSnapshot {
            temp,
            target: self.primary.clone(),
        })
    }

    pub fn save(&self, state: &AggregateState) -> Result<()> {
        self.stage(state)?.commit()
    }
}

fn read_valid(path: &Path) -> Result<AggregateState> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let state: AggregateState = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid state document", path.display()))?;
    state
        .validate()
        .map_err(|reason| anyhow::anyhow!("{} failed validation: {reason}", path.display()))?;
    Ok(state)
}
