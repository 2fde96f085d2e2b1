use std::{collections::HashMap, time::Duration};

use anyhow::Result;

/// Runtime configuration. Process env wins over `.env`; unparseable numbers
/// fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    // State
    pub state_path: String,
    pub seed_state_path: String,
    pub source_root: String,
    /// When set, originals are read from this git revision instead of the
    /// working tree.
    pub source_rev: String,
    /// Root under which guidance files may be written.
    pub containment_root: String,

    // Loop timing
    pub poll_interval_s: u64,
    pub tick_s: u64,

    // Policy
    pub max_retries: u32,
    pub sprint_size: usize,

    // Uncertainty detector
    pub entropy_samples: usize,
    pub entropy_threshold_ratio: f64,
    pub entropy_temperature: f64,

    // Sandbox
    /// "auto" (default), "bwrap", "docker", or "direct".
    pub sandbox_backend: String,
    pub sandbox_image: String,
    /// `{target}` is replaced with the inferred test target.
    pub test_cmd: String,

    // Worker
    pub github_token: String,
    /// `owner/name`.
    pub github_repository: String,
    pub worker_username: String,

    // Models
    pub ollama_url: String,
    pub judge_model: String,
    pub reviewer_model: String,

    /// "json" switches the subscriber to JSON lines.
    pub log_format: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    parse_dotenv_str(&contents, &mut map);
    map
}

fn parse_dotenv_str(contents: &str, map: &mut HashMap<String, String>) {
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_f64(key: &str, dotenv: &HashMap<String, String>, default: f64) -> f64 {
    get(key, dotenv)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        Ok(Self::from_map(&dotenv))
    }

    fn from_map(dotenv: &HashMap<String, String>) -> Self {
        Self {
            state_path: get_str("STATE_PATH", dotenv, "store/foundry_state.json"),
            seed_state_path: get_str("SEED_STATE_PATH", dotenv, "store/foundry_state.seed.json"),
            source_root: get_str("SOURCE_ROOT", dotenv, "."),
            source_rev: get_str("SOURCE_REV", dotenv, ""),
            containment_root: get_str("CONTAINMENT_ROOT", dotenv, "product/prompts"),

            poll_interval_s: get_u64("POLL_INTERVAL_S", dotenv, 30),
            tick_s: get_u64("TICK_S", dotenv, 15),

            max_retries: get_u32("MAX_RETRIES", dotenv, 3),
            sprint_size: get_usize("SPRINT_SIZE", dotenv, 5),

            entropy_samples: get_usize("ENTROPY_SAMPLES", dotenv, 5),
            entropy_threshold_ratio: get_f64("ENTROPY_THRESHOLD_RATIO", dotenv, 0.8),
            entropy_temperature: get_f64("ENTROPY_TEMPERATURE", dotenv, 0.7),

            sandbox_backend: get_str("SANDBOX_BACKEND", dotenv, "auto"),
            sandbox_image: get_str("SANDBOX_IMAGE", dotenv, "foundry-sandbox"),
            test_cmd: get_str("TEST_CMD", dotenv, "python -m pytest {target}"),

            github_token: get_str("GITHUB_TOKEN", dotenv, ""),
            github_repository: get_str("GITHUB_REPOSITORY", dotenv, ""),
            worker_username: get_str("WORKER_USERNAME", dotenv, "google-jules"),

            ollama_url: get_str("OLLAMA_URL", dotenv, "http://127.0.0.1:11434"),
            judge_model: get_str("JUDGE_MODEL", dotenv, "llama3.1"),
            reviewer_model: get_str("REVIEWER_MODEL", dotenv, "llama3.1"),

            log_format: get_str("LOG_FORMAT", dotenv, "text"),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_s.max(1))
    }
}
