use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use log::warn;

use crate::command::CommandSpec;
use crate::retry::RetryPolicy;

/// Environment variable overriding `poll_interval_secs`
pub const ENV_POLL_INTERVAL: &str = "POLLING_INTERVAL_SECONDS";
/// Environment variable overriding `max_concurrent`
pub const ENV_MAX_CONCURRENT: &str = "MAX_CONCURRENT_PROCESSING";

/// Configuration for the processing daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds between two polls of the status ledger
    pub poll_interval_secs: u64,
    /// Maximum number of work items processed concurrently
    pub max_concurrent: usize,
    /// Directory holding one JSON document per work item
    pub ledger_dir: PathBuf,
    /// JSON file holding the registered schema bindings
    pub bindings_path: PathBuf,
    /// Scratch directory for downloaded videos and extracted audio
    pub scratch_dir: PathBuf,
    /// Seconds between two orphan sweeps of the scratch directory
    pub sweep_interval_secs: u64,
    /// Scratch files older than this many seconds are considered orphaned
    pub orphan_max_age_secs: u64,
    /// Non-terminal items untouched for this many seconds are requeued.
    /// Must exceed `longest_silent_run`.
    pub stale_after_secs: u64,
    /// Number of requeues after which a stalled item is failed instead
    pub max_requeues: u32,
    pub retry: RetrySettings,
    pub timeouts: StageTimeouts,
    /// Regular expressions a source URL must match one of
    pub source_patterns: Vec<String>,
    /// External programs backing each stage (used by the daemon binary)
    pub commands: StageCommands,
}

/// Retry settings shared by every stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff sleep
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Per-call timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub download_secs: u64,
    pub transcribe_secs: u64,
    pub extract_text_secs: u64,
    pub summarize_secs: u64,
    pub publish_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            download_secs: 300,
            transcribe_secs: 600,
            extract_text_secs: 120,
            summarize_secs: 180,
            publish_secs: 60,
        }
    }
}

impl StageTimeouts {
    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn transcribe(&self) -> Duration {
        Duration::from_secs(self.transcribe_secs)
    }

    pub fn extract_text(&self) -> Duration {
        Duration::from_secs(self.extract_text_secs)
    }

    pub fn summarize(&self) -> Duration {
        Duration::from_secs(self.summarize_secs)
    }

    pub fn publish(&self) -> Duration {
        Duration::from_secs(self.publish_secs)
    }
}

/// Commands for the command-backed stage clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCommands {
    pub download: Option<CommandSpec>,
    /// Optional audio extraction run before transcription (`{input}` -> `{output}`)
    pub extract_audio: Option<CommandSpec>,
    pub transcribe: Option<CommandSpec>,
    pub extract_text: Option<CommandSpec>,
    pub summarize: Option<CommandSpec>,
    pub publish: Option<CommandSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            poll_interval_secs: 60,
            max_concurrent: 5,
            ledger_dir: PathBuf::from("/var/lib/svpd/items"),
            bindings_path: PathBuf::from("/var/lib/svpd/bindings.json"),
            scratch_dir: PathBuf::from("/tmp/svpd-scratch"),
            sweep_interval_secs: 24 * 60 * 60,
            orphan_max_age_secs: 24 * 60 * 60,
            stale_after_secs: 60 * 60,
            max_requeues: 3,
            retry: RetrySettings::default(),
            timeouts: StageTimeouts::default(),
            source_patterns: default_source_patterns(),
            commands: StageCommands::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist.
    /// Environment overrides are applied last.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which stale recovery could requeue a live run
    pub fn validate(&self) -> Result<()> {
        let longest = self.longest_silent_run();
        if Duration::from_secs(self.stale_after_secs) <= longest {
            bail!(
                "stale_after_secs ({}) must be greater than {}s, the longest a run can go without writing its status",
                self.stale_after_secs,
                longest.as_secs()
            );
        }
        Ok(())
    }

    /// Longest a healthy run can go between two status writes: every attempt
    /// of a stage timing out, plus the backoff sleeps in between. Text
    /// extraction and summarization share the `processing` status.
    pub fn longest_silent_run(&self) -> Duration {
        let retry = RetryPolicy::from_settings(&self.retry);
        let exhausted = |limit: Duration| {
            let backoff: Duration = (1..retry.max_attempts).map(|n| retry.delay_for_attempt(n)).sum();
            limit.saturating_mul(retry.max_attempts).saturating_add(backoff)
        };
        let t = &self.timeouts;
        [
            exhausted(t.download()),
            exhausted(t.transcribe()),
            exhausted(t.extract_text()).saturating_add(exhausted(t.summarize())),
            exhausted(t.publish()),
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }

    /// Apply `POLLING_INTERVAL_SECONDS` / `MAX_CONCURRENT_PROCESSING` from a variable lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_POLL_INTERVAL) {
            self.poll_interval_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got {:?}", ENV_POLL_INTERVAL, raw))?;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT) {
            self.max_concurrent = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer, got {:?}", ENV_MAX_CONCURRENT, raw))?;
        }
        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_secs(self.orphan_max_age_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

/// Short-video platforms accepted out of the box
pub fn default_source_patterns() -> Vec<String> {
    vec![
        r"^https?://(www\.|vm\.|vt\.|m\.)?tiktok\.com/".to_string(),
        r"^https?://(www\.)?instagram\.com/(reel|reels|p)/".to_string(),
        r"^https?://(www\.|m\.)?youtube\.com/shorts/".to_string(),
        r"^https?://youtu\.be/".to_string(),
    ]
}
