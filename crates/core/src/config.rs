use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

fn profiled_env_bool(profile: &str, key: &str) -> Option<bool> {
    profiled_env_opt(profile, key).and_then(|v| match v.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

// ── Top-level config ──────────────────────────────────────────

/// Full baton configuration.
///
/// Built either purely from the environment ([`Config::from_env`]) or from a
/// `baton.toml` file with environment overrides applied on top
/// ([`Config::from_file`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `BATON_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env_or("BATON_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, ConfigError> {
        let mut config = Self {
            profile: profile.to_uppercase(),
            ..Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        if config.profile.is_empty() {
            config.profile = env_or("BATON_PROFILE", "").to_uppercase();
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Directory holding the persisted lock, queue and history files.
    pub fn state_dir(&self) -> PathBuf {
        self.scheduler.state_dir(&self.project.path)
    }

    /// Apply environment variable overrides for the active profile.
    ///
    /// Convention: `BATON_SECTION_KEY`, e.g. `BATON_MAX_QUEUE_SIZE` overrides
    /// `scheduler.max_queue_size`.
    fn apply_env_overrides(&mut self) {
        let p = self.profile.clone();
        self.project.apply_env_overrides(&p);
        self.scheduler.apply_env_overrides(&p);
        self.publisher.apply_env_overrides(&p);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let s = &self.scheduler;
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  project:     path={}", self.project.path.display());
        tracing::info!(
            "  persistence: enabled={}, dir={}",
            s.enable_persistence,
            self.state_dir().display()
        );
        tracing::info!(
            "  queue:       max_size={}, max_history={}",
            s.max_queue_size,
            s.max_history_size
        );
        tracing::info!(
            "  timeouts:    enabled={}, max_duration_ms={}, warning_ms={}",
            s.enable_auto_timeout,
            s.max_execution_duration_ms,
            s.timeout_warning_ms
        );
        tracing::info!(
            "  publisher:   webhook={}",
            if self.publisher.webhook_url.is_some() { "configured" } else { "(none)" }
        );
    }
}

// ── Project ───────────────────────────────────────────────────

/// The project (working directory) the scheduler state is scoped to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_project_path")]
    pub path: PathBuf,
}

fn default_project_path() -> PathBuf {
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            path: default_project_path(),
        }
    }
}

impl ProjectConfig {
    fn apply_env_overrides(&mut self, p: &str) {
        if let Some(v) = profiled_env_opt(p, "BATON_PROJECT_PATH") {
            self.path = PathBuf::from(v);
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Execution queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of waiting entries before enqueue is refused.
    pub max_queue_size: usize,
    /// Maximum number of execution history records kept on disk.
    pub max_history_size: usize,
    /// Overrides the default `<project>/.baton/state` directory.
    pub persistence_dir: Option<PathBuf>,
    pub enable_persistence: bool,
    /// Force-release holders that exceed `max_execution_duration_ms`.
    pub enable_auto_timeout: bool,
    pub max_execution_duration_ms: u64,
    /// How long before expiry the warning fires.
    pub timeout_warning_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_history_size: 1000,
            persistence_dir: None,
            enable_persistence: true,
            enable_auto_timeout: false,
            max_execution_duration_ms: 300_000,
            timeout_warning_ms: 300_000,
        }
    }
}

impl SchedulerConfig {
    /// Config with persistence switched off, for embedding and tests.
    pub fn in_memory() -> Self {
        Self {
            enable_persistence: false,
            ..Self::default()
        }
    }

    /// Resolve the state directory for a project.
    pub fn state_dir(&self, project: &Path) -> PathBuf {
        self.persistence_dir
            .clone()
            .unwrap_or_else(|| project.join(".baton").join("state"))
    }

    /// Maximum holding time, or `None` when timeouts are disabled.
    pub fn max_execution_duration(&self) -> Option<Duration> {
        self.enable_auto_timeout
            .then(|| Duration::from_millis(self.max_execution_duration_ms))
    }

    pub fn timeout_warning(&self) -> Duration {
        Duration::from_millis(self.timeout_warning_ms)
    }

    fn apply_env_overrides(&mut self, p: &str) {
        if let Some(v) = profiled_env_parse(p, "BATON_MAX_QUEUE_SIZE") {
            self.max_queue_size = v;
        }
        if let Some(v) = profiled_env_parse(p, "BATON_MAX_HISTORY_SIZE") {
            self.max_history_size = v;
        }
        if let Some(v) = profiled_env_opt(p, "BATON_STATE_DIR") {
            self.persistence_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = profiled_env_bool(p, "BATON_ENABLE_PERSISTENCE") {
            self.enable_persistence = v;
        }
        if let Some(v) = profiled_env_bool(p, "BATON_ENABLE_AUTO_TIMEOUT") {
            self.enable_auto_timeout = v;
        }
        if let Some(v) = profiled_env_parse(p, "BATON_MAX_EXECUTION_DURATION_MS") {
            self.max_execution_duration_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "BATON_TIMEOUT_WARNING_MS") {
            self.timeout_warning_ms = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_queue_size must be greater than zero".into(),
            ));
        }
        if self.max_history_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_history_size must be greater than zero".into(),
            ));
        }
        if self.enable_auto_timeout && self.max_execution_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_execution_duration_ms must be greater than zero when auto timeout is enabled".into(),
            ));
        }
        Ok(())
    }
}

// ── Status publisher ──────────────────────────────────────────

/// Where scheduler state transitions are broadcast. Unset = not published.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub webhook_url: Option<String>,
    /// Extra headers; values may reference `${ENV_VAR}`.
    pub headers: HashMap<String, String>,
}

impl PublisherConfig {
    fn apply_env_overrides(&mut self, p: &str) {
        if let Some(v) = profiled_env_opt(p, "BATON_STATUS_WEBHOOK_URL") {
            self.webhook_url = Some(v);
        }
    }

    pub fn is_configured(&self) -> bool {
        self.webhook_url.is_some()
    }
}
