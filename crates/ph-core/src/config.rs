use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.ptyhive/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub scrollback: ScrollbackConfig,
    #[serde(default)]
    pub teardown: TeardownConfig,
}

impl Config {
    /// Load config from `~/.ptyhive/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(cfg)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sessions.validate()?;
        self.batcher.validate()?;
        self.scrollback.validate()?;
        self.teardown.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ptyhive")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn require(cond: bool, msg: &str) -> Result<(), ConfigError> {
    if cond {
        Ok(())
    } else {
        Err(ConfigError::Validation(msg.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Session registry and process launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Ceiling on live sessions; the least recently used are evicted beyond it.
    #[serde(default = "default_max_live_sessions")]
    pub max_live_sessions: usize,
    /// Interactive shell program. Falls back to `/bin/bash` then `/bin/sh`
    /// when the configured path does not exist.
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Delay between shell spawn and injection of the initial command.
    #[serde(default = "default_initial_command_delay_ms")]
    pub initial_command_delay_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_live_sessions: default_max_live_sessions(),
            shell: default_shell(),
            shell_args: default_shell_args(),
            term: default_term(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            initial_command_delay_ms: default_initial_command_delay_ms(),
        }
    }
}

impl SessionsConfig {
    pub fn initial_command_delay(&self) -> Duration {
        Duration::from_millis(self.initial_command_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require(self.max_live_sessions > 0, "sessions.max_live_sessions must be > 0")?;
        require(!self.shell.trim().is_empty(), "sessions.shell must not be empty")?;
        require(
            self.default_cols > 0 && self.default_rows > 0,
            "sessions.default_cols and default_rows must be > 0",
        )
    }
}

fn default_max_live_sessions() -> usize {
    8
}
fn default_shell() -> String {
    "/bin/zsh".into()
}
fn default_shell_args() -> Vec<String> {
    vec!["-l".into()]
}
fn default_term() -> String {
    "xterm-256color".into()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_initial_command_delay_ms() -> u64 {
    350
}

/// Output pacing between the PTY reader and the terminal buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Chunks at most this large bypass the queue when nothing is pending.
    #[serde(default = "default_immediate_max_bytes")]
    pub immediate_max_bytes: usize,
    /// Chunks at most this large bypass batching while the user is typing.
    #[serde(default = "default_typing_max_bytes")]
    pub typing_max_bytes: usize,
    #[serde(default = "default_typing_window_ms")]
    pub typing_window_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_queued_chunks")]
    pub max_queued_chunks: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            immediate_max_bytes: default_immediate_max_bytes(),
            typing_max_bytes: default_typing_max_bytes(),
            typing_window_ms: default_typing_window_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            max_queued_chunks: default_max_queued_chunks(),
        }
    }
}

impl BatcherConfig {
    pub fn typing_window(&self) -> Duration {
        Duration::from_millis(self.typing_window_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require(
            self.immediate_max_bytes <= self.typing_max_bytes,
            "batcher.immediate_max_bytes must not exceed typing_max_bytes",
        )?;
        require(self.max_queued_chunks > 0, "batcher.max_queued_chunks must be > 0")
    }
}

fn default_immediate_max_bytes() -> usize {
    96
}
fn default_typing_max_bytes() -> usize {
    512
}
fn default_typing_window_ms() -> u64 {
    80
}
fn default_flush_interval_ms() -> u64 {
    2
}
fn default_max_queued_chunks() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollbackConfig {
    #[serde(default = "default_baseline_lines")]
    pub baseline_lines: usize,
    /// History size used for resume workflows.
    #[serde(default = "default_boosted_lines")]
    pub boosted_lines: usize,
    #[serde(default = "default_shrink_delay_secs")]
    pub shrink_delay_secs: u64,
}

impl Default for ScrollbackConfig {
    fn default() -> Self {
        Self {
            baseline_lines: default_baseline_lines(),
            boosted_lines: default_boosted_lines(),
            shrink_delay_secs: default_shrink_delay_secs(),
        }
    }
}

impl ScrollbackConfig {
    pub fn shrink_delay(&self) -> Duration {
        Duration::from_secs(self.shrink_delay_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require(self.baseline_lines > 0, "scrollback.baseline_lines must be > 0")?;
        require(
            self.boosted_lines >= self.baseline_lines,
            "scrollback.boosted_lines must be >= baseline_lines",
        )
    }
}

fn default_baseline_lines() -> usize {
    10_000
}
fn default_boosted_lines() -> usize {
    120_000
}
fn default_shrink_delay_secs() -> u64 {
    180
}

/// Graduated shutdown timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownConfig {
    /// How long a process may take to honour SIGTERM/SIGHUP before escalation.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Post-SIGKILL window spent waiting to reap the process.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Snapshot+kill sweeps performed by the process tree killer.
    #[serde(default = "default_tree_kill_passes")]
    pub tree_kill_passes: u8,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
            tree_kill_passes: default_tree_kill_passes(),
        }
    }
}

impl TeardownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require(self.poll_interval_ms > 0, "teardown.poll_interval_ms must be > 0")?;
        require(
            self.poll_interval_ms <= self.grace_ms,
            "teardown.poll_interval_ms must not exceed grace_ms",
        )?;
        require(self.tree_kill_passes >= 1, "teardown.tree_kill_passes must be >= 1")
    }
}

fn default_grace_ms() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    20
}
fn default_settle_ms() -> u64 {
    150
}
fn default_tree_kill_passes() -> u8 {
    1
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.sessions.shell, "/bin/zsh");
        assert_eq!(cfg.sessions.shell_args, vec!["-l".to_string()]);
        assert_eq!(cfg.batcher.immediate_max_bytes, 96);
        assert_eq!(cfg.batcher.typing_max_bytes, 512);
        assert_eq!(cfg.batcher.max_queued_chunks, 32);
        assert_eq!(cfg.scrollback.boosted_lines, 120_000);
        assert_eq!(cfg.teardown.grace(), Duration::from_millis(300));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = Config::from_toml(
            r#"
            [sessions]
            max_live_sessions = 3
            shell = "/bin/sh"

            [batcher]
            flush_interval_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sessions.max_live_sessions, 3);
        assert_eq!(cfg.sessions.shell, "/bin/sh");
        assert_eq!(cfg.sessions.term, "xterm-256color");
        assert_eq!(cfg.batcher.flush_interval(), Duration::from_millis(5));
        assert_eq!(cfg.batcher.typing_window(), Duration::from_millis(80));
        assert_eq!(cfg.scrollback.shrink_delay(), Duration::from_secs(180));
    }

    #[test]
    fn log_format_parses_snake_case() {
        let cfg = Config::from_toml("[general]\nlog_format = \"json\"\n").unwrap();
        assert_eq!(cfg.general.log_format, LogFormat::Json);
    }

    #[test]
    fn rejects_zero_session_ceiling() {
        let err = Config::from_toml("[sessions]\nmax_live_sessions = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)), "got {err:?}");
    }

    #[test]
    fn rejects_inverted_batch_thresholds() {
        let err = Config::from_toml(
            "[batcher]\nimmediate_max_bytes = 1024\ntyping_max_bytes = 512\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_boost_below_baseline() {
        let err = Config::from_toml(
            "[scrollback]\nbaseline_lines = 5000\nboosted_lines = 100\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_poll_longer_than_grace() {
        let err = Config::from_toml("[teardown]\ngrace_ms = 10\npoll_interval_ms = 50\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn parse_error_is_reported() {
        let err = Config::from_toml("[sessions\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn toml_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.sessions.max_live_sessions = 4;
        cfg.teardown.tree_kill_passes = 3;
        std::fs::write(&path, cfg.to_toml().unwrap()).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.sessions.max_live_sessions, 4);
        assert_eq!(loaded.teardown.tree_kill_passes, 3);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
