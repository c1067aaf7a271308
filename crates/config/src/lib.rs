//! Configuration loading, validation, and management for VaultMind.
//!
//! Loads configuration from `~/.vaultmind/config.toml` with environment
//! variable overrides. Every knob has a default, so a missing file is a
//! valid configuration. Validates all settings at startup.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use logging::{LoggingConfig, init_logging};

/// The root configuration structure.
///
/// Maps directly to `~/.vaultmind/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Vault layout and agent resolution
    #[serde(default)]
    pub vault: VaultSection,

    /// Session lock timeouts
    #[serde(default)]
    pub locks: LockConfig,

    /// Context window size, guard thresholds and prompt sub-budgets
    #[serde(default)]
    pub context: ContextConfig,

    /// History compaction
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Token estimation heuristics
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Incoming message validation
    #[serde(default)]
    pub intake: IntakeConfig,

    /// LLM/tool execution
    #[serde(default)]
    pub execute: ExecuteConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSection {
    /// Root directory of the knowledge vault
    #[serde(default = "default_vault_root")]
    pub root: PathBuf,

    /// Directory (relative to root) holding one sub-directory per agent
    #[serde(default = "default_agents_dir")]
    pub agents_dir: String,

    /// Directory (relative to root) holding one sub-directory per project
    #[serde(default = "default_projects_dir")]
    pub projects_dir: String,

    /// Agent used when a request names none
    #[serde(default = "default_agent_id")]
    pub default_agent_id: String,

    /// File name of an agent definition inside its directory
    #[serde(default = "default_agent_file")]
    pub agent_file: String,
}

fn default_vault_root() -> PathBuf {
    VaultConfig::config_dir().join("vault")
}
fn default_agents_dir() -> String {
    "agents".into()
}
fn default_projects_dir() -> String {
    "projects".into()
}
fn default_agent_id() -> String {
    "assistant".into()
}
fn default_agent_file() -> String {
    "AGENT.md".into()
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            root: default_vault_root(),
            agents_dir: default_agents_dir(),
            projects_dir: default_projects_dir(),
            default_agent_id: default_agent_id(),
            agent_file: default_agent_file(),
        }
    }
}

impl VaultSection {
    /// Directory scanned by agent discovery.
    pub fn agents_root(&self) -> PathBuf {
        self.root.join(&self.agents_dir)
    }

    /// Agent definition path derived from a project name.
    pub fn project_agent_path(&self, project: &str) -> PathBuf {
        self.root
            .join(&self.projects_dir)
            .join(project)
            .join(&self.agent_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lifetime of a session lock before it is considered abandoned
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// How long `acquire` waits for a contended lock
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Period of the background expired-lock sweep
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    900_000
}
fn default_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_cleanup_interval_ms() -> u64 {
    60_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl LockConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Usage-ratio boundaries of the context window guard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuardThresholds {
    pub flush: f64,
    pub compact: f64,
    pub critical: f64,
}

impl Default for GuardThresholds {
    fn default() -> Self {
        Self {
            flush: default_flush_threshold(),
            compact: default_compaction_threshold(),
            critical: default_critical_threshold(),
        }
    }
}

/// Token sub-budgets for each section of the assembled prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBudgets {
    #[serde(default = "default_agent_definition_budget")]
    pub agent_definition: usize,
    #[serde(default = "default_working_memory_budget")]
    pub working_memory: usize,
    #[serde(default = "default_knowledge_budget")]
    pub knowledge: usize,
    #[serde(default = "default_history_budget")]
    pub history: usize,
}

fn default_agent_definition_budget() -> usize {
    8_000
}
fn default_working_memory_budget() -> usize {
    4_000
}
fn default_knowledge_budget() -> usize {
    8_000
}
fn default_history_budget() -> usize {
    40_000
}

impl Default for ContextBudgets {
    fn default() -> Self {
        Self {
            agent_definition: default_agent_definition_budget(),
            working_memory: default_working_memory_budget(),
            knowledge: default_knowledge_budget(),
            history: default_history_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Total tokens the model accepts
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Tokens held back for the response
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,

    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: f64,

    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// Usage ratio compaction aims for
    #[serde(default = "default_compaction_target_ratio")]
    pub compaction_target_ratio: f64,

    #[serde(default)]
    pub budgets: ContextBudgets,

    /// How many transcript messages are read back as history
    #[serde(default = "default_recent_message_limit")]
    pub recent_message_limit: usize,
}

fn default_context_window() -> usize {
    100_000
}
fn default_reserve_tokens() -> usize {
    4_000
}
fn default_flush_threshold() -> f64 {
    0.70
}
fn default_compaction_threshold() -> f64 {
    0.85
}
fn default_critical_threshold() -> f64 {
    0.95
}
fn default_compaction_target_ratio() -> f64 {
    0.5
}
fn default_recent_message_limit() -> usize {
    50
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            reserve_tokens: default_reserve_tokens(),
            flush_threshold: default_flush_threshold(),
            compaction_threshold: default_compaction_threshold(),
            critical_threshold: default_critical_threshold(),
            compaction_target_ratio: default_compaction_target_ratio(),
            budgets: ContextBudgets::default(),
            recent_message_limit: default_recent_message_limit(),
        }
    }
}

impl ContextConfig {
    pub fn thresholds(&self) -> GuardThresholds {
        GuardThresholds {
            flush: self.flush_threshold,
            compact: self.compaction_threshold,
            critical: self.critical_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// History above this many tokens is compacted
    #[serde(default = "default_compaction_max_tokens")]
    pub max_tokens: usize,

    /// Hard cap on the generated summary
    #[serde(default = "default_summary_tokens")]
    pub summary_tokens: usize,

    /// Most recent messages always kept verbatim
    #[serde(default = "default_preserve_recent")]
    pub preserve_recent: usize,

    /// Also keep earlier messages that carry importance markers
    #[serde(default = "default_true")]
    pub preserve_important: bool,
}

fn default_compaction_max_tokens() -> usize {
    40_000
}
fn default_summary_tokens() -> usize {
    1_000
}
fn default_preserve_recent() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_compaction_max_tokens(),
            summary_tokens: default_summary_tokens(),
            preserve_recent: default_preserve_recent(),
            preserve_important: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,

    #[serde(default = "default_words_per_token")]
    pub words_per_token: f64,

    /// Fixed per-message cost of role and formatting markers
    #[serde(default = "default_message_overhead")]
    pub message_overhead: usize,

    /// Buffered characters before the streaming counter folds its buffer
    #[serde(default = "default_stream_flush_chars")]
    pub stream_flush_chars: usize,
}

fn default_chars_per_token() -> f64 {
    4.0
}
fn default_words_per_token() -> f64 {
    0.75
}
fn default_message_overhead() -> usize {
    4
}
fn default_stream_flush_chars() -> usize {
    100
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            words_per_token: default_words_per_token(),
            message_overhead: default_message_overhead(),
            stream_flush_chars: default_stream_flush_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Minimum trimmed message length
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Maximum trimmed message length
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_min_length() -> usize {
    1
}
fn default_max_length() -> usize {
    100_000
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            max_length: default_max_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteConfig {
    /// Maximum LLM calls per turn while the model keeps requesting tools
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,

    /// How often the session lock is extended while awaiting the LLM
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a cancelled LLM call may take to hand back its partial output
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,
}

fn default_max_tool_iterations() -> u32 {
    10
}
fn default_heartbeat_interval_ms() -> u64 {
    60_000
}
fn default_abort_grace_ms() -> u64 {
    2_000
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            abort_grace_ms: default_abort_grace_ms(),
        }
    }
}

impl ExecuteConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

impl VaultConfig {
    /// Load configuration from the default path (~/.vaultmind/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `VAULTMIND_VAULT_ROOT`
    /// - `VAULTMIND_DEFAULT_AGENT`
    /// - `VAULTMIND_CONTEXT_WINDOW`
    /// - `VAULTMIND_LOG_LEVEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(root) = std::env::var("VAULTMIND_VAULT_ROOT") {
            self.vault.root = PathBuf::from(root);
        }
        if let Ok(agent) = std::env::var("VAULTMIND_DEFAULT_AGENT") {
            self.vault.default_agent_id = agent;
        }
        if let Ok(window) = std::env::var("VAULTMIND_CONTEXT_WINDOW") {
            self.context.context_window = window.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "VAULTMIND_CONTEXT_WINDOW must be a positive integer, got {window:?}"
                ))
            })?;
        }
        if let Ok(level) = std::env::var("VAULTMIND_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".vaultmind")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.context.thresholds();
        if !(0.0 < t.flush && t.flush < t.compact && t.compact < t.critical && t.critical <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "thresholds must satisfy 0 < flush < compaction < critical <= 1 (got {} / {} / {})",
                t.flush, t.compact, t.critical
            )));
        }

        if self.context.reserve_tokens >= self.context.context_window {
            return Err(ConfigError::ValidationError(
                "reserve_tokens must be smaller than context_window".into(),
            ));
        }

        let target = self.context.compaction_target_ratio;
        if !(0.0 < target && target < 1.0) {
            return Err(ConfigError::ValidationError(
                "compaction_target_ratio must be between 0.0 and 1.0".into(),
            ));
        }

        if self.tokens.chars_per_token <= 0.0 || self.tokens.words_per_token <= 0.0 {
            return Err(ConfigError::ValidationError(
                "chars_per_token and words_per_token must be > 0".into(),
            ));
        }

        if self.intake.min_length > self.intake.max_length {
            return Err(ConfigError::ValidationError(
                "intake.min_length must not exceed intake.max_length".into(),
            ));
        }

        if self.locks.lock_timeout_ms == 0 || self.locks.acquire_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "lock timeouts must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
