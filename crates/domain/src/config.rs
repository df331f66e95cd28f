//! Engine configuration, loaded from `weft.toml`.
//!
//! Every section and field has a serde default so a missing or empty config
//! file yields a working engine; `validate()` reports issues without
//! aborting deserialization.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::definition::ToolSpec;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub streamer: StreamerConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    /// Tools agents may invoke, referenced by persona `tool_ids`.
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut err = |message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message,
            })
        };

        if self.streamer.batch_size == 0 {
            err("streamer.batch_size must be >= 1".into());
        }
        if self.streamer.rows_per_insert == 0 {
            err("streamer.rows_per_insert must be >= 1".into());
        }
        if self.conversation.max_moves == 0 {
            err("conversation.max_moves must be >= 1".into());
        }
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            err(format!("server.bind '{}' is not a socket address", self.server.bind));
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(&tool.id) {
                err(format!("tools: duplicate tool id '{}'", tool.id));
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_bind")]
    pub bind: String,
    /// CORS origins; empty = allow any (dev mode).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: d_bind(),
            cors_origins: Vec::new(),
        }
    }
}

fn d_bind() -> String {
    "127.0.0.1:8080".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// State directory for JSONL journals. `None` = in-memory only.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { state_path: None }
    }
}

/// Event/trace streamer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerConfig {
    /// Combined event+trace buffer size that triggers an immediate flush.
    #[serde(default = "d_batch_size")]
    pub batch_size: usize,
    #[serde(default = "d_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Rows per insert chunk within one flush.
    #[serde(default = "d_rows_per_insert")]
    pub rows_per_insert: usize,
    /// Consecutive flush failures before a batch is dropped.
    #[serde(default = "d_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "d_true")]
    pub trace_enabled: bool,
    /// How far back the `history` payload reaches on subscribe.
    #[serde(default = "d_history_window_secs")]
    pub history_window_secs: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            batch_size: d_batch_size(),
            flush_interval_ms: d_flush_interval_ms(),
            rows_per_insert: d_rows_per_insert(),
            max_retry_attempts: d_max_retry_attempts(),
            trace_enabled: true,
            history_window_secs: d_history_window_secs(),
        }
    }
}

fn d_batch_size() -> usize {
    50
}

fn d_flush_interval_ms() -> u64 {
    50
}

fn d_rows_per_insert() -> usize {
    7
}

fn d_max_retry_attempts() -> u32 {
    3
}

fn d_history_window_secs() -> u64 {
    300
}

fn d_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Default recent-turn window for context assembly (persona overrides).
    #[serde(default = "d_recent_turns_limit")]
    pub recent_turns_limit: usize,
    #[serde(default = "d_llm_timeout_ms")]
    pub llm_timeout_ms: u64,
    /// Hard ceiling on LLM-tool loop iterations per turn.
    #[serde(default = "d_max_moves")]
    pub max_moves: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            recent_turns_limit: d_recent_turns_limit(),
            llm_timeout_ms: d_llm_timeout_ms(),
            max_moves: d_max_moves(),
        }
    }
}

fn d_recent_turns_limit() -> usize {
    10
}

fn d_llm_timeout_ms() -> u64 {
    60_000
}

fn d_max_moves() -> u32 {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuning_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.streamer.batch_size, 50);
        assert_eq!(cfg.streamer.flush_interval_ms, 50);
        assert_eq!(cfg.streamer.rows_per_insert, 7);
        assert_eq!(cfg.streamer.max_retry_attempts, 3);
        assert_eq!(cfg.conversation.recent_turns_limit, 10);
        assert!(cfg.streamer.trace_enabled);
    }

    #[test]
    fn empty_toml_deserializes() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg: Config = toml::from_str(
            r#"
            [streamer]
            batch_size = 10

            [server]
            bind = "0.0.0.0:9000"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.streamer.batch_size, 10);
        assert_eq!(cfg.streamer.flush_interval_ms, 50);
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn validate_flags_bad_values() {
        let mut cfg = Config::default();
        cfg.streamer.batch_size = 0;
        cfg.server.bind = "nonsense".into();
        let issues = cfg.validate();
        assert_eq!(issues.len(), 2);
        assert!(issues
            .iter()
            .all(|i| i.severity == ConfigSeverity::Error));
    }
}
