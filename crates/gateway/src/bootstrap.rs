//! AppState construction shared by `serve` and any future CLI commands
//! that need a booted runtime without the HTTP listener.

use std::sync::Arc;

use anyhow::Context;

use weft_domain::config::{Config, ConfigSeverity};
use weft_engine::{DefaultExecutor, Runtime};
use weft_llm::MockLlm;
use weft_store::{MemoryStore, Store};

use crate::state::AppState;

/// Validate config and wire the runtime: store (journaled when a state
/// path is configured), LLM client, and executor.
///
/// The built-in LLM client is the mock; provider adapters implement
/// `weft_llm::LlmClient` and plug in here.
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let store: Arc<dyn Store> = match &config.storage.state_path {
        Some(path) => {
            let store = MemoryStore::open(path)
                .with_context(|| format!("opening store at {}", path.display()))?;
            tracing::info!(path = %path.display(), "journaled store ready");
            Arc::new(store)
        }
        None => {
            tracing::info!("in-memory store (no state path configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let llm = Arc::new(MockLlm::new());
    let executor = Arc::new(DefaultExecutor::new(store.clone(), llm.clone()));
    let runtime = Runtime::new(store, llm, executor, (*config).clone());
    tracing::info!(tools = config.tools.len(), "runtime ready");

    Ok(AppState { runtime, config })
}
