//! Engine configuration, resolved from environment variables.
//!
//! The CLI overrides a handful of fields (`--model`, `--count`, `--mission`);
//! everything else follows the `SCRIBE_*` environment contract plus the two
//! provider credentials `LLM_API_KEY` and `RESEARCH_API_KEY`.

use std::time::Duration;

use orchestration::phase::PhaseThresholds;

fn u64_from_env(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn usize_from_env(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn bool_from_env(var: &str, default: bool) -> bool {
    std::env::var(var)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// External edit tool binary (expects the aider argument contract).
    pub tool_program: String,
    /// Model identifier passed to the tool.
    pub model: String,
    /// Primary LLM credential. Absence disables edit cycles.
    pub llm_api_key: Option<String>,
    /// Research backend credential. Absence disables research agents.
    pub research_api_key: Option<String>,
    /// Research backend chat-completions endpoint.
    pub research_url: String,
    /// Model requested from the research backend.
    pub research_model: String,
    /// Worker pool size.
    pub concurrency: usize,
    /// Rate limiter budget per window.
    pub max_requests: usize,
    /// Rate limiter window.
    pub rate_window: Duration,
    /// Hard cap on a single edit-tool invocation.
    pub tool_timeout: Duration,
    /// Research HTTP call timeout.
    pub research_timeout: Duration,
    /// Consecutive cycle errors before agent recovery is attempted.
    pub recovery_max_attempts: u32,
    /// Phase thresholds (token limit and ratios).
    pub phase: PhaseThresholds,
    /// Verbose logging requested (DEBUG env or --verbose).
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_program: std::env::var("SCRIBE_TOOL").unwrap_or_else(|_| "aider".into()),
            model: std::env::var("SCRIBE_MODEL")
                .unwrap_or_else(|_| "claude-3-5-haiku-20241022".into()),
            llm_api_key: std::env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            research_api_key: std::env::var("RESEARCH_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            research_url: std::env::var("SCRIBE_RESEARCH_URL")
                .unwrap_or_else(|_| "https://api.perplexity.ai/chat/completions".into()),
            research_model: std::env::var("SCRIBE_RESEARCH_MODEL")
                .unwrap_or_else(|_| "sonar-pro".into()),
            concurrency: usize_from_env("SCRIBE_CONCURRENCY", 10),
            max_requests: usize_from_env("SCRIBE_MAX_REQUESTS", 50),
            rate_window: Duration::from_secs(u64_from_env("SCRIBE_RATE_WINDOW_SECS", 60)),
            tool_timeout: Duration::from_secs(u64_from_env("SCRIBE_TOOL_TIMEOUT_SECS", 300)),
            research_timeout: Duration::from_secs(u64_from_env("SCRIBE_RESEARCH_TIMEOUT_SECS", 30)),
            recovery_max_attempts: u64_from_env("SCRIBE_RECOVERY_MAX_ATTEMPTS", 3) as u32,
            phase: PhaseThresholds {
                model_token_limit: usize_from_env("SCRIBE_TOKEN_LIMIT", 128_000),
                convergence_ratio: 0.60,
                expansion_ratio: 0.50,
            },
            debug: bool_from_env("DEBUG", false),
        }
    }
}

impl EngineConfig {
    /// Edit cycles need the primary provider credential.
    pub fn edit_cycles_enabled(&self) -> bool {
        self.llm_api_key.is_some()
    }

    /// Research agents need the research backend credential.
    pub fn research_enabled(&self) -> bool {
        self.research_api_key.is_some()
    }
}
