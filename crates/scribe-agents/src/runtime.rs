//! Per-agent cycle execution.
//!
//! One cycle: load the prompt, gather the file list, drive the mutator (or
//! the research backend), then fan the outcome into the map, dataset, and
//! transcript sinks. Every error is caught at the cycle boundary; only fatal
//! workspace failures escape as a dormant transition.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use orchestration::dataset::DatasetRecorder;
use orchestration::phase::PhaseService;
use orchestration::ratelimit::{self, RateLimiter, MAX_RATE_LIMIT_ATTEMPTS};
use orchestration::{ChatLogger, CommitLog, EngineError, EngineResult, MapService, Workspace, TRACKED_EXTENSIONS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::lifecycle::SlotState;
use crate::mutator::{MutationRequest, Mutator, MutatorError};
use crate::research::ResearchClient;
use crate::team::{Agent, AgentKind, Team};

/// How a cycle ended, as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// At least one file changed (or a commit was produced).
    Mutated,
    /// Clean run, nothing changed.
    NoChange,
    /// Pre-flight failed or the cycle was cancelled; no counters touched.
    Skipped,
    /// The cycle failed; the agent's error count was incremented.
    Failed,
    /// Fatal failure or failed recovery; the agent is now dormant.
    Dormant,
}

/// Shared services bundle, built once at startup in dependency order and
/// passed explicitly — there are no global singletons.
pub struct CycleServices {
    pub workspace: Workspace,
    pub team: Arc<Team>,
    pub map: Arc<MapService>,
    pub dataset: Arc<DatasetRecorder>,
    pub chat: Arc<ChatLogger>,
    pub commits: Arc<CommitLog>,
    pub phase: Arc<PhaseService>,
    /// Window for the primary (edit tool) provider.
    pub limiter: Arc<RateLimiter>,
    /// Separate window for the research provider.
    pub research_limiter: Arc<RateLimiter>,
    pub research: Option<Arc<ResearchClient>>,
    pub config: EngineConfig,
}

/// Executes cycles for every agent of the active team.
pub struct AgentRuntime {
    services: Arc<CycleServices>,
    mutator: Arc<dyn Mutator>,
    prompt_cache: Mutex<HashMap<PathBuf, (SystemTime, String)>>,
}

impl AgentRuntime {
    pub fn new(services: Arc<CycleServices>, mutator: Arc<dyn Mutator>) -> Self {
        Self {
            services,
            mutator,
            prompt_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<CycleServices> {
        &self.services
    }

    /// Run one cycle for an in-flight agent.
    ///
    /// The scheduler has already claimed the slot (`InFlight`); this method
    /// owns the `InFlight → Running → Ready | Dormant` edges.
    pub async fn run_cycle(&self, agent: &Arc<Agent>, cancel: &CancellationToken) -> CycleOutcome {
        // --- Pre-flight ---
        if let Err(e) = self.preflight() {
            error!(agent = agent.name(), error = %e, "pre-flight failed, agent dormant");
            let _ = agent.advance_slot(SlotState::Dormant, Some("workspace unavailable"));
            return CycleOutcome::Dormant;
        }
        let prompt = match self.load_prompt(agent) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(agent = agent.name(), error = %e, "prompt unreadable, skipping cycle");
                let _ = agent.advance_slot(SlotState::Ready, Some("prompt unreadable"));
                return CycleOutcome::Skipped;
            }
        };

        if agent
            .advance_slot(SlotState::Running, Some("cycle start"))
            .is_err()
        {
            return CycleOutcome::Skipped;
        }

        let outcome = match agent.kind() {
            AgentKind::Edit => self.run_edit_cycle(agent, &prompt, cancel).await,
            AgentKind::Research => self.run_research_cycle(agent, &prompt, cancel).await,
        };

        match outcome {
            CycleOutcome::Dormant => {
                let _ = agent.advance_slot(SlotState::Dormant, Some("fatal cycle failure"));
            }
            _ => {
                let _ = agent.advance_slot(SlotState::Ready, Some("cycle end"));
            }
        }
        outcome
    }

    fn preflight(&self) -> EngineResult<()> {
        let root = self.services.workspace.root();
        let meta = std::fs::metadata(root)
            .map_err(|e| EngineError::Fatal(format!("workspace root: {e}")))?;
        if meta.permissions().readonly() {
            return Err(EngineError::Fatal("workspace root not writable".into()));
        }
        Ok(())
    }

    /// Read the agent's prompt, cached by mtime. Bytes that are not valid
    /// UTF-8 are decoded as Latin-1 and re-encoded to UTF-8 on disk.
    fn load_prompt(&self, agent: &Agent) -> EngineResult<String> {
        let path = &agent.spec().prompt_path;
        let mtime = std::fs::metadata(path)?.modified()?;

        {
            let cache = self.prompt_cache.lock().expect("prompt cache poisoned");
            if let Some((cached_mtime, content)) = cache.get(path) {
                if *cached_mtime == mtime {
                    return Ok(content.clone());
                }
            }
        }

        let bytes = std::fs::read(path)?;
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(e) => {
                let recovered: String = e.into_bytes().iter().map(|&b| b as char).collect();
                warn!(path = %path.display(), "prompt re-encoded from Latin-1 to UTF-8");
                std::fs::write(path, &recovered)?;
                recovered
            }
        };
        if content.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "prompt {} is empty",
                path.display()
            )));
        }

        let mtime = std::fs::metadata(path)?.modified()?;
        self.prompt_cache
            .lock()
            .expect("prompt cache poisoned")
            .insert(path.clone(), (mtime, content.clone()));
        Ok(content)
    }

    /// Tracked files the agent may edit this cycle.
    fn editable_files(&self) -> Vec<PathBuf> {
        let rules = self.services.workspace.ignore_rules();
        self.services
            .workspace
            .enumerate(&rules, TRACKED_EXTENSIONS, Some(&self.services.team.name))
    }

    // --- Edit cycle ---

    async fn run_edit_cycle(
        &self,
        agent: &Arc<Agent>,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let request = MutationRequest {
            agent: agent.name().to_string(),
            prompt: prompt.to_string(),
            editable_files: self.editable_files(),
            readonly_files: Vec::new(),
            timeout: Some(self.services.config.tool_timeout),
        };

        let result = match self.mutate_with_retries(agent, request, cancel).await {
            Ok(result) => result,
            Err(MutatorError::Cancelled) => return CycleOutcome::Skipped,
            Err(MutatorError::Engine(EngineError::Validation(reason))) => {
                // Bad input is reported, never retried and never counted.
                warn!(agent = agent.name(), %reason, "cycle skipped");
                return CycleOutcome::Skipped;
            }
            Err(e) => {
                warn!(agent = agent.name(), error = %e, "cycle failed");
                return self.note_error(agent).await;
            }
        };

        if result.successful() {
            self.record_success(agent, prompt, &result).await;
            CycleOutcome::Mutated
        } else if result.errors.is_empty() {
            debug!(agent = agent.name(), "cycle produced no changes");
            agent.mark_no_change();
            CycleOutcome::NoChange
        } else {
            warn!(
                agent = agent.name(),
                errors = result.errors.len(),
                first = %result.errors.first().cloned().unwrap_or_default(),
                "cycle reported tool errors"
            );
            self.note_error(agent).await
        }
    }

    /// Drive the mutator behind the rate limiter.
    ///
    /// Critical usage applies the exponential usage back-off before admission;
    /// explicit rate-limit failures retry on the 5·3^(k−1) schedule, capped at
    /// five attempts.
    async fn mutate_with_retries(
        &self,
        agent: &Arc<Agent>,
        request: MutationRequest,
        cancel: &CancellationToken,
    ) -> Result<crate::mutator::MutationResult, MutatorError> {
        let limiter = &self.services.limiter;

        let mut critical_waits = 0u32;
        while limiter.is_critical() {
            critical_waits += 1;
            let delay = ratelimit::usage_backoff(critical_waits);
            warn!(
                agent = agent.name(),
                wait_secs = delay.as_secs(),
                "rate limiter critical, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(MutatorError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        for attempt in 1..=MAX_RATE_LIMIT_ATTEMPTS {
            if !limiter.allow() {
                let wait = limiter.wait_time();
                debug!(agent = agent.name(), wait_secs = wait.as_secs(), "window full, waiting");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(MutatorError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            limiter.record();

            match self.mutator.mutate(request.clone(), cancel).await {
                Err(MutatorError::RateLimited) if attempt < MAX_RATE_LIMIT_ATTEMPTS => {
                    let delay = ratelimit::retry_delay(attempt);
                    warn!(
                        agent = agent.name(),
                        attempt,
                        wait_secs = delay.as_secs(),
                        "provider rate limited, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(MutatorError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
        Err(MutatorError::RateLimited)
    }

    /// Fan a successful mutation into every artifact sink.
    ///
    /// Map update and dataset append both complete before the caller releases
    /// the scheduler slot, so the next observer of this agent sees the
    /// post-state.
    async fn record_success(
        &self,
        agent: &Arc<Agent>,
        prompt: &str,
        result: &crate::mutator::MutationResult,
    ) {
        agent.mark_success();

        let changed = result.changed_paths();
        let deleted: Vec<PathBuf> = result.deleted_files.iter().cloned().collect();
        if let Err(e) = self.services.map.update_entries(&changed, &deleted) {
            // A failed fast-path update never fails the cycle.
            warn!(agent = agent.name(), error = %e, "map update failed");
        }
        self.services
            .phase
            .observe(self.services.map.total_tokens());

        let files_context = self.read_files_context(&changed);
        let response = effective_response(result);
        if let Err(e) = self
            .services
            .dataset
            .append(agent.name(), prompt, &files_context, &response)
        {
            warn!(agent = agent.name(), error = %e, "dataset append failed");
        }

        self.services
            .chat
            .log_interaction(agent.name(), prompt, &response, Some(&files_context));
        for commit in &result.commits {
            self.services.commits.append(commit);
            info!(agent = agent.name(), "{}", commit.display_line());
        }
    }

    fn read_files_context(&self, paths: &[PathBuf]) -> BTreeMap<String, String> {
        let mut context = BTreeMap::new();
        for rel in paths {
            let abs = self.services.workspace.root().join(rel);
            if let Ok(content) = std::fs::read_to_string(&abs) {
                context.insert(rel.display().to_string(), content);
            }
        }
        context
    }

    // --- Research cycle ---

    async fn run_research_cycle(
        &self,
        agent: &Arc<Agent>,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let Some(research) = self.services.research.as_ref() else {
            debug!(agent = agent.name(), "research backend disabled, skipping");
            return CycleOutcome::Skipped;
        };

        // The team's demand document is the research question context.
        let demand_path = self.services.workspace.demand_file(&self.services.team.name);
        let question = std::fs::read_to_string(&demand_path)
            .unwrap_or_else(|_| prompt.to_string());

        self.services.research_limiter.record();
        let answer = tokio::select! {
            _ = cancel.cancelled() => return CycleOutcome::Skipped,
            answer = research.query(prompt, &question) => answer,
        };

        match answer {
            Ok(answer) => {
                agent.mark_success();
                let mut files_context = BTreeMap::new();
                if let Some(rel) = self.services.workspace.relative(&demand_path) {
                    files_context.insert(rel.display().to_string(), question.clone());
                }
                if let Err(e) =
                    self.services
                        .dataset
                        .append(agent.name(), prompt, &files_context, &answer)
                {
                    warn!(agent = agent.name(), error = %e, "dataset append failed");
                }
                self.services
                    .chat
                    .log_interaction(agent.name(), prompt, &answer, Some(&files_context));
                CycleOutcome::Mutated
            }
            Err(e) => {
                warn!(agent = agent.name(), error = %e, "research query failed");
                self.note_error(agent).await
            }
        }
    }

    // --- Error accounting and recovery ---

    async fn note_error(&self, agent: &Arc<Agent>) -> CycleOutcome {
        agent.mark_error();
        let error_count = agent.state().error_count;
        if error_count < self.services.config.recovery_max_attempts {
            return CycleOutcome::Failed;
        }

        info!(agent = agent.name(), error_count, "attempting recovery");
        match self.recover(agent) {
            Ok(()) => {
                info!(agent = agent.name(), "recovery successful");
                CycleOutcome::Failed
            }
            Err(e) => {
                error!(agent = agent.name(), error = %e, "recovery failed, agent dormant");
                CycleOutcome::Dormant
            }
        }
    }

    /// Snapshot the state, re-validate paths, reload the prompt, rebuild the
    /// file list, then reset the counters. Any failure restores the snapshot.
    fn recover(&self, agent: &Arc<Agent>) -> EngineResult<()> {
        let snapshot = agent.state();

        let attempt = (|| -> EngineResult<()> {
            self.preflight()?;

            // Drop the cached prompt and force a re-read.
            self.prompt_cache
                .lock()
                .expect("prompt cache poisoned")
                .remove(&agent.spec().prompt_path);
            self.load_prompt(agent)?;

            if self.editable_files().is_empty() {
                return Err(EngineError::Validation(
                    "no tracked files after recovery".into(),
                ));
            }

            agent.reset_counters();
            Ok(())
        })();

        if attempt.is_err() {
            agent.restore_state(snapshot);
        }
        attempt
    }
}

/// The assistant response recorded for a successful mutation: the tool's raw
/// output when present, otherwise the commit lines, otherwise a change
/// summary in the tool's own notation.
fn effective_response(result: &crate::mutator::MutationResult) -> String {
    if !result.raw_output.is_empty() {
        return result.raw_output.clone();
    }
    if !result.commits.is_empty() {
        return result
            .commits
            .iter()
            .map(|c| c.display_line())
            .collect::<Vec<_>>()
            .join("\n");
    }
    let mut lines = Vec::new();
    for path in &result.modified_files {
        lines.push(format!("Wrote {}", path.display()));
    }
    for path in &result.added_files {
        lines.push(format!("Created {}", path.display()));
    }
    for path in &result.deleted_files {
        lines.push(format!("Deleted {}", path.display()));
    }
    lines.join("\n")
}
