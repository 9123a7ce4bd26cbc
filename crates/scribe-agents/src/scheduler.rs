//! Team scheduler: worker pool, unique-instance guarantee, graceful shutdown.
//!
//! N workers share one in-flight set. A worker claims an agent (uniform random
//! over the eligible ones), runs a cycle through the [`AgentRuntime`], and
//! releases the claim. The set's mutex is held only for claim/release, never
//! across a cycle, and the concurrency cap is the worker count itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use orchestration::dataset::{self, DatasetRecorder};
use orchestration::phase::{Phase, PhaseService};
use orchestration::ratelimit::{RateLimiter, RateMetrics};
use orchestration::{ChatLogger, CommitLog, EngineError, EngineResult, MapService, Workspace};
use rand::seq::IndexedRandom;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::lifecycle::SlotState;
use crate::mutator::{AiderMutator, Mutator};
use crate::research::ResearchClient;
use crate::runtime::{AgentRuntime, CycleOutcome, CycleServices};
use crate::team::{load_teams, Agent, AgentKind, AgentSnapshot, Team};

/// Delay between the initial worker starts.
const INITIAL_STAGGER: Duration = Duration::from_secs(10);
/// Delay before a worker resumes after a caught panic (replacement delay).
const REPLACEMENT_DELAY: Duration = Duration::from_secs(3);
/// Bound on waiting for an eligible agent before re-checking.
const SELECT_POLL: Duration = Duration::from_secs(1);
/// Default grace period for [`Scheduler::shutdown`].
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Point-in-time view of the engine for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSnapshot {
    pub team: Option<String>,
    pub phase: Option<Phase>,
    pub in_flight: Vec<String>,
    pub agents: Vec<AgentSnapshot>,
    pub rate: Option<RateMetrics>,
}

/// Scheduler-owned set of agents currently held by a worker.
pub struct InFlightSet {
    set: Mutex<HashSet<String>>,
    notify: tokio::sync::Notify,
}

impl InFlightSet {
    fn new() -> Self {
        Self {
            set: Mutex::new(HashSet::new()),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Claim an agent; false when another worker already holds it.
    pub fn try_claim(&self, name: &str) -> bool {
        self.set
            .lock()
            .expect("in-flight set poisoned")
            .insert(name.to_string())
    }

    pub fn release(&self, name: &str) {
        self.set.lock().expect("in-flight set poisoned").remove(name);
        self.notify.notify_waiters();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.set
            .lock()
            .expect("in-flight set poisoned")
            .contains(name)
    }

    pub fn len(&self) -> usize {
        self.set.lock().expect("in-flight set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .set
            .lock()
            .expect("in-flight set poisoned")
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Everything a worker task needs.
struct WorkerShared {
    runtime: Arc<AgentRuntime>,
    in_flight: Arc<InFlightSet>,
    cancel: CancellationToken,
    config: EngineConfig,
}

struct ActiveEngine {
    team_name: String,
    runtime: Arc<AgentRuntime>,
    in_flight: Arc<InFlightSet>,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

/// Registry of the active team plus the worker pool driving it.
pub struct Scheduler {
    workspace: Workspace,
    config: EngineConfig,
    mission: String,
    engine: tokio::sync::Mutex<Option<ActiveEngine>>,
}

impl Scheduler {
    pub fn new(workspace: Workspace, config: EngineConfig, mission: &str) -> Self {
        Self {
            workspace,
            config,
            mission: mission.to_string(),
            engine: tokio::sync::Mutex::new(None),
        }
    }

    /// Activate a team by name, stopping the previous team's agents first.
    pub async fn activate_team(&self, name: &str) -> EngineResult<()> {
        let workspace = self.workspace.clone();
        let config = self.config.clone();
        let team = self.build_team(name)?;
        let mutator: Arc<dyn Mutator> = Arc::new(AiderMutator::new(
            workspace,
            name,
            config,
        ));
        self.activate_team_with_mutator(name, team, mutator).await
    }

    /// Activation seam used by tests to substitute a fake mutator.
    pub async fn activate_team_with_mutator(
        &self,
        name: &str,
        team: Team,
        mutator: Arc<dyn Mutator>,
    ) -> EngineResult<()> {
        self.deactivate_team(DEFAULT_SHUTDOWN_TIMEOUT).await;

        let team = Arc::new(team);
        let map = Arc::new(MapService::new(self.workspace.clone(), name));
        map.regenerate()?;

        let dataset = Arc::new(DatasetRecorder::new(&self.workspace)?);
        dataset.log_startup_stats();

        let phase = Arc::new(PhaseService::new(self.config.phase.clone()));
        phase.observe(map.total_tokens());

        let services = Arc::new(CycleServices {
            workspace: self.workspace.clone(),
            team: team.clone(),
            map,
            dataset: dataset.clone(),
            chat: Arc::new(ChatLogger::new(&self.workspace, &self.mission)),
            commits: Arc::new(CommitLog::new(&self.workspace)),
            phase,
            limiter: Arc::new(RateLimiter::new(
                self.config.max_requests,
                self.config.rate_window,
            )),
            research_limiter: Arc::new(RateLimiter::new(
                self.config.max_requests,
                self.config.rate_window,
            )),
            research: ResearchClient::from_config(&self.config).map(Arc::new),
            config: self.config.clone(),
        });
        let runtime = Arc::new(AgentRuntime::new(services, mutator));

        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        workers.spawn(dataset::run_housekeeping(dataset, cancel.child_token()));

        for agent in team.agents() {
            agent.advance_slot(SlotState::Ready, Some("team activated"))?;
        }

        let mut engine = self.engine.lock().await;
        *engine = Some(ActiveEngine {
            team_name: name.to_string(),
            runtime,
            in_flight: Arc::new(InFlightSet::new()),
            cancel,
            workers,
        });
        info!(team = name, "team activated");
        Ok(())
    }

    fn build_team(&self, name: &str) -> EngineResult<Team> {
        let defs = load_teams(&self.workspace)?;
        let def = defs
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| EngineError::Validation(format!("unknown team {name:?}")))?;
        def.build(&self.workspace)
    }

    /// Stop the active team: no new workers, cancel in-flight cycles, wait up
    /// to `timeout`, then force-terminate.
    pub async fn deactivate_team(&self, timeout: Duration) {
        let engine = {
            let mut slot = self.engine.lock().await;
            slot.take()
        };
        let Some(mut engine) = engine else {
            return;
        };

        info!(team = %engine.team_name, "deactivating team");
        engine.cancel.cancel();

        let drain = async {
            while let Some(result) = engine.workers.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!("worker panicked during shutdown");
                    }
                }
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                timeout_secs = timeout.as_secs(),
                "shutdown grace period expired, aborting workers"
            );
            engine.workers.abort_all();
            while engine.workers.join_next().await.is_some() {}
        }

        for agent in engine.runtime.services().team.agents() {
            let _ = agent.advance_slot(SlotState::Dormant, Some("team deactivated"));
        }
        info!(team = %engine.team_name, "team deactivated");
    }

    /// Start `concurrency` workers against the active team.
    ///
    /// Worker starts are staggered to avoid a synchronized burst of provider
    /// requests.
    pub async fn launch(&self, concurrency: usize) -> EngineResult<()> {
        let mut engine = self.engine.lock().await;
        let engine = engine
            .as_mut()
            .ok_or_else(|| EngineError::Validation("no active team".into()))?;

        if !self.config.edit_cycles_enabled() {
            warn!("LLM_API_KEY missing: edit cycles disabled");
        }
        if !self.config.research_enabled() {
            warn!("RESEARCH_API_KEY missing: research agents disabled");
        }

        info!(
            team = %engine.team_name,
            concurrency,
            agents = engine.runtime.services().team.agents().len(),
            "launching workers"
        );
        for index in 0..concurrency {
            let shared = Arc::new(WorkerShared {
                runtime: engine.runtime.clone(),
                in_flight: engine.in_flight.clone(),
                cancel: engine.cancel.clone(),
                config: self.config.clone(),
            });
            engine
                .workers
                .spawn(worker_loop(index, shared, INITIAL_STAGGER * index as u32));
        }
        Ok(())
    }

    /// Graceful shutdown of the whole engine.
    pub async fn shutdown(&self, timeout: Duration) {
        self.deactivate_team(timeout).await;
    }

    pub async fn status(&self) -> ScheduleSnapshot {
        let engine = self.engine.lock().await;
        match engine.as_ref() {
            None => ScheduleSnapshot {
                team: None,
                phase: None,
                in_flight: Vec::new(),
                agents: Vec::new(),
                rate: None,
            },
            Some(engine) => {
                let services = engine.runtime.services();
                ScheduleSnapshot {
                    team: Some(engine.team_name.clone()),
                    phase: Some(services.phase.current()),
                    in_flight: engine.in_flight.names(),
                    agents: services.team.agents().iter().map(|a| a.snapshot()).collect(),
                    rate: Some(services.limiter.metrics()),
                }
            }
        }
    }
}

/// One worker: claim an eligible agent, run a cycle, release, repeat.
async fn worker_loop(index: usize, shared: Arc<WorkerShared>, initial_delay: Duration) {
    if !initial_delay.is_zero() {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }
    }
    debug!(worker = index, "worker started");

    while !shared.cancel.is_cancelled() {
        let Some(agent) = select_agent(&shared).await else {
            break; // cancelled
        };

        // Panic isolation: the cycle runs in its own task so a panicking
        // agent takes down neither the worker nor its siblings.
        let handle = tokio::spawn({
            let runtime = shared.runtime.clone();
            let agent = agent.clone();
            let cancel = shared.cancel.clone();
            async move { runtime.run_cycle(&agent, &cancel).await }
        });

        match handle.await {
            Ok(outcome) => {
                debug!(worker = index, agent = agent.name(), ?outcome, "cycle done");
                if outcome == CycleOutcome::Mutated {
                    info!(worker = index, agent = agent.name(), "mutation recorded");
                }
            }
            Err(e) if e.is_panic() => {
                error!(worker = index, agent = agent.name(), "cycle panicked");
                agent.mark_error();
                // The slot may be stuck in Running or InFlight; push it back.
                if agent.advance_slot(SlotState::Ready, Some("panic recovery")).is_err() {
                    let _ = agent.advance_slot(SlotState::Dormant, Some("panic recovery"));
                }
                shared.in_flight.release(agent.name());
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = tokio::time::sleep(REPLACEMENT_DELAY) => {}
                }
                continue;
            }
            Err(_) => {
                // Cancelled mid-cycle during shutdown.
                shared.in_flight.release(agent.name());
                return;
            }
        }

        shared.in_flight.release(agent.name());
    }
    debug!(worker = index, "worker stopped");
}

/// Pick an eligible agent uniformly at random, claiming it in the in-flight
/// set. Waits (bounded) when none is eligible; returns `None` on cancel.
async fn select_agent(shared: &Arc<WorkerShared>) -> Option<Arc<Agent>> {
    loop {
        if shared.cancel.is_cancelled() {
            return None;
        }

        let services = shared.runtime.services();
        let phase = services.phase.current();
        let now = Utc::now();
        let candidates: Vec<Arc<Agent>> = services
            .team
            .agents()
            .iter()
            .filter(|agent| agent.slot_state() == SlotState::Ready)
            .filter(|agent| !shared.in_flight.contains(agent.name()))
            .filter(|agent| services.team.active_in_phase(agent.name(), phase))
            .filter(|agent| match agent.kind() {
                AgentKind::Edit => shared.config.edit_cycles_enabled(),
                AgentKind::Research => shared.config.research_enabled(),
            })
            .filter(|agent| agent.due(now))
            .cloned()
            .collect();

        if let Some(agent) = candidates.choose(&mut rand::rng()) {
            if shared.in_flight.try_claim(agent.name()) {
                if agent
                    .advance_slot(SlotState::InFlight, Some("claimed"))
                    .is_ok()
                {
                    return Some(agent.clone());
                }
                // Claimed but the slot moved underneath us; undo.
                shared.in_flight.release(agent.name());
            }
            continue;
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => return None,
            _ = shared.in_flight.notify.notified() => {}
            _ = tokio::time::sleep(SELECT_POLL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_claim_is_exclusive() {
        let set = InFlightSet::new();
        assert!(set.try_claim("spec"));
        assert!(!set.try_claim("spec"));
        set.release("spec");
        assert!(set.try_claim("spec"));
    }

    #[test]
    fn test_in_flight_names_sorted() {
        let set = InFlightSet::new();
        set.try_claim("zeta");
        set.try_claim("alpha");
        assert_eq!(set.names(), vec!["alpha", "zeta"]);
        assert_eq!(set.len(), 2);
    }
}
