//! Agent descriptors, per-agent runtime state, and team configuration.
//!
//! A team is the unit of activation: exactly one is active per workspace, and
//! switching teams stops every running agent first. Teams are declared in
//! `teams.toml` at the workspace root; a built-in default team covers
//! workspaces without one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestration::phase::Phase;
use orchestration::{EngineError, EngineResult, Workspace};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lifecycle::{Slot, SlotState};

/// Agents may never poll faster than this.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound for the adaptive interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Drives the external edit tool against workspace files.
    Edit,
    /// Queries the research backend instead of editing files.
    Research,
}

/// Immutable agent descriptor.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: String,
    pub role: String,
    pub prompt_path: PathBuf,
    pub kind: AgentKind,
    pub check_interval: Duration,
}

/// Mutable counters the runtime updates after every cycle.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub last_run: Option<DateTime<Utc>>,
    pub last_change: Option<DateTime<Utc>>,
    pub consecutive_no_changes: u32,
    pub error_count: u32,
}

/// Status row exposed by the scheduler's snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub name: String,
    pub role: String,
    pub kind: AgentKind,
    pub slot: SlotState,
    pub running: bool,
    pub healthy: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_change: Option<DateTime<Utc>>,
    pub consecutive_no_changes: u32,
    pub error_count: u32,
    pub current_interval_secs: u64,
}

/// A named, long-lived unit of work. Shared between the scheduler and at most
/// one in-flight worker at a time.
pub struct Agent {
    spec: AgentSpec,
    state: Mutex<AgentState>,
    slot: Mutex<Slot>,
}

impl Agent {
    pub fn new(spec: AgentSpec) -> EngineResult<Self> {
        validate_agent_name(&spec.name)?;
        if spec.check_interval < MIN_INTERVAL {
            return Err(EngineError::Validation(format!(
                "agent {}: check_interval {}s is below the {}s minimum",
                spec.name,
                spec.check_interval.as_secs(),
                MIN_INTERVAL.as_secs()
            )));
        }
        Ok(Self {
            spec,
            state: Mutex::new(AgentState::default()),
            slot: Mutex::new(Slot::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn kind(&self) -> AgentKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn state(&self) -> AgentState {
        self.state.lock().expect("agent state poisoned").clone()
    }

    // --- Slot transitions ---
    //
    // The scheduler owns Dormant/Ready/InFlight edges; the runtime owns
    // InFlight/Running edges.

    pub fn slot_state(&self) -> SlotState {
        self.slot.lock().expect("agent slot poisoned").current()
    }

    pub fn advance_slot(&self, to: SlotState, reason: Option<&str>) -> EngineResult<()> {
        self.slot
            .lock()
            .expect("agent slot poisoned")
            .advance(to, reason)
            .map_err(|e| EngineError::Validation(e.to_string()))
    }

    // --- Cycle outcome accounting ---

    /// A cycle ran and modified at least one file (or produced a commit).
    pub fn mark_success(&self) {
        let mut state = self.state.lock().expect("agent state poisoned");
        let now = Utc::now();
        state.last_run = Some(now);
        state.last_change = Some(now);
        state.consecutive_no_changes = 0;
        state.error_count = 0;
    }

    /// A cycle ran cleanly but changed nothing.
    pub fn mark_no_change(&self) {
        let mut state = self.state.lock().expect("agent state poisoned");
        state.last_run = Some(Utc::now());
        state.consecutive_no_changes += 1;
    }

    /// A cycle failed.
    pub fn mark_error(&self) {
        let mut state = self.state.lock().expect("agent state poisoned");
        state.last_run = Some(Utc::now());
        state.error_count += 1;
    }

    /// Reset all adaptive counters (used by recovery).
    pub fn reset_counters(&self) {
        let mut state = self.state.lock().expect("agent state poisoned");
        state.consecutive_no_changes = 0;
        state.error_count = 0;
    }

    /// Restore a previously captured state snapshot (recovery rollback).
    pub fn restore_state(&self, snapshot: AgentState) {
        *self.state.lock().expect("agent state poisoned") = snapshot;
    }

    /// Adaptive polling interval.
    ///
    /// Quiet agents back off geometrically (capped ×10), erroring agents get
    /// an extra ×1.5, and the result is clamped to [60 s, 3600 s].
    pub fn dynamic_interval(&self) -> Duration {
        let state = self.state.lock().expect("agent state poisoned");
        let base = self.spec.check_interval.as_secs_f64();
        let mut multiplier = 1.0_f64;
        if state.consecutive_no_changes > 0 {
            multiplier = 1.5_f64
                .powi(state.consecutive_no_changes.min(5) as i32)
                .min(10.0);
            if state.error_count > 0 {
                multiplier *= 1.5;
            }
        }
        let secs = (base * multiplier)
            .clamp(MIN_INTERVAL.as_secs_f64(), MAX_INTERVAL.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Whether enough time has elapsed for another cycle. First run is always
    /// due.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        let last_run = {
            let state = self.state.lock().expect("agent state poisoned");
            state.last_run
        };
        match last_run {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.dynamic_interval()
            }
        }
    }

    /// An agent is unhealthy when it is overdue by 2× its current interval or
    /// stuck in a long no-change streak.
    pub fn healthy(&self) -> bool {
        let (last_run, streak) = {
            let state = self.state.lock().expect("agent state poisoned");
            (state.last_run, state.consecutive_no_changes)
        };
        if let Some(last) = last_run {
            let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed > self.dynamic_interval() * 2 {
                return false;
            }
        }
        streak <= 5
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let state = self.state.lock().expect("agent state poisoned").clone();
        let slot = self.slot_state();
        AgentSnapshot {
            name: self.spec.name.clone(),
            role: self.spec.role.clone(),
            kind: self.spec.kind,
            slot,
            running: slot == SlotState::Running,
            healthy: self.healthy(),
            last_run: state.last_run,
            last_change: state.last_change,
            consecutive_no_changes: state.consecutive_no_changes,
            error_count: state.error_count,
            current_interval_secs: self.dynamic_interval().as_secs(),
        }
    }
}

fn agent_name_pattern() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new("^[a-z0-9_-]+$").expect("valid agent name regex"))
}

fn validate_agent_name(name: &str) -> EngineResult<()> {
    if agent_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "agent name {name:?} must match [a-z0-9_-]+"
        )))
    }
}

/// Ordered set of agents plus the phase policy.
pub struct Team {
    pub name: String,
    agents: Vec<Arc<Agent>>,
    phase_config: HashMap<Phase, Vec<String>>,
}

impl Team {
    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    pub fn agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.iter().find(|a| a.name() == name).cloned()
    }

    /// Phase gating: an empty or missing agent list for a phase means every
    /// agent is active in it.
    pub fn active_in_phase(&self, agent_name: &str, phase: Phase) -> bool {
        match self.phase_config.get(&phase) {
            Some(active) if !active.is_empty() => active
                .iter()
                .any(|name| name.eq_ignore_ascii_case(agent_name)),
            _ => true,
        }
    }
}

// --- teams.toml ---

#[derive(Debug, Deserialize)]
pub struct TeamsFile {
    pub teams: Vec<TeamDef>,
}

#[derive(Debug, Deserialize)]
pub struct TeamDef {
    pub name: String,
    #[serde(default)]
    pub agents: Vec<AgentDef>,
    #[serde(default)]
    pub phase_config: HashMap<Phase, Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AgentDef {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_kind")]
    pub kind: AgentKind,
    /// Seconds between cycles before adaptive back-off.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
}

fn default_kind() -> AgentKind {
    AgentKind::Edit
}

fn default_check_interval() -> u64 {
    120
}

impl TeamDef {
    /// Materialise the team, deriving each agent's prompt path from the
    /// workspace layout.
    pub fn build(&self, workspace: &Workspace) -> EngineResult<Team> {
        let prompts_dir = workspace.prompts_dir(&self.name);
        let mut agents = Vec::with_capacity(self.agents.len());
        for def in &self.agents {
            let spec = AgentSpec {
                name: def.name.clone(),
                role: if def.role.is_empty() {
                    def.name.clone()
                } else {
                    def.role.clone()
                },
                prompt_path: prompts_dir.join(format!("{}.md", def.name)),
                kind: def.kind,
                check_interval: Duration::from_secs(def.check_interval),
            };
            agents.push(Arc::new(Agent::new(spec)?));
        }
        Ok(Team {
            name: self.name.clone(),
            agents,
            phase_config: self.phase_config.clone(),
        })
    }
}

/// Load team definitions from `teams.toml`, falling back to the built-in
/// default team when the file is absent.
pub fn load_teams(workspace: &Workspace) -> EngineResult<Vec<TeamDef>> {
    let path = workspace.root().join("teams.toml");
    if !path.exists() {
        return Ok(vec![default_team_def()]);
    }
    let content = std::fs::read_to_string(&path)?;
    let file: TeamsFile = toml::from_str(&content).map_err(|e| {
        EngineError::Validation(format!("teams.toml: {e}"))
    })?;
    if file.teams.is_empty() {
        warn!("teams.toml declares no teams, using the default team");
        return Ok(vec![default_team_def()]);
    }
    Ok(file.teams)
}

/// The built-in team used when no `teams.toml` exists.
pub fn default_team_def() -> TeamDef {
    let agent = |name: &str, role: &str, kind: AgentKind, interval: u64| AgentDef {
        name: name.into(),
        role: role.into(),
        kind,
        check_interval: interval,
    };
    let mut phase_config = HashMap::new();
    phase_config.insert(
        Phase::Expansion,
        vec![
            "specifications".to_string(),
            "production".to_string(),
            "documentation".to_string(),
            "research".to_string(),
        ],
    );
    phase_config.insert(
        Phase::Convergence,
        vec![
            "evaluation".to_string(),
            "deduplication".to_string(),
            "integration".to_string(),
        ],
    );
    TeamDef {
        name: "default".into(),
        agents: vec![
            agent("specifications", "Specification writer", AgentKind::Edit, 120),
            agent("production", "Content producer", AgentKind::Edit, 120),
            agent("evaluation", "Quality evaluator", AgentKind::Edit, 180),
            agent("documentation", "Documentalist", AgentKind::Edit, 240),
            agent("deduplication", "Redundancy remover", AgentKind::Edit, 300),
            agent("management", "Task coordinator", AgentKind::Edit, 300),
            agent("integration", "Consistency keeper", AgentKind::Edit, 300),
            agent("research", "External researcher", AgentKind::Research, 600),
        ],
        phase_config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, interval: u64) -> AgentSpec {
        AgentSpec {
            name: name.into(),
            role: "test role".into(),
            prompt_path: PathBuf::from("prompts/test.md"),
            kind: AgentKind::Edit,
            check_interval: Duration::from_secs(interval),
        }
    }

    #[test]
    fn test_agent_name_validation() {
        assert!(Agent::new(spec("specifications", 120)).is_ok());
        assert!(Agent::new(spec("agent-2_x", 120)).is_ok());
        assert!(Agent::new(spec("Bad Name", 120)).is_err());
        assert!(Agent::new(spec("UPPER", 120)).is_err());
        assert!(Agent::new(spec("", 120)).is_err());
    }

    #[test]
    fn test_interval_below_minimum_rejected() {
        assert!(Agent::new(spec("fast", 10)).is_err());
        assert!(Agent::new(spec("ok", 60)).is_ok());
    }

    #[test]
    fn test_dynamic_interval_base_case() {
        let agent = Agent::new(spec("calm", 120)).unwrap();
        assert_eq!(agent.dynamic_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_dynamic_interval_backs_off_on_no_change() {
        let agent = Agent::new(spec("quiet", 120)).unwrap();
        agent.mark_no_change();
        // 120 × 1.5 = 180
        assert_eq!(agent.dynamic_interval(), Duration::from_secs(180));
        agent.mark_no_change();
        // 120 × 2.25 = 270
        assert_eq!(agent.dynamic_interval(), Duration::from_secs(270));
    }

    #[test]
    fn test_dynamic_interval_exponent_capped_at_five() {
        let agent = Agent::new(spec("quiet", 120)).unwrap();
        for _ in 0..10 {
            agent.mark_no_change();
        }
        // 1.5^5 ≈ 7.59, under the ×10 cap: 120 × 7.59 ≈ 911
        let secs = agent.dynamic_interval().as_secs();
        assert!((910..=912).contains(&secs), "got {secs}");
    }

    #[test]
    fn test_dynamic_interval_clamped_to_an_hour() {
        let agent = Agent::new(spec("slow", 3000)).unwrap();
        for _ in 0..6 {
            agent.mark_no_change();
        }
        assert_eq!(agent.dynamic_interval(), MAX_INTERVAL);
    }

    #[test]
    fn test_error_penalty_multiplies_backoff() {
        let agent = Agent::new(spec("flaky", 120)).unwrap();
        agent.mark_no_change();
        agent.mark_error();
        // 120 × 1.5 × 1.5 = 270
        assert_eq!(agent.dynamic_interval(), Duration::from_secs(270));
    }

    #[test]
    fn test_success_resets_counters() {
        let agent = Agent::new(spec("worker", 120)).unwrap();
        agent.mark_no_change();
        agent.mark_error();
        agent.mark_success();
        let state = agent.state();
        assert_eq!(state.consecutive_no_changes, 0);
        assert_eq!(state.error_count, 0);
        assert!(state.last_change.is_some());
    }

    #[test]
    fn test_first_run_is_due() {
        let agent = Agent::new(spec("fresh", 120)).unwrap();
        assert!(agent.due(Utc::now()));
    }

    #[test]
    fn test_not_due_immediately_after_run() {
        let agent = Agent::new(spec("busy", 120)).unwrap();
        agent.mark_success();
        assert!(!agent.due(Utc::now()));
        // But due once the interval has passed.
        assert!(agent.due(Utc::now() + chrono::Duration::seconds(121)));
    }

    #[test]
    fn test_unhealthy_after_long_no_change_streak() {
        let agent = Agent::new(spec("stuck", 120)).unwrap();
        for _ in 0..6 {
            agent.mark_no_change();
        }
        assert!(!agent.healthy());
    }

    #[test]
    fn test_phase_gating() {
        let def = default_team_def();
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let team = def.build(&ws).unwrap();

        assert!(team.active_in_phase("specifications", Phase::Expansion));
        assert!(!team.active_in_phase("specifications", Phase::Convergence));
        assert!(team.active_in_phase("evaluation", Phase::Convergence));
    }

    #[test]
    fn test_phase_gating_defaults_to_all_active() {
        let def = TeamDef {
            name: "open".into(),
            agents: vec![AgentDef {
                name: "writer".into(),
                role: String::new(),
                kind: AgentKind::Edit,
                check_interval: 120,
            }],
            phase_config: HashMap::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let team = def.build(&ws).unwrap();
        assert!(team.active_in_phase("writer", Phase::Expansion));
        assert!(team.active_in_phase("writer", Phase::Convergence));
    }

    #[test]
    fn test_teams_toml_parsing() {
        let toml_src = r#"
            [[teams]]
            name = "book"

            [[teams.agents]]
            name = "writer"
            role = "Chapter writer"
            check_interval = 180

            [[teams.agents]]
            name = "scout"
            kind = "research"

            [teams.phase_config]
            expansion = ["writer"]
            convergence = ["writer", "scout"]
        "#;
        let file: TeamsFile = toml::from_str(toml_src).unwrap();
        assert_eq!(file.teams.len(), 1);
        let def = &file.teams[0];
        assert_eq!(def.agents[0].check_interval, 180);
        assert_eq!(def.agents[1].kind, AgentKind::Research);
        assert_eq!(def.phase_config[&Phase::Expansion], vec!["writer"]);
    }

    #[test]
    fn test_load_teams_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let defs = load_teams(&ws).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "default");
        assert!(defs[0].agents.iter().any(|a| a.kind == AgentKind::Research));
    }

    #[test]
    fn test_build_derives_prompt_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let team = default_team_def().build(&ws).unwrap();
        let agent = team.agent("specifications").unwrap();
        assert!(agent
            .spec()
            .prompt_path
            .ends_with("team_default/prompts/specifications.md"));
    }
}
