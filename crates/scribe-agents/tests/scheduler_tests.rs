//! Scheduler integration: concurrency cap, unique-instance guarantee, and
//! graceful shutdown, driven with a scripted mutator and virtual time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orchestration::Workspace;
use tokio_util::sync::CancellationToken;

use scribe_agents::config::EngineConfig;
use scribe_agents::mutator::{MutationRequest, MutationResult, Mutator, MutatorError};
use scribe_agents::scheduler::Scheduler;
use scribe_agents::team::{AgentDef, AgentKind, Team, TeamDef};

/// Fake mutator that tracks concurrency and per-agent activity.
struct TrackingMutator {
    cycle_time: Duration,
    current: Mutex<HashSet<String>>,
    max_concurrent: Mutex<usize>,
    cycles_per_agent: Mutex<HashMap<String, usize>>,
    overlap_detected: Mutex<bool>,
}

impl TrackingMutator {
    fn new(cycle_time: Duration) -> Self {
        Self {
            cycle_time,
            current: Mutex::new(HashSet::new()),
            max_concurrent: Mutex::new(0),
            cycles_per_agent: Mutex::new(HashMap::new()),
            overlap_detected: Mutex::new(false),
        }
    }

    fn max_concurrent(&self) -> usize {
        *self.max_concurrent.lock().unwrap()
    }

    fn cycles_per_agent(&self) -> HashMap<String, usize> {
        self.cycles_per_agent.lock().unwrap().clone()
    }

    fn overlap_detected(&self) -> bool {
        *self.overlap_detected.lock().unwrap()
    }
}

#[async_trait]
impl Mutator for TrackingMutator {
    async fn mutate(
        &self,
        request: MutationRequest,
        cancel: &CancellationToken,
    ) -> Result<MutationResult, MutatorError> {
        {
            let mut current = self.current.lock().unwrap();
            // The same agent held by two workers at once is the bug the
            // in-flight set must prevent.
            if !current.insert(request.agent.clone()) {
                *self.overlap_detected.lock().unwrap() = true;
            }
            let mut max = self.max_concurrent.lock().unwrap();
            *max = (*max).max(current.len());
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(MutatorError::Cancelled),
            _ = tokio::time::sleep(self.cycle_time) => {
                *self
                    .cycles_per_agent
                    .lock()
                    .unwrap()
                    .entry(request.agent.clone())
                    .or_insert(0) += 1;
                Ok(MutationResult {
                    exit_code: 0,
                    raw_output: "No changes made.".into(),
                    ..Default::default()
                })
            }
        };

        self.current.lock().unwrap().remove(&request.agent);
        outcome
    }
}

fn agent_def(name: &str) -> AgentDef {
    AgentDef {
        name: name.into(),
        role: format!("{name} role"),
        kind: AgentKind::Edit,
        check_interval: 60,
    }
}

fn team_of(workspace: &Workspace, size: usize) -> Team {
    let def = TeamDef {
        name: "load".into(),
        agents: (0..size).map(|i| agent_def(&format!("agent_{i:02}"))).collect(),
        phase_config: HashMap::new(),
    };
    def.build(workspace).unwrap()
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.llm_api_key = Some("test-key".into());
    config.research_api_key = None;
    config
}

fn setup_workspace(agents: usize) -> (tempfile::TempDir, Workspace) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("team_load/prompts")).unwrap();
    std::fs::write(dir.path().join("content.md"), "# Content").unwrap();
    for i in 0..agents {
        std::fs::write(
            dir.path().join(format!("team_load/prompts/agent_{i:02}.md")),
            format!("Agent {i} instructions."),
        )
        .unwrap();
    }
    let ws = Workspace::open(dir.path()).unwrap();
    (dir, ws)
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_and_unique_instances() {
    let (_dir, ws) = setup_workspace(15);
    let team = team_of(&ws, 15);
    let mutator = Arc::new(TrackingMutator::new(Duration::from_secs(2)));

    let scheduler = Scheduler::new(ws, test_config(), "load-test");
    scheduler
        .activate_team_with_mutator("load", team, mutator.clone())
        .await
        .unwrap();
    scheduler.launch(3).await.unwrap();

    // 15 agents at 60 s base interval: two minutes of virtual time is enough
    // for every agent to run at least once through 3 workers.
    tokio::time::sleep(Duration::from_secs(150)).await;

    let snapshot = scheduler.status().await;
    assert!(snapshot.in_flight.len() <= 3);

    scheduler.shutdown(Duration::from_secs(5)).await;

    assert!(mutator.max_concurrent() <= 3, "cap violated: {}", mutator.max_concurrent());
    assert!(!mutator.overlap_detected(), "same agent held by two workers");

    let cycles = mutator.cycles_per_agent();
    assert_eq!(cycles.len(), 15, "only {} agents ran: {cycles:?}", cycles.len());
    assert!(cycles.values().all(|&n| n >= 1));
}

#[tokio::test(start_paused = true)]
async fn test_workers_fill_up_to_cap() {
    let (_dir, ws) = setup_workspace(8);
    let team = team_of(&ws, 8);
    // Long cycles so all workers stay busy once started.
    let mutator = Arc::new(TrackingMutator::new(Duration::from_secs(500)));

    let scheduler = Scheduler::new(ws, test_config(), "fill-test");
    scheduler
        .activate_team_with_mutator("load", team, mutator.clone())
        .await
        .unwrap();
    scheduler.launch(3).await.unwrap();

    // Past the staggered starts (0 s, 10 s, 20 s) all three workers hold an
    // agent.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(mutator.max_concurrent(), 3);
    let snapshot = scheduler.status().await;
    assert_eq!(snapshot.in_flight.len(), 3);

    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_cancels_in_flight_cycles() {
    let (dir, ws) = setup_workspace(4);
    let team = team_of(&ws, 4);
    let mutator = Arc::new(TrackingMutator::new(Duration::from_secs(1000)));

    let scheduler = Scheduler::new(ws, test_config(), "shutdown-test");
    scheduler
        .activate_team_with_mutator("load", team, mutator.clone())
        .await
        .unwrap();
    scheduler.launch(2).await.unwrap();

    // Both workers are mid-call.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(mutator.max_concurrent(), 2);

    scheduler.shutdown(Duration::from_secs(5)).await;

    // Engine is drained and the team is gone from the status surface.
    let snapshot = scheduler.status().await;
    assert!(snapshot.team.is_none());
    assert!(snapshot.in_flight.is_empty());

    // Cancelled cycles completed no work: the dataset holds no partial lines.
    let dataset = std::fs::read_to_string(dir.path().join("data/fine-tuning.jsonl")).unwrap();
    for line in dataset.lines() {
        serde_json::from_str::<serde_json::Value>(line).expect("complete JSON line");
    }

    // The map survived shutdown intact.
    let map = std::fs::read_to_string(dir.path().join("team_load/map.md")).unwrap();
    assert!(map.starts_with("# Project Map"));
}

#[tokio::test(start_paused = true)]
async fn test_agents_without_credentials_never_run() {
    let (_dir, ws) = setup_workspace(3);
    let team = team_of(&ws, 3);
    let mutator = Arc::new(TrackingMutator::new(Duration::from_secs(1)));

    let mut config = test_config();
    config.llm_api_key = None; // edit cycles disabled

    let scheduler = Scheduler::new(ws, config, "disabled-test");
    scheduler
        .activate_team_with_mutator("load", team, mutator.clone())
        .await
        .unwrap();
    scheduler.launch(2).await.unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    scheduler.shutdown(Duration::from_secs(5)).await;

    assert!(mutator.cycles_per_agent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_activating_a_team_replaces_the_previous_one() {
    let (_dir, ws) = setup_workspace(3);
    let mutator = Arc::new(TrackingMutator::new(Duration::from_secs(1)));

    let scheduler = Scheduler::new(ws.clone(), test_config(), "switch-test");
    scheduler
        .activate_team_with_mutator("load", team_of(&ws, 3), mutator.clone())
        .await
        .unwrap();
    scheduler.launch(2).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Re-activation stops the previous workers before switching.
    scheduler
        .activate_team_with_mutator("load", team_of(&ws, 3), mutator.clone())
        .await
        .unwrap();
    let snapshot = scheduler.status().await;
    assert_eq!(snapshot.team.as_deref(), Some("load"));
    assert!(snapshot.in_flight.is_empty());

    scheduler.shutdown(Duration::from_secs(5)).await;
}
