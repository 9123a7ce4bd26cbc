//! Engine launcher.
//!
//! Exit codes: 0 success, 1 missing mission file or unusable workspace,
//! 2 invalid arguments (clap), 130 cancelled by signal.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use scribe_agents::config::EngineConfig;
use scribe_agents::generate;
use scribe_agents::scheduler::{Scheduler, DEFAULT_SHUTDOWN_TIMEOUT};
use scribe_agents::team::load_teams;

const EXIT_MISSING_MISSION: u8 = 1;
const EXIT_SIGNAL: u8 = 130;

#[derive(Parser)]
#[command(name = "scribe-agents", about = "Autonomous editing team engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start engine components.
    Run {
        #[command(subcommand)]
        target: RunTarget,
    },
    /// Pre-generate agent inputs.
    Generate {
        #[command(subcommand)]
        target: GenerateTarget,
    },
}

#[derive(Subcommand)]
enum RunTarget {
    /// Start the agent scheduler.
    Agents {
        /// Regenerate agent prompts before launching.
        #[arg(long)]
        generate: bool,
        /// Mission file describing the project.
        #[arg(long, default_value = ".mission.md")]
        mission: PathBuf,
        /// Number of parallel workers.
        #[arg(long)]
        count: Option<usize>,
        /// Model identifier passed to the edit tool.
        #[arg(long)]
        model: Option<String>,
        /// Team to activate.
        #[arg(long, default_value = "default")]
        team: String,
        /// Verbose logging.
        #[arg(long, short)]
        verbose: bool,
    },
}

#[derive(Subcommand)]
enum GenerateTarget {
    /// Write one prompt file per agent of the team.
    Agents {
        /// Mission file to embed in the prompts.
        mission: Option<PathBuf>,
        /// Team whose prompts to generate.
        #[arg(long, default_value = "default")]
        team: String,
        /// Overwrite existing prompt files.
        #[arg(long)]
        force: bool,
    },
    /// Write a per-agent objective file.
    Objective {
        /// Agent name.
        #[arg(long)]
        agent: String,
        /// Team the agent belongs to.
        #[arg(long, default_value = "default")]
        team: String,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
}

fn mission_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().trim_start_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "mission".to_string())
}

fn build_team(
    workspace: &orchestration::Workspace,
    team: &str,
) -> Result<scribe_agents::team::Team> {
    let defs = load_teams(workspace)?;
    let def = defs
        .iter()
        .find(|d| d.name == team)
        .ok_or_else(|| anyhow::anyhow!("unknown team {team:?}"))?;
    Ok(def.build(workspace)?)
}

async fn run_agents(
    generate_prompts: bool,
    mission: PathBuf,
    count: Option<usize>,
    model: Option<String>,
    team: String,
) -> Result<u8> {
    let mut config = EngineConfig::default();
    if let Some(model) = model {
        config.model = model;
    }

    if !mission.exists() {
        error!(path = %mission.display(), "mission file not found");
        eprintln!("Mission file not found: {}", mission.display());
        eprintln!("Create one, or point at it with --mission <PATH>.");
        return Ok(EXIT_MISSING_MISSION);
    }

    let workspace = match orchestration::Workspace::open(std::env::current_dir()?) {
        Ok(workspace) => workspace,
        Err(e) => {
            error!(error = %e, "workspace unusable");
            return Ok(EXIT_MISSING_MISSION);
        }
    };

    if generate_prompts {
        let team_obj = build_team(&workspace, &team)?;
        let mission_text = std::fs::read_to_string(&mission)?;
        let written = generate::generate_agent_prompts(&workspace, &team_obj, &mission_text, true)?;
        info!(prompts = written.len(), "agent prompts regenerated");
    }

    let concurrency = count.unwrap_or(config.concurrency);
    let scheduler = Scheduler::new(workspace, config, &mission_name(&mission));
    scheduler.activate_team(&team).await?;
    scheduler.launch(concurrency).await?;
    info!(team = %team, concurrency, "engine running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("signal received, shutting down");
    scheduler.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
    Ok(EXIT_SIGNAL)
}

fn generate_command(target: GenerateTarget) -> Result<u8> {
    let workspace = orchestration::Workspace::open(std::env::current_dir()?)?;
    match target {
        GenerateTarget::Agents {
            mission,
            team,
            force,
        } => {
            let mission_path = mission.unwrap_or_else(|| PathBuf::from(".mission.md"));
            if !mission_path.exists() {
                eprintln!("Mission file not found: {}", mission_path.display());
                return Ok(EXIT_MISSING_MISSION);
            }
            let mission_text = std::fs::read_to_string(&mission_path)?;
            let team_obj = build_team(&workspace, &team)?;
            let written =
                generate::generate_agent_prompts(&workspace, &team_obj, &mission_text, force)?;
            println!("Generated {} prompt file(s).", written.len());
            Ok(0)
        }
        GenerateTarget::Objective { agent, team } => {
            let team_obj = build_team(&workspace, &team)?;
            let path = generate::generate_objective(&workspace, &team_obj, &agent)?;
            println!("Objective written to {}.", path.display());
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Run {
            target:
                RunTarget::Agents {
                    generate,
                    mission,
                    count,
                    model,
                    team,
                    verbose,
                },
        } => {
            init_tracing(verbose || EngineConfig::default().debug);
            run_agents(generate, mission, count, model, team).await?
        }
        Command::Generate { target } => {
            init_tracing(false);
            generate_command(target)?
        }
    };

    Ok(ExitCode::from(code))
}
