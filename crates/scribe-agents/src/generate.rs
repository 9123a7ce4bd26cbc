//! Prompt and objective pre-generation.
//!
//! `generate agents` materialises one prompt file per agent of a team,
//! embedding the mission text so each agent knows what project it is serving.
//! `generate objective` derives a per-agent objective document from the
//! current prompt and the team's demand file. Both are plain templates — the
//! LLM itself is an external collaborator and is never invoked here.

use std::fs;
use std::path::PathBuf;

use orchestration::{EngineError, EngineResult, Workspace};
use tracing::info;

use crate::team::{AgentKind, Team};

/// Role-specific guidance blocks keyed by well-known agent names. Unknown
/// agents get the generic block.
fn role_guidance(name: &str) -> &'static str {
    match name {
        "specifications" => {
            "Keep the specification documents precise and current. Split oversized \
             sections, resolve contradictions, and reflect every accepted decision."
        }
        "production" => {
            "Produce the project's primary content. Prefer completing existing \
             sections over starting new ones."
        }
        "evaluation" => {
            "Review recent changes for correctness and coherence. Record findings \
             in the evaluation documents and flag regressions explicitly."
        }
        "documentation" => {
            "Keep the documentation aligned with the current state of the project. \
             Remove references to content that no longer exists."
        }
        "deduplication" => {
            "Find duplicated content across files and consolidate it in a single \
             authoritative location."
        }
        "management" => {
            "Maintain the todolist: mark finished work done, order open tasks by \
             impact, and keep entries actionable."
        }
        "integration" => {
            "Ensure cross-file consistency: naming, terminology, and references \
             must agree across the whole workspace."
        }
        "research" => {
            "Answer open questions from the demand document using external \
             sources, and summarise findings concisely."
        }
        _ => "Advance the mission within your role, one focused improvement per cycle.",
    }
}

/// Write one prompt file per agent under `<team_dir>/prompts/`.
///
/// Existing prompts are only overwritten when `force` is set.
pub fn generate_agent_prompts(
    workspace: &Workspace,
    team: &Team,
    mission_text: &str,
    force: bool,
) -> EngineResult<Vec<PathBuf>> {
    let prompts_dir = workspace.prompts_dir(&team.name);
    fs::create_dir_all(&prompts_dir)?;

    let mut written = Vec::new();
    for agent in team.agents() {
        let path = &agent.spec().prompt_path;
        if path.exists() && !force {
            continue;
        }
        let kind_line = match agent.kind() {
            AgentKind::Edit => {
                "You edit the project files directly through the edit tool."
            }
            AgentKind::Research => {
                "You research external information; you never edit project files."
            }
        };
        let content = format!(
            "# Agent: {name}\n\n\
             ## Role\n{role}\n\n\
             ## Mission\n{mission}\n\n\
             ## Working mode\n{kind_line}\n\n\
             ## Guidance\n{guidance}\n",
            name = agent.name(),
            role = agent.spec().role,
            mission = mission_text.trim(),
            guidance = role_guidance(agent.name()),
        );
        fs::write(path, content)?;
        info!(agent = agent.name(), path = %path.display(), "prompt generated");
        written.push(path.clone());
    }
    Ok(written)
}

/// Write `<team_dir>/.objective.<agent>.md` for one agent.
pub fn generate_objective(
    workspace: &Workspace,
    team: &Team,
    agent_name: &str,
) -> EngineResult<PathBuf> {
    let agent = team.agent(agent_name).ok_or_else(|| {
        EngineError::Validation(format!("unknown agent {agent_name:?} in team {}", team.name))
    })?;

    let prompt = fs::read_to_string(&agent.spec().prompt_path).map_err(|_| {
        EngineError::Validation(format!(
            "agent {agent_name} has no prompt; run `generate agents` first"
        ))
    })?;
    let demand = fs::read_to_string(workspace.demand_file(&team.name)).unwrap_or_default();

    let path = workspace
        .team_dir(&team.name)
        .join(format!(".objective.{agent_name}.md"));
    let content = format!(
        "# Objective for {agent_name}\n\n\
         ## Current demand\n{demand}\n\n\
         ## Standing instructions\n{prompt}\n\n\
         ## Next cycle\nPick the single most valuable change within your role \
         and carry it out completely.\n",
        demand = if demand.trim().is_empty() {
            "(no demand file)"
        } else {
            demand.trim()
        },
    );
    fs::write(&path, content)?;
    info!(agent = agent_name, path = %path.display(), "objective generated");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::team::default_team_def;

    fn setup() -> (tempfile::TempDir, Workspace, Team) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let team = default_team_def().build(&ws).unwrap();
        (dir, ws, team)
    }

    #[test]
    fn test_generates_one_prompt_per_agent() {
        let (_dir, ws, team) = setup();
        let written = generate_agent_prompts(&ws, &team, "Write a novel.", false).unwrap();
        assert_eq!(written.len(), team.agents().len());
        for agent in team.agents() {
            let content = fs::read_to_string(&agent.spec().prompt_path).unwrap();
            assert!(content.contains("Write a novel."));
            assert!(content.contains(&format!("# Agent: {}", agent.name())));
        }
    }

    #[test]
    fn test_existing_prompts_kept_without_force() {
        let (_dir, ws, team) = setup();
        generate_agent_prompts(&ws, &team, "Mission one.", false).unwrap();
        let written = generate_agent_prompts(&ws, &team, "Mission two.", false).unwrap();
        assert!(written.is_empty());

        let agent = team.agent("production").unwrap();
        let content = fs::read_to_string(&agent.spec().prompt_path).unwrap();
        assert!(content.contains("Mission one."));
    }

    #[test]
    fn test_force_regenerates() {
        let (_dir, ws, team) = setup();
        generate_agent_prompts(&ws, &team, "Mission one.", false).unwrap();
        let written = generate_agent_prompts(&ws, &team, "Mission two.", true).unwrap();
        assert_eq!(written.len(), team.agents().len());
    }

    #[test]
    fn test_research_agents_get_research_mode() {
        let (_dir, ws, team) = setup();
        generate_agent_prompts(&ws, &team, "Mission.", false).unwrap();
        let agent = team.agent("research").unwrap();
        let content = fs::read_to_string(&agent.spec().prompt_path).unwrap();
        assert!(content.contains("never edit project files"));
    }

    #[test]
    fn test_objective_requires_prompt() {
        let (_dir, ws, team) = setup();
        let err = generate_objective(&ws, &team, "production").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_objective_embeds_demand() {
        let (dir, ws, team) = setup();
        generate_agent_prompts(&ws, &team, "Mission.", false).unwrap();
        fs::create_dir_all(dir.path().join("team_default")).unwrap();
        fs::write(dir.path().join("team_default/demande.md"), "Chapter 3 next.").unwrap();

        let path = generate_objective(&ws, &team, "production").unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("Chapter 3 next."));
    }

    #[test]
    fn test_objective_unknown_agent_rejected() {
        let (_dir, ws, team) = setup();
        let err = generate_objective(&ws, &team, "nobody").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
