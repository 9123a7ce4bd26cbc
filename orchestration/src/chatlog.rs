//! Per-agent chat transcripts and the commit stream.
//!
//! Two append-only sinks:
//! - `chats/<mission>/<agent>.md`: timestamped prompt/response pairs per agent
//! - `logs/commits.jsonl`: one JSON object per parsed commit
//!
//! Both are best-effort. A failed write is logged at WARN and never fails
//! the cycle that produced it.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, warn};

use crate::commit::Commit;
use crate::workspace::Workspace;

fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace([' ', '-'], "_")
}

/// Appends Markdown transcripts of every agent interaction in a mission.
pub struct ChatLogger {
    chats_dir: PathBuf,
}

impl ChatLogger {
    pub fn new(workspace: &Workspace, mission: &str) -> Self {
        Self {
            chats_dir: workspace.chats_dir(&normalize_name(mission)),
        }
    }

    /// Append one interaction to the agent's transcript.
    pub fn log_interaction(
        &self,
        agent: &str,
        prompt: &str,
        response: &str,
        files_context: Option<&BTreeMap<String, String>>,
    ) {
        if let Err(e) = self.try_log(agent, prompt, response, files_context) {
            warn!(agent, error = %e, "chat transcript write failed");
        }
    }

    fn try_log(
        &self,
        agent: &str,
        prompt: &str,
        response: &str,
        files_context: Option<&BTreeMap<String, String>>,
    ) -> std::io::Result<()> {
        fs::create_dir_all(&self.chats_dir)?;
        let path = self.chats_dir.join(format!("{}.md", normalize_name(agent)));

        let mut entry = format!("\n## {}\n\n", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        if let Some(context) = files_context {
            if !context.is_empty() {
                entry.push_str("### Files Context:\n");
                for (filename, content) in context {
                    entry.push_str(&format!("#### {filename}\n```\n{content}\n```\n\n"));
                }
            }
        }
        entry.push_str(&format!("### Prompt:\n{prompt}\n\n"));
        entry.push_str(&format!("### Response:\n{response}\n"));

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(entry.as_bytes())?;
        debug!(agent, path = %path.display(), "interaction logged");
        Ok(())
    }
}

/// Appends parsed commits as JSONL.
pub struct CommitLog {
    path: PathBuf,
}

impl CommitLog {
    pub fn new(workspace: &Workspace) -> Self {
        Self {
            path: workspace.logs_dir().join("commits.jsonl"),
        }
    }

    pub fn append(&self, commit: &Commit) {
        if let Err(e) = self.try_append(commit) {
            warn!(agent = %commit.agent, error = %e, "commit stream write failed");
        }
    }

    fn try_append(&self, commit: &Commit) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(commit)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        debug!(agent = %commit.agent, hash = %commit.hash, "commit recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_interaction_appends_markdown_sections() {
        let (dir, ws) = workspace();
        let logger = ChatLogger::new(&ws, "My Mission");
        logger.log_interaction("Specifications", "Expand §1.", "Wrote spec.md", None);

        let path = dir.path().join("chats/my_mission/specifications.md");
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("### Prompt:\nExpand §1."));
        assert!(content.contains("### Response:\nWrote spec.md"));
    }

    #[test]
    fn test_interaction_includes_files_context() {
        let (dir, ws) = workspace();
        let logger = ChatLogger::new(&ws, "mission");
        let mut ctx = BTreeMap::new();
        ctx.insert("spec.md".to_string(), "# Title".to_string());
        logger.log_interaction("doc", "p", "r", Some(&ctx));

        let content = fs::read_to_string(dir.path().join("chats/mission/doc.md")).unwrap();
        assert!(content.contains("### Files Context:"));
        assert!(content.contains("#### spec.md"));
    }

    #[test]
    fn test_two_interactions_accumulate() {
        let (dir, ws) = workspace();
        let logger = ChatLogger::new(&ws, "mission");
        logger.log_interaction("doc", "first", "a", None);
        logger.log_interaction("doc", "second", "b", None);

        let content = fs::read_to_string(dir.path().join("chats/mission/doc.md")).unwrap();
        assert_eq!(content.matches("### Prompt:").count(), 2);
    }

    #[test]
    fn test_commit_log_appends_jsonl() {
        let (dir, ws) = workspace();
        let log = CommitLog::new(&ws);
        let commit = Commit::parse_line("Commit a1b2c3d feat: expand section 1", "spec").unwrap();
        log.append(&commit);
        log.append(&commit);

        let content = fs::read_to_string(dir.path().join("logs/commits.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        let parsed: Commit = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.hash, "a1b2c3d");
        assert_eq!(parsed.agent, "spec");
    }

    #[test]
    fn test_mission_and_agent_names_are_normalized() {
        let (dir, ws) = workspace();
        let logger = ChatLogger::new(&ws, "Grand-Projet Final");
        logger.log_interaction("Chef De Projet", "p", "r", None);
        assert!(dir
            .path()
            .join("chats/grand_projet_final/chef_de_projet.md")
            .exists());
    }
}
