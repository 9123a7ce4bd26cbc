//! Argument-vector construction for the external edit tool.
//!
//! The tool contract:
//!
//! ```text
//! <tool> --model <id> --edit-format diff --yes-always --cache-prompts --no-pretty
//!        --chat-history-file <path> --input-history-file <path>
//!        (--read <file>)* (--file <file>)* --message "<prompt>"
//! ```
//!
//! Protected team documents are always passed read-only, whatever the caller
//! asked for, and at most ten editable files are forwarded per invocation.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use orchestration::{EngineError, EngineResult, IgnoreRules, Workspace};
use rand::seq::SliceRandom;
use tracing::debug;

/// Upper bound on `--file` entries per invocation.
pub const MAX_EDITABLE_FILES: usize = 10;

/// Appended to every prompt so the tool edits instead of conversing.
const SAFETY_SUFFIX: &str =
    "ALWAYS DIRECTLY PROCEED WITH THE MODIFICATIONS, USING THE SEARCH/REPLACE FORMAT.";

/// Team documents that are never editable by an agent.
const PROTECTED_FILES: &[&str] = &["demande.md", "map.md", "todolist.md", "directives.md"];

/// A fully built tool invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Paths passed with `--file`, for tests and logging.
    pub fn editable_args(&self) -> Vec<&str> {
        self.flag_values("--file")
    }

    /// Paths passed with `--read`.
    pub fn readonly_args(&self) -> Vec<&str> {
        self.flag_values("--read")
    }

    fn flag_values(&self, flag: &str) -> Vec<&str> {
        self.args
            .windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }
}

/// Escape newlines, double quotes, and backslashes for the `--message`
/// payload.
fn escape_prompt(prompt: &str) -> String {
    prompt
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

pub struct CommandBuilder<'a> {
    workspace: &'a Workspace,
    team: &'a str,
    agent: &'a str,
    model: &'a str,
    tool_program: &'a str,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(
        workspace: &'a Workspace,
        team: &'a str,
        agent: &'a str,
        model: &'a str,
        tool_program: &'a str,
    ) -> Self {
        Self {
            workspace,
            team,
            agent,
            model,
            tool_program,
        }
    }

    /// Build the full argument vector.
    ///
    /// `editable` and `readonly` may be workspace-relative or absolute; both
    /// are resolved and bounds-checked. Protected team documents are moved to
    /// the read-only set regardless of where the caller listed them.
    pub fn build(
        &self,
        prompt: &str,
        editable: &[PathBuf],
        readonly: &[PathBuf],
        rules: &IgnoreRules,
    ) -> EngineResult<CommandSpec> {
        let mut args: Vec<String> = vec![
            "--model".into(),
            self.model.into(),
            "--edit-format".into(),
            "diff".into(),
            "--yes-always".into(),
            "--cache-prompts".into(),
            "--no-pretty".into(),
        ];

        // History files live under the team directory and are created on
        // first use so the tool can append immediately.
        let history_dir = self.workspace.history_dir(self.team);
        fs::create_dir_all(&history_dir)?;
        let chat_history = history_dir.join(format!(".tool.{}.chat.history.md", self.agent));
        let input_history = history_dir.join(format!(".tool.{}.input.history.md", self.agent));
        for history in [&chat_history, &input_history] {
            if !history.exists() {
                fs::write(history, "")?;
            }
        }
        args.push("--chat-history-file".into());
        args.push(chat_history.display().to_string());
        args.push("--input-history-file".into());
        args.push(input_history.display().to_string());

        // Read-only set: protected team documents, the agent prompt, then the
        // caller's extras.
        let team_dir = self.workspace.team_dir(self.team);
        let mut readonly_paths: Vec<PathBuf> = Vec::new();
        let mut protected: HashSet<PathBuf> = HashSet::new();
        for name in PROTECTED_FILES {
            let path = team_dir.join(name);
            protected.insert(path.clone());
            if path.exists() {
                readonly_paths.push(path);
            }
        }
        let prompt_file = self.workspace.prompts_dir(self.team).join(format!("{}.md", self.agent));
        if prompt_file.exists() {
            readonly_paths.push(prompt_file);
        }
        for path in readonly {
            let resolved = self.workspace.resolve(path)?;
            if resolved.exists() && !readonly_paths.contains(&resolved) {
                readonly_paths.push(resolved);
            }
        }

        // Editable set: resolved, de-duplicated, cleared of ignored and
        // protected paths.
        let mut editable_paths: Vec<PathBuf> = Vec::new();
        for path in editable {
            let resolved = self.workspace.resolve(path)?;
            if protected.contains(&resolved)
                || readonly_paths.contains(&resolved)
                || editable_paths.contains(&resolved)
            {
                continue;
            }
            if let Some(rel) = self.workspace.relative(&resolved) {
                if rules.ignored(&rel, false) {
                    continue;
                }
            }
            editable_paths.push(resolved);
        }

        if editable_paths.len() > MAX_EDITABLE_FILES {
            let total = editable_paths.len();
            // Unseeded sample; reproducibility across cycles is not needed.
            editable_paths.shuffle(&mut rand::rng());
            editable_paths.truncate(MAX_EDITABLE_FILES);
            debug!(
                agent = self.agent,
                total,
                kept = MAX_EDITABLE_FILES,
                "sampled editable files"
            );
        }

        if editable_paths.is_empty() {
            return Err(EngineError::Validation(format!(
                "agent {}: no editable files for this cycle",
                self.agent
            )));
        }

        for path in &readonly_paths {
            args.push("--read".into());
            args.push(path.display().to_string());
        }
        for path in &editable_paths {
            args.push("--file".into());
            args.push(path.display().to_string());
        }

        args.push("--message".into());
        args.push(format!("{} {SAFETY_SUFFIX}", escape_prompt(prompt)));

        Ok(CommandSpec {
            program: self.tool_program.to_string(),
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("team_book/prompts")).unwrap();
        fs::write(dir.path().join("team_book/demande.md"), "request").unwrap();
        fs::write(dir.path().join("team_book/map.md"), "# Project Map").unwrap();
        fs::write(dir.path().join("team_book/prompts/spec.md"), "prompt").unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    fn build(
        ws: &Workspace,
        editable: &[PathBuf],
        readonly: &[PathBuf],
    ) -> EngineResult<CommandSpec> {
        let rules = ws.ignore_rules();
        CommandBuilder::new(ws, "book", "spec", "test-model", "aider")
            .build("Do the work.", editable, readonly, &rules)
    }

    #[test]
    fn test_base_arguments_present() {
        let (dir, ws) = setup();
        fs::write(dir.path().join("a.md"), "a").unwrap();
        let spec = build(&ws, &[PathBuf::from("a.md")], &[]).unwrap();

        assert_eq!(spec.program, "aider");
        for expected in [
            "--model",
            "--edit-format",
            "--yes-always",
            "--cache-prompts",
            "--no-pretty",
            "--chat-history-file",
            "--input-history-file",
            "--message",
        ] {
            assert!(spec.args.iter().any(|a| a == expected), "missing {expected}");
        }
        let model_pos = spec.args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(spec.args[model_pos + 1], "test-model");
    }

    #[test]
    fn test_history_files_created() {
        let (dir, ws) = setup();
        fs::write(dir.path().join("a.md"), "a").unwrap();
        build(&ws, &[PathBuf::from("a.md")], &[]).unwrap();

        assert!(dir
            .path()
            .join("team_book/history/.tool.spec.chat.history.md")
            .exists());
        assert!(dir
            .path()
            .join("team_book/history/.tool.spec.input.history.md")
            .exists());
    }

    #[test]
    fn test_protected_paths_forced_readonly() {
        let (dir, ws) = setup();
        fs::write(dir.path().join("src_a.md"), "a").unwrap();
        let spec = build(
            &ws,
            &[PathBuf::from("team_book/map.md"), PathBuf::from("src_a.md")],
            &[],
        )
        .unwrap();

        let editable = spec.editable_args();
        assert_eq!(editable.len(), 1);
        assert!(editable[0].ends_with("src_a.md"));
        assert!(spec
            .readonly_args()
            .iter()
            .any(|p| p.ends_with("team_book/map.md")));
    }

    #[test]
    fn test_prompt_file_passed_readonly() {
        let (dir, ws) = setup();
        fs::write(dir.path().join("a.md"), "a").unwrap();
        let spec = build(&ws, &[PathBuf::from("a.md")], &[]).unwrap();
        assert!(spec
            .readonly_args()
            .iter()
            .any(|p| p.ends_with("prompts/spec.md")));
    }

    #[test]
    fn test_eleven_editable_files_sampled_to_ten() {
        let (dir, ws) = setup();
        let mut editable = Vec::new();
        for i in 0..11 {
            let name = format!("file_{i:02}.md");
            fs::write(dir.path().join(&name), "content").unwrap();
            editable.push(PathBuf::from(name));
        }
        let spec = build(&ws, &editable, &[]).unwrap();
        assert_eq!(spec.editable_args().len(), MAX_EDITABLE_FILES);
    }

    #[test]
    fn test_ignored_files_dropped_from_editable() {
        let (dir, ws) = setup();
        fs::write(dir.path().join(".gitignore"), "generated/\n").unwrap();
        fs::create_dir_all(dir.path().join("generated")).unwrap();
        fs::write(dir.path().join("generated/out.md"), "x").unwrap();
        fs::write(dir.path().join("kept.md"), "x").unwrap();

        let spec = build(
            &ws,
            &[PathBuf::from("generated/out.md"), PathBuf::from("kept.md")],
            &[],
        )
        .unwrap();
        let editable = spec.editable_args();
        assert_eq!(editable.len(), 1);
        assert!(editable[0].ends_with("kept.md"));
    }

    #[test]
    fn test_no_editable_files_is_a_validation_error() {
        let (_dir, ws) = setup();
        let err = build(&ws, &[], &[]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_path_escape_rejected() {
        let (_dir, ws) = setup();
        let err = build(&ws, &[PathBuf::from("../outside.md")], &[]).unwrap_err();
        assert!(matches!(err, EngineError::PathEscape { .. }));
    }

    #[test]
    fn test_message_escaped_with_safety_suffix() {
        let (dir, ws) = setup();
        fs::write(dir.path().join("a.md"), "a").unwrap();
        let rules = ws.ignore_rules();
        let spec = CommandBuilder::new(&ws, "book", "spec", "m", "aider")
            .build(
                "Line one\nLine \"two\"",
                &[PathBuf::from("a.md")],
                &[],
                &rules,
            )
            .unwrap();

        let message = spec.args.last().unwrap();
        assert!(message.contains("Line one\\nLine \\\"two\\\""));
        assert!(message.ends_with(SAFETY_SUFFIX));
    }
}
