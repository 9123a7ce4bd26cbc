//! File mutation through the external edit tool.
//!
//! [`AiderMutator`] builds the tool invocation, streams its merged output
//! through the [`parser::OutputParser`], and produces a [`MutationResult`].
//! The child always receives the workspace as its working directory — the
//! engine process never calls `chdir`, so concurrent workers cannot race on
//! the process CWD.

pub mod command;
pub mod parser;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use orchestration::{Commit, EngineError, Workspace};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use command::CommandBuilder;
use parser::OutputParser;

/// How long the executor drains remaining output after killing a timed-out
/// child.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum MutatorError {
    /// The provider rejected the request; the runtime owns the retry policy.
    #[error("provider rate limited")]
    RateLimited,

    /// The cycle was cancelled by the scheduler.
    #[error("mutation cancelled")]
    Cancelled,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("tool spawn failed: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One mutation request: what to say and which files may change.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub agent: String,
    pub prompt: String,
    pub editable_files: Vec<PathBuf>,
    pub readonly_files: Vec<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Structured outcome of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct MutationResult {
    pub modified_files: BTreeSet<PathBuf>,
    pub added_files: BTreeSet<PathBuf>,
    pub deleted_files: BTreeSet<PathBuf>,
    pub commits: Vec<Commit>,
    pub errors: Vec<String>,
    pub raw_output: String,
    pub exit_code: i32,
}

impl MutationResult {
    /// A result is successful iff the tool exited cleanly, produced no error
    /// lines, and either changed at least one file or produced a commit.
    pub fn successful(&self) -> bool {
        self.exit_code == 0
            && self.errors.is_empty()
            && (!self.modified_files.is_empty()
                || !self.added_files.is_empty()
                || !self.deleted_files.is_empty()
                || !self.commits.is_empty())
    }

    /// All paths whose map entries must be refreshed.
    pub fn changed_paths(&self) -> Vec<PathBuf> {
        self.modified_files
            .iter()
            .chain(self.added_files.iter())
            .cloned()
            .collect()
    }
}

/// Seam between the agent runtime and the external tool. Tests substitute
/// fakes; production uses [`AiderMutator`].
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn mutate(
        &self,
        request: MutationRequest,
        cancel: &CancellationToken,
    ) -> Result<MutationResult, MutatorError>;
}

/// Production mutator driving the aider-compatible edit tool.
pub struct AiderMutator {
    workspace: Workspace,
    team: String,
    config: EngineConfig,
}

impl AiderMutator {
    pub fn new(workspace: Workspace, team: &str, config: EngineConfig) -> Self {
        Self {
            workspace,
            team: team.to_string(),
            config,
        }
    }

    fn spawn(&self, request: &MutationRequest) -> Result<Child, MutatorError> {
        let rules = self.workspace.ignore_rules();
        let builder = CommandBuilder::new(
            &self.workspace,
            &self.team,
            &request.agent,
            &self.config.model,
            &self.config.tool_program,
        );
        let spec = builder.build(
            &request.prompt,
            &request.editable_files,
            &request.readonly_files,
            &rules,
        )?;

        debug!(agent = %request.agent, args = spec.args.len(), "launching edit tool");
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .env("PYTHONIOENCODING", "UTF-8")
            // The workspace is passed to the child; the engine's own CWD is
            // never mutated.
            .current_dir(self.workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn().map_err(MutatorError::Spawn)
    }
}

#[async_trait]
impl Mutator for AiderMutator {
    async fn mutate(
        &self,
        request: MutationRequest,
        cancel: &CancellationToken,
    ) -> Result<MutationResult, MutatorError> {
        let timeout = request.timeout.unwrap_or(self.config.tool_timeout);
        let mut child = self.spawn(&request)?;

        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut streams = OutputStreams { stdout, stderr };

        let mut parser = OutputParser::new(&request.agent);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut timed_out = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(agent = %request.agent, "mutation cancelled, terminating tool");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(MutatorError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    warn!(
                        agent = %request.agent,
                        timeout_secs = timeout.as_secs(),
                        "edit tool timed out, terminating"
                    );
                    let _ = child.start_kill();
                    break;
                }
                line = streams.next_line() => {
                    match line {
                        Some(Ok(line)) => parser.feed_line(&line),
                        Some(Err(e)) => {
                            debug!(agent = %request.agent, error = %e, "output stream error");
                        }
                        None => break,
                    }
                }
            }
        }

        // After a kill, drain whatever is still buffered, bounded.
        if timed_out {
            let drain = async {
                while let Some(Ok(line)) = streams.next_line().await {
                    parser.feed_line(&line);
                }
            };
            let _ = tokio::time::timeout(DRAIN_AFTER_KILL, drain).await;
            let _ = child.wait().await;

            let rate_limited = parser.rate_limited();
            let mut result = parser.finish(-1);
            result
                .errors
                .push(format!("timeout after {} s", timeout.as_secs()));
            if rate_limited {
                return Err(MutatorError::RateLimited);
            }
            return Ok(result);
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);
        let rate_limited = parser.rate_limited();
        let result = parser.finish(exit_code);

        if rate_limited && !result.successful() {
            return Err(MutatorError::RateLimited);
        }

        info!(
            agent = %request.agent,
            exit_code,
            modified = result.modified_files.len(),
            added = result.added_files.len(),
            deleted = result.deleted_files.len(),
            commits = result.commits.len(),
            errors = result.errors.len(),
            "mutation finished"
        );
        Ok(result)
    }
}

/// Merges the child's stdout and stderr into one line stream.
struct OutputStreams {
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
}

impl OutputStreams {
    /// Next line from either stream; `None` once both are exhausted.
    async fn next_line(&mut self) -> Option<std::io::Result<String>> {
        loop {
            match (&mut self.stdout, &mut self.stderr) {
                (Some(out), Some(err)) => {
                    tokio::select! {
                        line = out.next_line() => match line.transpose() {
                            Some(line) => return Some(line),
                            None => self.stdout = None,
                        },
                        line = err.next_line() => match line.transpose() {
                            Some(line) => return Some(line),
                            None => self.stderr = None,
                        },
                    }
                }
                (Some(out), None) => match out.next_line().await.transpose() {
                    Some(line) => return Some(line),
                    None => self.stdout = None,
                },
                (None, Some(err)) => match err.next_line().await.transpose() {
                    Some(line) => return Some(line),
                    None => self.stderr = None,
                },
                (None, None) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_requires_clean_exit() {
        let mut result = MutationResult {
            exit_code: 0,
            ..Default::default()
        };
        result.modified_files.insert(PathBuf::from("a.md"));
        assert!(result.successful());

        result.exit_code = 1;
        assert!(!result.successful());
    }

    #[test]
    fn test_successful_requires_effect() {
        let result = MutationResult {
            exit_code: 0,
            ..Default::default()
        };
        assert!(!result.successful());
    }

    #[test]
    fn test_successful_rejects_error_lines() {
        let mut result = MutationResult {
            exit_code: 0,
            errors: vec!["fatal: broken".into()],
            ..Default::default()
        };
        result.modified_files.insert(PathBuf::from("a.md"));
        assert!(!result.successful());
    }

    #[test]
    fn test_changed_paths_unions_modified_and_added() {
        let mut result = MutationResult::default();
        result.modified_files.insert(PathBuf::from("a.md"));
        result.added_files.insert(PathBuf::from("b.md"));
        result.deleted_files.insert(PathBuf::from("c.md"));
        let changed = result.changed_paths();
        assert_eq!(changed.len(), 2);
        assert!(changed.contains(&PathBuf::from("a.md")));
        assert!(changed.contains(&PathBuf::from("b.md")));
    }
}
