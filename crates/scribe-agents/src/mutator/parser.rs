//! Streaming classification of the edit tool's output.
//!
//! Lines arrive one at a time and fall into four buckets: commit lines,
//! file-change lines (`Wrote` / `Created` / `Deleted`), error lines, and raw
//! output. Commit messages that wrap across physical lines are reassembled
//! until the next recognised prefix.

use std::collections::BTreeSet;
use std::path::PathBuf;

use orchestration::Commit;
use tracing::{debug, warn};

use super::MutationResult;

/// Noise the tool prints that must never be classified as an error.
const IGNORED_LINE_MARKERS: &[&str] = &[
    "Error checking pypi for new version",
    "Can't initialize prompt toolkit",
    "No Windows console found",
    "aider.chat/docs/troubleshooting/edit-errors.html",
    "[Errno 22] Invalid argument",
];

/// Case-insensitive markers of a genuine error line.
const ERROR_MARKERS: &[&str] = &["error", "exception", "failed", "permission denied", "fatal:"];

/// Markers of a rate-limited provider response.
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "too many requests", "429"];

/// Prefixes that terminate a wrapped commit message.
const LINE_PREFIXES: &[&str] = &["Wrote ", "Created ", "Deleted ", "Commit ", "Running ", "$ git"];

pub struct OutputParser {
    agent: String,
    modified: BTreeSet<PathBuf>,
    added: BTreeSet<PathBuf>,
    deleted: BTreeSet<PathBuf>,
    commits: Vec<Commit>,
    errors: Vec<String>,
    raw_lines: Vec<String>,
    pending_commit: Option<String>,
    rate_limited: bool,
}

impl OutputParser {
    pub fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            modified: BTreeSet::new(),
            added: BTreeSet::new(),
            deleted: BTreeSet::new(),
            commits: Vec::new(),
            errors: Vec::new(),
            raw_lines: Vec::new(),
            pending_commit: None,
            rate_limited: false,
        }
    }

    /// Whether a rate-limit response was observed in the stream.
    pub fn rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn feed_line(&mut self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        if IGNORED_LINE_MARKERS.iter().any(|m| line.contains(m)) {
            return;
        }

        let lower = line.to_lowercase();
        if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            self.rate_limited = true;
        }

        if line.starts_with("Commit ") {
            self.flush_pending_commit();
            self.pending_commit = Some(line.to_string());
            return;
        }

        // A wrapped commit message continues until the next recognised prefix.
        if self.pending_commit.is_some() && !LINE_PREFIXES.iter().any(|p| line.starts_with(p)) {
            if let Some(pending) = self.pending_commit.as_mut() {
                pending.push(' ');
                pending.push_str(line.trim());
            }
            return;
        }
        self.flush_pending_commit();

        if let Some(path) = line.strip_prefix("Wrote ") {
            self.modified.insert(first_token(path));
        } else if let Some(path) = line.strip_prefix("Created ") {
            self.added.insert(first_token(path));
        } else if let Some(path) = line.strip_prefix("Deleted ") {
            self.deleted.insert(first_token(path));
        } else if is_error_line(&lower) {
            self.errors.push(line.trim().to_string());
        } else {
            self.raw_lines.push(line.to_string());
        }
    }

    fn flush_pending_commit(&mut self) {
        let Some(pending) = self.pending_commit.take() else {
            return;
        };
        match Commit::parse_line(&pending, &self.agent) {
            Some(mut commit) => {
                commit.modified_files = self
                    .modified
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                debug!(agent = %self.agent, hash = %commit.hash, "commit parsed");
                self.commits.push(commit);
            }
            // Commit-parse failures are warnings, never fatal.
            None => warn!(agent = %self.agent, line = %pending, "unparseable commit line"),
        }
    }

    /// Consume the parser and produce the structured result.
    ///
    /// Tie-breaks applied here: a path both written and created stays only in
    /// `added_files`; files referenced by a commit but absent from every set
    /// join `modified_files`.
    pub fn finish(mut self, exit_code: i32) -> MutationResult {
        self.flush_pending_commit();

        for path in &self.added {
            self.modified.remove(path);
        }
        let commit_files: Vec<PathBuf> = self
            .commits
            .iter()
            .flat_map(|c| c.modified_files.iter().map(PathBuf::from))
            .collect();
        for path in commit_files {
            if !self.added.contains(&path) && !self.deleted.contains(&path) {
                self.modified.insert(path);
            }
        }

        MutationResult {
            modified_files: self.modified,
            added_files: self.added,
            deleted_files: self.deleted,
            commits: self.commits,
            errors: self.errors,
            raw_output: self.raw_lines.join("\n"),
            exit_code,
        }
    }
}

fn first_token(rest: &str) -> PathBuf {
    PathBuf::from(rest.split_whitespace().next().unwrap_or_default())
}

fn is_error_line(lower: &str) -> bool {
    if lower.contains("documentation:") {
        return false;
    }
    ERROR_MARKERS.iter().any(|m| lower.contains(m))
}
