//! Commit records parsed from the edit tool's output stream.
//!
//! The engine never writes commits itself — it only observes the
//! `Commit <hash> <type>: <message>` lines the tool prints and turns them into
//! structured records for the commit stream and the status surfaces.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Conventional-commit style types the tool emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitKind {
    Feat,
    Fix,
    Docs,
    Style,
    Refactor,
    Perf,
    Test,
    Build,
    Ci,
    Chore,
    Revert,
    Merge,
    Update,
    Add,
    Remove,
    Move,
    Cleanup,
    Format,
    Optimize,
    /// Unrecognised tag; the raw token is kept so formatting round-trips.
    Other(String),
}

impl CommitKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "feat" => Self::Feat,
            "fix" => Self::Fix,
            "docs" => Self::Docs,
            "style" => Self::Style,
            "refactor" => Self::Refactor,
            "perf" => Self::Perf,
            "test" => Self::Test,
            "build" => Self::Build,
            "ci" => Self::Ci,
            "chore" => Self::Chore,
            "revert" => Self::Revert,
            "merge" => Self::Merge,
            "update" => Self::Update,
            "add" => Self::Add,
            "remove" => Self::Remove,
            "move" => Self::Move,
            "cleanup" => Self::Cleanup,
            "format" => Self::Format,
            "optimize" => Self::Optimize,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Feat => "feat",
            Self::Fix => "fix",
            Self::Docs => "docs",
            Self::Style => "style",
            Self::Refactor => "refactor",
            Self::Perf => "perf",
            Self::Test => "test",
            Self::Build => "build",
            Self::Ci => "ci",
            Self::Chore => "chore",
            Self::Revert => "revert",
            Self::Merge => "merge",
            Self::Update => "update",
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Move => "move",
            Self::Cleanup => "cleanup",
            Self::Format => "format",
            Self::Optimize => "optimize",
            Self::Other(raw) => raw,
        }
    }

    /// Display emoji for transcripts and the commit stream.
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Feat => "✨",
            Self::Fix => "🐛",
            Self::Docs => "📚",
            Self::Style => "💎",
            Self::Refactor => "♻️",
            Self::Perf => "⚡️",
            Self::Test => "🧪",
            Self::Build => "📦",
            Self::Ci => "🔄",
            Self::Chore => "🔧",
            Self::Revert => "⏪",
            Self::Merge => "🔗",
            Self::Update => "📝",
            Self::Add => "➕",
            Self::Remove => "➖",
            Self::Move => "🚚",
            Self::Cleanup => "🧹",
            Self::Format => "🎨",
            Self::Optimize => "🚀",
            Self::Other(_) => "🔨",
        }
    }
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// On the wire a commit type is always a bare lowercase string, including
// unrecognised tags.
impl Serialize for CommitKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommitKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&tag))
    }
}

/// One commit observed in the tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    #[serde(rename = "type")]
    pub kind: CommitKind,
    pub message: String,
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    pub modified_files: Vec<String>,
}

fn commit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Commit\s+([0-9a-f]{7,})\s+(\w+):\s+(.+)$").expect("valid commit regex")
    })
}

impl Commit {
    /// Parse a `Commit <hash> <type>: <message>` line. Returns `None` for
    /// anything that does not match the grammar.
    pub fn parse_line(line: &str, agent: &str) -> Option<Self> {
        let caps = commit_regex().captures(line.trim())?;
        Some(Self {
            hash: caps[1].to_string(),
            kind: CommitKind::from_tag(&caps[2]),
            message: caps[3].trim().to_string(),
            agent: agent.to_string(),
            timestamp: Utc::now(),
            modified_files: Vec::new(),
        })
    }

    /// Canonical `<type>: <message>` form; parsing then formatting a commit
    /// line yields this exact string.
    pub fn canonical(&self) -> String {
        format!("{}: {}", self.kind.as_str(), self.message)
    }

    /// One-line rendering for transcripts: `✨ a1b2c3d: message`.
    pub fn display_line(&self) -> String {
        format!("{} {}: {}", self.kind.icon(), self.hash, self.message)
    }
}
