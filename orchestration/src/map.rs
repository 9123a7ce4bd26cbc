//! Project map: the per-team index of tracked files.
//!
//! One artifact per team at `<team_dir>/map.md`. Each tracked file gets a
//! role icon, a token estimate, and a health status; oversized files are
//! collected into a warnings section so agents know what to consolidate.
//!
//! Writes are serialised by a single lock and always go through
//! `map.md.tmp` + rename, so readers never observe a half-written map.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::workspace::{IgnoreRules, Workspace, TRACKED_EXTENSIONS};

/// Token estimate above which a file is flagged as approaching the limit.
pub const WARN_TOKENS: usize = 6_000;
/// Token estimate above which a file needs consolidation.
pub const ERR_TOKENS: usize = 12_000;

/// Health classification of a single file by size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Healthy,
    Warning,
    Error,
}

impl FileStatus {
    pub fn from_tokens(tokens: usize) -> Self {
        if tokens > ERR_TOKENS {
            Self::Error
        } else if tokens > WARN_TOKENS {
            Self::Warning
        } else {
            Self::Healthy
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Healthy => "✓",
            Self::Warning => "⚠️",
            Self::Error => "🔴",
        }
    }

    fn from_icon(icon: &str) -> Option<Self> {
        match icon {
            "✓" => Some(Self::Healthy),
            "⚠️" => Some(Self::Warning),
            "🔴" => Some(Self::Error),
            _ => None,
        }
    }
}

/// What a file is for, guessed from its path. Drives the role icon column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    PrimaryDeliverable,
    Specification,
    Implementation,
    Documentation,
    Configuration,
    Utility,
    Test,
    Build,
    WorkDocument,
    Draft,
    Template,
    Archive,
    SourceData,
    Generated,
    Cache,
    Backup,
    Unknown,
}

impl FileRole {
    pub fn icon(self) -> &'static str {
        match self {
            Self::PrimaryDeliverable => "📊",
            Self::Specification => "📋",
            Self::Implementation => "⚙️",
            Self::Documentation => "📚",
            Self::Configuration => "⚡",
            Self::Utility => "🛠️",
            Self::Test => "🧪",
            Self::Build => "📦",
            Self::WorkDocument => "✍️",
            Self::Draft => "📝",
            Self::Template => "📄",
            Self::Archive => "📂",
            Self::SourceData => "💾",
            Self::Generated => "⚡",
            Self::Cache => "💫",
            Self::Backup => "💿",
            Self::Unknown => "🔨",
        }
    }

    /// Classify a workspace-relative path.
    pub fn classify(rel: &Path) -> Self {
        let stem = rel
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let ext = rel
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let dirs: Vec<String> = rel
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        let in_dir = |name: &str| dirs.iter().any(|d| d == name);

        if stem == "demande" {
            return Self::PrimaryDeliverable;
        }
        if stem == "todolist" || stem == "directives" {
            return Self::WorkDocument;
        }
        if stem.contains("template") {
            return Self::Template;
        }
        if stem.contains("draft") || in_dir("drafts") {
            return Self::Draft;
        }
        if stem.contains("backup") || ext == "bak" {
            return Self::Backup;
        }
        if in_dir("archive") || in_dir("archives") {
            return Self::Archive;
        }
        if in_dir("cache") || stem.contains("cache") {
            return Self::Cache;
        }
        if stem.contains("generated") || in_dir("generated") {
            return Self::Generated;
        }
        if stem.contains("test") || in_dir("tests") || in_dir("test") {
            return Self::Test;
        }
        if stem.contains("spec") || stem.contains("specification") {
            return Self::Specification;
        }
        if in_dir("data") || ext == "csv" {
            return Self::SourceData;
        }
        if matches!(ext.as_str(), "sh" | "bat" | "ps1") {
            return Self::Utility;
        }
        if stem == "makefile" || stem == "setup" || stem.contains("build") {
            return Self::Build;
        }
        if matches!(ext.as_str(), "json" | "yaml" | "yml") || stem.contains("config") {
            return Self::Configuration;
        }
        if matches!(
            ext.as_str(),
            "py" | "js" | "ts" | "java" | "cpp" | "h" | "c" | "cs" | "php" | "rb" | "go" | "rs"
        ) {
            return Self::Implementation;
        }
        if stem == "readme" || in_dir("docs") || in_dir("doc") {
            return Self::Documentation;
        }
        if matches!(ext.as_str(), "md" | "txt" | "html" | "css") {
            return Self::Documentation;
        }
        Self::Unknown
    }
}

/// One line of the map artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub relative_path: PathBuf,
    pub role: FileRole,
    pub token_estimate: usize,
    pub status: FileStatus,
}

impl MapEntry {
    pub fn for_file(rel: &Path, content: &str) -> Self {
        let tokens = estimate_tokens(content);
        Self {
            relative_path: rel.to_path_buf(),
            role: FileRole::classify(rel),
            token_estimate: tokens,
            status: FileStatus::from_tokens(tokens),
        }
    }

    pub fn format_line(&self) -> String {
        format!(
            "- {} {} ({} tokens) {}",
            self.role.icon(),
            self.relative_path.display(),
            self.token_estimate,
            self.status.icon(),
        )
    }

    /// Parse a line previously produced by [`format_line`]. The role is
    /// re-derived from the path because two roles share the ⚡ icon.
    pub fn parse_line(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("- ")?;
        let (_icon, rest) = rest.split_once(' ')?;
        let (path_part, rest) = rest.rsplit_once(" (")?;
        let (tokens_part, status_part) = rest.split_once(" tokens) ")?;
        let tokens: usize = tokens_part.parse().ok()?;
        let status = FileStatus::from_icon(status_part.trim())?;
        let relative_path = PathBuf::from(path_part);
        Some(Self {
            role: FileRole::classify(&relative_path),
            relative_path,
            token_estimate: tokens,
            status,
        })
    }

    fn warning_message(&self) -> Option<String> {
        match self.status {
            FileStatus::Error => Some(format!(
                "🔴 {} needs consolidation (>{:.1}k tokens)",
                self.relative_path.display(),
                ERR_TOKENS as f64 / 1000.0
            )),
            FileStatus::Warning => Some(format!(
                "⚠️ {} approaching limit (>{:.1}k tokens)",
                self.relative_path.display(),
                WARN_TOKENS as f64 / 1000.0
            )),
            FileStatus::Healthy => None,
        }
    }
}

/// Approximate token count: `round(word_count × 1.3)`. Used in place of a
/// model tokenizer, which is not linked into the engine.
pub fn estimate_tokens(content: &str) -> usize {
    (content.split_whitespace().count() as f64 * 1.3).round() as usize
}

/// Maintains the map artifact for one team.
pub struct MapService {
    workspace: Workspace,
    team: String,
    write_lock: Mutex<()>,
}

impl MapService {
    pub fn new(workspace: Workspace, team: &str) -> Self {
        Self {
            workspace,
            team: team.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn map_path(&self) -> PathBuf {
        self.workspace.map_file(&self.team)
    }

    /// Rebuild the artifact from a full workspace walk.
    ///
    /// Retried once internally; the second failure is surfaced.
    pub fn regenerate(&self) -> EngineResult<()> {
        match self.regenerate_once() {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "map regenerate failed, retrying once");
                self.regenerate_once()
            }
        }
    }

    fn regenerate_once(&self) -> EngineResult<()> {
        let rules = self.workspace.ignore_rules();
        let files = self
            .workspace
            .enumerate(&rules, TRACKED_EXTENSIONS, Some(&self.team));

        let map_rel = self.workspace.relative(&self.map_path());
        let mut entries = Vec::with_capacity(files.len());
        for rel in files {
            // The artifact never indexes itself: its own size changes on
            // every write, which would break regeneration idempotence.
            if Some(&rel) == map_rel.as_ref() {
                continue;
            }
            let abs = self.workspace.root().join(&rel);
            match fs::read_to_string(&abs) {
                Ok(content) => entries.push(MapEntry::for_file(&rel, &content)),
                Err(e) => debug!(file = %rel.display(), error = %e, "skipping unreadable file"),
            }
        }

        let _guard = self.write_lock.lock().expect("map lock poisoned");
        self.write_entries(&entries)?;
        info!(team = %self.team, entries = entries.len(), "map regenerated");
        Ok(())
    }

    /// Fast path after a successful mutation: patch only the named entries.
    ///
    /// `changed` covers modified and added paths; `deleted` removes lines.
    /// Falls back to a full regenerate when the artifact is missing or
    /// unparseable.
    pub fn update_entries(&self, changed: &[PathBuf], deleted: &[PathBuf]) -> EngineResult<()> {
        let mut entries = match self.read_entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "map unreadable, regenerating from scratch");
                return self.regenerate();
            }
        };

        for rel in deleted {
            entries.retain(|entry| &entry.relative_path != rel);
        }
        let map_rel = self.workspace.relative(&self.map_path());
        for rel in changed {
            if Some(rel) == map_rel.as_ref() {
                continue;
            }
            let abs = self.workspace.root().join(rel);
            let Ok(content) = fs::read_to_string(&abs) else {
                // Treat an unreadable changed file as deleted.
                entries.retain(|entry| &entry.relative_path != rel);
                continue;
            };
            let fresh = MapEntry::for_file(rel, &content);
            match entries
                .iter_mut()
                .find(|entry| &entry.relative_path == rel)
            {
                Some(existing) => *existing = fresh,
                None => entries.push(fresh),
            }
        }
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let _guard = self.write_lock.lock().expect("map lock poisoned");
        self.write_entries(&entries)?;
        debug!(
            team = %self.team,
            changed = changed.len(),
            deleted = deleted.len(),
            "map entries updated"
        );
        Ok(())
    }

    /// Raw artifact content. Reads take no lock and tolerate a concurrent
    /// rename.
    pub fn content(&self) -> EngineResult<String> {
        Ok(fs::read_to_string(self.map_path())?)
    }

    /// Sum of all token estimates, for phase decisions.
    pub fn total_tokens(&self) -> usize {
        self.read_entries()
            .map(|entries| entries.iter().map(|e| e.token_estimate).sum())
            .unwrap_or(0)
    }

    fn read_entries(&self) -> EngineResult<Vec<MapEntry>> {
        let content = self.content()?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if let Some(entry) = MapEntry::parse_line(line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &[MapEntry]) -> EngineResult<()> {
        let mut content = String::from("# Project Map\n\n");
        content.push_str(&format!("Generated: {}\n\n", Utc::now().to_rfc3339()));
        for entry in entries {
            content.push_str(&entry.format_line());
            content.push('\n');
        }
        let warnings: Vec<String> = entries.iter().filter_map(MapEntry::warning_message).collect();
        if !warnings.is_empty() {
            content.push_str("\n## Warnings\n");
            for warning in &warnings {
                content.push_str(warning);
                content.push('\n');
            }
        }

        let map_path = self.map_path();
        if let Some(parent) = map_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = map_path.with_extension("md.tmp");
        let result = fs::write(&tmp_path, &content)
            .map_err(EngineError::from)
            .and_then(|()| fs::rename(&tmp_path, &map_path).map_err(EngineError::from));
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }
}
