//! Workspace path resolution and ignore handling.
//!
//! Every component that touches files — mutator, map, dataset — goes through
//! this module to decide what is inside the workspace and what is tracked.
//! Centralising the rules keeps the higher layers from silently diverging.

use std::fs;
use std::path::{Component, Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Text extensions the enumerator tracks by default.
pub const TRACKED_EXTENSIONS: &[&str] = &[
    "md", "txt", "py", "js", "ts", "json", "yaml", "yml", "html", "css", "sh", "bat", "ps1",
    "java", "cpp", "h", "c", "cs", "php", "rb", "go", "rs",
];

/// Patterns denied regardless of what the ignore files say.
///
/// `.aider*` and `.tool.*` cover the edit tool's hidden state files (chat and
/// input histories), which must never be modifiable even when untracked by
/// `.gitignore`.
const FIXED_DENYLIST: &[&str] = &[
    ".git/",
    ".aider*",
    ".tool.*",
    "node_modules/",
    "__pycache__/",
    "*.pyc",
    "*.log",
    ".env",
    ".DS_Store",
    "Thumbs.db",
];

/// A workspace root directory plus the layout conventions beneath it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open an existing workspace.
    ///
    /// Fails with [`EngineError::Fatal`] when the root is missing, not a
    /// directory, or not writable — the scheduler must refuse to start.
    pub fn open(root: impl AsRef<Path>) -> EngineResult<Self> {
        let root = root.as_ref();
        let meta = fs::metadata(root)
            .map_err(|e| EngineError::Fatal(format!("workspace {}: {e}", root.display())))?;
        if !meta.is_dir() {
            return Err(EngineError::Fatal(format!(
                "workspace {} is not a directory",
                root.display()
            )));
        }
        if meta.permissions().readonly() {
            return Err(EngineError::Fatal(format!(
                "workspace {} is not writable",
                root.display()
            )));
        }
        let root = fs::canonicalize(root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalise a path and ensure it stays inside the workspace.
    ///
    /// Relative inputs are joined to the root. `.` and `..` components are
    /// folded lexically; any traversal that leaves the root yields
    /// [`EngineError::PathEscape`].
    pub fn resolve(&self, candidate: impl AsRef<Path>) -> EngineResult<PathBuf> {
        let candidate = candidate.as_ref();
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let mut normalized = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(EngineError::PathEscape {
                            path: candidate.to_path_buf(),
                        });
                    }
                }
                other => normalized.push(other.as_os_str()),
            }
        }

        if normalized.starts_with(&self.root) {
            Ok(normalized)
        } else {
            Err(EngineError::PathEscape {
                path: candidate.to_path_buf(),
            })
        }
    }

    /// Path of a path relative to the root, if it is inside the workspace.
    pub fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    /// Load the ignore rules currently on disk.
    pub fn ignore_rules(&self) -> IgnoreRules {
        IgnoreRules::load(&self.root)
    }

    /// Enumerate tracked files of the requested extensions, relative to the
    /// root, deterministically sorted.
    ///
    /// When `active_team` is given, other teams' `team_*` directories are
    /// skipped so each team's map only covers its own workspace view.
    pub fn enumerate(
        &self,
        rules: &IgnoreRules,
        extensions: &[&str],
        active_team: Option<&str>,
    ) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let active_dir = active_team.map(team_dir_name);
        self.walk_dir(&self.root, rules, extensions, active_dir.as_deref(), &mut found);
        found.sort();
        found
    }

    fn walk_dir(
        &self,
        dir: &Path,
        rules: &IgnoreRules,
        extensions: &[&str],
        active_dir: Option<&str>,
        found: &mut Vec<PathBuf>,
    ) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                return;
            }
        };

        let mut items: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        items.sort();

        for path in items {
            let Some(rel) = self.relative(&path) else {
                continue;
            };
            let is_dir = path.is_dir();
            if rules.ignored(&rel, is_dir) {
                continue;
            }
            if is_dir {
                // Only descend into the active team's directory.
                if let (Some(active), Some(name)) = (active_dir, path.file_name()) {
                    let name = name.to_string_lossy();
                    if name.starts_with("team_") && name != active {
                        continue;
                    }
                }
                self.walk_dir(&path, rules, extensions, active_dir, found);
            } else if has_tracked_extension(&path, extensions) {
                found.push(rel);
            }
        }
    }

    // --- Workspace layout conventions ---

    /// `<root>/team_<name>` (the prefix is not doubled if already present).
    pub fn team_dir(&self, team: &str) -> PathBuf {
        self.root.join(team_dir_name(team))
    }

    pub fn map_file(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("map.md")
    }

    pub fn demand_file(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("demande.md")
    }

    pub fn prompts_dir(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("prompts")
    }

    pub fn history_dir(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("history")
    }

    pub fn chats_dir(&self, mission: &str) -> PathBuf {
        self.root.join("chats").join(mission)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

fn team_dir_name(team: &str) -> String {
    if team.starts_with("team_") {
        team.to_string()
    } else {
        format!("team_{team}")
    }
}

fn has_tracked_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e))
        .unwrap_or(false)
}

/// Gitignore-style matcher combining `.gitignore`, `.aiderignore`, and the
/// fixed denylist.
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    pub fn load(root: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in FIXED_DENYLIST {
            // Infallible for the static patterns above.
            let _ = builder.add_line(None, pattern);
        }
        for name in [".gitignore", ".aiderignore"] {
            let file = root.join(name);
            if file.exists() {
                if let Some(e) = builder.add(&file) {
                    warn!(file = %file.display(), error = %e, "ignore file has invalid lines");
                }
            }
        }
        let matcher = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "falling back to empty ignore rules");
            Gitignore::empty()
        });
        Self { matcher }
    }

    /// Whether a workspace-relative path is excluded.
    pub fn ignored(&self, rel: &Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_open_missing_root_is_fatal() {
        let err = Workspace::open("/no/such/workspace/root").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_resolve_relative_inside() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("docs/spec.md").unwrap();
        assert!(resolved.starts_with(ws.root()));
        assert!(resolved.ends_with("docs/spec.md"));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_dir, ws) = workspace();
        let err = ws.resolve("../outside.md").unwrap_err();
        assert!(matches!(err, EngineError::PathEscape { .. }));

        let err = ws.resolve("docs/../../outside.md").unwrap_err();
        assert!(matches!(err, EngineError::PathEscape { .. }));
    }

    #[test]
    fn test_resolve_folds_dot_components() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("./docs/./a/../spec.md").unwrap();
        assert!(resolved.ends_with("docs/spec.md"));
    }

    #[test]
    fn test_resolve_absolute_outside_rejected() {
        let (_dir, ws) = workspace();
        let err = ws.resolve("/etc/passwd").unwrap_err();
        assert!(matches!(err, EngineError::PathEscape { .. }));
    }

    #[test]
    fn test_denylist_always_applies() {
        let (_dir, ws) = workspace();
        let rules = ws.ignore_rules();
        assert!(rules.ignored(Path::new(".aider.spec.chat.history.md"), false));
        assert!(rules.ignored(Path::new(".git/config"), false));
        assert!(rules.ignored(Path::new("node_modules/left-pad/index.js"), false));
        assert!(rules.ignored(Path::new("cache/__pycache__/mod.pyc"), false));
        assert!(!rules.ignored(Path::new("src/main.rs"), false));
    }

    #[test]
    fn test_gitignore_patterns_are_honoured() {
        let (dir, ws) = workspace();
        fs::write(dir.path().join(".gitignore"), "build/\n*.tmp\n").unwrap();
        let rules = ws.ignore_rules();
        assert!(rules.ignored(Path::new("build/out.md"), false));
        assert!(rules.ignored(Path::new("draft.tmp"), false));
        assert!(!rules.ignored(Path::new("draft.md"), false));
    }

    #[test]
    fn test_aiderignore_patterns_are_honoured() {
        let (dir, ws) = workspace();
        fs::write(dir.path().join(".aiderignore"), "secrets.md\n").unwrap();
        let rules = ws.ignore_rules();
        assert!(rules.ignored(Path::new("secrets.md"), false));
    }

    #[test]
    fn test_enumerate_sorted_and_filtered() {
        let (dir, ws) = workspace();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/b.rs"), "fn b() {}").unwrap();
        fs::write(dir.path().join("src/a.rs"), "fn a() {}").unwrap();
        fs::write(dir.path().join("readme.md"), "# hi").unwrap();
        fs::write(dir.path().join("image.png"), [0u8; 4]).unwrap();
        fs::write(dir.path().join(".aider.state.md"), "state").unwrap();

        let rules = ws.ignore_rules();
        let files = ws.enumerate(&rules, TRACKED_EXTENSIONS, None);
        assert_eq!(
            files,
            vec![
                PathBuf::from("readme.md"),
                PathBuf::from("src/a.rs"),
                PathBuf::from("src/b.rs"),
            ]
        );
    }

    #[test]
    fn test_enumerate_skips_other_team_dirs() {
        let (dir, ws) = workspace();
        fs::create_dir_all(dir.path().join("team_red")).unwrap();
        fs::create_dir_all(dir.path().join("team_blue")).unwrap();
        fs::write(dir.path().join("team_red/todolist.md"), "- task").unwrap();
        fs::write(dir.path().join("team_blue/todolist.md"), "- task").unwrap();

        let rules = ws.ignore_rules();
        let files = ws.enumerate(&rules, TRACKED_EXTENSIONS, Some("red"));
        assert_eq!(files, vec![PathBuf::from("team_red/todolist.md")]);
    }

    #[test]
    fn test_team_dir_prefix_not_doubled() {
        let (_dir, ws) = workspace();
        assert!(ws.team_dir("book").ends_with("team_book"));
        assert!(ws.team_dir("team_book").ends_with("team_book"));
    }
}
