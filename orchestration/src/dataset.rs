//! Fine-tuning dataset: append-only JSONL of successful interactions.
//!
//! One record per successful cycle at `data/fine-tuning.jsonl`. The file is
//! opened in append mode per call under an exclusive advisory lock and synced
//! before close, so concurrent workers never interleave partial lines.
//! Records are never updated; housekeeping only drops exact duplicates.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::workspace::Workspace;

/// Interval between duplicate-removal passes.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub agent: String,
    pub num_files: usize,
    pub files: Vec<String>,
}

/// One appended interaction. `messages` is always
/// `[system: prompt, user: context+task, assistant: response]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub timestamp: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DatasetStats {
    pub total_entries: usize,
    pub malformed_entries: usize,
    pub total_files: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DedupReport {
    pub removed: usize,
    pub remaining: usize,
}

/// Appends interaction records for later fine-tuning.
pub struct DatasetRecorder {
    path: PathBuf,
}

impl DatasetRecorder {
    pub fn new(workspace: &Workspace) -> EngineResult<Self> {
        let data_dir = workspace.data_dir();
        fs::create_dir_all(&data_dir)?;
        let path = data_dir.join("fine-tuning.jsonl");
        if !path.exists() {
            fs::write(&path, "")?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one record. The write is flushed and fsynced before the lock is
    /// released; a failure leaves the file without a partial line.
    pub fn append(
        &self,
        agent: &str,
        prompt: &str,
        files_context: &BTreeMap<String, String>,
        response: &str,
    ) -> EngineResult<()> {
        if prompt.trim().is_empty() || response.trim().is_empty() {
            return Err(EngineError::Validation(
                "dataset record requires a prompt and a response".into(),
            ));
        }

        let user_content = format!(
            "Context:\n{}\n\nTask:\n{}",
            format_files_context(files_context),
            prompt
        );
        let record = DatasetRecord {
            timestamp: Utc::now(),
            messages: vec![
                Message {
                    role: "system".into(),
                    content: prompt.to_string(),
                },
                Message {
                    role: "user".into(),
                    content: user_content,
                },
                Message {
                    role: "assistant".into(),
                    content: response.to_string(),
                },
            ],
            metadata: RecordMetadata {
                agent: agent.to_string(),
                num_files: files_context.len(),
                files: files_context.keys().cloned().collect(),
            },
        };

        let line = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let result = writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all());
        let unlock = fs2::FileExt::unlock(&file);
        result?;
        unlock?;

        debug!(agent, files = record.metadata.num_files, "dataset record appended");
        Ok(())
    }

    /// Count valid and malformed lines. Malformed lines are skipped and
    /// counted, never rewritten.
    pub fn stats(&self) -> EngineResult<DatasetStats> {
        let content = fs::read_to_string(&self.path)?;
        let mut total_entries = 0;
        let mut malformed = 0;
        let mut total_files = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<DatasetRecord>(line) {
                Ok(record) => {
                    total_entries += 1;
                    total_files += record.metadata.num_files;
                }
                Err(_) => malformed += 1,
            }
        }
        Ok(DatasetStats {
            total_entries,
            malformed_entries: malformed,
            total_files,
            size_bytes: fs::metadata(&self.path)?.len(),
        })
    }

    /// Log the startup inventory; malformed lines are reported but kept.
    pub fn log_startup_stats(&self) {
        match self.stats() {
            Ok(stats) => info!(
                entries = stats.total_entries,
                malformed = stats.malformed_entries,
                files = stats.total_files,
                bytes = stats.size_bytes,
                "dataset ready"
            ),
            Err(e) => warn!(error = %e, "could not scan dataset file"),
        }
    }

    /// Rewrite the file without exact-duplicate lines (byte-identical after
    /// trim). Runs under the advisory lock; the swap is atomic.
    pub fn dedup(&self) -> EngineResult<DedupReport> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.lock_exclusive()?;

        let result = (|| {
            let content = fs::read_to_string(&self.path)?;
            let mut seen = std::collections::HashSet::new();
            let mut kept = Vec::new();
            let mut removed = 0;
            for line in content.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if seen.insert(trimmed.to_string()) {
                    kept.push(line);
                } else {
                    removed += 1;
                }
            }

            let tmp = self.path.with_extension("jsonl.tmp");
            let mut out = String::with_capacity(content.len());
            for line in &kept {
                out.push_str(line);
                out.push('\n');
            }
            fs::write(&tmp, &out)?;
            fs::rename(&tmp, &self.path)?;
            Ok::<_, EngineError>(DedupReport {
                removed,
                remaining: kept.len(),
            })
        })();

        let unlock = fs2::FileExt::unlock(&file);
        let report = result?;
        unlock?;

        info!(
            removed = report.removed,
            remaining = report.remaining,
            "dataset housekeeping complete"
        );
        Ok(report)
    }
}

fn format_files_context(files_context: &BTreeMap<String, String>) -> String {
    let mut formatted = Vec::with_capacity(files_context.len());
    for (filename, content) in files_context {
        formatted.push(format!("File: {filename}\n```\n{content}\n```\n"));
    }
    formatted.join("\n")
}

/// Hourly duplicate-removal loop. Spawned by the scheduler; exits when the
/// cancellation token fires.
pub async fn run_housekeeping(recorder: Arc<DatasetRecorder>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("dataset housekeeping stopped");
                return;
            }
            _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {
                if let Err(e) = recorder.dedup() {
                    warn!(error = %e, "dataset housekeeping failed");
                }
            }
        }
    }
}
