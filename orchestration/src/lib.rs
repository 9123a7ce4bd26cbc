//! Leaf services of the agent execution engine.
//!
//! This crate holds everything the scheduler and agent runtime build on:
//!
//! - [`workspace`]: path normalisation, ignore rules, tracked-file enumeration
//! - [`ratelimit`]: sliding-window accounting per LLM provider
//! - [`commit`]: commit records parsed from the edit tool's output
//! - [`map`]: the per-team project map artifact
//! - [`dataset`]: the append-only fine-tuning dataset
//! - [`chatlog`]: chat transcripts and the commit stream
//! - [`phase`]: expansion/convergence phase tracking
//!
//! Initialisation order follows the dependency order: a [`workspace::Workspace`]
//! is opened first and passed explicitly to every other service constructor —
//! there are no global singletons.

pub mod chatlog;
pub mod commit;
pub mod dataset;
pub mod error;
pub mod map;
pub mod phase;
pub mod ratelimit;
pub mod workspace;

pub use chatlog::{ChatLogger, CommitLog};
pub use commit::{Commit, CommitKind};
pub use dataset::{DatasetRecord, DatasetRecorder, DatasetStats};
pub use error::{EngineError, EngineResult};
pub use map::{FileRole, FileStatus, MapEntry, MapService, ERR_TOKENS, WARN_TOKENS};
pub use phase::{Phase, PhaseService, PhaseStatus, PhaseThresholds};
pub use ratelimit::{RateLimiter, RateMetrics, MAX_RATE_LIMIT_ATTEMPTS};
pub use workspace::{IgnoreRules, Workspace, TRACKED_EXTENSIONS};
