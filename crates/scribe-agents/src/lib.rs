//! Scheduler and runtime for the autonomous editing team.
//!
//! The `orchestration` crate provides the leaf services (workspace, rate
//! limiter, map, dataset, transcripts); this crate adds the moving parts:
//! the file mutator driving the external edit tool, the per-agent runtime,
//! and the team scheduler with its worker pool.

pub mod config;
pub mod generate;
pub mod lifecycle;
pub mod mutator;
pub mod research;
pub mod runtime;
pub mod scheduler;
pub mod team;

pub use config::EngineConfig;
pub use mutator::{AiderMutator, MutationRequest, MutationResult, Mutator, MutatorError};
pub use runtime::{AgentRuntime, CycleOutcome, CycleServices};
pub use scheduler::{ScheduleSnapshot, Scheduler, DEFAULT_SHUTDOWN_TIMEOUT};
pub use team::{Agent, AgentKind, AgentSpec, Team};
