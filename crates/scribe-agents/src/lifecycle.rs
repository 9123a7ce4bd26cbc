//! Agent slot states and legal transition guards.
//!
//! Every agent slot moves through a small graph:
//!
//! ```text
//! Dormant → Ready → InFlight → Running → Ready
//!                                      → Dormant (fatal)
//! ```
//!
//! Only the scheduler crosses Ready↔InFlight; only the runtime crosses
//! InFlight↔Running. `advance()` validates each edge and keeps a bounded
//! transition log so the status surface can explain how an agent got where
//! it is.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use serde::Serialize;

/// Number of transitions retained per agent for diagnostics.
const TRANSITION_LOG_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Not schedulable (startup, fatal error, or team deactivated).
    Dormant,
    /// Eligible for selection.
    Ready,
    /// Claimed by a worker, cycle not yet started.
    InFlight,
    /// A cycle is executing.
    Running,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Dormant => "dormant",
            Self::Ready => "ready",
            Self::InFlight => "in-flight",
            Self::Running => "running",
        };
        f.write_str(label)
    }
}

fn is_legal_transition(from: SlotState, to: SlotState) -> bool {
    use SlotState::*;
    matches!(
        (from, to),
        (Dormant, Ready)        // activation
            | (Ready, InFlight) // scheduler claims the slot
            | (InFlight, Running) // runtime starts the cycle
            | (InFlight, Ready) // claim released without running (cancel)
            | (Running, Ready)  // cycle finished
            | (Running, Dormant) // fatal error or failed recovery
            | (Ready, Dormant)  // team deactivated
            | (InFlight, Dormant) // shutdown while claimed
    )
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: SlotState,
    pub to: SlotState,
    pub at: Instant,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: SlotState,
    pub to: SlotState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal slot transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// The per-agent slot state machine.
#[derive(Debug)]
pub struct Slot {
    current: SlotState,
    transitions: VecDeque<TransitionRecord>,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            current: SlotState::Dormant,
            transitions: VecDeque::new(),
        }
    }

    pub fn current(&self) -> SlotState {
        self.current
    }

    pub fn advance(&mut self, to: SlotState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }
        if self.transitions.len() == TRANSITION_LOG_CAP {
            self.transitions.pop_front();
        }
        self.transitions.push_back(TransitionRecord {
            from: self.current,
            to,
            at: Instant::now(),
            reason: reason.map(String::from),
        });
        tracing::debug!(from = %self.current, to = %to, "slot transition");
        self.current = to;
        Ok(())
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.transitions.iter()
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}
