//! Project phases driven by total token usage.
//!
//! The workspace grows during *expansion* and must be condensed during
//! *convergence*. The scheduler feeds the map's token total into
//! [`PhaseService::observe`] and uses the resulting phase to gate which
//! agents may run.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Expansion,
    Convergence,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expansion => "expansion",
            Self::Convergence => "convergence",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds are configuration, not constants: deployments with a different
/// context window override the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseThresholds {
    pub model_token_limit: usize,
    pub convergence_ratio: f64,
    pub expansion_ratio: f64,
}

impl Default for PhaseThresholds {
    fn default() -> Self {
        Self {
            model_token_limit: 128_000,
            convergence_ratio: 0.60,
            expansion_ratio: 0.50,
        }
    }
}

impl PhaseThresholds {
    pub fn convergence_tokens(&self) -> usize {
        (self.model_token_limit as f64 * self.convergence_ratio) as usize
    }

    pub fn expansion_tokens(&self) -> usize {
        (self.model_token_limit as f64 * self.expansion_ratio) as usize
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub total_tokens: usize,
    pub usage_percent: f64,
    pub status_icon: &'static str,
    pub headroom: i64,
    pub last_transition: DateTime<Utc>,
}

struct PhaseState {
    current: Phase,
    total_tokens: usize,
    last_transition: DateTime<Utc>,
}

/// Publishes the discrete phase label consumed by the scheduler's gate.
pub struct PhaseService {
    thresholds: PhaseThresholds,
    state: Mutex<PhaseState>,
}

impl PhaseService {
    pub fn new(thresholds: PhaseThresholds) -> Self {
        Self {
            thresholds,
            state: Mutex::new(PhaseState {
                current: Phase::Expansion,
                total_tokens: 0,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn current(&self) -> Phase {
        self.state.lock().expect("phase lock poisoned").current
    }

    /// Feed a fresh token total and return the (possibly changed) phase.
    ///
    /// Hysteresis: above the convergence threshold → convergence; below the
    /// expansion threshold → expansion; in between the phase is kept.
    pub fn observe(&self, total_tokens: usize) -> Phase {
        let mut state = self.state.lock().expect("phase lock poisoned");
        state.total_tokens = total_tokens;
        let previous = state.current;

        if total_tokens > self.thresholds.convergence_tokens() {
            state.current = Phase::Convergence;
        } else if total_tokens < self.thresholds.expansion_tokens() {
            state.current = Phase::Expansion;
        }

        if previous != state.current {
            state.last_transition = Utc::now();
            info!(
                from = %previous,
                to = %state.current,
                total_tokens,
                "phase transition"
            );
        }
        state.current
    }

    pub fn status(&self) -> PhaseStatus {
        let state = self.state.lock().expect("phase lock poisoned");
        let usage_percent =
            state.total_tokens as f64 / self.thresholds.model_token_limit as f64 * 100.0;
        let status_icon = if usage_percent < 55.0 {
            "✓"
        } else if usage_percent < 60.0 {
            "⚠️"
        } else {
            "🔴"
        };
        let headroom = match state.current {
            Phase::Expansion => {
                self.thresholds.convergence_tokens() as i64 - state.total_tokens as i64
            }
            Phase::Convergence => {
                self.thresholds.expansion_tokens() as i64 - state.total_tokens as i64
            }
        };
        PhaseStatus {
            phase: state.current,
            total_tokens: state.total_tokens,
            usage_percent,
            status_icon,
            headroom,
            last_transition: state.last_transition,
        }
    }

    /// Force a phase by hand (debugging aid).
    pub fn force(&self, phase: Phase) {
        let mut state = self.state.lock().expect("phase lock poisoned");
        if state.current != phase {
            state.current = phase;
            state.last_transition = Utc::now();
            warn!(phase = %phase, "phase forced");
        }
    }
}

impl Default for PhaseService {
    fn default() -> Self {
        Self::new(PhaseThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_in_expansion() {
        let service = PhaseService::default();
        assert_eq!(service.current(), Phase::Expansion);
    }

    #[test]
    fn test_crossing_convergence_threshold() {
        let service = PhaseService::default();
        // 60 % of 128k = 76 800
        assert_eq!(service.observe(76_800), Phase::Expansion);
        assert_eq!(service.observe(76_801), Phase::Convergence);
    }

    #[test]
    fn test_hysteresis_between_thresholds() {
        let service = PhaseService::default();
        service.observe(80_000);
        assert_eq!(service.current(), Phase::Convergence);
        // Between 64 000 and 76 800 the phase is kept.
        assert_eq!(service.observe(70_000), Phase::Convergence);
        // Dropping below 50 % flips back to expansion.
        assert_eq!(service.observe(63_999), Phase::Expansion);
    }

    #[test]
    fn test_status_icons_follow_usage() {
        let service = PhaseService::default();
        service.observe(10_000);
        assert_eq!(service.status().status_icon, "✓");
        service.observe(72_000); // 56.25 %
        assert_eq!(service.status().status_icon, "⚠️");
        service.observe(80_000); // 62.5 %
        assert_eq!(service.status().status_icon, "🔴");
    }

    #[test]
    fn test_headroom_sign() {
        let service = PhaseService::default();
        service.observe(10_000);
        assert!(service.status().headroom > 0);
        service.observe(90_000);
        // In convergence, headroom measures distance back to expansion.
        assert!(service.status().headroom < 0);
    }

    #[test]
    fn test_force_overrides_phase() {
        let service = PhaseService::default();
        service.force(Phase::Convergence);
        assert_eq!(service.current(), Phase::Convergence);
    }

    #[test]
    fn test_custom_thresholds() {
        let service = PhaseService::new(PhaseThresholds {
            model_token_limit: 1000,
            convergence_ratio: 0.6,
            expansion_ratio: 0.5,
        });
        assert_eq!(service.observe(601), Phase::Convergence);
        assert_eq!(service.observe(499), Phase::Expansion);
    }
}
