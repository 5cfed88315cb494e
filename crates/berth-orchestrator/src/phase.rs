use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    CheckingExisting,
    Pulling,
    Building,
    Starting,
    HealthChecking,
    Ready,
    Failed,
}

impl Phase {
    /// Wire name used in `orchestration:phase` events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::CheckingExisting => "checking_existing",
            Phase::Pulling => "pulling",
            Phase::Building => "building",
            Phase::Starting => "starting",
            Phase::HealthChecking => "health_checking",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ready | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Idle => "Idle",
            Phase::CheckingExisting => "CheckingExisting",
            Phase::Pulling => "Pulling",
            Phase::Building => "Building",
            Phase::Starting => "Starting",
            Phase::HealthChecking => "HealthChecking",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// PhaseEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEvent {
    Begin,
    FoundRunning,
    NeedPull,
    NeedBuild,
    ImageReady,
    StreamSucceeded,
    ContainerStarted,
    Healthy,
    Fail,
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PhaseEvent::Begin => "Begin",
            PhaseEvent::FoundRunning => "FoundRunning",
            PhaseEvent::NeedPull => "NeedPull",
            PhaseEvent::NeedBuild => "NeedBuild",
            PhaseEvent::ImageReady => "ImageReady",
            PhaseEvent::StreamSucceeded => "StreamSucceeded",
            PhaseEvent::ContainerStarted => "ContainerStarted",
            PhaseEvent::Healthy => "Healthy",
            PhaseEvent::Fail => "Fail",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in phase {phase}")]
    InvalidTransition { phase: Phase, event: PhaseEvent },
}

// ---------------------------------------------------------------------------
// PhaseMachine
// ---------------------------------------------------------------------------

/// Bootstrap lifecycle. Phases only move forward; `Ready` and `Failed` are
/// terminal and accept nothing.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    current: Phase,
    history: Vec<(Phase, PhaseEvent, Phase)>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: Phase::Idle,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.current
    }

    pub fn history(&self) -> &[(Phase, PhaseEvent, Phase)] {
        &self.history
    }

    /// Valid transitions:
    /// - Idle             + Begin            -> CheckingExisting
    /// - CheckingExisting + FoundRunning     -> Ready
    /// - CheckingExisting + NeedPull         -> Pulling
    /// - CheckingExisting + NeedBuild        -> Building
    /// - CheckingExisting + ImageReady       -> Starting
    /// - Pulling|Building + StreamSucceeded  -> Starting
    /// - Starting         + ContainerStarted -> HealthChecking
    /// - HealthChecking   + Healthy          -> Ready
    /// - any non-terminal + Fail             -> Failed
    pub fn transition(&mut self, event: PhaseEvent) -> Result<Phase, StateMachineError> {
        let next = next_phase(self.current, event).ok_or(StateMachineError::InvalidTransition {
            phase: self.current,
            event,
        })?;

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "bootstrap phase transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: PhaseEvent) -> bool {
        next_phase(self.current, event).is_some()
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn next_phase(current: Phase, event: PhaseEvent) -> Option<Phase> {
    let next = match (current, event) {
        (Phase::Idle, PhaseEvent::Begin) => Phase::CheckingExisting,
        (Phase::CheckingExisting, PhaseEvent::FoundRunning) => Phase::Ready,
        (Phase::CheckingExisting, PhaseEvent::NeedPull) => Phase::Pulling,
        (Phase::CheckingExisting, PhaseEvent::NeedBuild) => Phase::Building,
        (Phase::CheckingExisting, PhaseEvent::ImageReady) => Phase::Starting,
        (Phase::Pulling | Phase::Building, PhaseEvent::StreamSucceeded) => Phase::Starting,
        (Phase::Starting, PhaseEvent::ContainerStarted) => Phase::HealthChecking,
        (Phase::HealthChecking, PhaseEvent::Healthy) => Phase::Ready,
        (phase, PhaseEvent::Fail) if !phase.is_terminal() => Phase::Failed,
        _ => return None,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_path_reaches_ready() {
        let mut sm = PhaseMachine::new();
        for event in [
            PhaseEvent::Begin,
            PhaseEvent::NeedPull,
            PhaseEvent::StreamSucceeded,
            PhaseEvent::ContainerStarted,
            PhaseEvent::Healthy,
        ] {
            sm.transition(event).unwrap();
        }
        assert_eq!(sm.phase(), Phase::Ready);
        assert_eq!(sm.history().len(), 5);
    }

    #[test]
    fn fast_path_skips_to_ready() {
        let mut sm = PhaseMachine::new();
        sm.transition(PhaseEvent::Begin).unwrap();
        assert_eq!(sm.transition(PhaseEvent::FoundRunning).unwrap(), Phase::Ready);
    }

    #[test]
    fn fail_from_every_non_terminal_phase() {
        let paths: &[&[PhaseEvent]] = &[
            &[],
            &[PhaseEvent::Begin],
            &[PhaseEvent::Begin, PhaseEvent::NeedPull],
            &[PhaseEvent::Begin, PhaseEvent::NeedBuild],
            &[PhaseEvent::Begin, PhaseEvent::ImageReady],
            &[PhaseEvent::Begin, PhaseEvent::ImageReady, PhaseEvent::ContainerStarted],
        ];
        for path in paths {
            let mut sm = PhaseMachine::new();
            for event in *path {
                sm.transition(*event).unwrap();
            }
            assert!(sm.can_transition(PhaseEvent::Fail));
            assert_eq!(sm.transition(PhaseEvent::Fail).unwrap(), Phase::Failed);
        }
    }

    #[test]
    fn terminal_phases_accept_nothing() {
        let mut sm = PhaseMachine::new();
        sm.transition(PhaseEvent::Fail).unwrap();
        assert!(sm.transition(PhaseEvent::Fail).is_err());
        assert!(sm.transition(PhaseEvent::Begin).is_err());

        let mut sm = PhaseMachine::new();
        sm.transition(PhaseEvent::Begin).unwrap();
        sm.transition(PhaseEvent::FoundRunning).unwrap();
        assert!(!sm.can_transition(PhaseEvent::Fail));
        assert!(!sm.can_transition(PhaseEvent::Healthy));
    }

    #[test]
    fn no_phase_is_skipped() {
        let mut sm = PhaseMachine::new();
        sm.transition(PhaseEvent::Begin).unwrap();
        let err = sm.transition(PhaseEvent::Healthy).unwrap_err();
        assert!(err.to_string().contains("Healthy"));
        assert!(err.to_string().contains("CheckingExisting"));
        assert_eq!(sm.phase(), Phase::CheckingExisting);
    }

    #[test]
    fn wire_names_are_snake_case() {
        assert_eq!(Phase::HealthChecking.as_str(), "health_checking");
        let json = serde_json::to_string(&Phase::CheckingExisting).unwrap();
        assert_eq!(json, "\"checking_existing\"");
    }
}
