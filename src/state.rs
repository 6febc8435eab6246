//! Instance state machine: states, terminal set, legal transitions.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job instance.
///
/// Every transition is a compare-and-swap on `(id, state)` performed by the
/// store; losers of the CAS must not perform the transition's side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Waiting in its queue, not yet owned by any node.
    Submitted,
    /// Reserved by a node, not yet started.
    Attributed,
    /// Payload is executing on the attributed node.
    Running,
    /// Parked by an administrator; resumes to Submitted.
    Hold,
    /// Payload returned normally.
    Ended,
    /// Payload failed, the artifact could not be loaded, or the node crashed.
    Crashed,
    /// Kill observed at a yield point, or run deadline exceeded.
    Killed,
    /// Cancelled by an administrator before it ever ran.
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Ended
                | InstanceState::Crashed
                | InstanceState::Killed
                | InstanceState::Cancelled
        )
    }

    /// Whether a node currently owns the instance.
    pub fn is_attributed(self) -> bool {
        matches!(self, InstanceState::Attributed | InstanceState::Running)
    }

    /// Legal transitions. Enqueue creates instances directly in Submitted;
    /// everything after that goes through here.
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, to),
            (Submitted, Attributed)
                | (Submitted, Hold)
                | (Submitted, Cancelled)
                | (Hold, Submitted)
                | (Hold, Cancelled)
                | (Attributed, Running)
                | (Attributed, Submitted)
                | (Attributed, Crashed)
                | (Attributed, Killed)
                | (Running, Ended)
                | (Running, Crashed)
                | (Running, Killed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Submitted => "SUBMITTED",
            InstanceState::Attributed => "ATTRIBUTED",
            InstanceState::Running => "RUNNING",
            InstanceState::Hold => "HOLD",
            InstanceState::Ended => "ENDED",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Killed => "KILLED",
            InstanceState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(text: &str) -> Option<InstanceState> {
        Some(match text {
            "SUBMITTED" => InstanceState::Submitted,
            "ATTRIBUTED" => InstanceState::Attributed,
            "RUNNING" => InstanceState::Running,
            "HOLD" => InstanceState::Hold,
            "ENDED" => InstanceState::Ended,
            "CRASHED" => InstanceState::Crashed,
            "KILLED" => InstanceState::Killed,
            "CANCELLED" => InstanceState::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::InstanceState::*;

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [Ended, Crashed, Killed, Cancelled] {
            for to in [
                Submitted, Attributed, Running, Hold, Ended, Crashed, Killed, Cancelled,
            ] {
                assert!(!terminal.can_transition_to(to), "{terminal} -> {to}");
            }
            assert!(terminal.is_terminal());
        }
    }

    #[test]
    fn reservation_and_requeue_are_symmetric() {
        assert!(Submitted.can_transition_to(Attributed));
        assert!(Attributed.can_transition_to(Submitted));
        assert!(!Running.can_transition_to(Submitted));
    }

    #[test]
    fn hold_round_trip() {
        assert!(Submitted.can_transition_to(Hold));
        assert!(Hold.can_transition_to(Submitted));
        assert!(Hold.can_transition_to(Cancelled));
        assert!(!Hold.can_transition_to(Attributed));
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            Submitted, Attributed, Running, Hold, Ended, Crashed, Killed, Cancelled,
        ] {
            assert_eq!(super::InstanceState::parse(state.as_str()), Some(state));
        }
        assert_eq!(super::InstanceState::parse("BOGUS"), None);
    }
}
