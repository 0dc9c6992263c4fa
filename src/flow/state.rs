//! Flow lifecycle states

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a single flow.
///
/// ```text
/// Created -> Matching -> Connecting -> Relaying -> Closing -> Closed
///               \______________\____________\_____> Errored -> Closed
/// ```
///
/// Cancellation moves any non-terminal state to `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Created,
    Matching,
    Connecting,
    Relaying,
    Closing,
    Closed,
    Errored,
}

impl FlowState {
    /// Whether the flow has finished
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use FlowState::{Closed, Closing, Connecting, Created, Errored, Matching, Relaying};
        matches!(
            (self, next),
            (Created, Matching)
                | (Matching, Connecting)
                | (Connecting, Relaying)
                | (Relaying, Closing)
                | (Created | Matching | Connecting | Relaying, Errored)
                | (Created | Matching | Connecting, Closing)
                | (Closing | Errored, Closed)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Matching => "matching",
            Self::Connecting => "connecting",
            Self::Relaying => "relaying",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            FlowState::Created,
            FlowState::Matching,
            FlowState::Connecting,
            FlowState::Relaying,
            FlowState::Closing,
            FlowState::Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_errored_always_reaches_closed() {
        assert!(FlowState::Errored.can_transition_to(FlowState::Closed));
        assert!(!FlowState::Errored.can_transition_to(FlowState::Relaying));
        assert!(!FlowState::Closed.can_transition_to(FlowState::Matching));
        assert!(!FlowState::Relaying.can_transition_to(FlowState::Matching));
    }

    #[test]
    fn test_terminal() {
        assert!(FlowState::Closed.is_terminal());
        assert!(!FlowState::Errored.is_terminal());
    }
}
