//! Per-record lifecycle.

use std::fmt;

use serde::Serialize;

/// Processing state of one record.
///
/// `Received -> Suspended (0+) -> Merging -> Completed | Failed`. Failure is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Received,
    Suspended,
    Merging,
    Completed,
    Failed,
}

impl RecordState {
    /// Returns true if `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Suspended | Self::Merging | Self::Failed)
                | (Self::Suspended, Self::Suspended | Self::Merging | Self::Failed)
                | (Self::Merging, Self::Completed | Self::Failed)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Suspended => "suspended",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State plus the number of times the record suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lifecycle {
    state: RecordState,
    suspensions: usize,
}

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self {
            state: RecordState::Received,
            suspensions: 0,
        }
    }

    pub(crate) const fn state(&self) -> RecordState {
        self.state
    }

    pub(crate) const fn suspensions(&self) -> usize {
        self.suspensions
    }

    /// Moves to `next`. Returns false and keeps the current state if the
    /// transition is illegal.
    pub(crate) fn advance(&mut self, next: RecordState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        if next == RecordState::Suspended {
            self.suspensions += 1;
        }
        self.state = next;
        true
    }
}
