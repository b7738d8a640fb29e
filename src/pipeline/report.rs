//! Record outcomes and the session summary.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;

use crate::engine::MergeOutcome;
use crate::error::{RecordError, RuntimeError};
use crate::record::Identifier;

/// Final result of one record.
#[derive(Debug)]
pub enum RecordOutcome {
    Completed {
        identifier: Option<Identifier>,
        merge: MergeOutcome,
        suspensions: usize,
    },
    Failed {
        identifier: Option<Identifier>,
        error: RecordError,
    },
}

impl RecordOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    #[must_use]
    pub const fn identifier(&self) -> Option<&Identifier> {
        match self {
            Self::Completed { identifier, .. } | Self::Failed { identifier, .. } => identifier.as_ref(),
        }
    }

    #[must_use]
    pub const fn merge(&self) -> Option<&MergeOutcome> {
        match self {
            Self::Completed { merge, .. } => Some(merge),
            Self::Failed { .. } => None,
        }
    }

    #[must_use]
    pub const fn error(&self) -> Option<&RecordError> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

/// Handle returned by `Session::submit`.
#[derive(Debug)]
pub struct RecordHandle {
    label: String,
    rx: Receiver<RecordOutcome>,
}

impl RecordHandle {
    pub(crate) const fn new(label: String, rx: Receiver<RecordOutcome>) -> Self {
        Self { label, rx }
    }

    /// Log label of the submitted record.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the record to complete or fail.
    pub fn join(self) -> Result<RecordOutcome, RuntimeError> {
        self.rx.recv().map_err(|_| RuntimeError::Disconnected)
    }

    /// Waits for the record with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> Result<RecordOutcome, RuntimeError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RuntimeError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => RuntimeError::Disconnected,
        })
    }
}

/// One failed record in the session summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub record: String,
    pub identifier: Option<Identifier>,
    pub kind: &'static str,
    pub message: String,
}

/// Summary returned by `Session::finish`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub submitted: usize,
    pub completed: usize,
    pub created: usize,
    pub failed: usize,
    /// Failed records whose failure was a session cancellation.
    pub cancelled: usize,
    pub failures: Vec<FailureEntry>,
}

impl SessionReport {
    pub(crate) fn record_completed(&mut self, merge: &MergeOutcome) {
        self.completed += 1;
        if merge.created {
            self.created += 1;
        }
    }

    pub(crate) fn record_failed(&mut self, record: String, identifier: Option<Identifier>, error: &RecordError) {
        self.failed += 1;
        if matches!(error, RecordError::Cancelled) {
            self.cancelled += 1;
        }
        self.failures.push(FailureEntry {
            record,
            identifier,
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Failure entry for `identifier`, if that record failed.
    #[must_use]
    pub fn failure_for(&self, identifier: &str) -> Option<&FailureEntry> {
        self.failures
            .iter()
            .find(|f| f.identifier.as_ref().is_some_and(|i| i.as_str() == identifier))
    }
}
