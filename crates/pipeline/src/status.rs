//! Work item status vocabulary and the transition function driving it.
//!
//! The serialized names are read by the UI and by whoever owns the link
//! database, so they must not change.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Pending,
    Downloading,
    Transcribing,
    Processing,
    Saving,
    Completed,
    Failed,
}

/// Event that moves an item from one status to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Dispatched,
    Downloaded,
    Transcribed,
    /// Text extraction finished, successfully or not
    TextExtracted,
    Summarized,
    Published,
    StageFailed,
    /// A stalled item was handed back to discovery
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transition from {from} on {trigger:?}")]
pub struct TransitionError {
    pub from: WorkStatus,
    pub trigger: Trigger,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 7] = [
        WorkStatus::Pending,
        WorkStatus::Downloading,
        WorkStatus::Transcribing,
        WorkStatus::Processing,
        WorkStatus::Saving,
        WorkStatus::Completed,
        WorkStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Downloading => "downloading",
            WorkStatus::Transcribing => "transcribing",
            WorkStatus::Processing => "processing",
            WorkStatus::Saving => "saving",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed)
    }

    /// Statuses held while a worker owns the item
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            WorkStatus::Downloading | WorkStatus::Transcribing | WorkStatus::Processing | WorkStatus::Saving
        )
    }

    /// Position along the happy path; `Failed` has none
    pub fn rank(self) -> Option<usize> {
        match self {
            WorkStatus::Pending => Some(0),
            WorkStatus::Downloading => Some(1),
            WorkStatus::Transcribing => Some(2),
            WorkStatus::Processing => Some(3),
            WorkStatus::Saving => Some(4),
            WorkStatus::Completed => Some(5),
            WorkStatus::Failed => None,
        }
    }

    /// Total transition function. Every (status, trigger) pair yields either
    /// the next status or a `TransitionError`.
    pub fn next(self, trigger: Trigger) -> Result<WorkStatus, TransitionError> {
        use Trigger::*;
        use WorkStatus::*;

        let to = match (self, trigger) {
            (Pending, Dispatched) => Downloading,
            (Downloading, Downloaded) => Transcribing,
            (Transcribing, Transcribed) => Processing,
            (Processing, TextExtracted) => Processing,
            (Processing, Summarized) => Saving,
            (Saving, Published) => Completed,
            (from, StageFailed) if !from.is_terminal() => Failed,
            (from, Requeued) if from.is_in_flight() => Pending,
            (from, trigger) => return Err(TransitionError { from, trigger }),
        };
        Ok(to)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TRIGGERS: [Trigger; 8] = [
        Trigger::Dispatched,
        Trigger::Downloaded,
        Trigger::Transcribed,
        Trigger::TextExtracted,
        Trigger::Summarized,
        Trigger::Published,
        Trigger::StageFailed,
        Trigger::Requeued,
    ];

    #[test]
    fn test_happy_path() {
        let mut status = WorkStatus::Pending;
        for trigger in [
            Trigger::Dispatched,
            Trigger::Downloaded,
            Trigger::Transcribed,
            Trigger::TextExtracted,
            Trigger::Summarized,
            Trigger::Published,
        ] {
            status = status.next(trigger).unwrap();
        }
        assert_eq!(status, WorkStatus::Completed);
    }

    #[test]
    fn test_transition_table() {
        use Trigger::*;
        use WorkStatus::*;

        let table = [
            (Pending, Dispatched, Downloading),
            (Downloading, Downloaded, Transcribing),
            (Downloading, StageFailed, Failed),
            (Transcribing, Transcribed, Processing),
            (Transcribing, StageFailed, Failed),
            (Processing, TextExtracted, Processing),
            (Processing, Summarized, Saving),
            (Processing, StageFailed, Failed),
            (Saving, Published, Completed),
            (Saving, StageFailed, Failed),
        ];
        for (from, trigger, to) in table {
            assert_eq!(from.next(trigger), Ok(to), "{} on {:?}", from, trigger);
        }
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for trigger in TRIGGERS {
            assert!(WorkStatus::Completed.next(trigger).is_err());
            assert!(WorkStatus::Failed.next(trigger).is_err());
        }
    }

    #[test]
    fn test_serialized_names() {
        for status in WorkStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<WorkStatus>(), Ok(status));
        }
        assert!("done".parse::<WorkStatus>().is_err());
    }

    #[test]
    fn test_requeue_only_from_in_flight() {
        assert_eq!(WorkStatus::Saving.next(Trigger::Requeued), Ok(WorkStatus::Pending));
        assert!(WorkStatus::Pending.next(Trigger::Requeued).is_err());
        assert!(WorkStatus::Completed.next(Trigger::Requeued).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Any trigger sequence that does not requeue moves strictly forward along the
        /// happy path or ends in failed, and never leaves a terminal status.
        #[test]
        fn test_never_moves_backward(indices in prop::collection::vec(0usize..7, 0..20)) {
            let mut status = WorkStatus::Pending;
            for i in indices {
                match status.next(TRIGGERS[i]) {
                    Ok(next) => {
                        prop_assert!(!status.is_terminal());
                        if let (Some(a), Some(b)) = (status.rank(), next.rank()) {
                            prop_assert!(b >= a);
                            prop_assert!(b - a <= 1);
                        }
                        status = next;
                    }
                    Err(err) => prop_assert_eq!(err.from, status),
                }
            }
        }
    }
}
