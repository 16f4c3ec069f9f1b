use serde::{Deserialize, Serialize};

/// Result a handler reports for one message.
///
/// Only `Retry` puts the message back on the queue. A handler that fails
/// with an error is treated like `Reject`, never like `Retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingOutcome {
    Success,
    Retry,
    Reject,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Reject => "reject",
        }
    }
}

impl std::fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal broker action for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// `basic.ack`
    Ack,
    /// `basic.reject` with `requeue = true`
    Requeue,
    /// `basic.reject` with `requeue = false`
    Discard,
}

impl Disposition {
    pub fn requeue(&self) -> bool {
        matches!(self, Self::Requeue)
    }
}

impl From<ProcessingOutcome> for Disposition {
    fn from(outcome: ProcessingOutcome) -> Self {
        match outcome {
            ProcessingOutcome::Success => Self::Ack,
            ProcessingOutcome::Retry => Self::Requeue,
            ProcessingOutcome::Reject => Self::Discard,
        }
    }
}
