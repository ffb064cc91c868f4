//! Measurement lifecycle states and terminal classification.

use std::fmt;
use std::fmt::{Display, Formatter};

/// Why a measurement ended in [`LifecycleState::Failed`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureCause {
    /// No receipt arrived within the submission bound.
    NoAcknowledgment,
    /// A reply arrived on the receipt topic but carried no usable receipt.
    UnusableReceipt,
    /// The transport rejected an operation mid-lifecycle.
    Transport(String),
}

impl Display for FailureCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::NoAcknowledgment => write!(f, "no acknowledgment"),
            FailureCause::UnusableReceipt => write!(f, "unusable receipt"),
            FailureCause::Transport(detail) => write!(f, "transport: {detail}"),
        }
    }
}

/// Client-side lifecycle of one measurement.
///
/// `Created` and `Configured` are local-only; `Submitted`, `AwaitingReceipt`
/// and `Streaming` involve transport I/O; `Completed`, `Interrupted` and
/// `Failed` are terminal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    Created,
    Configured,
    Submitted,
    AwaitingReceipt,
    Streaming,
    Completed,
    Interrupted,
    Failed(FailureCause),
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Completed | LifecycleState::Interrupted | LifecycleState::Failed(_)
        )
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Configured => write!(f, "configured"),
            LifecycleState::Submitted => write!(f, "submitted"),
            LifecycleState::AwaitingReceipt => write!(f, "awaiting-receipt"),
            LifecycleState::Streaming => write!(f, "streaming"),
            LifecycleState::Completed => write!(f, "completed"),
            LifecycleState::Interrupted => write!(f, "interrupted"),
            LifecycleState::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}
