//! Termination classification
//!
//! Pure functions over the observed wait status; consulted only when no
//! envelope arrived from the isolated context.

use crate::config::types::{FaultRecord, IsolateError, TerminationStatus};

/// Why a context produced no envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Killed by a fatal signal.
    Fault(FaultRecord),
    /// Exited nonzero without a detected fault signal.
    UnknownFailure(i32),
    /// Exited zero, i.e. claimed success, but wrote nothing.
    ProtocolViolation,
}

impl Verdict {
    pub fn into_error(self) -> IsolateError {
        match self {
            Self::Fault(record) => IsolateError::Fault(record),
            Self::UnknownFailure(exit_code) => IsolateError::UnknownFailure { exit_code },
            Self::ProtocolViolation => IsolateError::ProtocolViolation,
        }
    }
}

/// Classify a context that terminated without an envelope.
pub fn classify(status: &TerminationStatus) -> Verdict {
    match *status {
        TerminationStatus::Signaled {
            signal,
            core_dumped,
        } => Verdict::Fault(FaultRecord::from_signal(signal, core_dumped)),
        TerminationStatus::Exited(0) => Verdict::ProtocolViolation,
        TerminationStatus::Exited(code) => Verdict::UnknownFailure(code),
    }
}

/// Classify a context run without a transport: a clean exit is success.
pub fn classify_discarded(status: &TerminationStatus) -> Option<Verdict> {
    match status {
        TerminationStatus::Exited(0) => None,
        other => Some(classify(other)),
    }
}
