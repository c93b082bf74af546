//! Error kinds shared across the executor.
//!
//! Every failure carries a stable integer code; the code travels to the host
//! through the response queue or, for per-message failures, through the
//! message's return-code field. `QueueEmpty` is a control signal rather than
//! a failure and must never be reported downstream.

use thiserror::Error;

/// Code reported for a healthy message / successful command.
pub const CODE_SUCCESS: i32 = 0;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("queue operation failed: {0}")]
    QueueError(String),

    #[error("driver operation failed: {0}")]
    DrvError(String),

    #[error("message buffer error: {0}")]
    MemBufError(String),

    /// Soft retry signal for lazily loaded operators.
    #[error("operator not ready, init again")]
    InitAgain,

    /// Non-error control signal: dequeue found nothing.
    #[error("queue empty")]
    QueueEmpty,

    #[error("input queue {queue_id} already bound to processor {owner}")]
    QueueBindingConflict { queue_id: u32, owner: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Stable integer code used on the wire and in message return codes.
    pub fn code(&self) -> i32 {
        match self {
            FlowError::Internal(_) => 1,
            FlowError::ParamInvalid(_) => 3,
            FlowError::QueueError(_) => 4,
            FlowError::DrvError(_) => 5,
            FlowError::MemBufError(_) => 6,
            FlowError::InitAgain => 7,
            FlowError::QueueEmpty => 8,
            FlowError::QueueBindingConflict { .. } => 9,
        }
    }

    /// True for the codes that signal "try again later" rather than failure.
    pub fn is_retry(&self) -> bool {
        matches!(self, FlowError::InitAgain | FlowError::QueueEmpty)
    }
}

pub type FlowResult<T> = Result<T, FlowError>;

/// Result of a lazy operator initialisation attempt.
///
/// `RetryLater` propagates to the executor, which re-submits the init event
/// after a back-off instead of failing the whole process.
#[derive(Debug)]
pub enum InitOutcome {
    Done,
    RetryLater,
    Fatal(FlowError),
}

impl InitOutcome {
    pub fn from_result(res: FlowResult<()>) -> Self {
        match res {
            Ok(()) => InitOutcome::Done,
            Err(FlowError::InitAgain) => InitOutcome::RetryLater,
            Err(e) => InitOutcome::Fatal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(FlowError::Internal("x".into()).code(), 1);
        assert_eq!(FlowError::ParamInvalid("x".into()).code(), 3);
        assert_eq!(FlowError::QueueEmpty.code(), 8);
        assert_eq!(
            FlowError::QueueBindingConflict { queue_id: 7, owner: 0 }.code(),
            9
        );
    }

    #[test]
    fn retry_classification() {
        assert!(FlowError::InitAgain.is_retry());
        assert!(FlowError::QueueEmpty.is_retry());
        assert!(!FlowError::DrvError("d".into()).is_retry());
    }

    #[test]
    fn init_outcome_mapping() {
        assert!(matches!(InitOutcome::from_result(Ok(())), InitOutcome::Done));
        assert!(matches!(
            InitOutcome::from_result(Err(FlowError::InitAgain)),
            InitOutcome::RetryLater
        ));
        assert!(matches!(
            InitOutcome::from_result(Err(FlowError::Internal("b".into()))),
            InitOutcome::Fatal(_)
        ));
    }
}
