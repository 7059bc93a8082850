use crate::guidance::{FailureKind, TrialOutcome};
use crate::target::TrialError;
use std::any::Any;

/// Panics whose message starts with this are treated as assertion failures, which
/// covers `assert!`, `assert_eq!` and `assert_ne!`.
const ASSERTION_PANIC_PREFIX: &str = "assertion";

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// Maps what a harness produced into a [`TrialOutcome`].
pub fn classify(result: std::thread::Result<Result<(), TrialError>>) -> TrialOutcome {
    match result {
        Ok(Ok(())) => TrialOutcome::Success,
        Ok(Err(TrialError::Assertion(msg))) => {
            TrialOutcome::failure(FailureKind::AssertionFailure, msg)
        }
        Ok(Err(TrialError::Uncaught(msg))) => {
            TrialOutcome::failure(FailureKind::UncaughtError, msg)
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            let kind = if msg.starts_with(ASSERTION_PANIC_PREFIX) {
                FailureKind::AssertionFailure
            } else {
                FailureKind::UncaughtError
            };
            TrialOutcome::failure(kind, msg)
        }
    }
}
