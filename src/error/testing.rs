//! Assertions over failed compilations, shared by unit tests and pg_tests.
//!
//! Each helper returns the error so a test can check more than one aspect
//! of it.
#![cfg(any(test, feature = "pg_test"))]

use super::{ErrorKind, MergeViewError};
use crate::MergeViewResult;

/// # Panics
/// Panics if the compilation succeeded.
fn expect_failure<T>(result: MergeViewResult<T>, expected: &str) -> MergeViewError {
    match result {
        Err(e) => e,
        Ok(_) => panic!("Expected {expected}, but the compilation succeeded"),
    }
}

/// Fails unless the compilation stopped at the `expected_kind` stage
pub fn assert_error_kind<T>(result: MergeViewResult<T>, expected_kind: ErrorKind) -> MergeViewError {
    let e = expect_failure(result, &format!("a {expected_kind:?} error"));
    assert_eq!(e.kind(), expected_kind, "Error raised at the wrong stage: {e}");
    e
}

/// A definition rejected before any catalog access, with `reason` in its message
pub fn assert_definition_error<T>(result: MergeViewResult<T>, reason: &str) -> MergeViewError {
    let e = assert_error_kind(result, ErrorKind::DefinitionInvalid);
    assert!(
        e.to_string().contains(reason),
        "Definition error '{e}' does not mention '{reason}'"
    );
    e
}

/// SQLSTATE a SQL caller would see
pub fn assert_error_sqlstate<T>(result: MergeViewResult<T>, expected_sqlstate: &str) -> MergeViewError {
    let e = expect_failure(result, &format!("SQLSTATE {expected_sqlstate}"));
    assert_eq!(
        e.sqlstate(),
        expected_sqlstate,
        "Expected SQLSTATE {expected_sqlstate}, got {}: {e}",
        e.sqlstate()
    );
    e
}

pub fn assert_error_contains<T>(result: MergeViewResult<T>, expected_substring: &str) -> MergeViewError {
    let e = expect_failure(result, &format!("an error containing '{expected_substring}'"));
    let message = e.to_string();
    assert!(
        message.contains(expected_substring),
        "Error message '{message}' does not contain '{expected_substring}'"
    );
    e
}
