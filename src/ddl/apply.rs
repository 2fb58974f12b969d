//! Apply Driver: run the generated statements in the caller's transaction
//!
//! Statements run one by one through SPI. Any failure aborts the whole
//! batch and PostgreSQL rolls back every statement already applied. The
//! failing statement is logged as a warning first. Nothing is retried.

use pgrx::pg_sys::panic::CaughtError;
use pgrx::prelude::*;

use super::variables::Variables;
use crate::error::{MergeViewError, MergeViewResult};

/// Execute `statements` in order, returning how many ran
pub fn apply(statements: &[String], variables: &Variables) -> MergeViewResult<usize> {
    for (index, statement) in statements.iter().enumerate() {
        let sql = variables.substitute(statement).inspect_err(|_| {
            warning!("pg_merge_view: failing statement:\n{}", statement);
        })?;

        debug1!("pg_merge_view: applying statement {}/{}", index + 1, statements.len());
        execute(&sql)?;
    }

    Ok(statements.len())
}

/// Engine errors are re-raised untouched so the caller sees the engine's
/// SQLSTATE. Only failures on the Rust side become `ApplyFailed`.
fn execute(sql: &str) -> MergeViewResult<()> {
    PgTryBuilder::new(|| {
        Spi::run(sql).map_err(|e| MergeViewError::ApplyFailed {
            statement: sql.to_string(),
            error: e.to_string(),
        })
    })
    .catch_others(|caught| {
        warning!("pg_merge_view: failing statement:\n{}", sql);
        if let CaughtError::RustPanic { ereport, .. } = &caught {
            return Err(MergeViewError::ApplyFailed {
                statement: sql.to_string(),
                error: ereport.message().to_string(),
            });
        }
        caught.rethrow()
    })
    .execute()
}
