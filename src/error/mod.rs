use std::fmt;

use pgrx::pg_sys::panic::ErrorReport;
use pgrx::{PgLogLevel, PgSqlErrorCode};

pub mod testing;

/// Broad classes of failure, in the order a compilation can hit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed definition document, caught before any catalog access
    DefinitionInvalid,
    /// The catalog does not report what the definition needs
    SchemaMismatch,
    /// A join refers to an ancestor that is declared later
    GraphOrdering,
    /// A declared derived column cannot be synthesized
    Generation,
    /// The engine rejected a generated statement
    Apply,
    /// Bug in the extension
    Internal,
}

/// Main error type for pg_merge_view
#[derive(Debug, Clone, PartialEq)]
pub enum MergeViewError {
    // ============ Definition Errors (42P17) ============
    /// Unknown key, missing key or wrong value type in the definition
    InvalidDefinition {
        reason: String,
    },

    /// A shaping directive names a column the table does not have
    InvalidColumn {
        table: String,
        column: String,
        directive: String,
    },

    /// `skip_columns` names a column the table does not have
    InvalidSkipColumn {
        table: String,
        column: String,
    },

    /// A derived identifier does not fit in a PostgreSQL name
    InvalidIdentifier {
        identifier: String,
        reason: String,
    },

    // ============ Catalog Errors (42xxx) ============
    /// Table or view not found
    TableNotFound {
        table: String,
    },

    /// Catalog reports no primary key
    NoPrimaryKey {
        table: String,
    },

    /// No foreign key links the two tables
    NoReferenceFound {
        child: String,
        parent: String,
    },

    /// A spatial merge column is not a geometry column in any join
    NoGeometryColumn {
        column: String,
    },

    /// Joins disagree on the geometry type or SRID of a merge column
    GeometryMismatch {
        column: String,
        expected: String,
        found: String,
        table: String,
    },

    // ============ Join Graph Errors (42P19) ============
    /// `referenced_by` points at a join declared further down
    ReferencedTableDefinedBeforeReferencing {
        alias: String,
        referenced_by: String,
    },

    // ============ Generation Errors ============
    /// A merge column is defined by none of the joins
    MergeColumnNotFound {
        column: String,
    },

    // ============ Apply Errors ============
    /// Variables do not match the placeholders of a statement
    VariableError {
        given: Vec<String>,
        reason: String,
    },

    /// The engine rejected a generated statement
    ApplyFailed {
        statement: String,
        error: String,
    },

    // ============ I/O and System Errors (XX000) ============
    /// SPI operation failed
    SpiError {
        query: String,
        error: String,
    },

    /// Internal error (bug in extension)
    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl MergeViewError {
    /// Get PostgreSQL SQLSTATE code for this error
    pub fn sqlstate(&self) -> &'static str {
        use MergeViewError::*;
        match self {
            InvalidDefinition { .. } => "42P17", // Invalid object definition
            InvalidColumn { .. } => "42703", // Undefined column
            InvalidSkipColumn { .. } => "42703",
            InvalidIdentifier { .. } => "42602", // Invalid name

            TableNotFound { .. } => "42P01", // Undefined table
            NoPrimaryKey { .. } => "42P16", // Invalid table definition
            NoReferenceFound { .. } => "42830", // Invalid foreign key
            NoGeometryColumn { .. } => "42703",
            GeometryMismatch { .. } => "42804", // Datatype mismatch

            ReferencedTableDefinedBeforeReferencing { .. } => "42P19", // Invalid recursion

            MergeColumnNotFound { .. } => "42703",

            VariableError { .. } => "42P02", // Undefined parameter
            ApplyFailed { .. } => "XX000",

            SpiError { .. } => "XX000",
            InternalError { .. } => "XX000",
        }
    }

    fn error_code(&self) -> PgSqlErrorCode {
        use MergeViewError::*;
        match self {
            InvalidDefinition { .. } => PgSqlErrorCode::ERRCODE_INVALID_OBJECT_DEFINITION,
            InvalidColumn { .. }
            | InvalidSkipColumn { .. }
            | NoGeometryColumn { .. }
            | MergeColumnNotFound { .. } => PgSqlErrorCode::ERRCODE_UNDEFINED_COLUMN,
            InvalidIdentifier { .. } => PgSqlErrorCode::ERRCODE_INVALID_NAME,
            TableNotFound { .. } => PgSqlErrorCode::ERRCODE_UNDEFINED_TABLE,
            NoPrimaryKey { .. } => PgSqlErrorCode::ERRCODE_INVALID_TABLE_DEFINITION,
            NoReferenceFound { .. } => PgSqlErrorCode::ERRCODE_INVALID_FOREIGN_KEY,
            GeometryMismatch { .. } => PgSqlErrorCode::ERRCODE_DATATYPE_MISMATCH,
            ReferencedTableDefinedBeforeReferencing { .. } => PgSqlErrorCode::ERRCODE_INVALID_RECURSION,
            VariableError { .. } => PgSqlErrorCode::ERRCODE_UNDEFINED_PARAMETER,
            ApplyFailed { .. } | SpiError { .. } | InternalError { .. } => {
                PgSqlErrorCode::ERRCODE_INTERNAL_ERROR
            }
        }
    }

    /// Which stage of the compilation this error belongs to
    pub fn kind(&self) -> ErrorKind {
        use MergeViewError::*;
        match self {
            InvalidDefinition { .. }
            | InvalidColumn { .. }
            | InvalidSkipColumn { .. }
            | InvalidIdentifier { .. } => ErrorKind::DefinitionInvalid,

            TableNotFound { .. }
            | NoPrimaryKey { .. }
            | NoReferenceFound { .. }
            | NoGeometryColumn { .. }
            | GeometryMismatch { .. } => ErrorKind::SchemaMismatch,

            ReferencedTableDefinedBeforeReferencing { .. } => ErrorKind::GraphOrdering,

            MergeColumnNotFound { .. } => ErrorKind::Generation,

            VariableError { .. } | ApplyFailed { .. } => ErrorKind::Apply,

            SpiError { .. } | InternalError { .. } => ErrorKind::Internal,
        }
    }

    /// Shorthand for the most common definition error
    pub fn invalid(reason: impl Into<String>) -> Self {
        MergeViewError::InvalidDefinition { reason: reason.into() }
    }

    /// Create internal error with file/line info
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        MergeViewError::InternalError { message, file, line }
    }

    /// Raise this error to PostgreSQL with its SQLSTATE. Aborts the calling
    /// transaction, so nothing generated so far is kept.
    pub fn report(self) -> ! {
        ErrorReport::new(self.error_code(), self.to_string(), "pg_merge_view")
            .report(PgLogLevel::ERROR);
        unreachable!("ERROR level reports do not return")
    }
}

/// At most `max` bytes of `text`, cut on a char boundary
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl fmt::Display for MergeViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use MergeViewError::*;
        match self {
            InvalidDefinition { reason } => {
                write!(f, "Invalid definition: {}", reason)
            }
            InvalidColumn { table, column, directive } => {
                write!(f, "{} names column \"{}\" which does not exist in \"{}\"", directive, column, table)
            }
            InvalidSkipColumn { table, column } => {
                write!(f, "Cannot skip unexisting column \"{}\" in \"{}\"", column, table)
            }
            InvalidIdentifier { identifier, reason } => {
                write!(f, "Invalid identifier '{}': {}", identifier, reason)
            }
            TableNotFound { table } => {
                write!(f, "Relation \"{}\" does not exist", table)
            }
            NoPrimaryKey { table } => {
                write!(f, "{} has no primary key, specify it with \"key\"", table)
            }
            NoReferenceFound { child, parent } => {
                write!(f, "{} has no reference to {}", child, parent)
            }
            NoGeometryColumn { column } => {
                write!(f, "There is no geometry column \"{}\" in joined tables", column)
            }
            GeometryMismatch { column, expected, found, table } => {
                write!(f, "Merge column \"{}\" is {} in {} but {} in an earlier join",
                       column, found, table, expected)
            }
            ReferencedTableDefinedBeforeReferencing { alias, referenced_by } => {
                write!(f, "\"{}\" should be defined after \"{}\"", alias, referenced_by)
            }
            MergeColumnNotFound { column } => {
                write!(f, "Merge column \"{}\" is not defined by any joined table", column)
            }
            VariableError { given, reason } => {
                write!(f, "An error in a SQL variable is probable ({}). \
                           Check the variables in the SQL code (were given: [{}]). \
                           Also, any % character shall be escaped with %%",
                       reason, given.join(", "))
            }
            ApplyFailed { statement, error } => {
                write!(f, "Statement failed: {}\nStatement: {}", error,
                       truncate(statement, 200))
            }
            SpiError { query, error } => {
                write!(f, "SPI query failed: {}\nQuery: {}", error,
                       truncate(query, 100))
            }
            InternalError { message, file, line } => {
                write!(f, "Internal error at {}:{}: {}\nPlease report this bug.",
                       file, line, message)
            }
        }
    }
}

impl std::error::Error for MergeViewError {}

/// Result type for merge view operations
pub type MergeViewResult<T> = Result<T, MergeViewError>;

/// Convert SpiError to MergeViewError
impl From<pgrx::spi::Error> for MergeViewError {
    fn from(e: pgrx::spi::Error) -> Self {
        MergeViewError::SpiError {
            query: "Unknown".to_string(),
            error: e.to_string(),
        }
    }
}

/// Convert regex::Error to MergeViewError
impl From<regex::Error> for MergeViewError {
    fn from(e: regex::Error) -> Self {
        MergeViewError::internal(format!("Regex compilation failed: {}", e), file!(), line!())
    }
}

/// Helper macro for creating internal errors with automatic file/line
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::MergeViewError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MergeViewError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("SELECT 'é'", 9), "SELECT '");
    }

    #[test]
    fn test_no_primary_key_message() {
        let err = MergeViewError::NoPrimaryKey {
            table: "zoo.animal".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("zoo.animal"));
        assert!(msg.contains("no primary key"));
        assert_eq!(err.sqlstate(), "42P16");
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_forward_reference_message() {
        let err = MergeViewError::ReferencedTableDefinedBeforeReferencing {
            alias: "sheepdog".to_string(),
            referenced_by: "dog".to_string(),
        };

        assert_eq!(err.to_string(), "\"sheepdog\" should be defined after \"dog\"");
        assert_eq!(err.kind(), ErrorKind::GraphOrdering);
    }

    #[test]
    fn test_variable_error_lists_given_variables() {
        let err = MergeViewError::VariableError {
            given: vec!["srid".to_string(), "owner".to_string()],
            reason: "missing variable \"schema\"".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("[srid, owner]"));
        assert!(msg.contains("escaped with %%"));
        assert_eq!(err.kind(), ErrorKind::Apply);
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("Test error at {}", "location");

        match err {
            MergeViewError::InternalError { message, file, line } => {
                assert!(message.contains("Test error"));
                assert!(file.ends_with("mod.rs"));
                assert!(line > 0);
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_kinds_cover_taxonomy() {
        let errors = vec![
            MergeViewError::invalid("key foo is not valid"),
            MergeViewError::TableNotFound { table: "t".to_string() },
            MergeViewError::ReferencedTableDefinedBeforeReferencing {
                alias: "a".to_string(),
                referenced_by: "b".to_string(),
            },
            MergeViewError::MergeColumnNotFound { column: "c".to_string() },
            MergeViewError::ApplyFailed { statement: "s".to_string(), error: "e".to_string() },
            internal_error!("boom"),
        ];

        let kinds: Vec<ErrorKind> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![
            ErrorKind::DefinitionInvalid,
            ErrorKind::SchemaMismatch,
            ErrorKind::GraphOrdering,
            ErrorKind::Generation,
            ErrorKind::Apply,
            ErrorKind::Internal,
        ]);
    }
}
