//! SQL text helpers shared by the synthesizers.
//!
//! These are pure string functions: the renderers must not touch SPI, so
//! identifiers are quoted here following the rules of PostgreSQL's
//! `quote_ident()` instead of round-tripping through the backend.

use crate::config::MAX_IDENTIFIER_LENGTH;
use crate::error::{MergeViewError, MergeViewResult};

/// Reserved key words that always need quoting as identifiers
const RESERVED_KEYWORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
    "authorization", "binary", "both", "case", "cast", "check", "collate", "collation",
    "column", "concurrently", "constraint", "create", "cross", "current_catalog",
    "current_date", "current_role", "current_schema", "current_time", "current_timestamp",
    "current_user", "default", "deferrable", "desc", "distinct", "do", "else", "end",
    "except", "false", "fetch", "for", "foreign", "freeze", "from", "full", "grant",
    "group", "having", "ilike", "in", "initially", "inner", "intersect", "into", "is",
    "isnull", "join", "lateral", "leading", "left", "like", "limit", "localtime",
    "localtimestamp", "natural", "not", "notnull", "null", "offset", "on", "only", "or",
    "order", "outer", "overlaps", "placing", "primary", "references", "returning",
    "right", "select", "session_user", "similar", "some", "symmetric", "system_user",
    "table", "tablesample", "then", "to", "trailing", "true", "union", "unique", "user",
    "using", "variadic", "verbose", "when", "where", "window", "with",
];

/// Quote an identifier only when PostgreSQL would require it
pub fn quote_ident(name: &str) -> String {
    let mut chars = name.chars();
    let plain = match chars.next() {
        Some(first) => {
            (first.is_ascii_lowercase() || first == '_')
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        None => false,
    };

    if plain && !RESERVED_KEYWORDS.contains(&name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// `schema.name`, each part quoted as needed
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Standard-conforming string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Reject names PostgreSQL would silently truncate or cannot store
pub fn check_identifier(identifier: &str, what: &str) -> MergeViewResult<()> {
    if identifier.is_empty() {
        return Err(MergeViewError::InvalidIdentifier {
            identifier: identifier.to_string(),
            reason: format!("{} cannot be empty", what),
        });
    }

    if identifier.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MergeViewError::InvalidIdentifier {
            identifier: identifier.to_string(),
            reason: format!("{} is {} bytes long (max {})", what, identifier.len(), MAX_IDENTIFIER_LENGTH),
        });
    }

    if identifier.contains('\0') {
        return Err(MergeViewError::InvalidIdentifier {
            identifier: identifier.replace('\0', "\\0"),
            reason: format!("{} contains a NUL byte", what),
        });
    }

    Ok(())
}

/// Join lines, prefixing every line after the first with `indent` spaces
pub fn indent_lines(lines: &[String], indent: usize, separator: &str) -> String {
    let pad = " ".repeat(indent);
    lines.join(&format!("{separator}\n{pad}"))
}
