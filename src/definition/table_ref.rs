use std::fmt;

use crate::utils::quote_qualified;

/// A table or view as written in a definition, resolved to `(schema, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    /// Split at the first `.`; bare names land in `default_schema`
    pub fn parse(identifier: &str, default_schema: &str) -> Self {
        match identifier.split_once('.') {
            Some((schema, name)) => Self {
                schema: schema.to_string(),
                name: name.to_string(),
            },
            None => Self {
                schema: default_schema.to_string(),
                name: identifier.to_string(),
            },
        }
    }

    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self { schema: schema.into(), name: name.into() }
    }

    /// Quoted `schema.name`, ready for SQL text
    pub fn qualified(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}
