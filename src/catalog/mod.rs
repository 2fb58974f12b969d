//! Catalog Adapter: read-only relational metadata
//!
//! The resolver only sees the [`Catalog`] trait. Inside the backend it is
//! served by [`SpiCatalog`], in unit tests by the in-memory `StaticCatalog`.
//! Nothing is cached: every call re-reads the catalog, so each compilation
//! sees the schema as it is at that moment.

use std::fmt;

use crate::definition::TableRef;
use crate::error::{MergeViewError, MergeViewResult};

mod spi;

#[cfg(any(test, feature = "pg_test"))]
pub mod memory;

pub use self::spi::SpiCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Table,
    View,
}

/// Subtype and SRID of a PostGIS geometry column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryType {
    pub geometry_type: String,
    pub srid: i32,
}

impl GeometryType {
    pub fn new(geometry_type: impl Into<String>, srid: i32) -> Self {
        Self { geometry_type: geometry_type.into(), srid }
    }

    /// Cast suffix typing a `NULL` like this column
    pub fn cast(&self) -> String {
        format!("::geometry({},{})", self.geometry_type, self.srid)
    }
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "geometry({},{})", self.geometry_type, self.srid)
    }
}

pub trait Catalog {
    /// Fails with `TableNotFound` when the relation does not exist
    fn relation_kind(&self, table: &TableRef) -> MergeViewResult<RelationKind>;

    /// Fails with `NoPrimaryKey`, which callers may recover from
    fn primary_key(&self, table: &TableRef) -> MergeViewResult<String>;

    /// Columns in catalog ordinal order
    fn columns(&self, table: &TableRef, kind: RelationKind) -> MergeViewResult<Vec<String>>;

    /// `(child column, parent column)` of the foreign key from `child` to
    /// `parent`, or `NoReferenceFound`
    fn reference_columns(&self, child: &TableRef, parent: &TableRef) -> MergeViewResult<(String, String)>;

    /// Default expression of a column, `"NULL"` when it has none
    fn default_value(&self, table: &TableRef, column: &str) -> MergeViewResult<String>;

    fn geometry_type(&self, table: &TableRef, column: &str) -> MergeViewResult<Option<GeometryType>>;

    /// Catalog columns minus `skip`
    fn columns_without(&self, table: &TableRef, kind: RelationKind, skip: &[String]) -> MergeViewResult<Vec<String>> {
        remove_skipped(table, self.columns(table, kind)?, skip)
    }
}

/// Drop `skip` from `columns`; every skipped column must exist, otherwise
/// `InvalidSkipColumn`
pub fn remove_skipped(table: &TableRef, mut columns: Vec<String>, skip: &[String]) -> MergeViewResult<Vec<String>> {
    for column in skip {
        let position = columns.iter().position(|c| c == column).ok_or_else(|| {
            MergeViewError::InvalidSkipColumn {
                table: table.to_string(),
                column: column.clone(),
            }
        })?;
        columns.remove(position);
    }
    Ok(columns)
}
