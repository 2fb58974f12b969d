use pgrx::prelude::*;
use pgrx::{pg_sys, IntoDatum};

use super::{Catalog, GeometryType, RelationKind};
use crate::definition::TableRef;
use crate::error::{MergeViewError, MergeViewResult};

/// Resolve a relation without raising when it is missing
const REGCLASS: &str = "to_regclass(format('%I.%I', $1, $2))";

/// Catalog backed by the live backend through SPI
#[derive(Debug, Default, Clone, Copy)]
pub struct SpiCatalog;

type SpiArgs = Option<Vec<(PgOid, Option<pg_sys::Datum>)>>;

fn text_args(values: &[&str]) -> SpiArgs {
    Some(
        values
            .iter()
            .map(|v| (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), (*v).into_datum()))
            .collect(),
    )
}

fn spi_error(query: &str) -> impl Fn(pgrx::spi::Error) -> MergeViewError + '_ {
    move |e| MergeViewError::SpiError {
        query: query.to_string(),
        error: e.to_string(),
    }
}

/// First column of every row, NULLs dropped
fn select_strings(query: &str, args: SpiArgs) -> MergeViewResult<Vec<String>> {
    Spi::connect(|client| -> MergeViewResult<Vec<String>> {
        let rows = client.select(query, None, args).map_err(spi_error(query))?;
        let mut values = Vec::new();
        for row in rows {
            if let Some(value) = row.get::<String>(1).map_err(spi_error(query))? {
                values.push(value);
            }
        }
        Ok(values)
    })
}

impl Catalog for SpiCatalog {
    fn relation_kind(&self, table: &TableRef) -> MergeViewResult<RelationKind> {
        let query = format!("SELECT c.relkind::text FROM pg_catalog.pg_class c WHERE c.oid = {REGCLASS}");
        let kinds = select_strings(&query, text_args(&[&table.schema, &table.name]))?;

        // materialized views are missing from information_schema.columns
        match kinds.first().map(String::as_str) {
            Some("v") => Ok(RelationKind::View),
            Some(_) => Ok(RelationKind::Table),
            None => Err(MergeViewError::TableNotFound { table: table.to_string() }),
        }
    }

    fn primary_key(&self, table: &TableRef) -> MergeViewResult<String> {
        let query = format!(
            "SELECT a.attname::text \
             FROM pg_catalog.pg_index i \
             JOIN pg_catalog.pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = {REGCLASS} AND i.indisprimary \
             ORDER BY array_position(i.indkey::int2[], a.attnum) \
             LIMIT 1"
        );
        let keys = select_strings(&query, text_args(&[&table.schema, &table.name]))?;

        match keys.into_iter().next() {
            Some(pkey) => Ok(pkey),
            None => {
                debug1!("pg_merge_view: {} has no primary key", table);
                Err(MergeViewError::NoPrimaryKey { table: table.to_string() })
            }
        }
    }

    fn columns(&self, table: &TableRef, kind: RelationKind) -> MergeViewResult<Vec<String>> {
        let query = match kind {
            RelationKind::Table => format!(
                "SELECT a.attname::text FROM pg_catalog.pg_attribute a \
                 WHERE a.attrelid = {REGCLASS} AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum"
            ),
            // ordinal positions of views only make sense through information_schema
            RelationKind::View => "SELECT c.column_name::text FROM information_schema.columns c \
                 WHERE c.table_schema = $1 AND c.table_name = $2 \
                 ORDER BY c.ordinal_position"
                .to_string(),
        };

        let columns = select_strings(&query, text_args(&[&table.schema, &table.name]))?;
        if columns.is_empty() {
            return Err(MergeViewError::TableNotFound { table: table.to_string() });
        }
        debug1!("pg_merge_view: {} has columns {:?}", table, columns);
        Ok(columns)
    }

    fn reference_columns(&self, child: &TableRef, parent: &TableRef) -> MergeViewResult<(String, String)> {
        let query = "SELECT ca.attname::text, pa.attname::text \
             FROM pg_catalog.pg_constraint k \
             JOIN pg_catalog.pg_attribute ca ON ca.attrelid = k.conrelid AND ca.attnum = k.conkey[1] \
             JOIN pg_catalog.pg_attribute pa ON pa.attrelid = k.confrelid AND pa.attnum = k.confkey[1] \
             WHERE k.contype = 'f' \
               AND k.conrelid = to_regclass(format('%I.%I', $1, $2)) \
               AND k.confrelid = to_regclass(format('%I.%I', $3, $4)) \
             ORDER BY k.conname \
             LIMIT 1";
        let args = text_args(&[&child.schema, &child.name, &parent.schema, &parent.name]);

        let pair = Spi::connect(|client| -> MergeViewResult<Option<(String, String)>> {
            let rows = client.select(query, None, args).map_err(spi_error(query))?;
            for row in rows {
                let child_column = row.get::<String>(1).map_err(spi_error(query))?;
                let parent_column = row.get::<String>(2).map_err(spi_error(query))?;
                if let (Some(c), Some(p)) = (child_column, parent_column) {
                    return Ok(Some((c, p)));
                }
            }
            Ok(None)
        })?;

        pair.ok_or_else(|| MergeViewError::NoReferenceFound {
            child: child.to_string(),
            parent: parent.to_string(),
        })
    }

    fn default_value(&self, table: &TableRef, column: &str) -> MergeViewResult<String> {
        let query = format!(
            "SELECT pg_catalog.pg_get_expr(d.adbin, d.adrelid) \
             FROM pg_catalog.pg_attribute a \
             LEFT JOIN pg_catalog.pg_attrdef d ON (d.adrelid, d.adnum) = (a.attrelid, a.attnum) \
             WHERE a.attrelid = {REGCLASS} AND a.attname = $3::name AND NOT a.attisdropped"
        );
        let defaults = select_strings(&query, text_args(&[&table.schema, &table.name, column]))?;
        Ok(defaults.into_iter().next().unwrap_or_else(|| "NULL".to_string()))
    }

    fn geometry_type(&self, table: &TableRef, column: &str) -> MergeViewResult<Option<GeometryType>> {
        // geometry_columns only exists with PostGIS
        let has_postgis = Spi::get_one::<bool>("SELECT to_regclass('geometry_columns') IS NOT NULL")?
            .unwrap_or(false);
        if !has_postgis {
            return Ok(None);
        }

        let query = "SELECT g.type::text, g.srid \
             FROM geometry_columns g \
             WHERE g.f_table_schema = $1 AND g.f_table_name = $2 AND g.f_geometry_column = $3";
        let args = text_args(&[&table.schema, &table.name, column]);

        Spi::connect(|client| -> MergeViewResult<Option<GeometryType>> {
            let rows = client.select(query, None, args).map_err(spi_error(query))?;
            for row in rows {
                let geometry_type = row.get::<String>(1).map_err(spi_error(query))?;
                let srid = row.get::<i32>(2).map_err(spi_error(query))?;
                if let (Some(t), Some(s)) = (geometry_type, srid) {
                    return Ok(Some(GeometryType::new(t, s)));
                }
            }
            Ok(None)
        })
    }
}
