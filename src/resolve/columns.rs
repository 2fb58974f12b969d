use crate::definition::ColumnShaping;

use super::{MergeColumn, ResolvedJoin, ResolvedMaster};

/// Table a view column is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSource {
    Master,
    /// Index into the merge columns
    Merge(usize),
    /// Index into the joins
    Join(usize),
}

/// One projected column of the view, before the additional columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewColumn {
    pub source: ColumnSource,
    /// Table column, or the merge column name
    pub column: String,
}

/// 0 for `columns_on_top`, 2 for `columns_at_end`, 1 otherwise
fn bucket(shaping: &ColumnShaping, column: &str) -> u8 {
    if shaping.columns_on_top.iter().any(|c| c == column) {
        0
    } else if shaping.columns_at_end.iter().any(|c| c == column) {
        2
    } else {
        1
    }
}

/// Order the projected columns of one table.
///
/// The primary key (when given) comes first, then `columns_on_top` in the
/// order they are listed, then the other columns in catalog order, then
/// `columns_at_end` in the order they are listed. The result only depends
/// on its inputs, so recompiling against an unchanged schema yields the
/// same view.
pub fn order_columns(columns: &[String], shaping: &ColumnShaping, pkey: Option<&str>) -> Vec<String> {
    let rank = |position: usize, column: &str| -> (u8, u8, usize) {
        if pkey == Some(column) {
            return (0, 0, 0);
        }
        if let Some(i) = shaping.columns_on_top.iter().position(|c| c == column) {
            (1, 0, i)
        } else if let Some(i) = shaping.columns_at_end.iter().position(|c| c == column) {
            (1, 2, i)
        } else {
            (1, 1, position)
        }
    };

    let mut ranked: Vec<((u8, u8, usize), &String)> = columns
        .iter()
        .enumerate()
        .map(|(position, column)| (rank(position, column), column))
        .collect();
    ranked.sort_by_key(|(key, _)| *key);
    ranked.into_iter().map(|(_, column)| column.clone()).collect()
}

/// Order every projected column of the view.
///
/// Buckets apply across tables: a join column listed in `columns_on_top`
/// comes before the normal master columns. The master primary key stays
/// first. Within a bucket the master comes first, then the merge columns,
/// then the joins in declaration order, each in its own column order. A
/// merge column takes the highest bucket any of its source joins gives it.
pub fn order_view_columns(
    master: &ResolvedMaster,
    merge_columns: &[MergeColumn],
    joins: &[ResolvedJoin],
) -> Vec<ViewColumn> {
    let mut ranked: Vec<((u8, u8, usize, usize), ViewColumn)> = Vec::new();

    for (i, column) in master.columns.iter().enumerate() {
        let rank = if *column == master.pkey {
            (0, 0, 0, 0)
        } else {
            (1, bucket(&master.shaping, column), 0, i)
        };
        ranked.push((rank, ViewColumn { source: ColumnSource::Master, column: column.clone() }));
    }

    for (m, merge) in merge_columns.iter().enumerate() {
        let rank = merge
            .sources
            .iter()
            .filter_map(|&j| joins.get(j))
            .map(|join| bucket(&join.shaping, &merge.name))
            .filter(|b| *b != 1)
            .min()
            .unwrap_or(1);
        ranked.push(((1, rank, 1, m), ViewColumn { source: ColumnSource::Merge(m), column: merge.name.clone() }));
    }

    for (j, join) in joins.iter().enumerate() {
        for (i, column) in join.projected.iter().enumerate() {
            ranked.push((
                (1, bucket(&join.shaping, column), 2 + j, i),
                ViewColumn { source: ColumnSource::Join(j), column: column.clone() },
            ));
        }
    }

    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().map(|(_, column)| column).collect()
}
