//! Definition Resolver
//!
//! Combines a validated [`Definition`], its [`Topology`] and the catalog into
//! a [`ResolvedView`]: every key, link and projected column is decided here,
//! so the renderers in [`crate::ddl`] are pure text producers that cannot
//! fail on schema questions.

mod columns;

use crate::catalog::{remove_skipped, Catalog, GeometryType};
use crate::config::{self, CompileOptions, UNKNOWN_TYPE_LABEL};
use crate::definition::{ColumnShaping, Definition, TableRef, TriggerHooks};
use crate::error::{MergeViewError, MergeViewResult};
use crate::graph::{Anchor, Topology};
use crate::utils::{quote_literal, quote_qualified};

pub use columns::{order_columns, order_view_columns, ColumnSource, ViewColumn};

/// Where a join's foreign key value can be read from a view row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// View column carrying the value
    pub column: String,
    /// The value is a key owned by a join rather than the master key
    pub join_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMaster {
    pub table: TableRef,
    pub short_alias: String,
    pub pkey: String,
    /// Name of the primary key column in the view
    pub pkey_column: String,
    pub pkey_default: String,
    /// Table columns minus skipped ones, pkey first then shaping order
    pub columns: Vec<String>,
    pub shaping: ColumnShaping,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedJoin {
    pub alias: String,
    pub table: TableRef,
    pub short_alias: String,
    pub anchor: Anchor,
    /// Column of this table holding the ancestor's key
    pub ref_master_key: String,
    /// Ancestor column matched by `ref_master_key`
    pub referenced_by_key: String,
    pub pkey: String,
    pub pkey_default: String,
    pub is_type: bool,
    /// Table columns minus skipped ones, catalog order
    pub columns: Vec<String>,
    /// Columns shown in the view, in shaping order
    pub projected: Vec<String>,
    pub link: Link,
    pub shaping: ColumnShaping,
    pub insert_values: Vec<(String, String)>,
    pub update_values: Vec<(String, String)>,
}

impl ResolvedJoin {
    /// Own primary key, when it is distinct from the link column
    pub fn own_pkey(&self) -> Option<&str> {
        (self.pkey != self.ref_master_key).then_some(self.pkey.as_str())
    }

    pub fn insert_value(&self, column: &str) -> Option<&str> {
        self.insert_values.iter().find(|(c, _)| c == column).map(|(_, v)| v.as_str())
    }

    pub fn update_value(&self, column: &str) -> Option<&str> {
        self.update_values.iter().find(|(c, _)| c == column).map(|(_, v)| v.as_str())
    }
}

/// A column common to several joins, exposed once
#[derive(Debug, Clone, PartialEq)]
pub struct MergeColumn {
    pub name: String,
    /// Joins defining the column, deepest first
    pub sources: Vec<usize>,
    pub cast: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedView {
    pub view: TableRef,
    pub type_name: String,
    pub alias: String,
    pub master: ResolvedMaster,
    pub joins: Vec<ResolvedJoin>,
    pub topology: Topology,
    pub merge_columns: Vec<MergeColumn>,
    /// Projected columns across master, merge columns and joins, in view order
    pub columns: Vec<ViewColumn>,
    pub allow_type_change: bool,
    pub allow_parent_only: bool,
    pub pkey_default_value: bool,
    pub additional_columns: Vec<(String, String)>,
    pub additional_joins: Option<String>,
    pub insert_trigger: TriggerHooks,
    pub update_trigger: TriggerHooks,
    pub delete_trigger: TriggerHooks,
    /// Schema mismatches recovered from, reported to the caller
    pub fallbacks: Vec<String>,
}

impl ResolvedView {
    pub fn qualified_type(&self) -> String {
        quote_qualified(&self.view.schema, &self.type_name)
    }

    /// `'<label>'::schema.type`
    pub fn type_literal(&self, label: &str) -> String {
        format!("{}::{}", quote_literal(label), self.qualified_type())
    }

    /// Discriminator of rows matching no subtype
    pub fn sentinel(&self) -> &str {
        if self.allow_parent_only {
            &self.alias
        } else {
            UNKNOWN_TYPE_LABEL
        }
    }

    /// Enum labels: the sentinel, then every type alias in declaration order
    pub fn type_labels(&self) -> Vec<&str> {
        let mut labels = vec![self.sentinel()];
        labels.extend(self.topology.types().into_iter().map(|j| self.joins[j].alias.as_str()));
        labels
    }

    pub fn trigger_function(&self, op: &str) -> String {
        config::trigger_function_name(&self.view.name, op)
    }

    pub fn trigger_name(&self, op: &str) -> String {
        config::trigger_name(&self.view.name, op)
    }

    pub fn is_merge_column(&self, column: &str) -> bool {
        self.merge_columns.iter().any(|m| m.name == column)
    }
}

/// Resolve everything the synthesizers need.
///
/// Recoverable schema mismatches (missing primary or foreign key) are
/// handled here through explicit overrides and `fkey_is_pkey`; anything
/// left unresolved aborts the compilation.
pub fn resolve<C: Catalog + ?Sized>(
    definition: &Definition,
    catalog: &C,
    options: &CompileOptions,
) -> MergeViewResult<ResolvedView> {
    let topology = Topology::build(definition)?;
    let schema = options.default_schema.as_str();
    let alias = definition.alias();

    let master = resolve_master(definition, catalog, schema, &alias)?;
    let merge_names: Vec<String> = definition
        .merge_columns
        .iter()
        .chain(definition.merge_geometry_columns.iter())
        .cloned()
        .collect();

    let mut joins: Vec<ResolvedJoin> = Vec::with_capacity(definition.joins.len());
    let mut fallbacks = Vec::new();
    for (index, (join_alias, join)) in definition.joins.iter().enumerate() {
        let table = TableRef::parse(&join.table, schema);
        let columns = table_columns(catalog, &table, join.only_columns.as_ref(), &join.shaping)?;
        let anchor = topology.anchor(index);

        let (ancestor_table, ancestor_columns, ancestor_pkey) = match anchor {
            Anchor::Master => (&master.table, &master.columns, &master.pkey),
            Anchor::Join(p) => {
                let ancestor = joins
                    .get(p)
                    .ok_or_else(|| crate::internal_error!("join {} anchored on unresolved join {}", join_alias, p))?;
                (&ancestor.table, &ancestor.columns, &ancestor.pkey)
            }
        };

        // foreign key towards the ancestor, looked up once
        let forward = match catalog.reference_columns(&table, ancestor_table) {
            Ok(pair) => Some(pair),
            Err(MergeViewError::NoReferenceFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let no_reference = || MergeViewError::NoReferenceFound {
            child: table.to_string(),
            parent: ancestor_table.to_string(),
        };

        let ref_master_key = match (&join.fkey, &forward) {
            (Some(fkey), _) => fkey.clone(),
            (None, Some((child_column, _))) => child_column.clone(),
            (None, None) if definition.fkey_is_pkey => match catalog.primary_key(&table) {
                Ok(pkey) => {
                    fallbacks.push(format!(
                        "no foreign key from {table} to {ancestor_table}, joining on primary key \"{pkey}\""
                    ));
                    pkey
                }
                Err(MergeViewError::NoPrimaryKey { .. }) => return Err(no_reference()),
                Err(e) => return Err(e),
            },
            (None, None) => return Err(no_reference()),
        };

        let referenced_by_key = match (&join.referenced_by_key, &forward, anchor) {
            (Some(key), _, _) => key.clone(),
            (None, Some((_, parent_column)), _) => parent_column.clone(),
            (None, None, Anchor::Master) => master.pkey.clone(),
            (None, None, Anchor::Join(_)) => {
                match catalog.reference_columns(ancestor_table, &table) {
                    Ok((ancestor_column, _)) => ancestor_column,
                    Err(MergeViewError::NoReferenceFound { .. }) if definition.fkey_is_pkey => {
                        fallbacks.push(format!(
                            "no foreign key between {ancestor_table} and {table}, \
                             {join_alias} references primary key \"{ancestor_pkey}\""
                        ));
                        ancestor_pkey.clone()
                    }
                    Err(MergeViewError::NoReferenceFound { .. }) => return Err(no_reference()),
                    Err(e) => return Err(e),
                }
            }
        };

        require_column(&table, &columns, &ref_master_key, "fkey")?;
        require_column(ancestor_table, ancestor_columns, &referenced_by_key, "referenced_by_key")?;
        for (directive, column) in join.shaping.referenced_columns() {
            require_column(&table, &columns, column, directive)?;
        }
        for column in join.insert_values.keys() {
            require_column(&table, &columns, column, "insert_values")?;
        }
        for column in join.update_values.keys() {
            require_column(&table, &columns, column, "update_values")?;
        }

        let pkey = match catalog.primary_key(&table) {
            Ok(pkey) => pkey,
            // keyless extension table, identified by its link column
            Err(MergeViewError::NoPrimaryKey { .. }) => {
                fallbacks.push(format!("{table} has no primary key, rows are identified by \"{ref_master_key}\""));
                ref_master_key.clone()
            }
            Err(e) => return Err(e),
        };
        let pkey_default = if pkey != ref_master_key {
            catalog.default_value(&table, &pkey)?
        } else {
            "NULL".to_string()
        };

        let visible: Vec<String> = columns
            .iter()
            .filter(|c| **c != ref_master_key && !merge_names.contains(c))
            .cloned()
            .collect();
        let projected = order_columns(&visible, &join.shaping, None);

        let short_alias = join.short_alias.clone().unwrap_or_else(|| join_alias.clone());

        let link = link_for(&master, &joins, anchor, &referenced_by_key, &merge_names, join_alias)?;

        joins.push(ResolvedJoin {
            alias: join_alias.clone(),
            table,
            short_alias,
            anchor,
            ref_master_key,
            referenced_by_key,
            pkey,
            pkey_default,
            is_type: topology.is_type(index),
            columns,
            projected,
            link,
            shaping: join.shaping.clone(),
            insert_values: join.insert_values.clone().into_iter().collect(),
            update_values: join.update_values.clone().into_iter().collect(),
        });
    }

    let merge_columns = resolve_merge_columns(definition, catalog, &joins, &topology)?;
    let columns = order_view_columns(&master, &merge_columns, &joins);

    Ok(ResolvedView {
        view: definition.view(schema),
        type_name: definition.type_name(),
        alias,
        master,
        joins,
        topology,
        merge_columns,
        columns,
        allow_type_change: definition.allow_type_change,
        allow_parent_only: definition.allow_parent_only,
        pkey_default_value: definition.pkey_default_value,
        additional_columns: definition.additional_columns.clone(),
        additional_joins: definition.additional_joins.clone(),
        insert_trigger: definition.insert_trigger.clone(),
        update_trigger: definition.update_trigger.clone(),
        delete_trigger: definition.delete_trigger.clone(),
        fallbacks,
    })
}

fn resolve_master<C: Catalog + ?Sized>(
    definition: &Definition,
    catalog: &C,
    schema: &str,
    alias: &str,
) -> MergeViewResult<ResolvedMaster> {
    let table = definition.master_table(schema);

    let pkey = match &definition.key {
        Some(key) => key.clone(),
        None => catalog.primary_key(&table).map_err(|e| match e {
            MergeViewError::NoPrimaryKey { .. } => MergeViewError::NoPrimaryKey { table: alias.to_string() },
            other => other,
        })?,
    };

    let shaping = definition.shaping.clone();
    if shaping.skip_columns.contains(&pkey) {
        return Err(MergeViewError::invalid(format!(
            "primary key \"{pkey}\" of {table} cannot be skipped"
        )));
    }

    let columns = table_columns(catalog, &table, definition.columns.as_ref(), &shaping)?;
    require_column(&table, &columns, &pkey, "key")?;
    for (directive, column) in shaping.referenced_columns() {
        require_column(&table, &columns, column, directive)?;
    }

    let pkey_default = catalog.default_value(&table, &pkey)?;
    let pkey_column = shaping.view_name(&pkey);
    let short_alias = definition.short_alias();

    Ok(ResolvedMaster {
        columns: order_columns(&columns, &shaping, Some(&pkey)),
        table,
        short_alias,
        pkey,
        pkey_column,
        pkey_default,
        shaping,
    })
}

/// Columns of a table minus skipped ones. An explicit list replaces the
/// catalog's and is taken as given.
fn table_columns<C: Catalog + ?Sized>(
    catalog: &C,
    table: &TableRef,
    explicit: Option<&Vec<String>>,
    shaping: &ColumnShaping,
) -> MergeViewResult<Vec<String>> {
    match explicit {
        Some(columns) => remove_skipped(table, columns.clone(), &shaping.skip_columns),
        None => {
            let kind = catalog.relation_kind(table)?;
            catalog.columns_without(table, kind, &shaping.skip_columns)
        }
    }
}

/// View column holding the value that `key` of `anchor` has for a row
fn link_for(
    master: &ResolvedMaster,
    joins: &[ResolvedJoin],
    anchor: Anchor,
    key: &str,
    merge_names: &[String],
    alias: &str,
) -> MergeViewResult<Link> {
    match anchor {
        Anchor::Master => Ok(Link {
            column: master.shaping.view_name(key),
            join_key: false,
        }),
        Anchor::Join(p) => {
            let ancestor = joins
                .get(p)
                .ok_or_else(|| crate::internal_error!("join {} anchored on unresolved join {}", alias, p))?;
            if key == ancestor.ref_master_key {
                Ok(ancestor.link.clone())
            } else if merge_names.iter().any(|m| m == key) {
                Ok(Link { column: key.to_string(), join_key: true })
            } else if ancestor.projected.iter().any(|c| c == key) {
                Ok(Link { column: ancestor.shaping.view_name(key), join_key: true })
            } else {
                Err(MergeViewError::invalid(format!(
                    "join {alias} is linked through \"{key}\" of {}, which the view does not expose",
                    ancestor.alias
                )))
            }
        }
    }
}

fn resolve_merge_columns<C: Catalog + ?Sized>(
    definition: &Definition,
    catalog: &C,
    joins: &[ResolvedJoin],
    topology: &Topology,
) -> MergeViewResult<Vec<MergeColumn>> {
    let sources_of = |column: &str| -> Vec<usize> {
        let mut sources: Vec<usize> = (0..joins.len())
            .filter(|&j| joins[j].columns.iter().any(|c| c == column))
            .collect();
        sources.sort_by(|a, b| topology.depth(*b).cmp(&topology.depth(*a)));
        sources
    };

    let mut merged = Vec::new();

    for column in &definition.merge_columns {
        let sources = sources_of(column);
        if sources.is_empty() {
            return Err(MergeViewError::MergeColumnNotFound { column: column.clone() });
        }
        merged.push(MergeColumn { name: column.clone(), sources, cast: None });
    }

    for column in &definition.merge_geometry_columns {
        let sources = sources_of(column);
        let mut expected: Option<GeometryType> = None;

        // declaration order decides which join sets the reference type
        let mut by_declaration = sources.clone();
        by_declaration.sort_unstable();
        for &j in &by_declaration {
            let Some(found) = catalog.geometry_type(&joins[j].table, column)? else {
                continue;
            };
            match &expected {
                None => expected = Some(found),
                Some(first) if *first != found => {
                    return Err(MergeViewError::GeometryMismatch {
                        column: column.clone(),
                        expected: first.to_string(),
                        found: found.to_string(),
                        table: joins[j].table.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        let geometry = expected.ok_or_else(|| MergeViewError::NoGeometryColumn { column: column.clone() })?;
        merged.push(MergeColumn {
            name: column.clone(),
            sources,
            cast: Some(geometry.cast()),
        });
    }

    Ok(merged)
}

fn require_column(table: &TableRef, columns: &[String], column: &str, directive: &str) -> MergeViewResult<()> {
    if columns.iter().any(|c| c == column) {
        Ok(())
    } else {
        Err(MergeViewError::InvalidColumn {
            table: table.to_string(),
            column: column.to_string(),
            directive: directive.to_string(),
        })
    }
}
