//! In-memory catalog for unit tests of the resolver and the renderers

use std::collections::{BTreeMap, HashMap};

use super::{Catalog, GeometryType, RelationKind};
use crate::definition::TableRef;
use crate::error::{MergeViewError, MergeViewResult};

#[derive(Debug, Clone)]
struct Relation {
    kind: RelationKind,
    columns: Vec<String>,
    pkey: Option<String>,
    defaults: BTreeMap<String, String>,
    geometries: BTreeMap<String, GeometryType>,
}

#[derive(Debug, Clone)]
struct ForeignKey {
    child: TableRef,
    child_column: String,
    parent: TableRef,
    parent_column: String,
}

/// Builder-style fixed schema
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    relations: HashMap<TableRef, Relation>,
    foreign_keys: Vec<ForeignKey>,
}

fn table_ref(name: &str) -> TableRef {
    TableRef::parse(name, crate::config::DEFAULT_SCHEMA)
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn relation(mut self, name: &str, kind: RelationKind, columns: &[&str]) -> Self {
        self.relations.insert(
            table_ref(name),
            Relation {
                kind,
                columns: columns.iter().map(|c| c.to_string()).collect(),
                pkey: None,
                defaults: BTreeMap::new(),
                geometries: BTreeMap::new(),
            },
        );
        self
    }

    pub fn table(self, name: &str, columns: &[&str]) -> Self {
        self.relation(name, RelationKind::Table, columns)
    }

    pub fn view(self, name: &str, columns: &[&str]) -> Self {
        self.relation(name, RelationKind::View, columns)
    }

    fn with_relation(mut self, name: &str, f: impl FnOnce(&mut Relation)) -> Self {
        if let Some(relation) = self.relations.get_mut(&table_ref(name)) {
            f(relation);
        }
        self
    }

    pub fn with_primary_key(self, name: &str, column: &str) -> Self {
        self.with_relation(name, |r| r.pkey = Some(column.to_string()))
    }

    pub fn with_default(self, name: &str, column: &str, expression: &str) -> Self {
        self.with_relation(name, |r| {
            r.defaults.insert(column.to_string(), expression.to_string());
        })
    }

    pub fn with_geometry(self, name: &str, column: &str, geometry_type: &str, srid: i32) -> Self {
        self.with_relation(name, |r| {
            r.geometries.insert(column.to_string(), GeometryType::new(geometry_type, srid));
        })
    }

    pub fn with_foreign_key(mut self, child: &str, child_column: &str, parent: &str, parent_column: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            child: table_ref(child),
            child_column: child_column.to_string(),
            parent: table_ref(parent),
            parent_column: parent_column.to_string(),
        });
        self
    }

    /// animal(aid, name, year) with cat(aid, eye_color) and dog(aid, breed)
    pub fn zoo() -> Self {
        Self::new()
            .table("zoo.animal", &["aid", "name", "year"])
            .with_primary_key("zoo.animal", "aid")
            .with_default("zoo.animal", "aid", "nextval('zoo.animal_aid_seq'::regclass)")
            .table("zoo.cat", &["aid", "eye_color"])
            .with_primary_key("zoo.cat", "aid")
            .with_foreign_key("zoo.cat", "aid", "zoo.animal", "aid")
            .table("zoo.dog", &["aid", "breed"])
            .with_primary_key("zoo.dog", "aid")
            .with_foreign_key("zoo.dog", "aid", "zoo.animal", "aid")
    }

    fn get(&self, table: &TableRef) -> MergeViewResult<&Relation> {
        self.relations
            .get(table)
            .ok_or_else(|| MergeViewError::TableNotFound { table: table.to_string() })
    }
}

impl Catalog for StaticCatalog {
    fn relation_kind(&self, table: &TableRef) -> MergeViewResult<RelationKind> {
        Ok(self.get(table)?.kind)
    }

    fn primary_key(&self, table: &TableRef) -> MergeViewResult<String> {
        self.get(table)?
            .pkey
            .clone()
            .ok_or_else(|| MergeViewError::NoPrimaryKey { table: table.to_string() })
    }

    fn columns(&self, table: &TableRef, _kind: RelationKind) -> MergeViewResult<Vec<String>> {
        Ok(self.get(table)?.columns.clone())
    }

    fn reference_columns(&self, child: &TableRef, parent: &TableRef) -> MergeViewResult<(String, String)> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.child == *child && fk.parent == *parent)
            .map(|fk| (fk.child_column.clone(), fk.parent_column.clone()))
            .ok_or_else(|| MergeViewError::NoReferenceFound {
                child: child.to_string(),
                parent: parent.to_string(),
            })
    }

    fn default_value(&self, table: &TableRef, column: &str) -> MergeViewResult<String> {
        Ok(self
            .get(table)?
            .defaults
            .get(column)
            .cloned()
            .unwrap_or_else(|| "NULL".to_string()))
    }

    fn geometry_type(&self, table: &TableRef, column: &str) -> MergeViewResult<Option<GeometryType>> {
        Ok(self.get(table)?.geometries.get(column).cloned())
    }
}
