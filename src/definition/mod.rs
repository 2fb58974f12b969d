//! Definition Document: the declarative description of an inheritance view
//!
//! The document arrives as a generic JSON tree. It is checked against closed
//! key vocabularies first (cheap, before any catalog access) and then
//! deserialized into fixed structs, so the later passes never inspect
//! optional keys ad hoc.
//!
//! ## Example
//!
//! ```json
//! {
//!   "table": "zoo.animal",
//!   "allow_type_change": true,
//!   "joins": {
//!     "cat": {"table": "zoo.cat", "remap_columns": {"eye_color": "cat_eye_color"}},
//!     "dog": {"table": "zoo.dog", "prefix": "dog_"}
//!   }
//! }
//! ```

pub mod table_ref;

use std::collections::BTreeMap;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;

use crate::config::{self, TYPE_NAME_SUFFIX, UNKNOWN_TYPE_LABEL, VIEW_NAME_PREFIX};
use crate::error::{MergeViewError, MergeViewResult};
use crate::utils::check_identifier;

pub use table_ref::TableRef;

/// Keys accepted at the top level of a definition
pub const DEFINITION_KEYS: &[&str] = &[
    "table", "joins", "columns",
    "view_schema", "view_name", "alias", "short_alias", "type_name", "key",
    "skip_columns", "remap_columns", "prefix", "columns_on_top", "columns_at_end",
    "allow_type_change", "allow_parent_only", "fkey_is_pkey", "pkey_default_value",
    "merge_columns", "merge_geometry_columns",
    "additional_columns", "additional_joins",
    "insert_trigger", "update_trigger", "delete_trigger",
];

/// Keys accepted inside each entry of `joins`
pub const JOIN_KEYS: &[&str] = &[
    "table", "short_alias", "fkey", "only_columns",
    "referenced_by", "referenced_by_key", "is_type",
    "skip_columns", "remap_columns", "prefix", "columns_on_top", "columns_at_end",
    "insert_values", "update_values",
];

/// Keys accepted inside `insert_trigger`, `update_trigger`, `delete_trigger`
pub const TRIGGER_HOOK_KEYS: &[&str] = &["declare", "pre", "post"];

const MANDATORY_KEYS: &[&str] = &["table", "joins"];

/// Projection-shaping directives, shared by the master table and the joins
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ColumnShaping {
    #[serde(default)]
    pub skip_columns: Vec<String>,
    #[serde(default)]
    pub remap_columns: BTreeMap<String, String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub columns_on_top: Vec<String>,
    #[serde(default)]
    pub columns_at_end: Vec<String>,
}

impl ColumnShaping {
    /// Name a table column gets in the view
    pub fn view_name(&self, column: &str) -> String {
        if let Some(remapped) = self.remap_columns.get(column) {
            remapped.clone()
        } else if let Some(prefix) = &self.prefix {
            format!("{prefix}{column}")
        } else {
            column.to_string()
        }
    }

    /// Every (directive, column) pair, for existence checks against the catalog
    pub fn referenced_columns(&self) -> Vec<(&'static str, &str)> {
        let mut refs = Vec::new();
        refs.extend(self.remap_columns.keys().map(|c| ("remap_columns", c.as_str())));
        refs.extend(self.columns_on_top.iter().map(|c| ("columns_on_top", c.as_str())));
        refs.extend(self.columns_at_end.iter().map(|c| ("columns_at_end", c.as_str())));
        refs
    }
}

/// Caller-supplied PL/pgSQL wrapped verbatim around a generated trigger body
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TriggerHooks {
    #[serde(default)]
    pub declare: Vec<String>,
    #[serde(default)]
    pub pre: Option<String>,
    #[serde(default)]
    pub post: Option<String>,
}

/// One subtype or extension table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinDef {
    pub table: String,
    #[serde(default)]
    pub short_alias: Option<String>,
    /// Column of this table pointing at its ancestor
    #[serde(default)]
    pub fkey: Option<String>,
    /// Columns to use instead of the catalog's
    #[serde(default)]
    pub only_columns: Option<Vec<String>>,
    /// Alias of the ancestor join; the master when absent
    #[serde(default)]
    pub referenced_by: Option<String>,
    /// Ancestor column the `fkey` value matches
    #[serde(default)]
    pub referenced_by_key: Option<String>,
    #[serde(default)]
    pub is_type: Option<bool>,
    #[serde(flatten)]
    pub shaping: ColumnShaping,
    #[serde(default)]
    pub insert_values: BTreeMap<String, String>,
    #[serde(default)]
    pub update_values: BTreeMap<String, String>,
}

fn yes() -> bool {
    true
}

/// The whole definition document
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Definition {
    pub table: String,
    #[serde(deserialize_with = "ordered_map")]
    pub joins: Vec<(String, JoinDef)>,
    /// Master columns to use instead of the catalog's
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub view_schema: Option<String>,
    #[serde(default)]
    pub view_name: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub short_alias: Option<String>,
    #[serde(default)]
    pub type_name: Option<String>,
    /// Master primary key, when the catalog has none
    #[serde(default)]
    pub key: Option<String>,
    #[serde(flatten)]
    pub shaping: ColumnShaping,
    #[serde(default = "yes")]
    pub allow_type_change: bool,
    #[serde(default = "yes")]
    pub allow_parent_only: bool,
    /// Relaxed mode: a join without a foreign key links through its primary key
    #[serde(default)]
    pub fkey_is_pkey: bool,
    #[serde(default)]
    pub pkey_default_value: bool,
    #[serde(default)]
    pub merge_columns: Vec<String>,
    #[serde(default)]
    pub merge_geometry_columns: Vec<String>,
    #[serde(default, deserialize_with = "ordered_map")]
    pub additional_columns: Vec<(String, String)>,
    #[serde(default)]
    pub additional_joins: Option<String>,
    #[serde(default)]
    pub insert_trigger: TriggerHooks,
    #[serde(default)]
    pub update_trigger: TriggerHooks,
    #[serde(default)]
    pub delete_trigger: TriggerHooks,
}

impl Definition {
    /// Validate the raw tree against the key vocabularies, then deserialize it.
    ///
    /// Every failure here is a `DefinitionInvalid` error and happens before
    /// the catalog is consulted.
    pub fn from_value(value: Value) -> MergeViewResult<Self> {
        validate_keys(&value)?;

        let definition: Definition = serde_json::from_value(value)
            .map_err(|e| MergeViewError::invalid(e.to_string()))?;
        definition.validate_combinations()?;
        Ok(definition)
    }

    pub fn master_table(&self, default_schema: &str) -> TableRef {
        TableRef::parse(&self.table, default_schema)
    }

    /// Alias of the master table, also the parent-only discriminator label
    pub fn alias(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| TableRef::parse(&self.table, "").name)
    }

    pub fn short_alias(&self) -> String {
        self.short_alias.clone().unwrap_or_else(|| self.alias())
    }

    /// The generated view; it lives next to the master table unless told otherwise
    pub fn view(&self, default_schema: &str) -> TableRef {
        let master = self.master_table(default_schema);
        TableRef::new(
            self.view_schema.clone().unwrap_or(master.schema),
            self.view_name
                .clone()
                .unwrap_or_else(|| format!("{VIEW_NAME_PREFIX}{}", master.name)),
        )
    }

    pub fn type_name(&self) -> String {
        self.type_name
            .clone()
            .unwrap_or_else(|| format!("{}{TYPE_NAME_SUFFIX}", self.alias()))
    }

    /// Discriminator of rows matching no subtype
    pub fn sentinel(&self) -> String {
        if self.allow_parent_only {
            self.alias()
        } else {
            UNKNOWN_TYPE_LABEL.to_string()
        }
    }

    /// Whether a join gets a discriminator label. Joins on the master are
    /// types unless told otherwise, chained joins are extensions.
    pub fn join_is_type(&self, join: &JoinDef) -> bool {
        let on_master = match join.referenced_by.as_deref() {
            None => true,
            Some(parent) => parent == self.alias(),
        };
        join.is_type.unwrap_or(on_master)
    }

    /// Checks that need neither the catalog nor the join graph
    fn validate_combinations(&self) -> MergeViewResult<()> {
        if self.joins.is_empty() {
            return Err(MergeViewError::invalid("\"joins\" must declare at least one table"));
        }

        for column in &self.merge_geometry_columns {
            if self.merge_columns.contains(column) {
                return Err(MergeViewError::invalid(format!(
                    "column \"{column}\" is listed in both merge_columns and merge_geometry_columns"
                )));
            }
        }

        let view = self.view(config::DEFAULT_SCHEMA).name;
        check_identifier(&view, "view name")?;
        check_identifier(&self.type_name(), "type name")?;
        for op in ["insert", "update", "delete"] {
            check_identifier(&config::trigger_function_name(&view, op), "trigger function name")?;
            check_identifier(&config::trigger_name(&view, op), "trigger name")?;
        }

        let sentinel = self.sentinel();
        if let Some((alias, _)) = self.joins.iter().find(|(a, j)| *a == sentinel && self.join_is_type(j)) {
            return Err(MergeViewError::invalid(format!(
                "join alias \"{alias}\" is also the label of rows without subtype"
            )));
        }

        let master_short = self.short_alias();
        check_identifier(&master_short, "short alias")?;
        let mut seen = vec![master_short.as_str()];
        for (alias, join) in &self.joins {
            let short = join.short_alias.as_deref().unwrap_or(alias);
            check_identifier(short, "short alias")?;
            if seen.contains(&short) {
                return Err(MergeViewError::invalid(format!(
                    "short alias \"{short}\" is used more than once"
                )));
            }
            seen.push(short);
        }

        Ok(())
    }
}

/// Check every object level of the document against its allow-list
pub fn validate_keys(value: &Value) -> MergeViewResult<()> {
    let top = value
        .as_object()
        .ok_or_else(|| MergeViewError::invalid("definition must be an object"))?;

    for key in top.keys() {
        if !DEFINITION_KEYS.contains(&key.as_str()) {
            return Err(MergeViewError::invalid(format!("key {key} is not valid")));
        }
    }

    for mandatory in MANDATORY_KEYS {
        if !top.contains_key(*mandatory) {
            return Err(MergeViewError::invalid(format!(
                "Missing key: \"{mandatory}\" should be provided."
            )));
        }
    }

    let joins = top["joins"]
        .as_object()
        .ok_or_else(|| MergeViewError::invalid("\"joins\" must be an object of alias => join"))?;
    for (alias, join) in joins {
        let join = join
            .as_object()
            .ok_or_else(|| MergeViewError::invalid(format!("join {alias} must be an object")))?;
        for key in join.keys() {
            if !JOIN_KEYS.contains(&key.as_str()) {
                return Err(MergeViewError::invalid(format!(
                    "in join {alias} key \"{key}\" is not valid"
                )));
            }
        }
    }

    for trigger in ["insert_trigger", "update_trigger", "delete_trigger"] {
        if let Some(hooks) = top.get(trigger) {
            let hooks = hooks
                .as_object()
                .ok_or_else(|| MergeViewError::invalid(format!("{trigger} must be an object")))?;
            for key in hooks.keys() {
                if !TRIGGER_HOOK_KEYS.contains(&key.as_str()) {
                    return Err(MergeViewError::invalid(format!(
                        "key {key} is not valid in trigger definitions"
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Deserialize a JSON object into `(key, value)` pairs in document order
fn ordered_map<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OrderedVisitor<T>(std::marker::PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("an object")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((key, value)) = map.next_entry::<String, T>()? {
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedVisitor(std::marker::PhantomData))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::testing::assert_definition_error;
    use serde_json::json;

    fn animal() -> Value {
        json!({
            "table": "zoo.animal",
            "joins": {
                "cat": {"table": "zoo.cat"},
                "dog": {"table": "zoo.dog", "prefix": "dog_"},
                "aardvark": {"table": "zoo.aardvark", "skip_columns": ["father"]}
            }
        })
    }

    #[test]
    fn test_defaults() {
        let def = Definition::from_value(animal()).unwrap();
        assert_eq!(def.table, "zoo.animal");
        assert!(def.allow_type_change);
        assert!(def.allow_parent_only);
        assert!(!def.fkey_is_pkey);
        assert!(def.insert_trigger.declare.is_empty());
        assert_eq!(def.joins[1].1.shaping.prefix.as_deref(), Some("dog_"));
    }

    #[test]
    fn test_derived_names() {
        let def = Definition::from_value(animal()).unwrap();
        assert_eq!(def.alias(), "animal");
        assert_eq!(def.short_alias(), "animal");
        assert_eq!(def.type_name(), "animal_type");
        assert_eq!(def.view("public"), TableRef::new("zoo", "vw_merge_animal"));

        let mut value = animal();
        value["alias"] = json!("beast");
        value["short_alias"] = json!("b");
        value["view_schema"] = json!("zoo_app");
        let def = Definition::from_value(value).unwrap();
        assert_eq!(def.type_name(), "beast_type");
        assert_eq!(def.short_alias(), "b");
        assert_eq!(def.view("public").to_string(), "zoo_app.vw_merge_animal");
    }

    #[test]
    fn test_join_declaration_order_is_kept() {
        let def = Definition::from_value(animal()).unwrap();
        let aliases: Vec<&str> = def.joins.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(aliases, vec!["cat", "dog", "aardvark"]);
    }

    #[test]
    fn test_unknown_top_level_key() {
        let mut value = animal();
        value["MyBadKey"] = json!("Ouch");
        let err = Definition::from_value(value).unwrap_err();
        assert_eq!(err.to_string(), "Invalid definition: key MyBadKey is not valid");
    }

    #[test]
    fn test_unknown_join_key() {
        let mut value = animal();
        value["joins"]["cat"]["colour"] = json!("black");
        let err = Definition::from_value(value).unwrap_err();
        assert!(err.to_string().contains("in join cat key \"colour\" is not valid"));
    }

    #[test]
    fn test_unknown_trigger_hook_key() {
        let mut value = animal();
        value["update_trigger"] = json!({"before": "NULL;"});
        let err = Definition::from_value(value).unwrap_err();
        assert!(err.to_string().contains("not valid in trigger definitions"));
    }

    #[test]
    fn test_missing_joins() {
        let err = Definition::from_value(json!({"table": "zoo.animal"})).unwrap_err();
        assert!(err.to_string().contains("Missing key: \"joins\""));
    }

    #[test]
    fn test_wrong_value_type_is_definition_error() {
        let mut value = animal();
        value["allow_type_change"] = json!("yes");
        let err = Definition::from_value(value).unwrap_err();
        assert_eq!(err.sqlstate(), "42P17");
    }

    #[test]
    fn test_merge_column_listed_twice() {
        let mut value = animal();
        value["merge_columns"] = json!(["geom"]);
        value["merge_geometry_columns"] = json!(["geom"]);
        assert!(Definition::from_value(value).is_err());
    }

    #[test]
    fn test_duplicate_short_alias() {
        let mut value = animal();
        value["joins"]["dog"]["short_alias"] = json!("cat");
        let err = Definition::from_value(value).unwrap_err();
        assert!(err.to_string().contains("short alias \"cat\" is used more than once"));

        let mut value = animal();
        value["joins"]["cat"]["short_alias"] = json!("animal");
        let err = Definition::from_value(value).unwrap_err();
        assert!(err.to_string().contains("short alias \"animal\""));
    }

    #[test]
    fn test_alias_colliding_with_sentinel() {
        let mut value = animal();
        value["alias"] = json!("cat");
        value["short_alias"] = json!("a");
        assert_definition_error(Definition::from_value(value), "also the label of rows without subtype");

        // "unknown" takes the label once parent-only rows are refused
        let mut value = animal();
        value["alias"] = json!("cat");
        value["short_alias"] = json!("a");
        value["allow_parent_only"] = json!(false);
        assert!(Definition::from_value(value).is_ok());
    }

    #[test]
    fn test_extension_may_share_sentinel() {
        let mut value = animal();
        value["joins"]["animal"] = json!({"table": "zoo.animal_extra", "is_type": false, "short_alias": "ax"});
        value["short_alias"] = json!("a");
        assert!(Definition::from_value(value).is_ok());
    }

    #[test]
    fn test_identifier_lengths() {
        let mut value = animal();
        value["view_name"] = json!("v".repeat(60));
        let err = assert_definition_error(Definition::from_value(value), "trigger function name");
        assert_eq!(err.sqlstate(), "42602");

        let mut value = animal();
        value["type_name"] = json!("t".repeat(64));
        assert_definition_error(Definition::from_value(value), "type name");

        let mut value = animal();
        value["joins"]["cat"]["short_alias"] = json!("");
        assert_definition_error(Definition::from_value(value), "short alias cannot be empty");
    }

    #[test]
    fn test_explicit_column_lists() {
        let mut value = animal();
        value["columns"] = json!(["aid", "name"]);
        value["joins"]["cat"]["only_columns"] = json!(["aid", "eye_color"]);
        let def = Definition::from_value(value).unwrap();
        assert_eq!(def.columns, Some(vec!["aid".to_string(), "name".to_string()]));
        assert_eq!(def.joins[0].1.only_columns.as_ref().map(Vec::len), Some(2));
        assert_eq!(def.joins[1].1.only_columns, None);
    }

    #[test]
    fn test_additional_columns_keep_order() {
        let value: Value = serde_json::from_str(
            r#"{"table": "animal", "joins": {"cat": {"table": "cat"}},
                "additional_columns": {"zz_age": "now() - a.year", "aa_label": "upper(a.name)"}}"#,
        )
        .unwrap();
        let def = Definition::from_value(value).unwrap();
        assert_eq!(def.additional_columns[0].0, "zz_age");
        assert_eq!(def.additional_columns[1].0, "aa_label");
    }

    #[test]
    fn test_view_name_of_column() {
        let shaping = ColumnShaping {
            remap_columns: BTreeMap::from([("eye_color".to_string(), "cat_eyes".to_string())]),
            prefix: Some("cat_".to_string()),
            ..ColumnShaping::default()
        };
        assert_eq!(shaping.view_name("eye_color"), "cat_eyes");
        assert_eq!(shaping.view_name("fk_breed"), "cat_fk_breed");
        assert_eq!(ColumnShaping::default().view_name("year"), "year");
    }
}
