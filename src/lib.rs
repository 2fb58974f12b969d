use pgrx::prelude::*;
use pgrx::Json;

pub mod catalog;
pub mod config;
pub mod ddl;
pub mod definition;
pub mod error;
pub mod graph;
pub mod resolve;
mod utils;

pub use error::{MergeViewError, MergeViewResult};

use catalog::SpiCatalog;
use config::CompileOptions;
use ddl::variables::Variables;
use definition::Definition;

pg_module_magic!();

/// Get the version of the pg_merge_view extension
#[pg_extern]
fn merge_view_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn compile_options(variables: Option<Json>, drop: bool) -> MergeViewResult<CompileOptions> {
    let variables = Variables::from_json(variables.map(|json| json.0))?;
    Ok(CompileOptions::new(drop, variables))
}

/// Compile a definition against the live catalog.
///
/// Returns the qualified view name and the statements, variables not yet
/// substituted.
fn compile(definition: Json, options: &CompileOptions) -> MergeViewResult<(String, Vec<String>)> {
    let definition = Definition::from_value(definition.0)?;
    let view = resolve::resolve(&definition, &SpiCatalog, options)?;

    for fallback in &view.fallbacks {
        notice!("pg_merge_view: {}", fallback);
    }

    let statements = ddl::render(&view, options);
    info!(
        "pg_merge_view: compiled {} ({} joins, {} statements)",
        view.view,
        view.joins.len(),
        statements.len()
    );
    Ok((view.view.qualified(), statements))
}

/// Generate the view, enum type and triggers of a merge view definition
/// without executing anything
#[pg_extern]
fn merge_view_sql(
    definition: Json,
    variables: default!(Option<Json>, "NULL"),
    drop: default!(bool, false),
) -> SetOfIterator<'static, String> {
    let statements = compile_options(variables, drop).and_then(|options| {
        let (_, statements) = compile(definition, &options)?;
        statements
            .iter()
            .map(|statement| options.variables.substitute(statement))
            .collect::<MergeViewResult<Vec<String>>>()
    });

    match statements {
        Ok(statements) => SetOfIterator::new(statements),
        Err(e) => e.report(),
    }
}

/// Create (or replace) a merge view in the current transaction
#[pg_extern]
fn merge_view_create(
    definition: Json,
    variables: default!(Option<Json>, "NULL"),
    drop: default!(bool, false),
) -> String {
    let created = compile_options(variables, drop).and_then(|options| {
        let (view, statements) = compile(definition, &options)?;
        let applied = ddl::apply::apply(&statements, &options.variables)?;
        Ok(format!("{view} created ({applied} statements)"))
    });

    match created {
        Ok(summary) => {
            info!("pg_merge_view: {}", summary);
            summary
        }
        Err(e) => e.report(),
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    use crate::catalog::{Catalog, RelationKind, SpiCatalog};
    use crate::definition::TableRef;
    use crate::error::testing::assert_error_sqlstate;

    const ZOO: &str = r#"{"table": "zoo.animal", "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}"#;

    fn create_zoo() {
        Spi::run(
            "CREATE SCHEMA zoo;
             CREATE TABLE zoo.animal (aid serial PRIMARY KEY, name text NOT NULL, year integer);
             CREATE TABLE zoo.cat (aid integer PRIMARY KEY REFERENCES zoo.animal (aid), eye_color text);
             CREATE TABLE zoo.dog (aid integer PRIMARY KEY REFERENCES zoo.animal (aid), breed text);
             CREATE FUNCTION zoo.sqlstate_of(statement text) RETURNS text LANGUAGE plpgsql AS $f$
             BEGIN
               EXECUTE statement;
               RETURN NULL;
             EXCEPTION WHEN OTHERS THEN
               RETURN SQLSTATE;
             END
             $f$;",
        )
        .expect("zoo schema");
    }

    /// SQLSTATE raised by `statement`, or None when it succeeds
    fn sqlstate_of(statement: &str) -> Option<String> {
        Spi::get_one::<String>(&format!("SELECT zoo.sqlstate_of($stmt${statement}$stmt$)")).expect("sqlstate_of")
    }

    fn create_view(definition: &str) {
        Spi::run(&format!("SELECT merge_view_create($${definition}$$::json)")).expect("merge view");
    }

    fn count(query: &str) -> i64 {
        Spi::get_one::<i64>(query).expect("count").unwrap_or_default()
    }

    fn insert_felix() {
        Spi::run(
            "INSERT INTO zoo.vw_merge_animal (animal_type, name, year, eye_color)
             VALUES ('cat', 'felix', 2010, 'green')",
        )
        .expect("insert felix");
    }

    #[pg_test]
    fn test_version_callable_from_sql() {
        let version = Spi::get_one::<String>("SELECT merge_view_version()").unwrap();
        assert_eq!(version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
    }

    #[pg_test]
    fn test_spi_catalog() {
        create_zoo();
        Spi::run("CREATE VIEW zoo.names AS SELECT aid, name FROM zoo.animal").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW zoo.census AS SELECT aid, year FROM zoo.animal").unwrap();
        let catalog = SpiCatalog;
        let animal = TableRef::new("zoo", "animal");
        let cat = TableRef::new("zoo", "cat");
        let names = TableRef::new("zoo", "names");
        let census = TableRef::new("zoo", "census");

        assert_eq!(catalog.relation_kind(&animal).unwrap(), RelationKind::Table);
        assert_eq!(catalog.relation_kind(&names).unwrap(), RelationKind::View);
        assert_eq!(catalog.primary_key(&animal).unwrap(), "aid");
        assert_eq!(
            catalog.columns(&animal, RelationKind::Table).unwrap(),
            vec!["aid", "name", "year"]
        );
        assert_eq!(catalog.columns(&names, RelationKind::View).unwrap(), vec!["aid", "name"]);
        // materialized views only have pg_attribute rows
        let kind = catalog.relation_kind(&census).unwrap();
        assert_eq!(kind, RelationKind::Table);
        assert_eq!(catalog.columns(&census, kind).unwrap(), vec!["aid", "year"]);
        assert_eq!(
            catalog.reference_columns(&cat, &animal).unwrap(),
            ("aid".to_string(), "aid".to_string())
        );
        assert_eq!(
            catalog.default_value(&animal, "aid").unwrap(),
            "nextval('zoo.animal_aid_seq'::regclass)"
        );
        assert_eq!(catalog.default_value(&cat, "eye_color").unwrap(), "NULL");
        assert_eq!(catalog.geometry_type(&cat, "eye_color").unwrap(), None);

        assert_error_sqlstate(catalog.relation_kind(&TableRef::new("zoo", "bird")), "42P01");
        assert_error_sqlstate(catalog.primary_key(&names), "42P16");
        assert_error_sqlstate(catalog.reference_columns(&animal, &cat), "42830");
    }

    #[pg_test]
    fn test_insert_and_read_back() {
        create_zoo();
        create_view(ZOO);
        insert_felix();

        let animal_type = Spi::get_one::<String>(
            "SELECT animal_type::text FROM zoo.vw_merge_animal WHERE name = 'felix'",
        )
        .unwrap();
        assert_eq!(animal_type.as_deref(), Some("cat"));

        let eye_color =
            Spi::get_one::<String>("SELECT eye_color FROM zoo.vw_merge_animal WHERE name = 'felix'").unwrap();
        assert_eq!(eye_color.as_deref(), Some("green"));

        assert_eq!(count("SELECT count(*) FROM zoo.animal"), 1);
        assert_eq!(count("SELECT count(*) FROM zoo.cat c JOIN zoo.animal a USING (aid)"), 1);
        assert_eq!(count("SELECT count(*) FROM zoo.dog"), 0);
    }

    #[pg_test]
    fn test_parent_only_row() {
        create_zoo();
        create_view(ZOO);
        Spi::run("INSERT INTO zoo.vw_merge_animal (animal_type, name) VALUES ('animal', 'generic')").unwrap();

        let animal_type = Spi::get_one::<String>(
            "SELECT animal_type::text FROM zoo.vw_merge_animal WHERE name = 'generic'",
        )
        .unwrap();
        assert_eq!(animal_type.as_deref(), Some("animal"));
        assert_eq!(count("SELECT count(*) FROM zoo.cat") + count("SELECT count(*) FROM zoo.dog"), 0);
    }

    #[pg_test]
    fn test_update_columns() {
        create_zoo();
        create_view(ZOO);
        insert_felix();
        Spi::run("UPDATE zoo.vw_merge_animal SET year = 2011, eye_color = 'blue' WHERE name = 'felix'").unwrap();

        assert_eq!(count("SELECT count(*) FROM zoo.animal WHERE year = 2011"), 1);
        assert_eq!(count("SELECT count(*) FROM zoo.cat WHERE eye_color = 'blue'"), 1);
    }

    #[pg_test]
    fn test_type_change() {
        create_zoo();
        create_view(ZOO);
        insert_felix();
        Spi::run("UPDATE zoo.vw_merge_animal SET animal_type = 'dog', breed = 'sheltie' WHERE name = 'felix'")
            .unwrap();

        let animal_type = Spi::get_one::<String>(
            "SELECT animal_type::text FROM zoo.vw_merge_animal WHERE name = 'felix'",
        )
        .unwrap();
        assert_eq!(animal_type.as_deref(), Some("dog"));
        assert_eq!(count("SELECT count(*) FROM zoo.cat"), 0);
        assert_eq!(count("SELECT count(*) FROM zoo.dog WHERE breed = 'sheltie'"), 1);
    }

    #[pg_test(error = "Type change not allowed for animal")]
    fn test_type_change_refused() {
        create_zoo();
        create_view(r#"{"table": "zoo.animal", "allow_type_change": false,
            "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}"#);
        insert_felix();
        Spi::run("UPDATE zoo.vw_merge_animal SET animal_type = 'dog' WHERE name = 'felix'").unwrap();
    }

    #[pg_test]
    fn test_delete_leaves_no_orphans() {
        create_zoo();
        create_view(ZOO);
        insert_felix();
        Spi::run("DELETE FROM zoo.vw_merge_animal WHERE name = 'felix'").unwrap();

        assert_eq!(count("SELECT count(*) FROM zoo.animal"), 0);
        assert_eq!(count("SELECT count(*) FROM zoo.cat"), 0);
    }

    #[pg_test(error = "vw_merge_animal type not known (unknown)")]
    fn test_parent_only_refused() {
        create_zoo();
        create_view(r#"{"table": "zoo.animal", "allow_parent_only": false,
            "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}"#);
        Spi::run("INSERT INTO zoo.vw_merge_animal (animal_type, name) VALUES ('unknown', 'generic')").unwrap();
    }

    #[pg_test]
    fn test_recreate_with_drop() {
        create_zoo();
        create_view(ZOO);
        Spi::run(&format!("SELECT merge_view_create($${ZOO}$$::json, drop => true)")).unwrap();
        insert_felix();
        assert_eq!(count("SELECT count(*) FROM zoo.vw_merge_animal"), 1);
    }

    #[pg_test]
    fn test_create_twice_keeps_engine_sqlstate() {
        create_zoo();
        create_view(ZOO);
        // the enum type already exists: duplicate_object
        let state = sqlstate_of(&format!("SELECT merge_view_create($${ZOO}$$::json)"));
        assert_eq!(state.as_deref(), Some("42710"));
    }

    const KENNEL: &str = r#"{"table": "zoo.animal", "joins": {
        "cat": {"table": "zoo.cat"},
        "dog": {"table": "zoo.dog"},
        "sheepdog": {"table": "zoo.sheepdog", "referenced_by": "dog", "is_type": true}}}"#;

    fn create_kennel() {
        create_zoo();
        Spi::run(
            "CREATE TABLE zoo.sheepdog (aid integer PRIMARY KEY REFERENCES zoo.dog (aid), flock_size integer)",
        )
        .unwrap();
        create_view(KENNEL);
        Spi::run(
            "INSERT INTO zoo.vw_merge_animal (animal_type, name, breed, flock_size)
             VALUES ('sheepdog', 'shep', 'collie', 120)",
        )
        .unwrap();
    }

    #[pg_test]
    fn test_chained_type_insert() {
        create_kennel();

        let animal_type = Spi::get_one::<String>(
            "SELECT animal_type::text FROM zoo.vw_merge_animal WHERE name = 'shep'",
        )
        .unwrap();
        assert_eq!(animal_type.as_deref(), Some("sheepdog"));
        assert_eq!(count("SELECT count(*) FROM zoo.dog WHERE breed = 'collie'"), 1);
        assert_eq!(count("SELECT count(*) FROM zoo.sheepdog WHERE flock_size = 120"), 1);
    }

    #[pg_test]
    fn test_chained_type_change() {
        create_kennel();
        Spi::run("UPDATE zoo.vw_merge_animal SET animal_type = 'cat', eye_color = 'amber' WHERE name = 'shep'")
            .unwrap();

        assert_eq!(count("SELECT count(*) FROM zoo.sheepdog"), 0);
        assert_eq!(count("SELECT count(*) FROM zoo.dog"), 0);
        assert_eq!(count("SELECT count(*) FROM zoo.cat WHERE eye_color = 'amber'"), 1);
    }

    #[pg_test]
    fn test_chained_type_delete() {
        create_kennel();
        Spi::run("DELETE FROM zoo.vw_merge_animal WHERE name = 'shep'").unwrap();

        assert_eq!(count("SELECT count(*) FROM zoo.sheepdog"), 0);
        assert_eq!(count("SELECT count(*) FROM zoo.dog"), 0);
        assert_eq!(count("SELECT count(*) FROM zoo.animal"), 0);
    }

    #[pg_test]
    fn test_merge_column_read_and_write() {
        create_zoo();
        Spi::run("ALTER TABLE zoo.cat ADD COLUMN nickname text; ALTER TABLE zoo.dog ADD COLUMN nickname text")
            .unwrap();
        create_view(r#"{"table": "zoo.animal", "merge_columns": ["nickname"],
            "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}"#);
        Spi::run(
            "INSERT INTO zoo.vw_merge_animal (animal_type, name, nickname) VALUES
               ('cat', 'felix', 'fluffy'),
               ('dog', 'rex', 'rexy')",
        )
        .unwrap();

        assert_eq!(count("SELECT count(*) FROM zoo.cat WHERE nickname = 'fluffy'"), 1);
        assert_eq!(count("SELECT count(*) FROM zoo.dog WHERE nickname = 'rexy'"), 1);
        let nickname =
            Spi::get_one::<String>("SELECT nickname FROM zoo.vw_merge_animal WHERE name = 'rex'").unwrap();
        assert_eq!(nickname.as_deref(), Some("rexy"));

        Spi::run("UPDATE zoo.vw_merge_animal SET nickname = 'tom' WHERE name = 'felix'").unwrap();
        assert_eq!(count("SELECT count(*) FROM zoo.cat WHERE nickname = 'tom'"), 1);
        assert_eq!(count("SELECT count(*) FROM zoo.dog WHERE nickname = 'tom'"), 0);
    }

    #[pg_test]
    fn test_extension_written_for_every_row() {
        create_zoo();
        Spi::run(
            "CREATE TABLE zoo.passport (aid integer PRIMARY KEY REFERENCES zoo.animal (aid), number text)",
        )
        .unwrap();
        create_view(r#"{"table": "zoo.animal", "joins": {
            "cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"},
            "passport": {"table": "zoo.passport", "is_type": false}}}"#);
        Spi::run(
            "INSERT INTO zoo.vw_merge_animal (animal_type, name, number) VALUES
               ('cat', 'felix', 'CH-1'),
               ('animal', 'generic', 'CH-2')",
        )
        .unwrap();
        assert_eq!(count("SELECT count(*) FROM zoo.passport"), 2);

        Spi::run("UPDATE zoo.vw_merge_animal SET number = 'CH-3' WHERE name = 'generic'").unwrap();
        assert_eq!(count("SELECT count(*) FROM zoo.passport WHERE number = 'CH-3'"), 1);

        Spi::run("DELETE FROM zoo.vw_merge_animal WHERE name = 'felix'").unwrap();
        assert_eq!(count("SELECT count(*) FROM zoo.passport"), 1);
        assert_eq!(count("SELECT count(*) FROM zoo.cat"), 0);
    }

    #[pg_test(error = "vw_merge_animal type not known (unknown)")]
    fn test_update_to_unknown_type_refused() {
        create_zoo();
        create_view(r#"{"table": "zoo.animal", "allow_parent_only": false,
            "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}"#);
        insert_felix();
        Spi::run("UPDATE zoo.vw_merge_animal SET animal_type = 'unknown' WHERE name = 'felix'").unwrap();
    }

    #[pg_test]
    fn test_create_with_missing_variable() {
        create_zoo();
        let definition = r#"{"table": "zoo.animal", "additional_columns": {"zoo_name": "%(zoo)s::text"},
            "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}"#;
        let state = sqlstate_of(&format!(
            "SELECT merge_view_create($${definition}$$::json, '{{\"city\": \"Basel\"}}'::json)"
        ));
        assert_eq!(state.as_deref(), Some("42P02"));
        assert_eq!(count("SELECT count(*) FROM pg_views WHERE viewname = 'vw_merge_animal'"), 0);
    }

    #[pg_test]
    fn test_sql_is_not_executed() {
        create_zoo();
        let statements = count(&format!("SELECT count(*) FROM merge_view_sql($${ZOO}$$::json)"));
        assert_eq!(statements, 11);
        assert_eq!(count("SELECT count(*) FROM pg_views WHERE viewname = 'vw_merge_animal'"), 0);
    }

    #[pg_test]
    fn test_sql_substitutes_variables() {
        create_zoo();
        let definition = r#"{"table": "zoo.animal", "additional_columns": {"zoo_name": "%(zoo)s::text"},
            "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}"#;
        let view = Spi::get_one::<String>(&format!(
            "SELECT s FROM merge_view_sql($${definition}$$::json, '{{\"zoo\": \"Basel\"}}'::json) s \
             WHERE s LIKE 'CREATE OR REPLACE VIEW%'"
        ))
        .unwrap()
        .unwrap_or_default();
        assert!(view.contains("'Basel'::text AS zoo_name"));
    }

    #[pg_test(error = "Invalid definition: key colour is not valid")]
    fn test_invalid_definition_raised() {
        Spi::run(r#"SELECT merge_view_sql('{"table": "zoo.animal", "joins": {}, "colour": 1}'::json)"#).unwrap();
    }
}
