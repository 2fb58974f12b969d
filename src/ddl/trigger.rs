//! Trigger Synthesizer: `INSTEAD OF` triggers making the view editable
//!
//! Each trigger body follows the same sequence:
//!
//! ```text
//! pre hook → master row → unconditional joins → [type change] → type dispatch → post hook → RETURN
//! ```
//!
//! Writes walk the join tree top-down so that every row exists before the
//! rows pointing at it; deletes walk it bottom-up.

use crate::config::CompileOptions;
use crate::definition::TriggerHooks;
use crate::resolve::{ResolvedJoin, ResolvedView};
use crate::utils::{indent_lines, quote_ident, quote_literal, quote_qualified};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    Insert,
    Update,
    Delete,
}

impl TriggerOp {
    pub const ALL: [TriggerOp; 3] = [TriggerOp::Insert, TriggerOp::Update, TriggerOp::Delete];

    pub fn name(self) -> &'static str {
        match self {
            TriggerOp::Insert => "insert",
            TriggerOp::Update => "update",
            TriggerOp::Delete => "delete",
        }
    }

    fn event(self) -> &'static str {
        match self {
            TriggerOp::Insert => "INSERT",
            TriggerOp::Update => "UPDATE",
            TriggerOp::Delete => "DELETE",
        }
    }

    fn hooks(self, view: &ResolvedView) -> &TriggerHooks {
        match self {
            TriggerOp::Insert => &view.insert_trigger,
            TriggerOp::Update => &view.update_trigger,
            TriggerOp::Delete => &view.delete_trigger,
        }
    }

    /// Record whose values the key columns are read from
    fn records(self) -> Records {
        match self {
            TriggerOp::Insert => Records { master: "NEW", join: "NEW" },
            // join-owned keys may be reassigned by a type change
            TriggerOp::Update => Records { master: "OLD", join: "NEW" },
            TriggerOp::Delete => Records { master: "OLD", join: "OLD" },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Records {
    master: &'static str,
    join: &'static str,
}

/// PL/pgSQL body under construction, two spaces per level
#[derive(Debug, Default)]
struct Body {
    lines: Vec<String>,
    depth: usize,
}

impl Body {
    fn push(&mut self, text: &str) {
        let pad = "  ".repeat(self.depth);
        for line in text.lines() {
            self.lines.push(format!("{pad}{line}"));
        }
    }

    fn nested(&mut self, f: impl FnOnce(&mut Self)) {
        self.depth += 1;
        f(self);
        self.depth -= 1;
    }

    fn finish(self) -> String {
        self.lines.join("\n")
    }
}

fn new_column(column: &str) -> String {
    format!("NEW.{}", quote_ident(column))
}

/// Name of a join column in the view
fn view_column(view: &ResolvedView, join: &ResolvedJoin, column: &str) -> String {
    if view.is_merge_column(column) {
        column.to_string()
    } else {
        join.shaping.view_name(column)
    }
}

/// Value of the join's foreign key for the current row
fn link_value(join: &ResolvedJoin, records: Records) -> String {
    let record = if join.link.join_key { records.join } else { records.master };
    format!("{record}.{}", quote_ident(&join.link.column))
}

fn type_test(view: &ResolvedView, record: &str, join: &ResolvedJoin) -> String {
    format!(
        "{record}.{} = {}",
        quote_ident(&view.type_name),
        view.type_literal(&join.alias)
    )
}

fn insert_master(view: &ResolvedView) -> String {
    let master = &view.master;
    let values: Vec<String> = master
        .columns
        .iter()
        .map(|column| {
            let value = new_column(&master.shaping.view_name(column));
            if *column == master.pkey {
                format!("COALESCE({value}, {})", master.pkey_default)
            } else {
                value
            }
        })
        .collect();
    let columns: Vec<String> = master.columns.iter().map(|c| quote_ident(c)).collect();

    format!(
        "INSERT INTO {} (\n    {}\n  ) VALUES (\n    {}\n  )\n  RETURNING {} INTO {};",
        master.table.qualified(),
        indent_lines(&columns, 4, ","),
        indent_lines(&values, 4, ","),
        quote_ident(&master.pkey),
        new_column(&master.pkey_column),
    )
}

/// Insert one join row. A bare insert only writes the keys.
fn insert_join(view: &ResolvedView, join: &ResolvedJoin, records: Records, bare: bool) -> String {
    let own_pkey = join.own_pkey().filter(|pkey| join.columns.iter().any(|c| c == pkey));

    let mut columns = Vec::new();
    let mut values = Vec::new();
    for column in &join.columns {
        let is_key = *column == join.ref_master_key || Some(column.as_str()) == own_pkey;
        if bare && !is_key {
            continue;
        }

        let value = match join.insert_value(column) {
            Some(expression) if !bare => expression.to_string(),
            _ if *column == join.ref_master_key => link_value(join, records),
            _ if Some(column.as_str()) == own_pkey => format!(
                "COALESCE({}, {})",
                new_column(&view_column(view, join, column)),
                join.pkey_default
            ),
            _ => new_column(&view_column(view, join, column)),
        };
        columns.push(quote_ident(column));
        values.push(value);
    }

    let returning = match own_pkey {
        Some(pkey) => format!(
            "\n  RETURNING {} INTO {}",
            quote_ident(pkey),
            new_column(&view_column(view, join, pkey))
        ),
        None => String::new(),
    };

    format!(
        "INSERT INTO {} (\n    {}\n  ) VALUES (\n    {}\n  ){returning};",
        join.table.qualified(),
        indent_lines(&columns, 4, ","),
        indent_lines(&values, 4, ","),
    )
}

fn update_master(view: &ResolvedView) -> Option<String> {
    let master = &view.master;
    let assignments: Vec<String> = master
        .columns
        .iter()
        .filter(|c| **c != master.pkey)
        .map(|c| format!("{} = {}", quote_ident(c), new_column(&master.shaping.view_name(c))))
        .collect();
    if assignments.is_empty() {
        return None;
    }

    Some(format!(
        "UPDATE {} SET\n    {}\n  WHERE {} = OLD.{};",
        master.table.qualified(),
        indent_lines(&assignments, 4, ","),
        quote_ident(&master.pkey),
        quote_ident(&master.pkey_column),
    ))
}

/// Update one join row; keys and link columns are never rewritten
fn update_join(view: &ResolvedView, join: &ResolvedJoin, records: Records) -> Option<String> {
    let assignments: Vec<String> = join
        .columns
        .iter()
        .filter(|c| **c != join.ref_master_key && Some(c.as_str()) != join.own_pkey())
        .map(|c| {
            let value = match join.update_value(c) {
                Some(expression) => expression.to_string(),
                None => new_column(&view_column(view, join, c)),
            };
            format!("{} = {value}", quote_ident(c))
        })
        .collect();
    if assignments.is_empty() {
        return None;
    }

    Some(format!(
        "UPDATE {} SET\n    {}\n  WHERE {} = {};",
        join.table.qualified(),
        indent_lines(&assignments, 4, ","),
        quote_ident(&join.ref_master_key),
        link_value(join, records),
    ))
}

fn delete_join(join: &ResolvedJoin, records: Records) -> String {
    format!(
        "DELETE FROM {} WHERE {} = {};",
        join.table.qualified(),
        quote_ident(&join.ref_master_key),
        link_value(join, records),
    )
}

fn delete_master(view: &ResolvedView) -> String {
    format!(
        "DELETE FROM {} WHERE {} = OLD.{};",
        view.master.table.qualified(),
        quote_ident(&view.master.pkey),
        quote_ident(&view.master.pkey_column),
    )
}

/// Statement run for a discriminator matching no type
fn unknown_type(view: &ResolvedView, options: &CompileOptions) -> String {
    if view.allow_parent_only {
        "NULL;".to_string()
    } else {
        format!(
            "RAISE EXCEPTION {}, NEW.{};",
            quote_literal(&format!("{} type not known ({})", view.view.name, options.percent())),
            quote_ident(&view.type_name),
        )
    }
}

/// `CASE WHEN <record>.type = '<alias>' THEN ... ELSE <fallback> END CASE;`
fn dispatch(
    body: &mut Body,
    view: &ResolvedView,
    record: &str,
    arms: Vec<(usize, Vec<String>)>,
    fallback: &str,
) {
    if arms.is_empty() {
        body.push(fallback);
        return;
    }

    body.push("CASE");
    body.nested(|body| {
        for (j, statements) in arms {
            body.push(&format!("WHEN {} THEN", type_test(view, record, &view.joins[j])));
            body.nested(|body| {
                if statements.is_empty() {
                    body.push("NULL;");
                }
                for statement in &statements {
                    body.push(statement);
                }
            });
        }
        body.push("ELSE");
        body.nested(|body| body.push(fallback));
    });
    body.push("END CASE;");
}

fn insert_body(view: &ResolvedView, options: &CompileOptions, body: &mut Body) {
    let records = TriggerOp::Insert.records();
    body.push(&insert_master(view));
    for j in view.topology.unconditional() {
        body.push(&insert_join(view, &view.joins[j], records, false));
    }

    let arms = view
        .topology
        .types()
        .into_iter()
        .map(|t| {
            let statements = view
                .topology
                .footprint(t)
                .into_iter()
                .map(|j| insert_join(view, &view.joins[j], records, false))
                .collect();
            (t, statements)
        })
        .collect();
    dispatch(body, view, "NEW", arms, &unknown_type(view, options));
}

fn type_change(view: &ResolvedView, body: &mut Body) {
    let type_column = quote_ident(&view.type_name);
    body.push(&format!("IF OLD.{type_column} IS DISTINCT FROM NEW.{type_column} THEN"));
    body.nested(|body| {
        if !view.allow_type_change {
            body.push(&format!(
                "RAISE EXCEPTION {}\n  USING HINT = 'You cannot switch from ' || OLD.{type_column} || ' to ' || NEW.{type_column};",
                quote_literal(&format!("Type change not allowed for {}", view.alias)),
            ));
            return;
        }

        let old_records = TriggerOp::Delete.records();
        let deletes = view
            .topology
            .types()
            .into_iter()
            .map(|t| {
                let statements = view
                    .topology
                    .footprint(t)
                    .into_iter()
                    .rev()
                    .map(|j| delete_join(&view.joins[j], old_records))
                    .collect();
                (t, statements)
            })
            .collect();
        dispatch(body, view, "OLD", deletes, "NULL;");

        let new_records = TriggerOp::Update.records();
        let inserts = view
            .topology
            .types()
            .into_iter()
            .map(|t| {
                let statements = view
                    .topology
                    .footprint(t)
                    .into_iter()
                    .map(|j| insert_join(view, &view.joins[j], new_records, true))
                    .collect();
                (t, statements)
            })
            .collect();
        dispatch(body, view, "NEW", inserts, "NULL;");
    });
    body.push("END IF;");
}

fn update_body(view: &ResolvedView, options: &CompileOptions, body: &mut Body) {
    let records = TriggerOp::Update.records();
    if let Some(statement) = update_master(view) {
        body.push(&statement);
    }
    for j in view.topology.unconditional() {
        if let Some(statement) = update_join(view, &view.joins[j], records) {
            body.push(&statement);
        }
    }

    type_change(view, body);

    let arms = view
        .topology
        .types()
        .into_iter()
        .map(|t| {
            let statements = view
                .topology
                .footprint(t)
                .into_iter()
                .filter_map(|j| update_join(view, &view.joins[j], records))
                .collect();
            (t, statements)
        })
        .collect();
    dispatch(body, view, "NEW", arms, &unknown_type(view, options));
}

fn delete_body(view: &ResolvedView, body: &mut Body) {
    let records = TriggerOp::Delete.records();
    let arms = view
        .topology
        .types()
        .into_iter()
        .map(|t| {
            let statements = view
                .topology
                .footprint(t)
                .into_iter()
                .rev()
                .map(|j| delete_join(&view.joins[j], records))
                .collect();
            (t, statements)
        })
        .collect();
    dispatch(body, view, "OLD", arms, "NULL;");

    for j in view.topology.unconditional().into_iter().rev() {
        body.push(&delete_join(&view.joins[j], records));
    }
    body.push(&delete_master(view));
}

/// `CREATE OR REPLACE FUNCTION ... RETURNS trigger` for one operation
pub fn trigger_function(view: &ResolvedView, op: TriggerOp, options: &CompileOptions) -> String {
    let hooks = op.hooks(view);
    let mut body = Body::default();

    body.nested(|body| {
        if let Some(pre) = &hooks.pre {
            body.push(pre);
        }
        match op {
            TriggerOp::Insert => insert_body(view, options, body),
            TriggerOp::Update => update_body(view, options, body),
            TriggerOp::Delete => delete_body(view, body),
        }
        if let Some(post) = &hooks.post {
            body.push(post);
        }
        body.push(if op == TriggerOp::Delete { "RETURN OLD;" } else { "RETURN NEW;" });
    });

    let declare = if hooks.declare.is_empty() {
        String::new()
    } else {
        let declarations: Vec<String> = hooks.declare.iter().map(|d| format!("  {d};")).collect();
        format!("DECLARE\n{}\n", declarations.join("\n"))
    };

    format!(
        "CREATE OR REPLACE FUNCTION {}() RETURNS trigger AS\n$BODY$\n{declare}BEGIN\n{}\nEND;\n$BODY$\nLANGUAGE plpgsql;",
        quote_qualified(&view.view.schema, &view.trigger_function(op.name())),
        body.finish(),
    )
}

pub fn drop_trigger(view: &ResolvedView, op: TriggerOp) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {} ON {};",
        quote_ident(&view.trigger_name(op.name())),
        view.view.qualified(),
    )
}

pub fn create_trigger(view: &ResolvedView, op: TriggerOp) -> String {
    format!(
        "CREATE TRIGGER {}\n  INSTEAD OF {} ON {}\n  FOR EACH ROW EXECUTE PROCEDURE {}();",
        quote_ident(&view.trigger_name(op.name())),
        op.event(),
        view.view.qualified(),
        quote_qualified(&view.view.schema, &view.trigger_function(op.name())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory::StaticCatalog;
    use crate::ddl::variables::{SqlVariable, Variables};
    use crate::definition::Definition;
    use crate::resolve::resolve;
    use serde_json::json;

    fn zoo_view(value: serde_json::Value, catalog: &StaticCatalog) -> ResolvedView {
        let definition = Definition::from_value(value).unwrap();
        resolve(&definition, catalog, &CompileOptions::default()).unwrap()
    }

    fn zoo() -> ResolvedView {
        zoo_view(
            json!({"table": "zoo.animal", "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}),
            &StaticCatalog::zoo(),
        )
    }

    #[test]
    fn test_insert_trigger() {
        let sql = trigger_function(&zoo(), TriggerOp::Insert, &CompileOptions::default());

        let expected = "\
CREATE OR REPLACE FUNCTION zoo.ft_vw_merge_animal_insert() RETURNS trigger AS
$BODY$
BEGIN
  INSERT INTO zoo.animal (
      aid,
      name,
      year
    ) VALUES (
      COALESCE(NEW.aid, nextval('zoo.animal_aid_seq'::regclass)),
      NEW.name,
      NEW.year
    )
    RETURNING aid INTO NEW.aid;
  CASE
    WHEN NEW.animal_type = 'cat'::zoo.animal_type THEN
      INSERT INTO zoo.cat (
          aid,
          eye_color
        ) VALUES (
          NEW.aid,
          NEW.eye_color
        );
    WHEN NEW.animal_type = 'dog'::zoo.animal_type THEN
      INSERT INTO zoo.dog (
          aid,
          breed
        ) VALUES (
          NEW.aid,
          NEW.breed
        );
    ELSE
      NULL;
  END CASE;
  RETURN NEW;
END;
$BODY$
LANGUAGE plpgsql;";
        assert_eq!(sql, expected);
    }

    #[test]
    fn test_master_insert_coalesces_catalog_default() {
        let sql = insert_master(&zoo());
        assert!(sql.contains("COALESCE(NEW.aid, nextval('zoo.animal_aid_seq'::regclass))"));
        assert!(sql.ends_with("RETURNING aid INTO NEW.aid;"));
    }

    #[test]
    fn test_unknown_type_raises_when_parent_only_refused() {
        let view = zoo_view(
            json!({"table": "zoo.animal", "allow_parent_only": false, "joins": {"cat": {"table": "zoo.cat"}}}),
            &StaticCatalog::zoo(),
        );
        let insert = trigger_function(&view, TriggerOp::Insert, &CompileOptions::default());
        assert!(insert.contains("RAISE EXCEPTION 'vw_merge_animal type not known (%)', NEW.animal_type;"));
        let update = trigger_function(&view, TriggerOp::Update, &CompileOptions::default());
        assert!(update.contains("type not known"));

        let mut variables = Variables::default();
        variables.insert("srid", SqlVariable::Int(2056));
        let escaped = trigger_function(&view, TriggerOp::Insert, &CompileOptions::new(false, variables));
        assert!(escaped.contains("type not known (%%)"));
    }

    #[test]
    fn test_type_change_refused() {
        let view = zoo_view(
            json!({"table": "zoo.animal", "allow_type_change": false, "joins": {"cat": {"table": "zoo.cat"}}}),
            &StaticCatalog::zoo(),
        );
        let sql = trigger_function(&view, TriggerOp::Update, &CompileOptions::default());
        assert!(sql.contains("IF OLD.animal_type IS DISTINCT FROM NEW.animal_type THEN"));
        assert!(sql.contains("RAISE EXCEPTION 'Type change not allowed for animal'"));
        assert!(sql.contains("USING HINT = 'You cannot switch from ' || OLD.animal_type || ' to ' || NEW.animal_type;"));
    }

    #[test]
    fn test_type_change_moves_subtype_row() {
        let sql = trigger_function(&zoo(), TriggerOp::Update, &CompileOptions::default());
        assert!(sql.contains(
            "WHEN OLD.animal_type = 'cat'::zoo.animal_type THEN\n        DELETE FROM zoo.cat WHERE aid = OLD.aid;"
        ));
        assert!(sql.contains("WHEN NEW.animal_type = 'dog'::zoo.animal_type THEN\n        INSERT INTO zoo.dog (\n            aid\n"));
        assert!(sql.contains("UPDATE zoo.animal SET\n      name = NEW.name,\n      year = NEW.year\n    WHERE aid = OLD.aid;"));
        assert!(sql.contains("UPDATE zoo.cat SET\n          eye_color = NEW.eye_color\n        WHERE aid = OLD.aid;"));

        let change = sql.find("IS DISTINCT FROM").unwrap();
        let dispatch = sql.rfind("WHEN NEW.animal_type = 'cat'").unwrap();
        assert!(change < dispatch);
    }

    #[test]
    fn test_delete_trigger() {
        let sql = trigger_function(&zoo(), TriggerOp::Delete, &CompileOptions::default());
        assert!(sql.contains("WHEN OLD.animal_type = 'cat'::zoo.animal_type THEN\n      DELETE FROM zoo.cat WHERE aid = OLD.aid;"));
        assert!(sql.contains("  DELETE FROM zoo.animal WHERE aid = OLD.aid;\n  RETURN OLD;"));
    }

    #[test]
    fn test_hooks_and_values() {
        let catalog = StaticCatalog::zoo()
            .table("zoo.cat", &["aid", "eye_color", "updated_at"])
            .with_primary_key("zoo.cat", "aid")
            .with_foreign_key("zoo.cat", "aid", "zoo.animal", "aid");
        let view = zoo_view(
            json!({"table": "zoo.animal",
                   "insert_trigger": {"declare": ["counter integer"], "pre": "counter := 1;", "post": "PERFORM pg_notify('zoo', 'insert');"},
                   "delete_trigger": {"pre": "RAISE NOTICE 'bye';"},
                   "joins": {"cat": {"table": "zoo.cat",
                                     "insert_values": {"updated_at": "now()"},
                                     "update_values": {"updated_at": "clock_timestamp()"}}}}),
            &catalog,
        );

        let insert = trigger_function(&view, TriggerOp::Insert, &CompileOptions::default());
        assert!(insert.contains("$BODY$\nDECLARE\n  counter integer;\nBEGIN\n  counter := 1;\n"));
        assert!(insert.contains("  PERFORM pg_notify('zoo', 'insert');\n  RETURN NEW;"));
        assert!(insert.contains("NEW.eye_color,\n          now()\n"));

        let update = trigger_function(&view, TriggerOp::Update, &CompileOptions::default());
        assert!(update.contains("updated_at = clock_timestamp()"));

        let delete = trigger_function(&view, TriggerOp::Delete, &CompileOptions::default());
        assert!(delete.contains("BEGIN\n  RAISE NOTICE 'bye';\n"));
    }

    #[test]
    fn test_own_primary_key_is_returned() {
        let catalog = StaticCatalog::zoo()
            .table("zoo.bird", &["bid", "animal_id", "wingspan"])
            .with_primary_key("zoo.bird", "bid")
            .with_default("zoo.bird", "bid", "nextval('zoo.bird_bid_seq'::regclass)");
        let view = zoo_view(
            json!({"table": "zoo.animal", "joins": {"bird": {"table": "zoo.bird", "fkey": "animal_id", "prefix": "bird_"}}}),
            &catalog,
        );

        let insert = trigger_function(&view, TriggerOp::Insert, &CompileOptions::default());
        assert!(insert.contains("COALESCE(NEW.bird_bid, nextval('zoo.bird_bid_seq'::regclass)),\n          NEW.aid,"));
        assert!(insert.contains("RETURNING bid INTO NEW.bird_bid;"));

        let update = trigger_function(&view, TriggerOp::Update, &CompileOptions::default());
        assert!(update.contains("UPDATE zoo.bird SET\n          wingspan = NEW.bird_wingspan\n        WHERE animal_id = OLD.aid;"));
        assert!(!update.contains("bid = NEW"));
    }

    #[test]
    fn test_chain_footprint_order() {
        let catalog = StaticCatalog::zoo()
            .table("zoo.sheepdog", &["aid", "flock_size"])
            .with_primary_key("zoo.sheepdog", "aid")
            .with_foreign_key("zoo.sheepdog", "aid", "zoo.dog", "aid")
            .table("zoo.passport", &["aid", "number"])
            .with_foreign_key("zoo.passport", "aid", "zoo.animal", "aid");
        let view = zoo_view(
            json!({"table": "zoo.animal", "joins": {
                "dog": {"table": "zoo.dog"},
                "sheepdog": {"table": "zoo.sheepdog", "referenced_by": "dog", "is_type": true},
                "passport": {"table": "zoo.passport", "is_type": false}
            }}),
            &catalog,
        );

        let insert = trigger_function(&view, TriggerOp::Insert, &CompileOptions::default());
        let passport = insert.find("INSERT INTO zoo.passport").unwrap();
        let case = insert.find("CASE").unwrap();
        assert!(passport < case, "extension rows are written for every type");
        let arm = insert.find("WHEN NEW.animal_type = 'sheepdog'").unwrap();
        let dog = insert[arm..].find("INSERT INTO zoo.dog").unwrap();
        let sheepdog = insert[arm..].find("INSERT INTO zoo.sheepdog").unwrap();
        assert!(dog < sheepdog);

        let delete = trigger_function(&view, TriggerOp::Delete, &CompileOptions::default());
        let arm = delete.find("WHEN OLD.animal_type = 'sheepdog'").unwrap();
        let dog = delete[arm..].find("DELETE FROM zoo.dog").unwrap();
        let sheepdog = delete[arm..].find("DELETE FROM zoo.sheepdog").unwrap();
        assert!(sheepdog < dog);
        let passport = delete.find("DELETE FROM zoo.passport").unwrap();
        let master = delete.find("DELETE FROM zoo.animal").unwrap();
        assert!(passport < master);
    }

    #[test]
    fn test_trigger_statements() {
        let view = zoo();
        assert_eq!(
            drop_trigger(&view, TriggerOp::Update),
            "DROP TRIGGER IF EXISTS tr_vw_merge_animal_on_update ON zoo.vw_merge_animal;"
        );
        assert_eq!(
            create_trigger(&view, TriggerOp::Delete),
            "CREATE TRIGGER tr_vw_merge_animal_on_delete\n  INSTEAD OF DELETE ON zoo.vw_merge_animal\n  \
             FOR EACH ROW EXECUTE PROCEDURE zoo.ft_vw_merge_animal_delete();"
        );
    }
}
