//! View Synthesizer: the discriminated `SELECT` over the master table and its joins

use crate::resolve::{ColumnSource, MergeColumn, ResolvedJoin, ResolvedView};
use crate::utils::{indent_lines, quote_ident};

/// `alias.column`, renamed when the view name differs
fn projection(table_alias: &str, column: &str, view_name: &str) -> String {
    if view_name == column {
        format!("{}.{}", quote_ident(table_alias), quote_ident(column))
    } else {
        format!("{}.{} AS {}", quote_ident(table_alias), quote_ident(column), quote_ident(view_name))
    }
}

/// `CASE` computing the discriminator, deepest type first
pub fn discriminator(view: &ResolvedView) -> String {
    let sentinel = view.type_literal(view.sentinel());
    let order = view.topology.discriminator_order();
    if order.is_empty() {
        return format!("{sentinel} AS {}", quote_ident(&view.type_name));
    }

    let mut lines = vec!["CASE".to_string()];
    for j in order {
        let join = &view.joins[j];
        lines.push(format!(
            "  WHEN {}.{} IS NOT NULL THEN {}",
            quote_ident(&join.short_alias),
            quote_ident(&join.ref_master_key),
            view.type_literal(&join.alias)
        ));
    }
    lines.push(format!("  ELSE {sentinel}"));
    lines.push(format!("END AS {}", quote_ident(&view.type_name)));
    lines.join("\n    ")
}

fn merge_column(view: &ResolvedView, merge: &MergeColumn) -> String {
    let mut lines = vec!["CASE".to_string()];
    for &j in &merge.sources {
        let join = &view.joins[j];
        lines.push(format!(
            "  WHEN {sa}.{rmk} IS NOT NULL THEN {sa}.{col}",
            sa = quote_ident(&join.short_alias),
            rmk = quote_ident(&join.ref_master_key),
            col = quote_ident(&merge.name),
        ));
    }
    lines.push(format!("  ELSE NULL{}", merge.cast.as_deref().unwrap_or("")));
    lines.push(format!("END AS {}", quote_ident(&merge.name)));
    lines.join("\n    ")
}

fn join_column(join: &ResolvedJoin, column: &str) -> String {
    projection(&join.short_alias, column, &join.shaping.view_name(column))
}

fn left_join(view: &ResolvedView, join: &ResolvedJoin) -> String {
    let ancestor_alias = match join.anchor {
        crate::graph::Anchor::Master => &view.master.short_alias,
        crate::graph::Anchor::Join(p) => &view.joins[p].short_alias,
    };
    format!(
        "LEFT JOIN {table} {sa} ON {sa}.{rmk} = {aa}.{rbk}",
        table = join.table.qualified(),
        sa = quote_ident(&join.short_alias),
        rmk = quote_ident(&join.ref_master_key),
        aa = quote_ident(ancestor_alias),
        rbk = quote_ident(&join.referenced_by_key),
    )
}

/// `CREATE OR REPLACE VIEW` statement
pub fn create_view(view: &ResolvedView) -> String {
    let master = &view.master;

    let mut columns = vec![discriminator(view)];
    columns.extend(view.columns.iter().map(|c| match c.source {
        ColumnSource::Master => projection(&master.short_alias, &c.column, &master.shaping.view_name(&c.column)),
        ColumnSource::Merge(m) => merge_column(view, &view.merge_columns[m]),
        ColumnSource::Join(j) => join_column(&view.joins[j], &c.column),
    }));
    columns.extend(
        view.additional_columns
            .iter()
            .map(|(alias, expression)| format!("{expression} AS {}", quote_ident(alias))),
    );

    let mut from = vec![format!("{} {}", master.table.qualified(), quote_ident(&master.short_alias))];
    from.extend(view.joins.iter().map(|join| left_join(view, join)));
    if let Some(additional) = &view.additional_joins {
        from.push(additional.clone());
    }

    format!(
        "CREATE OR REPLACE VIEW {} AS\n  SELECT\n    {}\n  FROM {};",
        view.view.qualified(),
        indent_lines(&columns, 4, ","),
        indent_lines(&from, 4, ""),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory::StaticCatalog;
    use crate::config::CompileOptions;
    use crate::definition::Definition;
    use crate::resolve::resolve;
    use serde_json::json;

    fn render(value: serde_json::Value, catalog: &StaticCatalog) -> String {
        let definition = Definition::from_value(value).unwrap();
        let view = resolve(&definition, catalog, &CompileOptions::default()).unwrap();
        create_view(&view)
    }

    #[test]
    fn test_zoo_view() {
        let sql = render(
            json!({"table": "zoo.animal", "joins": {
                "cat": {"table": "zoo.cat", "remap_columns": {"eye_color": "cat_eye_color"}},
                "dog": {"table": "zoo.dog", "prefix": "dog_"}
            }}),
            &StaticCatalog::zoo(),
        );

        let expected = "\
CREATE OR REPLACE VIEW zoo.vw_merge_animal AS
  SELECT
    CASE
      WHEN cat.aid IS NOT NULL THEN 'cat'::zoo.animal_type
      WHEN dog.aid IS NOT NULL THEN 'dog'::zoo.animal_type
      ELSE 'animal'::zoo.animal_type
    END AS animal_type,
    animal.aid,
    animal.name,
    animal.year,
    cat.eye_color AS cat_eye_color,
    dog.breed AS dog_breed
  FROM zoo.animal animal
    LEFT JOIN zoo.cat cat ON cat.aid = animal.aid
    LEFT JOIN zoo.dog dog ON dog.aid = animal.aid;";
        assert_eq!(sql, expected);
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let value = json!({"table": "zoo.animal", "columns_on_top": ["year"], "joins": {
            "cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}
        }});
        let catalog = StaticCatalog::zoo();
        assert_eq!(render(value.clone(), &catalog), render(value, &catalog));
    }

    #[test]
    fn test_chain_joins_against_ancestor() {
        let catalog = StaticCatalog::zoo()
            .table("zoo.sheepdog", &["aid", "flock_size"])
            .with_primary_key("zoo.sheepdog", "aid")
            .with_foreign_key("zoo.sheepdog", "aid", "zoo.dog", "aid");
        let sql = render(
            json!({"table": "zoo.animal", "short_alias": "a", "allow_parent_only": false, "joins": {
                "dog": {"table": "zoo.dog", "short_alias": "d"},
                "sheepdog": {"table": "zoo.sheepdog", "short_alias": "sd", "referenced_by": "dog", "is_type": true}
            }}),
            &catalog,
        );

        assert!(sql.contains("LEFT JOIN zoo.sheepdog sd ON sd.aid = d.aid"));
        let sheepdog = sql.find("'sheepdog'::zoo.animal_type").unwrap();
        let dog = sql.find("'dog'::zoo.animal_type").unwrap();
        assert!(sheepdog < dog, "nested type must be tested first");
        assert!(sql.contains("ELSE 'unknown'::zoo.animal_type"));
    }

    #[test]
    fn test_merge_and_additional_columns() {
        let catalog = StaticCatalog::zoo()
            .table("zoo.cat", &["aid", "eye_color", "geom"])
            .with_primary_key("zoo.cat", "aid")
            .with_foreign_key("zoo.cat", "aid", "zoo.animal", "aid")
            .with_geometry("zoo.cat", "geom", "POINT", 2056)
            .table("zoo.dog", &["aid", "breed", "geom"])
            .with_primary_key("zoo.dog", "aid")
            .with_foreign_key("zoo.dog", "aid", "zoo.animal", "aid")
            .with_geometry("zoo.dog", "geom", "POINT", 2056);
        let sql = render(
            json!({"table": "zoo.animal", "merge_geometry_columns": ["geom"],
                   "additional_columns": {"age": "extract(year from now()) - animal.year"},
                   "additional_joins": "LEFT JOIN zoo.keeper k ON k.aid = animal.aid",
                   "joins": {"cat": {"table": "zoo.cat"}, "dog": {"table": "zoo.dog"}}}),
            &catalog,
        );

        assert!(sql.contains(
            "    CASE\n      WHEN cat.aid IS NOT NULL THEN cat.geom\n      \
             WHEN dog.aid IS NOT NULL THEN dog.geom\n      \
             ELSE NULL::geometry(POINT,2056)\n    END AS geom,"
        ));
        assert!(!sql.contains("cat.geom,"));
        assert!(sql.contains("extract(year from now()) - animal.year AS age\n  FROM"));
        assert!(sql.ends_with("LEFT JOIN zoo.keeper k ON k.aid = animal.aid;"));
    }

    #[test]
    fn test_columns_on_top_of_join() {
        let catalog = StaticCatalog::zoo()
            .table("zoo.dog", &["aid", "fk_breed"])
            .with_primary_key("zoo.dog", "aid")
            .with_foreign_key("zoo.dog", "aid", "zoo.animal", "aid");
        let sql = render(
            json!({"table": "zoo.animal", "type_name": "my_custom_type", "joins": {
                "cat": {"table": "zoo.cat", "remap_columns": {"eye_color": "eye_color_renamed"},
                        "columns_on_top": ["eye_color"]},
                "dog": {"table": "zoo.dog", "prefix": "dog_"}
            }}),
            &catalog,
        );

        assert!(sql.contains(
            "    END AS my_custom_type,\n    animal.aid,\n    cat.eye_color AS eye_color_renamed,\n    animal.name,"
        ));
        assert!(sql.contains("dog.fk_breed AS dog_fk_breed\n  FROM"));
    }

    #[test]
    fn test_no_type_joins() {
        let sql = render(
            json!({"table": "zoo.animal", "joins": {"cat": {"table": "zoo.cat", "is_type": false}}}),
            &StaticCatalog::zoo(),
        );
        assert!(sql.contains("    'animal'::zoo.animal_type AS animal_type,"));
    }
}
