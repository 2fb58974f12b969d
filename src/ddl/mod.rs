//! DDL generation for one merge view
//!
//! Compilation runs in two passes:
//! 1. [`resolve`](crate::resolve::resolve) builds a [`ResolvedView`] from the
//!    definition and the catalog; all validation happens there.
//! 2. [`render`] turns it into SQL text without touching the database.
//!
//! The statements come out in execution order:
//!
//! ```text
//! [DROP VIEW, DROP TYPE]            -- only when asked to drop
//! CREATE TYPE ... AS ENUM
//! CREATE OR REPLACE VIEW
//! (CREATE FUNCTION, DROP TRIGGER, CREATE TRIGGER) x insert/update/delete
//! [ALTER VIEW ... SET DEFAULT]      -- only with pkey_default_value
//! ```

pub mod apply;
pub mod trigger;
pub mod variables;
pub mod view;

use crate::config::CompileOptions;
use crate::resolve::ResolvedView;
use crate::utils::{quote_ident, quote_literal};

use trigger::TriggerOp;

pub fn drop_statements(view: &ResolvedView) -> Vec<String> {
    vec![
        format!("DROP VIEW IF EXISTS {};", view.view.qualified()),
        format!("DROP TYPE IF EXISTS {};", view.qualified_type()),
    ]
}

pub fn create_type(view: &ResolvedView) -> String {
    let labels: Vec<String> = view.type_labels().into_iter().map(quote_literal).collect();
    format!("CREATE TYPE {} AS ENUM ({});", view.qualified_type(), labels.join(", "))
}

pub fn alter_view_default(view: &ResolvedView) -> String {
    format!(
        "ALTER VIEW {} ALTER COLUMN {} SET DEFAULT {};",
        view.view.qualified(),
        quote_ident(&view.master.pkey_column),
        view.master.pkey_default,
    )
}

/// Render every statement for a resolved view
pub fn render(view: &ResolvedView, options: &CompileOptions) -> Vec<String> {
    let mut statements = Vec::new();

    if options.drop {
        statements.extend(drop_statements(view));
    }
    statements.push(create_type(view));
    statements.push(view::create_view(view));

    for op in TriggerOp::ALL {
        statements.push(trigger::trigger_function(view, op, options));
        statements.push(trigger::drop_trigger(view, op));
        statements.push(trigger::create_trigger(view, op));
    }

    if view.pkey_default_value {
        statements.push(alter_view_default(view));
    }

    statements
}
