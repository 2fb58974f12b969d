use crate::ddl::variables::Variables;

/// Schema used for bare (unqualified) table identifiers
pub const DEFAULT_SCHEMA: &str = "public";

/// Default view name is `vw_merge_<master table>`
pub const VIEW_NAME_PREFIX: &str = "vw_merge_";

/// Default discriminator type name is `<alias>_type`
pub const TYPE_NAME_SUFFIX: &str = "_type";

/// Discriminator label for rows matching no subtype when parent-only rows are refused
pub const UNKNOWN_TYPE_LABEL: &str = "unknown";

/// Trigger functions are `ft_<view>_<op>`, triggers `tr_<view>_on_<op>`
pub const TRIGGER_FUNCTION_PREFIX: &str = "ft_";
pub const TRIGGER_PREFIX: &str = "tr_";

pub fn trigger_function_name(view: &str, op: &str) -> String {
    format!("{TRIGGER_FUNCTION_PREFIX}{view}_{op}")
}

pub fn trigger_name(view: &str, op: &str) -> String {
    format!("{TRIGGER_PREFIX}{view}_on_{op}")
}

/// PostgreSQL NAMEDATALEN - 1
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Per-call options, built at the SQL boundary and owned by one compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Emit `DROP VIEW` / `DROP TYPE` before recreating them
    pub drop: bool,
    pub default_schema: String,
    pub variables: Variables,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            drop: false,
            default_schema: DEFAULT_SCHEMA.to_string(),
            variables: Variables::default(),
        }
    }
}

impl CompileOptions {
    pub fn new(drop: bool, variables: Variables) -> Self {
        Self { drop, variables, ..Self::default() }
    }

    /// `%` written by the generator must be doubled once variables are substituted
    pub fn percent(&self) -> &'static str {
        if self.variables.is_empty() { "%" } else { "%%" }
    }
}
