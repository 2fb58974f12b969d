//! SQL variables: `%(name)s` placeholders inside caller-supplied fragments
//!
//! Placeholders are replaced with SQL literals right before a statement is
//! executed. `%%` stands for a literal `%`, so while variables are in use
//! the generator doubles every `%` it writes itself (see
//! [`CompileOptions::percent`](crate::config::CompileOptions::percent)).
//! Without variables no substitution happens and text is passed through.

use std::collections::BTreeMap;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{MergeViewError, MergeViewResult};
use crate::utils::quote_literal;

static PLACEHOLDER: OnceCell<Regex> = OnceCell::new();

fn placeholder() -> MergeViewResult<&'static Regex> {
    Ok(PLACEHOLDER.get_or_try_init(|| {
        Regex::new(r"%(?:\((?P<name>[^)]*)\)s|(?P<escape>%))?")
    })?)
}

/// Value bound to a placeholder
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SqlVariable {
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlVariable {
    /// Literal form written into the statement
    pub fn to_sql(&self) -> String {
        match self {
            SqlVariable::Int(i) => i.to_string(),
            SqlVariable::Float(f) => f.to_string(),
            SqlVariable::Text(s) => quote_literal(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables(BTreeMap<String, SqlVariable>);

impl Variables {
    /// Build from the optional `variables` argument; SQL NULL and `{}` mean none
    pub fn from_json(value: Option<Value>) -> MergeViewResult<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Object(object)) => {
                let map: BTreeMap<String, SqlVariable> = serde_json::from_value(Value::Object(object))
                    .map_err(|e| MergeViewError::invalid(format!(
                        "variables must map names to strings or numbers: {e}"
                    )))?;
                Ok(Self(map))
            }
            Some(other) => Err(MergeViewError::invalid(format!(
                "variables must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SqlVariable) {
        self.0.insert(name.into(), value);
    }

    fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    fn error(&self, reason: String) -> MergeViewError {
        MergeViewError::VariableError { given: self.names(), reason }
    }

    /// Replace placeholders in `sql`; unchanged when no variables are set
    pub fn substitute(&self, sql: &str) -> MergeViewResult<String> {
        if self.is_empty() {
            return Ok(sql.to_string());
        }

        let re = placeholder()?;
        let mut out = String::with_capacity(sql.len());
        let mut last = 0;

        for caps in re.captures_iter(sql) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&sql[last..whole.start()]);
            last = whole.end();

            if caps.name("escape").is_some() {
                out.push('%');
            } else if let Some(name) = caps.name("name") {
                let value = self
                    .0
                    .get(name.as_str())
                    .ok_or_else(|| self.error(format!("missing variable \"{}\"", name.as_str())))?;
                out.push_str(&value.to_sql());
            } else {
                return Err(self.error(format!(
                    "unescaped % at offset {}",
                    whole.start()
                )));
            }
        }

        out.push_str(&sql[last..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        Variables::from_json(Some(json!({"srid": 2056, "owner": "zoo keeper", "ratio": 0.5}))).unwrap()
    }

    #[test]
    fn test_no_variables_leaves_text_alone() {
        let sql = "RAISE EXCEPTION 'type not known (%)', NEW.animal_type;";
        assert_eq!(Variables::default().substitute(sql).unwrap(), sql);
    }

    #[test]
    fn test_null_and_missing_mean_empty() {
        assert!(Variables::from_json(None).unwrap().is_empty());
        assert!(Variables::from_json(Some(Value::Null)).unwrap().is_empty());
    }

    #[test]
    fn test_substitute_literals() {
        let out = vars()
            .substitute("SELECT ST_SetSRID(g, %(srid)s), %(owner)s, %(ratio)s")
            .unwrap();
        assert_eq!(out, "SELECT ST_SetSRID(g, 2056), 'zoo keeper', 0.5");
    }

    #[test]
    fn test_escaped_percent() {
        let out = vars().substitute("RAISE EXCEPTION 'unknown (%%)', %(owner)s;").unwrap();
        assert_eq!(out, "RAISE EXCEPTION 'unknown (%)', 'zoo keeper';");
    }

    #[test]
    fn test_missing_variable() {
        let err = vars().substitute("SELECT %(schema)s").unwrap_err();
        assert_eq!(err.sqlstate(), "42P02");
        assert!(err.to_string().contains("missing variable \"schema\""));
        assert!(err.to_string().contains("owner, ratio, srid"));
    }

    #[test]
    fn test_lone_percent_is_rejected() {
        assert!(vars().substitute("SELECT 'a' LIKE 'b%'").is_err());
    }

    #[test]
    fn test_quotes_in_text_values() {
        let mut v = Variables::default();
        v.insert("label", SqlVariable::Text("o'clock".to_string()));
        assert_eq!(v.substitute("%(label)s").unwrap(), "'o''clock'");
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(Variables::from_json(Some(json!([1, 2]))).is_err());
        assert!(Variables::from_json(Some(json!({"a": [1]}))).is_err());
    }
}
