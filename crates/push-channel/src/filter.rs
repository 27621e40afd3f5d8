use std::fmt;

use serde_json::Value;

use crate::{PushError, PushResult};

/// Equality predicate in the `<column>=eq.<value>` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub column: String,
    pub value: String,
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn parse(raw: &str) -> PushResult<Self> {
        let invalid = || PushError::InvalidFilter(raw.to_string());
        let (column, rest) = raw.split_once('=').ok_or_else(invalid)?;
        let value = rest.strip_prefix("eq.").ok_or_else(invalid)?;
        let column = column.trim();
        if column.is_empty() || value.is_empty() {
            return Err(invalid());
        }
        Ok(Self::eq(column, value))
    }

    /// Numbers and booleans compare by their JSON text, so `7` matches `eq.7`.
    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(text)) => text == &self.value,
            Some(Value::Number(number)) => number.to_string() == self.value,
            Some(Value::Bool(flag)) => flag.to_string() == self.value,
            _ => false,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_equality_predicate() {
        let predicate = Predicate::parse("consultant_id=eq.c-19").expect("parse");
        assert_eq!(predicate, Predicate::eq("consultant_id", "c-19"));
        assert_eq!(predicate.to_string(), "consultant_id=eq.c-19");
    }

    #[test]
    fn rejects_unsupported_operators() {
        assert!(matches!(
            Predicate::parse("client_id=neq.4"),
            Err(PushError::InvalidFilter(_))
        ));
        assert!(Predicate::parse("client_id").is_err());
        assert!(Predicate::parse("=eq.4").is_err());
        assert!(Predicate::parse("client_id=eq.").is_err());
    }

    #[test]
    fn matches_string_and_numeric_columns() {
        let predicate = Predicate::eq("client_id", "42");
        assert!(predicate.matches(&json!({"client_id": 42})));
        assert!(predicate.matches(&json!({"client_id": "42"})));
        assert!(!predicate.matches(&json!({"client_id": 43})));
        assert!(!predicate.matches(&json!({"client_id": null})));
        assert!(!predicate.matches(&json!({"consultant_id": 42})));
    }
}
