//! Typed SOQL.
//!
//! Queries are built as values so the in-memory store can evaluate them and
//! the REST client can render them; literal escaping lives in one place.

use serde_json::Value;

use crate::types::Row;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    In { field: String, values: Vec<String> },
    Eq { field: String, value: Value },
    NotNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Filter::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Filter::NotNull(field.into())
    }

    fn render(&self, out: &mut String) {
        match self {
            Filter::In { field, values } => {
                out.push_str(field);
                out.push_str(" IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&quote(value));
                }
                out.push(')');
            }
            Filter::Eq { field, value } => {
                out.push_str(field);
                out.push_str(" = ");
                out.push_str(&literal(value));
            }
            Filter::NotNull(field) => {
                out.push_str(field);
                out.push_str(" != null");
            }
            Filter::And(parts) => render_joined(parts, " AND ", out),
            Filter::Or(parts) => render_joined(parts, " OR ", out),
        }
    }

    /// Evaluate against a flat row. Missing fields compare as null.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::In { field, values } => row
                .get(field)
                .and_then(scalar_text)
                .is_some_and(|v| values.iter().any(|candidate| *candidate == v)),
            Filter::Eq { field, value } => match (row.get(field), value) {
                (None | Some(Value::Null), Value::Null) => true,
                (Some(actual), expected) => {
                    actual == expected || scalar_text(actual) == scalar_text(expected)
                }
                (None, _) => false,
            },
            Filter::NotNull(field) => row.get(field).is_some_and(|v| !v.is_null()),
            Filter::And(parts) => parts.iter().all(|p| p.matches(row)),
            Filter::Or(parts) => parts.iter().any(|p| p.matches(row)),
        }
    }
}

fn render_joined(parts: &[Filter], joiner: &str, out: &mut String) {
    if parts.len() > 1 {
        out.push('(');
    }
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push_str(joiner);
        }
        part.render(out);
    }
    if parts.len() > 1 {
        out.push(')');
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub object: String,
    pub fields: Vec<String>,
    pub filter: Option<Filter>,
    pub order_by: Vec<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn select(object: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            object: object.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(field.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_soql(&self) -> String {
        let mut soql = format!("SELECT {} FROM {}", self.fields.join(", "), self.object);
        if let Some(filter) = &self.filter {
            soql.push_str(" WHERE ");
            filter.render(&mut soql);
        }
        if !self.order_by.is_empty() {
            soql.push_str(" ORDER BY ");
            soql.push_str(&self.order_by.join(", "));
        }
        if let Some(limit) = self.limit {
            soql.push_str(&format!(" LIMIT {}", limit));
        }
        soql
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_soql())
    }
}
