//! Driver-neutral parameter values.
//!
//! [`SqlValue`] plays two roles: as a regular query parameter it is sent to
//! the server in text format (the server performs input conversion, so no
//! per-type binary codec is required), and for `EXECUTE` of a cached
//! prepared statement it is rendered as an inline SQL literal.

use std::error::Error as StdError;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio_postgres::types::{to_sql_checked, Format, IsNull, ToSql, Type};

/// A value passed as a query parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A 64-bit integer.
    Int(i64),
    /// A double-precision float.
    Float(f64),
    /// A text value.
    Text(String),
    /// A UTC timestamp, rendered as ISO-8601.
    Timestamp(DateTime<Utc>),
    /// An array of values, rendered recursively.
    Array(Vec<SqlValue>),
    /// Any other structured value, rendered as `jsonb`.
    Json(serde_json::Value),
}

impl SqlValue {
    /// Renders this value as an inline SQL literal for `EXECUTE`.
    pub fn to_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_owned(),
            Self::Boolean(true) => "TRUE".to_owned(),
            Self::Boolean(false) => "FALSE".to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(n) => n.to_string(),
            Self::Text(s) => quote_literal(s),
            Self::Timestamp(ts) => format!("'{}'", ts.to_rfc3339()),
            Self::Array(items) => {
                let parts: Vec<String> = items.iter().map(Self::to_literal).collect();
                format!("ARRAY[{}]", parts.join(","))
            }
            Self::Json(v) => format!("'{}'::jsonb", v.to_string().replace('\'', "''")),
        }
    }

    /// Text-format wire encoding; `None` encodes SQL `NULL`.
    fn text_encoding(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Boolean(b) => Some(if *b { "t" } else { "f" }.to_owned()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(n) => Some(n.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Timestamp(ts) => Some(ts.to_rfc3339()),
            Self::Array(items) => Some(array_text(items)),
            Self::Json(v) => Some(v.to_string()),
        }
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// PostgreSQL array input syntax: `{a,b,c}` with `\` and `"` escaped
/// inside always-quoted scalar elements.
fn array_text(items: &[SqlValue]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            SqlValue::Null => out.push_str("NULL"),
            SqlValue::Array(inner) => out.push_str(&array_text(inner)),
            other => {
                let text = other.text_encoding().unwrap_or_default();
                out.push('"');
                for ch in text.chars() {
                    if ch == '"' || ch == '\\' {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push('"');
            }
        }
    }
    out.push('}');
    out
}

/// Escapes an identifier for embedding inside double quotes.
pub(crate) fn escape_ident(name: &str) -> String {
    name.replace('"', "\"\"")
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self.text_encoding() {
            None => Ok(IsNull::Yes),
            Some(text) => {
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}
