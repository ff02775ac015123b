use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{Error, Result};

/// Dynamic SQL scalar, the unit of parameter binding and of result rows.
///
/// Array columns travel as `Text` holding JSON; the Postgres dialect maps
/// them to native arrays in DDL while SQLite keeps the JSON text form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert an argument binding (JSON) into a bindable scalar.
    /// Arrays are expanded at the placeholder site, never here.
    pub(crate) fn from_json(v: &serde_json::Value) -> Result<Value> {
        match v {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else {
                    Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            other => Err(Error::Arg(format!(
                "cannot bind argument of shape {other}"
            ))),
        }
    }

    /// Parse a CSV cell against a declared scalar type. Empty cells are NULL.
    pub fn parse_typed(ty: &crate::schema::SqlType, cell: &str) -> Result<Value> {
        use crate::schema::SqlType;
        if cell.is_empty() {
            return Ok(Value::Null);
        }
        let bad = |what: &str| Error::Arg(format!("cannot parse {cell:?} as {what}"));
        Ok(match ty {
            SqlType::Integer | SqlType::BigInt => {
                Value::Int(cell.parse().map_err(|_| bad("integer"))?)
            }
            SqlType::Float => Value::Float(cell.parse().map_err(|_| bad("float"))?),
            SqlType::Bool => match cell {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => return Err(bad("bool")),
            },
            SqlType::Date => Value::Date(cell.parse().map_err(|_| bad("date"))?),
            SqlType::Timestamp => Value::Timestamp(
                NaiveDateTime::parse_from_str(cell, "%Y-%m-%d %H:%M:%S")
                    .or_else(|_| NaiveDateTime::parse_from_str(cell, "%Y-%m-%dT%H:%M:%S"))
                    .map_err(|_| bad("timestamp"))?,
            ),
            SqlType::Varchar | SqlType::Bytea | SqlType::Array(_) => Value::Text(cell.to_owned()),
        })
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => b.fmt(f),
            Value::Int(i) => i.fmt(f),
            Value::Float(x) => x.fmt(f),
            Value::Text(s) => s.fmt(f),
            Value::Bytes(b) => write!(f, "\\x{}", hex(b)),
            Value::Date(d) => d.fmt(f),
            Value::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(t: NaiveDateTime) -> Self {
        Value::Timestamp(t)
    }
}

impl<T> From<Option<T>> for Value
where
    Value: From<T>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
