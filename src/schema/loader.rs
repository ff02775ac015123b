//! Declaration file parsing. A schema file is a YAML sequence of table
//! records; each column maps a name to a type-spec string, either a scalar
//! SQL type (`varchar`, `integer`, ...), `m2o <table>.<col>` or
//! `o2m <table>.<col>`, with optional `not null` / `default <value>`
//! modifiers.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::schema::{surrogate_id, ColKind, Column, SqlType, Table};

#[derive(Debug, Clone, Deserialize)]
pub struct TableDecl {
    pub table: String,
    pub columns: IndexMap<String, String>,
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
}

pub(crate) fn decls_from_yaml(text: &str) -> Result<Vec<TableDecl>> {
    serde_yaml::from_str(text).map_err(|e| Error::Schema(format!("bad schema file: {e}")))
}

impl TableDecl {
    pub(crate) fn build(&self) -> Result<Table> {
        let mut columns = IndexMap::new();
        if !self.columns.contains_key("id") {
            let id = surrogate_id();
            columns.insert(id.name.clone(), id);
        }
        for (name, spec) in &self.columns {
            let column = parse_column(&self.table, name, spec)?;
            columns.insert(name.clone(), column);
        }
        Ok(Table {
            name: self.table.clone(),
            columns,
            key: self.key.clone(),
            unique: self.unique.clone(),
            relations: Vec::new(),
        })
    }
}

fn parse_column(table: &str, name: &str, spec: &str) -> Result<Column> {
    let mut words = spec.split_whitespace().peekable();
    let head = words
        .next()
        .ok_or_else(|| Error::Schema(format!("empty type for {table}.{name}")))?;

    let kind = match head {
        "m2o" | "o2m" => {
            let target = words.next().ok_or_else(|| {
                Error::Schema(format!("{table}.{name}: {head} needs a target <table>.<col>"))
            })?;
            let (t, c) = target.split_once('.').ok_or_else(|| {
                Error::Schema(format!(
                    "{table}.{name}: relation target {target:?} must be <table>.<col>"
                ))
            })?;
            if head == "m2o" {
                ColKind::ManyToOne {
                    table: t.to_owned(),
                    column: c.to_owned(),
                }
            } else {
                ColKind::OneToMany {
                    table: t.to_owned(),
                    column: c.to_owned(),
                }
            }
        }
        scalar => ColKind::Scalar(SqlType::parse(scalar)?),
    };

    let mut not_null = false;
    let mut default = None;
    while let Some(word) = words.next() {
        match word {
            "not" => match words.next() {
                Some("null") => not_null = true,
                _ => {
                    return Err(Error::Schema(format!(
                        "{table}.{name}: expected 'not null' in {spec:?}"
                    )))
                }
            },
            "default" => {
                let value = words.next().ok_or_else(|| {
                    Error::Schema(format!("{table}.{name}: 'default' needs a value"))
                })?;
                default = Some(value.to_owned());
            }
            other => {
                return Err(Error::Schema(format!(
                    "{table}.{name}: unexpected modifier {other:?}"
                )))
            }
        }
    }

    Ok(Column {
        name: name.to_owned(),
        kind,
        not_null,
        default,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scalar_with_modifiers() {
        let col = parse_column("t", "bio", "varchar not null default unknown").unwrap();
        assert_eq!(col.kind, ColKind::Scalar(SqlType::Varchar));
        assert!(col.not_null);
        assert_eq!(col.default.as_deref(), Some("unknown"));
    }

    #[test]
    fn parse_relations() {
        let col = parse_column("team", "country", "m2o country.id").unwrap();
        assert_eq!(
            col.kind,
            ColKind::ManyToOne {
                table: "country".into(),
                column: "id".into(),
            }
        );
        let col = parse_column("team", "members", "o2m member.team").unwrap();
        assert!(col.is_o2m());
    }

    #[test]
    fn parse_array_type() {
        let col = parse_column("event", "tags", "varchar[]").unwrap();
        assert_eq!(
            col.kind,
            ColKind::Scalar(SqlType::Array(Box::new(SqlType::Varchar)))
        );
    }

    #[test]
    fn reject_bad_specs() {
        assert!(parse_column("t", "c", "m2o nodot").is_err());
        assert!(parse_column("t", "c", "varchar banana").is_err());
        assert!(parse_column("t", "c", "enum").is_err());
    }
}
