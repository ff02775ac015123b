//! Schema registry: table, column, key and relation declarations with
//! build-time validation. The registry is built once at connect time and is
//! immutable afterwards.

mod ddl;
mod loader;

pub use ddl::{create_tables, drop_tables, introspect};
pub use loader::TableDecl;

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Scalar SQL type of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    Varchar,
    Integer,
    BigInt,
    Float,
    Bool,
    Date,
    Timestamp,
    Bytea,
    Array(Box<SqlType>),
}

impl SqlType {
    pub(crate) fn parse(word: &str) -> Result<SqlType> {
        if let Some(inner) = word.strip_suffix("[]") {
            return Ok(SqlType::Array(Box::new(SqlType::parse(inner)?)));
        }
        Ok(match word {
            "varchar" | "text" => SqlType::Varchar,
            "integer" | "int" => SqlType::Integer,
            "bigint" => SqlType::BigInt,
            "float" | "double" => SqlType::Float,
            "bool" | "boolean" => SqlType::Bool,
            "date" => SqlType::Date,
            "timestamp" => SqlType::Timestamp,
            "bytea" | "blob" => SqlType::Bytea,
            other => return Err(Error::Schema(format!("unknown column type {other:?}"))),
        })
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlType::Varchar => write!(f, "varchar"),
            SqlType::Integer => write!(f, "integer"),
            SqlType::BigInt => write!(f, "bigint"),
            SqlType::Float => write!(f, "float"),
            SqlType::Bool => write!(f, "bool"),
            SqlType::Date => write!(f, "date"),
            SqlType::Timestamp => write!(f, "timestamp"),
            SqlType::Bytea => write!(f, "bytea"),
            SqlType::Array(inner) => write!(f, "{inner}[]"),
        }
    }
}

/// The three kinds of column: plain scalar storage, a stored foreign key
/// (`m2o`), or a purely virtual inverse relation (`o2m`).
#[derive(Debug, Clone, PartialEq)]
pub enum ColKind {
    Scalar(SqlType),
    ManyToOne { table: String, column: String },
    OneToMany { table: String, column: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColKind,
    pub not_null: bool,
    pub default: Option<String>,
}

impl Column {
    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, ColKind::Scalar(_))
    }

    pub fn is_m2o(&self) -> bool {
        matches!(self.kind, ColKind::ManyToOne { .. })
    }

    pub fn is_o2m(&self) -> bool {
        matches!(self.kind, ColKind::OneToMany { .. })
    }

    /// The type this column stores. Foreign keys store the target surrogate
    /// as a big integer; `o2m` columns store nothing.
    pub fn stored_type(&self) -> Option<SqlType> {
        match &self.kind {
            ColKind::Scalar(ty) => Some(ty.clone()),
            ColKind::ManyToOne { .. } => Some(SqlType::BigInt),
            ColKind::OneToMany { .. } => None,
        }
    }
}

/// A relation edge usable by the path resolver, kept sorted per table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Relation {
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: IndexMap<String, Column>,
    pub key: Vec<String>,
    pub unique: Vec<Vec<String>>,
    pub relations: Vec<Relation>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Columns that exist in storage, in declaration order (`o2m` excluded).
    pub fn stored_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.values().filter(|c| !c.is_o2m())
    }
}

/// The process-wide registry. Built once from declarations, then read-only.
#[derive(Debug, Clone)]
pub struct Schema {
    tables: IndexMap<String, Table>,
}

impl Schema {
    pub(crate) fn assemble(tables: IndexMap<String, Table>) -> Result<Schema> {
        let mut schema = Schema { tables };
        schema.link()?;
        Ok(schema)
    }

    pub fn from_declarations(decls: &[TableDecl]) -> Result<Schema> {
        let mut tables = IndexMap::new();
        for decl in decls {
            let table = decl.build()?;
            if tables.insert(table.name.clone(), table).is_some() {
                return Err(Error::Schema(format!("duplicate table {:?}", decl.table)));
            }
        }
        let mut schema = Schema { tables };
        schema.link()?;
        Ok(schema)
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::Resolve(format!("unknown table {name:?}")))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// The stored type a dotted write path stages as: the terminal column's
    /// declared type, reached through m2o hops.
    pub fn terminal_type(&self, table: &str, path: &str) -> Result<SqlType> {
        let mut cur = self.table(table)?;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, seg) in segments.iter().enumerate() {
            let col = cur.column(seg).ok_or_else(|| {
                Error::Resolve(format!("no column {seg:?} on table {:?}", cur.name))
            })?;
            let last = i + 1 == segments.len();
            match (&col.kind, last) {
                (_, true) => {
                    return col.stored_type().ok_or_else(|| {
                        Error::Resolve(format!("column {seg:?} has no stored type"))
                    })
                }
                (ColKind::ManyToOne { table: t, .. }, false) => cur = self.table(t)?,
                _ => {
                    return Err(Error::Resolve(format!(
                        "cannot traverse {seg:?} in path {path:?}"
                    )))
                }
            }
        }
        Err(Error::Resolve(format!("empty path for table {table:?}")))
    }

    /// Validate cross-table consistency and compute per-table relation lists.
    fn link(&mut self) -> Result<()> {
        // Validate edges against the full table set first.
        for table in self.tables.values() {
            if table.key.is_empty() {
                return Err(Error::Schema(format!(
                    "table {:?} has no natural key",
                    table.name
                )));
            }
            for key_col in &table.key {
                match table.column(key_col) {
                    None => {
                        return Err(Error::Schema(format!(
                            "key column {:?} not declared in table {:?}",
                            key_col, table.name
                        )))
                    }
                    Some(c) if c.is_o2m() => {
                        return Err(Error::Schema(format!(
                            "key column {:?} of table {:?} is one-to-many",
                            key_col, table.name
                        )))
                    }
                    Some(_) => {}
                }
            }
            for col in table.columns.values() {
                match &col.kind {
                    ColKind::ManyToOne { table: t, column: c } => {
                        let target = self.tables.get(t).ok_or_else(|| {
                            Error::Schema(format!(
                                "column {}.{} references unknown table {t:?}",
                                table.name, col.name
                            ))
                        })?;
                        if c != "id" && target.column(c).is_none() {
                            return Err(Error::Schema(format!(
                                "column {}.{} references unknown column {t}.{c}",
                                table.name, col.name
                            )));
                        }
                        // The referenced column must be unique in the target,
                        // or the join it declares fans out.
                        let unique = c == "id"
                            || target.key == [c.clone()]
                            || target.unique.iter().any(|u| *u == [c.clone()]);
                        if !unique {
                            return Err(Error::Schema(format!(
                                "column {}.{} references {t}.{c}, which is not unique in {t:?}",
                                table.name, col.name
                            )));
                        }
                    }
                    ColKind::OneToMany { table: t, column: c } => {
                        let source = self.tables.get(t).ok_or_else(|| {
                            Error::Schema(format!(
                                "column {}.{} references unknown table {t:?}",
                                table.name, col.name
                            ))
                        })?;
                        match source.column(c) {
                            Some(back) if back.is_m2o() => {}
                            _ => {
                                return Err(Error::Schema(format!(
                                    "column {}.{} must name a many-to-one column, got {t}.{c}",
                                    table.name, col.name
                                )))
                            }
                        }
                    }
                    ColKind::Scalar(_) => {}
                }
            }
        }

        // Relation lists, sorted by (source_column, target_table, target_column).
        let mut all_relations: IndexMap<String, Vec<Relation>> = IndexMap::new();
        for table in self.tables.values() {
            let mut relations = Vec::new();
            for col in table.columns.values() {
                match &col.kind {
                    ColKind::ManyToOne { table: t, column: c }
                    | ColKind::OneToMany { table: t, column: c } => relations.push(Relation {
                        source_column: col.name.clone(),
                        target_table: t.clone(),
                        target_column: c.clone(),
                    }),
                    ColKind::Scalar(_) => {}
                }
            }
            relations.sort();
            all_relations.insert(table.name.clone(), relations);
        }
        for (name, relations) in all_relations {
            self.tables[&name].relations = relations;
        }
        Ok(())
    }
}

/// Prepend the implicit surrogate `id` column unless the declaration already
/// carries one.
pub(crate) fn surrogate_id() -> Column {
    Column {
        name: "id".to_owned(),
        kind: ColKind::Scalar(SqlType::BigInt),
        not_null: true,
        default: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::loader::decls_from_yaml;

    fn sample() -> Vec<TableDecl> {
        decls_from_yaml(
            r#"
- table: country
  columns:
    name: varchar
  key: [name]
- table: team
  columns:
    name: varchar
    country: m2o country.id
    members: o2m member.team
  key: [name, country]
- table: member
  columns:
    name: varchar
    team: m2o team.id
  key: [name]
"#,
        )
        .unwrap()
    }

    #[test]
    fn build_registry() {
        let schema = Schema::from_declarations(&sample()).unwrap();
        let team = schema.table("team").unwrap();
        assert!(team.column("id").unwrap().is_scalar());
        assert_eq!(team.columns.get_index(0).unwrap().0, "id");
        assert_eq!(team.key, vec!["name", "country"]);
        assert!(team.column("country").unwrap().is_m2o());
        assert!(team.column("members").unwrap().is_o2m());
    }

    #[test]
    fn relations_are_sorted() {
        let schema = Schema::from_declarations(&sample()).unwrap();
        let team = schema.table("team").unwrap();
        assert_eq!(
            team.relations,
            vec![
                Relation {
                    source_column: "country".into(),
                    target_table: "country".into(),
                    target_column: "id".into(),
                },
                Relation {
                    source_column: "members".into(),
                    target_table: "member".into(),
                    target_column: "team".into(),
                },
            ]
        );
    }

    #[test]
    fn missing_target_is_fatal() {
        let decls = decls_from_yaml(
            r#"
- table: team
  columns:
    name: varchar
    country: m2o country.id
  key: [name]
"#,
        )
        .unwrap();
        let err = Schema::from_declarations(&decls).unwrap_err();
        assert!(matches!(err, Error::Schema(_)), "{err}");
    }

    #[test]
    fn key_must_exist_and_be_stored() {
        let decls = decls_from_yaml(
            r#"
- table: team
  columns:
    name: varchar
  key: [label]
"#,
        )
        .unwrap();
        assert!(Schema::from_declarations(&decls).is_err());

        let decls = decls_from_yaml(
            r#"
- table: country
  columns:
    name: varchar
  key: []
"#,
        )
        .unwrap();
        assert!(Schema::from_declarations(&decls).is_err());
    }

    #[test]
    fn m2o_target_must_be_unique() {
        // city.name is only part of a composite key, not unique by itself.
        let decls = decls_from_yaml(
            r#"
- table: city
  columns:
    name: varchar
    country: varchar
  key: [name, country]
- table: office
  columns:
    label: varchar
    city: m2o city.name
  key: [label]
"#,
        )
        .unwrap();
        let err = Schema::from_declarations(&decls).unwrap_err();
        assert!(matches!(err, Error::Schema(_)), "{err}");

        // A single-column natural key or a declared unique index qualifies.
        let decls = decls_from_yaml(
            r#"
- table: country
  columns:
    name: varchar
    code: varchar
  key: [name]
  unique: [[code]]
- table: team
  columns:
    name: varchar
    country: m2o country.name
    homeland: m2o country.code
  key: [name]
"#,
        )
        .unwrap();
        assert!(Schema::from_declarations(&decls).is_ok());
    }

    #[test]
    fn o2m_must_point_at_m2o() {
        let decls = decls_from_yaml(
            r#"
- table: country
  columns:
    name: varchar
    teams: o2m team.name
  key: [name]
- table: team
  columns:
    name: varchar
  key: [name]
"#,
        )
        .unwrap();
        assert!(Schema::from_declarations(&decls).is_err());
    }
}
