//! Table creation, teardown and catalog introspection.
//!
//! `create_tables` is idempotent against a live schema: it reads the catalog
//! first and only creates what is missing. Foreign-key columns are added via
//! `ALTER TABLE` after every base table exists, so cyclic references work.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::engine::Scope;
use crate::error::Result;
use crate::schema::{ColKind, Column, Schema, SqlType, Table};
use crate::value::Value;

fn text(v: &Value) -> String {
    match v {
        Value::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn fetch_names(scope: &mut Scope<'_>, sql: &str) -> Result<HashSet<String>> {
    let rows = scope.fetch_all(sql, &[]).await?;
    Ok(rows.iter().map(|row| text(&row[0])).collect())
}

fn column_ddl(scope: &Scope<'_>, column: &Column, ty: &SqlType) -> String {
    let mut ddl = format!("{} {}", column.name, scope.dialect().type_sql(ty));
    if column.not_null {
        ddl.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        match ty {
            SqlType::Varchar | SqlType::Date | SqlType::Timestamp => {
                ddl.push_str(&format!(" DEFAULT '{}'", default.replace('\'', "''")))
            }
            _ => ddl.push_str(&format!(" DEFAULT {default}")),
        }
    }
    ddl
}

fn index_name(table: &Table, columns: &[String]) -> String {
    format!("{}_{}_idx", table.name, columns.join("_"))
}

/// Create missing tables, then missing FK columns, then missing unique
/// indexes, in that order.
pub async fn create_tables(scope: &mut Scope<'_>) -> Result<()> {
    let schema = scope.schema_arc();
    let dialect = scope.dialect();
    let existing = fetch_names(scope, dialect.existing_tables_sql()).await?;

    // Base tables with their scalar columns.
    for table in schema.tables() {
        if existing.contains(&table.name) {
            let have = fetch_names(scope, &dialect.existing_columns_sql(&table.name)).await?;
            for column in table.stored_columns() {
                if have.contains(&column.name) {
                    continue;
                }
                let sql = match &column.kind {
                    ColKind::Scalar(ty) => format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        table.name,
                        column_ddl(scope, column, ty)
                    ),
                    ColKind::ManyToOne { table: t, column: c } => format!(
                        "ALTER TABLE {} ADD COLUMN {} BIGINT REFERENCES {t} ({c}) \
                         ON DELETE CASCADE",
                        table.name, column.name
                    ),
                    ColKind::OneToMany { .. } => continue,
                };
                scope.execute(&sql, &[]).await?;
            }
            continue;
        }

        let mut cols = vec![format!("id {}", dialect.serial_primary_key())];
        for column in table.stored_columns() {
            if column.name == "id" {
                continue;
            }
            if let ColKind::Scalar(ty) = &column.kind {
                cols.push(column_ddl(scope, column, ty));
            }
        }
        let sql = format!("CREATE TABLE {} ({})", table.name, cols.join(", "));
        scope.execute(&sql, &[]).await?;
        tracing::info!(table = %table.name, "created table");
    }

    // FK columns, now that every target exists. The table is fresh and
    // empty here, so a declared `not null` can be enforced where the
    // backend accepts it on ADD COLUMN.
    for table in schema.tables() {
        if existing.contains(&table.name) {
            // Handled above with the other missing columns.
            continue;
        }
        for column in table.columns.values() {
            if let ColKind::ManyToOne { table: t, column: c } = &column.kind {
                let not_null = if column.not_null && dialect.not_null_on_add_column() {
                    " NOT NULL"
                } else {
                    ""
                };
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} BIGINT{not_null} REFERENCES {t} ({c}) \
                     ON DELETE CASCADE",
                    table.name, column.name
                );
                scope.execute(&sql, &[]).await?;
            }
        }
    }

    // Natural-key and secondary unique indexes.
    let indexes = fetch_names(scope, dialect.existing_indexes_sql()).await?;
    for table in schema.tables() {
        let key_index = format!("unique_index_{}", table.name);
        if !indexes.contains(&key_index) {
            let sql = format!(
                "CREATE UNIQUE INDEX {key_index} ON {} ({})",
                table.name,
                table.key.join(", ")
            );
            scope.execute(&sql, &[]).await?;
        }
        for columns in &table.unique {
            let name = index_name(table, columns);
            if !indexes.contains(&name) {
                let sql = format!(
                    "CREATE UNIQUE INDEX {name} ON {} ({})",
                    table.name,
                    columns.join(", ")
                );
                scope.execute(&sql, &[]).await?;
            }
        }
    }
    Ok(())
}

/// Drop every declared table, children before parents where dependencies
/// allow; cycles are handled by the dialect (CASCADE or deferral).
pub async fn drop_tables(scope: &mut Scope<'_>) -> Result<()> {
    let schema = scope.schema_arc();
    let dialect = scope.dialect();
    if let Some(sql) = dialect.defer_constraints_sql() {
        scope.execute(sql, &[]).await?;
    }
    let mut names: Vec<String> = schema.tables().map(|t| t.name.clone()).collect();
    names.reverse();
    for name in names {
        scope.execute(&dialect.drop_table_sql(&name), &[]).await?;
    }
    Ok(())
}

/// Fabricate a schema object from catalog rows: tables, column types,
/// foreign keys, natural keys recovered from `unique_index_<table>`, and
/// secondary unique indexes recovered from the `<table>_…_idx` naming.
/// `o2m` declarations are virtual and cannot be recovered.
pub async fn introspect(scope: &mut Scope<'_>) -> Result<Schema> {
    let dialect = scope.dialect();
    let mut table_names: Vec<String> = fetch_names(scope, dialect.existing_tables_sql())
        .await?
        .into_iter()
        .collect();
    table_names.sort();
    let visible: HashSet<String> = table_names.iter().cloned().collect();
    let mut index_names: Vec<String> = fetch_names(scope, dialect.existing_indexes_sql())
        .await?
        .into_iter()
        .collect();
    index_names.sort();

    let mut tables = IndexMap::new();
    for name in &table_names {
        let mut fks: IndexMap<String, (String, String)> = IndexMap::new();
        for row in scope
            .fetch_all(&dialect.introspect_fks_sql(name), &[])
            .await?
        {
            let target_table = text(&row[1]);
            if visible.contains(&target_table) {
                fks.insert(text(&row[0]), (target_table, text(&row[2])));
            }
        }

        let mut columns = IndexMap::new();
        for row in scope
            .fetch_all(&dialect.introspect_columns_sql(name), &[])
            .await?
        {
            let col_name = text(&row[0]);
            let kind = match fks.get(&col_name) {
                Some((t, c)) => ColKind::ManyToOne {
                    table: t.clone(),
                    column: c.clone(),
                },
                None => ColKind::Scalar(dialect.scalar_type_from_catalog(&text(&row[1]))),
            };
            columns.insert(
                col_name.clone(),
                Column {
                    name: col_name,
                    kind,
                    not_null: text(&row[2]) == "NO",
                    default: None,
                },
            );
        }

        let mut key = Vec::new();
        for row in scope
            .fetch_all(&dialect.index_columns_sql(&format!("unique_index_{name}")), &[])
            .await?
        {
            key.push(text(&row[0]));
        }
        if key.is_empty() {
            key.push("id".to_owned());
        }

        let mut unique = Vec::new();
        for idx in &index_names {
            if !idx.starts_with(&format!("{name}_")) || !idx.ends_with("_idx") {
                continue;
            }
            let cols: Vec<String> = scope
                .fetch_all(&dialect.index_columns_sql(idx), &[])
                .await?
                .iter()
                .map(|row| text(&row[0]))
                .collect();
            if !cols.is_empty() {
                unique.push(cols);
            }
        }

        tables.insert(
            name.clone(),
            Table {
                name: name.clone(),
                columns,
                key,
                unique,
                relations: Vec::new(),
            },
        );
    }
    Schema::assemble(tables)
}
