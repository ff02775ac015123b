//! Per-flavor dialect shims. All SQL syntax differences between PostgreSQL
//! and SQLite live here: placeholder markers, DDL forms, `ILIKE` and
//! `EXTRACT` translations, catalog queries. The compiler and the view
//! assembly never branch on the flavor themselves.

use crate::error::{Error, Result};
use crate::schema::SqlType;

pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Positional parameter marker, 1-based.
    fn marker(&self, n: usize) -> String {
        let _ = n;
        "?".to_owned()
    }

    fn serial_primary_key(&self) -> &'static str;

    fn type_sql(&self, ty: &SqlType) -> String;

    fn ilike(&self, lhs: &str, rhs: &str) -> String {
        format!("{lhs} ILIKE {rhs}")
    }

    fn extract(&self, unit: &str, operand: &str) -> Result<String>;

    /// Whether `INSERT … SELECT … ON CONFLICT` needs a WHERE clause on the
    /// SELECT to parse (SQLite's join/upsert ambiguity).
    fn upsert_select_needs_where(&self) -> bool {
        false
    }

    fn create_temp_table(&self, name: &str, columns: &[(String, SqlType)]) -> String {
        let cols = columns
            .iter()
            .map(|(name, ty)| format!("\"{name}\" {}", self.type_sql(ty)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TEMP TABLE {name} ({cols})")
    }

    /// Whether `ALTER TABLE … ADD COLUMN … NOT NULL` is accepted without a
    /// default value.
    fn not_null_on_add_column(&self) -> bool {
        true
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {table}")
    }

    /// Statement run before dropping everything, when FK enforcement cannot
    /// simply cascade.
    fn defer_constraints_sql(&self) -> Option<&'static str> {
        None
    }

    // ========================================================================
    // Catalog queries (idempotent DDL + introspection)
    // ========================================================================

    fn existing_tables_sql(&self) -> &'static str;

    fn existing_columns_sql(&self, table: &str) -> String;

    fn existing_indexes_sql(&self) -> &'static str;

    /// `(column_name, type_name, is_nullable 'YES'/'NO')` in ordinal order.
    fn introspect_columns_sql(&self, table: &str) -> String;

    /// `(source_column, target_table, target_column)` for each FK.
    fn introspect_fks_sql(&self, table: &str) -> String;

    /// Column names of one index, in index order.
    fn index_columns_sql(&self, index: &str) -> String;

    fn scalar_type_from_catalog(&self, name: &str) -> SqlType;
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresDialect;

pub static POSTGRES: PostgresDialect = PostgresDialect;

const EXTRACT_UNITS: &[&str] = &[
    "year", "month", "day", "hour", "minute", "second", "dow", "doy", "week", "quarter", "epoch",
];

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn marker(&self, n: usize) -> String {
        format!("${n}")
    }

    fn serial_primary_key(&self) -> &'static str {
        "BIGSERIAL PRIMARY KEY"
    }

    fn type_sql(&self, ty: &SqlType) -> String {
        match ty {
            SqlType::Varchar => "VARCHAR".to_owned(),
            SqlType::Integer => "INTEGER".to_owned(),
            SqlType::BigInt => "BIGINT".to_owned(),
            SqlType::Float => "DOUBLE PRECISION".to_owned(),
            SqlType::Bool => "BOOLEAN".to_owned(),
            SqlType::Date => "DATE".to_owned(),
            SqlType::Timestamp => "TIMESTAMP".to_owned(),
            SqlType::Bytea => "BYTEA".to_owned(),
            SqlType::Array(inner) => format!("{}[]", self.type_sql(inner)),
        }
    }

    fn extract(&self, unit: &str, operand: &str) -> Result<String> {
        if !EXTRACT_UNITS.contains(&unit) {
            return Err(Error::Unsupported(format!("extract unit {unit:?}")));
        }
        if unit == "epoch" {
            // Fractional by nature; everything else truncates to an integer.
            Ok(format!(
                "CAST(EXTRACT(EPOCH FROM {operand}) AS DOUBLE PRECISION)"
            ))
        } else {
            Ok(format!(
                "CAST(EXTRACT({} FROM {operand}) AS BIGINT)",
                unit.to_uppercase()
            ))
        }
    }

    fn create_temp_table(&self, name: &str, columns: &[(String, SqlType)]) -> String {
        let cols = columns
            .iter()
            .map(|(name, ty)| format!("\"{name}\" {}", self.type_sql(ty)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TEMPORARY TABLE {name} ({cols}) ON COMMIT DROP")
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {table} CASCADE")
    }

    fn existing_tables_sql(&self) -> &'static str {
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = current_schema()"
    }

    fn existing_columns_sql(&self, table: &str) -> String {
        format!(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = '{table}'"
        )
    }

    fn existing_indexes_sql(&self) -> &'static str {
        "SELECT indexname FROM pg_indexes WHERE schemaname = current_schema()"
    }

    fn introspect_columns_sql(&self, table: &str) -> String {
        format!(
            "SELECT column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = '{table}' \
             ORDER BY ordinal_position"
        )
    }

    fn introspect_fks_sql(&self, table: &str) -> String {
        format!(
            "SELECT kcu.column_name, ccu.table_name, ccu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON tc.constraint_name = ccu.constraint_name \
              AND tc.table_schema = ccu.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' \
               AND tc.table_schema = current_schema() \
               AND tc.table_name = '{table}'"
        )
    }

    fn index_columns_sql(&self, index: &str) -> String {
        format!(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_class ic ON ic.oid = i.indexrelid \
             CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum \
             WHERE ic.relname = '{index}' \
             ORDER BY k.ord"
        )
    }

    fn scalar_type_from_catalog(&self, name: &str) -> SqlType {
        match name {
            "integer" | "smallint" => SqlType::Integer,
            "bigint" => SqlType::BigInt,
            "double precision" | "real" | "numeric" => SqlType::Float,
            "boolean" => SqlType::Bool,
            "date" => SqlType::Date,
            "timestamp without time zone" | "timestamp with time zone" => SqlType::Timestamp,
            "bytea" => SqlType::Bytea,
            "ARRAY" => SqlType::Array(Box::new(SqlType::Varchar)),
            _ => SqlType::Varchar,
        }
    }
}

// ============================================================================
// SQLite
// ============================================================================

pub struct SqliteDialect;

pub static SQLITE: SqliteDialect = SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn serial_primary_key(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }

    fn type_sql(&self, ty: &SqlType) -> String {
        match ty {
            SqlType::Varchar => "VARCHAR".to_owned(),
            SqlType::Integer => "INTEGER".to_owned(),
            SqlType::BigInt => "BIGINT".to_owned(),
            SqlType::Float => "REAL".to_owned(),
            SqlType::Bool => "BOOLEAN".to_owned(),
            SqlType::Date => "DATE".to_owned(),
            SqlType::Timestamp => "TIMESTAMP".to_owned(),
            SqlType::Bytea => "BLOB".to_owned(),
            // No native arrays; stored as JSON text.
            SqlType::Array(_) => "TEXT".to_owned(),
        }
    }

    fn ilike(&self, lhs: &str, rhs: &str) -> String {
        format!("{lhs} LIKE {rhs} COLLATE NOCASE")
    }

    fn upsert_select_needs_where(&self) -> bool {
        true
    }

    // SQLite refuses an added NOT NULL column unless it carries a non-NULL
    // default, empty table or not.
    fn not_null_on_add_column(&self) -> bool {
        false
    }

    fn extract(&self, unit: &str, operand: &str) -> Result<String> {
        let fmt = match unit {
            "year" => "%Y",
            "month" => "%m",
            "day" => "%d",
            "hour" => "%H",
            "minute" => "%M",
            "second" => "%S",
            "dow" => "%w",
            "doy" => "%j",
            "week" => "%W",
            "epoch" => "%s",
            "quarter" => {
                return Ok(format!(
                    "((CAST(strftime('%m', {operand}) AS INTEGER) + 2) / 3)"
                ))
            }
            other => return Err(Error::Unsupported(format!("extract unit {other:?}"))),
        };
        Ok(format!(
            "CAST(strftime('{fmt}', {operand}) AS INTEGER)"
        ))
    }

    fn defer_constraints_sql(&self) -> Option<&'static str> {
        Some("PRAGMA defer_foreign_keys = ON")
    }

    fn existing_tables_sql(&self) -> &'static str {
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'"
    }

    fn existing_columns_sql(&self, table: &str) -> String {
        format!("SELECT name FROM pragma_table_info('{table}')")
    }

    fn existing_indexes_sql(&self) -> &'static str {
        "SELECT name FROM sqlite_master WHERE type = 'index'"
    }

    fn introspect_columns_sql(&self, table: &str) -> String {
        format!(
            "SELECT name, type, CASE \"notnull\" WHEN 1 THEN 'NO' ELSE 'YES' END \
             FROM pragma_table_info('{table}') ORDER BY cid"
        )
    }

    fn introspect_fks_sql(&self, table: &str) -> String {
        format!(
            "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list('{table}')"
        )
    }

    fn index_columns_sql(&self, index: &str) -> String {
        format!("SELECT name FROM pragma_index_info('{index}') ORDER BY seqno")
    }

    fn scalar_type_from_catalog(&self, name: &str) -> SqlType {
        match name.to_uppercase().as_str() {
            "INTEGER" | "INT" => SqlType::Integer,
            "BIGINT" => SqlType::BigInt,
            "REAL" | "DOUBLE" | "FLOAT" => SqlType::Float,
            "BOOLEAN" | "BOOL" => SqlType::Bool,
            "DATE" => SqlType::Date,
            "TIMESTAMP" | "DATETIME" => SqlType::Timestamp,
            "BLOB" => SqlType::Bytea,
            _ => SqlType::Varchar,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_diverge() {
        assert_eq!(POSTGRES.marker(2), "$2");
        assert_eq!(SQLITE.marker(2), "?");
    }

    #[test]
    fn ilike_falls_back_on_sqlite() {
        assert_eq!(POSTGRES.ilike("a", "$1"), "a ILIKE $1");
        assert_eq!(SQLITE.ilike("a", "?"), "a LIKE ? COLLATE NOCASE");
    }

    #[test]
    fn extract_translation() {
        assert_eq!(
            POSTGRES.extract("year", "event.date").unwrap(),
            "CAST(EXTRACT(YEAR FROM event.date) AS BIGINT)"
        );
        assert_eq!(
            SQLITE.extract("year", "event.date").unwrap(),
            "CAST(strftime('%Y', event.date) AS INTEGER)"
        );
        assert!(POSTGRES.extract("banana", "x").is_err());
    }

    #[test]
    fn array_type_mapping() {
        let ty = SqlType::Array(Box::new(SqlType::Varchar));
        assert_eq!(POSTGRES.type_sql(&ty), "VARCHAR[]");
        assert_eq!(SQLITE.type_sql(&ty), "TEXT");
    }
}
