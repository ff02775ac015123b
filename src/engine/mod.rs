//! Process handle, configuration and transaction scopes.
//!
//! A [`Tanker`] owns the connection pool, the schema registry (built once at
//! connect time) and the head registry. All reads and writes happen inside a
//! [`Scope`]: a transaction acquired with [`Tanker::begin`], committed or
//! rolled back explicitly. A scope whose transaction is gone rejects every
//! call with [`Error::NotInScope`].

pub mod backend;

use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, PgPool, Row, SqlitePool, TypeInfo, ValueRef};

use crate::engine::backend::{Dialect, POSTGRES, SQLITE};
use crate::error::{Error, Result};
use crate::expr::compile::HeadRegistry;
use crate::expr::Expr;
use crate::schema::{self, Schema, TableDecl};
use crate::value::Value;
use crate::view::View;

/// Connection-level configuration. The `db_uri` scheme selects the dialect;
/// any key that is not recognized is kept and usable as `{key}` in
/// expressions.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_uri: String,
    #[serde(default)]
    pub schema: Vec<TableDecl>,
    #[serde(default, rename = "acl-read")]
    pub acl_read: IndexMap<String, String>,
    #[serde(default, rename = "acl-write")]
    pub acl_write: IndexMap<String, String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default, flatten)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl Config {
    pub fn new(db_uri: impl Into<String>) -> Config {
        Config {
            db_uri: db_uri.into(),
            schema: Vec::new(),
            acl_read: IndexMap::new(),
            acl_write: IndexMap::new(),
            max_connections: None,
            values: serde_json::Map::new(),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Config> {
        serde_yaml::from_str(text).map_err(|e| Error::Schema(format!("bad config: {e}")))
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Schema(format!("cannot read config: {e}")))?;
        Config::from_yaml(&text)
    }

    pub fn schema_yaml(mut self, yaml: &str) -> Result<Config> {
        self.schema = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Schema(format!("bad schema file: {e}")))?;
        Ok(self)
    }

    pub fn acl_read(mut self, table: &str, filter: &str) -> Config {
        self.acl_read.insert(table.to_owned(), filter.to_owned());
        self
    }

    pub fn acl_write(mut self, table: &str, filter: &str) -> Config {
        self.acl_write.insert(table.to_owned(), filter.to_owned());
        self
    }

    pub fn value(mut self, key: &str, value: serde_json::Value) -> Config {
        self.values.insert(key.to_owned(), value);
        self
    }
}

enum Db {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

pub(crate) enum Tx {
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>),
}

/// Process-wide handle: pool, dialect shim, schema registry, head registry.
pub struct Tanker {
    db: Db,
    dialect: &'static dyn Dialect,
    schema: Arc<Schema>,
    heads: HeadRegistry,
    config: Arc<Config>,
}

impl Tanker {
    pub async fn connect(config: Config) -> Result<Tanker> {
        let schema = Arc::new(Schema::from_declarations(&config.schema)?);
        let max = config.max_connections.unwrap_or(5);
        let (uri, fragment) = match config.db_uri.split_once('#') {
            Some((uri, fragment)) => (uri.to_owned(), Some(fragment.to_owned())),
            None => (config.db_uri.clone(), None),
        };

        let (db, dialect): (Db, &'static dyn Dialect) = if uri.starts_with("postgres") {
            let mut options = PgPoolOptions::new().max_connections(max);
            if let Some(pg_schema) = fragment {
                options = options.after_connect(move |conn, _meta| {
                    let pg_schema = pg_schema.clone();
                    Box::pin(async move {
                        let sql = format!("SET search_path TO {pg_schema}");
                        sqlx::query(&sql).execute(conn).await?;
                        Ok(())
                    })
                });
            }
            let pool = options.connect(&uri).await.map_err(Error::from_driver)?;
            (Db::Postgres(pool), &POSTGRES)
        } else if uri.starts_with("sqlite") {
            let options = SqliteConnectOptions::from_str(&uri)
                .map_err(Error::from_driver)?
                .create_if_missing(true)
                .foreign_keys(true);
            // A pooled in-memory database would be one database per
            // connection.
            let in_memory = uri.contains(":memory:") || uri.contains("mode=memory");
            let pool = SqlitePoolOptions::new()
                .max_connections(if in_memory { 1 } else { max })
                .connect_with(options)
                .await
                .map_err(Error::from_driver)?;
            (Db::Sqlite(pool), &SQLITE)
        } else {
            return Err(Error::Schema(format!(
                "db_uri scheme not recognized: {:?}",
                config.db_uri
            )));
        };

        tracing::info!(dialect = dialect.name(), "connected");
        Ok(Tanker {
            db,
            dialect,
            schema,
            heads: HeadRegistry::builtin(),
            config: Arc::new(config),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn dialect_name(&self) -> &'static str {
        self.dialect.name()
    }

    /// Register an expression head before compiling views through this
    /// handle. Shadows the builtin of the same name, if any.
    pub fn register_head<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut crate::expr::compile::QueryBuild, &[Expr]) -> Result<String>
            + Send
            + Sync
            + 'static,
    {
        self.heads.register(name, f);
    }

    /// Open a transaction scope.
    pub async fn begin(&self) -> Result<Scope<'_>> {
        let tx = match &self.db {
            Db::Postgres(pool) => Tx::Postgres(pool.begin().await.map_err(Error::from_driver)?),
            Db::Sqlite(pool) => Tx::Sqlite(pool.begin().await.map_err(Error::from_driver)?),
        };
        Ok(Scope {
            tanker: self,
            tx: Some(tx),
            savepoints: 0,
        })
    }

    /// Create missing tables, columns and natural-key indexes.
    pub async fn create_tables(&self) -> Result<()> {
        let mut scope = self.begin().await?;
        schema::create_tables(&mut scope).await?;
        scope.commit().await
    }

    /// Drop every declared table.
    pub async fn drop_tables(&self) -> Result<()> {
        let mut scope = self.begin().await?;
        schema::drop_tables(&mut scope).await?;
        scope.commit().await
    }

    /// Fabricate a schema object from the live catalog.
    pub async fn introspect(&self) -> Result<Schema> {
        let mut scope = self.begin().await?;
        let schema = schema::introspect(&mut scope).await?;
        scope.rollback().await?;
        Ok(schema)
    }
}

/// One transaction. Holds the connection for its lifetime; commit and
/// rollback consume the transaction, and later calls fail with
/// [`Error::NotInScope`].
pub struct Scope<'t> {
    tanker: &'t Tanker,
    tx: Option<Tx>,
    savepoints: usize,
}

impl<'t> Scope<'t> {
    pub fn view(&mut self, table: &str) -> Result<View<'_, 't>> {
        self.tanker.schema.table(table)?;
        Ok(View::new(self, table))
    }

    pub(crate) fn schema(&self) -> &Schema {
        &self.tanker.schema
    }

    pub(crate) fn schema_arc(&self) -> Arc<Schema> {
        Arc::clone(&self.tanker.schema)
    }

    pub(crate) fn dialect(&self) -> &'static dyn Dialect {
        self.tanker.dialect
    }

    pub(crate) fn heads(&self) -> &HeadRegistry {
        &self.tanker.heads
    }

    pub(crate) fn config(&self) -> &Config {
        &self.tanker.config
    }

    pub async fn commit(mut self) -> Result<()> {
        match self.tx.take().ok_or(Error::NotInScope)? {
            Tx::Postgres(tx) => tx.commit().await.map_err(Error::from_driver),
            Tx::Sqlite(tx) => tx.commit().await.map_err(Error::from_driver),
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        match self.tx.take().ok_or(Error::NotInScope)? {
            Tx::Postgres(tx) => tx.rollback().await.map_err(Error::from_driver),
            Tx::Sqlite(tx) => tx.rollback().await.map_err(Error::from_driver),
        }
    }

    /// Nested scopes are savepoints; each `begin_nested` pairs with either
    /// `commit_nested` or `rollback_nested`.
    pub async fn begin_nested(&mut self) -> Result<()> {
        let name = format!("sp_{}", self.savepoints + 1);
        self.execute(&format!("SAVEPOINT {name}"), &[]).await?;
        self.savepoints += 1;
        Ok(())
    }

    pub async fn commit_nested(&mut self) -> Result<()> {
        let name = self.pop_savepoint()?;
        self.execute(&format!("RELEASE SAVEPOINT {name}"), &[]).await?;
        Ok(())
    }

    pub async fn rollback_nested(&mut self) -> Result<()> {
        let name = self.pop_savepoint()?;
        self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await?;
        self.execute(&format!("RELEASE SAVEPOINT {name}"), &[]).await?;
        Ok(())
    }

    fn pop_savepoint(&mut self) -> Result<String> {
        if self.savepoints == 0 {
            return Err(Error::NotInScope);
        }
        let name = format!("sp_{}", self.savepoints);
        self.savepoints -= 1;
        Ok(name)
    }

    fn tx_mut(&mut self) -> Result<&mut Tx> {
        self.tx.as_mut().ok_or(Error::NotInScope)
    }

    /// Roll back after a driver failure; later calls see `NotInScope`.
    async fn poison(&mut self) {
        if let Some(tx) = self.tx.take() {
            let outcome = match tx {
                Tx::Postgres(tx) => tx.rollback().await,
                Tx::Sqlite(tx) => tx.rollback().await,
            };
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "rollback after failure");
            }
        }
    }

    pub(crate) async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        tracing::debug!(target: "tanker::sql", sql, params = params.len());
        let outcome = match self.tx_mut()? {
            Tx::Postgres(tx) => bind_pg(sqlx::query(sql), params)
                .execute(&mut **tx)
                .await
                .map(|r| r.rows_affected()),
            Tx::Sqlite(tx) => bind_sqlite(sqlx::query(sql), params)
                .execute(&mut **tx)
                .await
                .map(|r| r.rows_affected()),
        };
        match outcome {
            Ok(n) => Ok(n),
            Err(e) => {
                self.poison().await;
                Err(Error::from_driver(e))
            }
        }
    }

    pub(crate) async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        tracing::debug!(target: "tanker::sql", sql, params = params.len());
        let outcome = match self.tx_mut()? {
            Tx::Postgres(tx) => {
                match bind_pg(sqlx::query(sql), params).fetch_all(&mut **tx).await {
                    Ok(rows) => rows.iter().map(decode_pg_row).collect::<Result<Vec<_>>>(),
                    Err(e) => Err(Error::from_driver(e)),
                }
            }
            Tx::Sqlite(tx) => {
                match bind_sqlite(sqlx::query(sql), params)
                    .fetch_all(&mut **tx)
                    .await
                {
                    Ok(rows) => rows.iter().map(decode_sqlite_row).collect::<Result<Vec<_>>>(),
                    Err(e) => Err(Error::from_driver(e)),
                }
            }
        };
        match outcome {
            Ok(rows) => Ok(rows),
            Err(e) => {
                self.poison().await;
                Err(e)
            }
        }
    }

    /// Bulk-load rows into a (temp) table: `COPY … FROM STDIN (FORMAT csv)`
    /// on Postgres, chunked multi-row inserts on SQLite.
    pub(crate) async fn bulk_load(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
        if matches!(self.tx_mut()?, Tx::Postgres(_)) {
            let copy_sql = format!(
                "COPY {table} ({}) FROM STDIN (FORMAT csv)",
                quoted.join(", ")
            );
            tracing::debug!(target: "tanker::sql", sql = %copy_sql, rows = rows.len());
            let payload = copy_payload(rows);
            let outcome = match self.tx_mut()? {
                Tx::Postgres(tx) => {
                    async {
                        let mut sink = (&mut **tx).copy_in_raw(&copy_sql).await?;
                        sink.send(payload.as_bytes()).await?;
                        sink.finish().await?;
                        Ok::<_, sqlx::Error>(())
                    }
                    .await
                }
                Tx::Sqlite(_) => unreachable!("checked above"),
            };
            if let Err(e) = outcome {
                self.poison().await;
                return Err(Error::from_driver(e));
            }
        } else {
            // Chunk against the default host-variable limit.
            let per_chunk = (999 / columns.len().max(1)).max(1);
            let row_markers = format!("({})", vec!["?"; columns.len()].join(", "));
            for chunk in rows.chunks(per_chunk) {
                let sql = format!(
                    "INSERT INTO {table} ({}) VALUES {}",
                    quoted.join(", "),
                    vec![row_markers.as_str(); chunk.len()].join(", ")
                );
                let flat: Vec<Value> =
                    chunk.iter().flat_map(|row| row.iter().cloned()).collect();
                self.execute(&sql, &flat).await?;
            }
        }
        tracing::info!(table, rows = rows.len(), "staged rows");
        Ok(())
    }
}

// ============================================================================
// Parameter binding and row decoding per flavor
// ============================================================================

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_pg<'q>(mut q: PgQuery<'q>, params: &[Value]) -> PgQuery<'q> {
    for p in params {
        q = match p {
            Value::Null => q.bind(None::<String>),
            Value::Bool(b) => q.bind(*b),
            Value::Int(i) => q.bind(*i),
            Value::Float(x) => q.bind(*x),
            Value::Text(s) => q.bind(s.clone()),
            Value::Bytes(b) => q.bind(b.clone()),
            Value::Date(d) => q.bind(*d),
            Value::Timestamp(t) => q.bind(*t),
        };
    }
    q
}

fn bind_sqlite<'q>(mut q: SqliteQuery<'q>, params: &[Value]) -> SqliteQuery<'q> {
    for p in params {
        q = match p {
            Value::Null => q.bind(None::<String>),
            Value::Bool(b) => q.bind(*b),
            Value::Int(i) => q.bind(*i),
            Value::Float(x) => q.bind(*x),
            Value::Text(s) => q.bind(s.clone()),
            Value::Bytes(b) => q.bind(b.clone()),
            Value::Date(d) => q.bind(*d),
            Value::Timestamp(t) => q.bind(*t),
        };
    }
    q
}

fn decode_pg_row(row: &PgRow) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(row.len());
    for (i, col) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            out.push(Value::Null);
            continue;
        }
        let ty = col.type_info().name().to_owned();
        let value = match ty.as_str() {
            "BOOL" => Value::Bool(row.try_get(i)?),
            "INT2" => Value::Int(row.try_get::<i16, _>(i)? as i64),
            "INT4" => Value::Int(row.try_get::<i32, _>(i)? as i64),
            "INT8" => Value::Int(row.try_get(i)?),
            "FLOAT4" => Value::Float(row.try_get::<f32, _>(i)? as f64),
            "FLOAT8" => Value::Float(row.try_get(i)?),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get(i)?),
            "BYTEA" => Value::Bytes(row.try_get(i)?),
            "DATE" => Value::Date(row.try_get(i)?),
            "TIMESTAMP" => Value::Timestamp(row.try_get(i)?),
            "TIMESTAMPTZ" => Value::Timestamp(
                row.try_get::<chrono::DateTime<chrono::Utc>, _>(i)?.naive_utc(),
            ),
            "TEXT[]" | "VARCHAR[]" => {
                let items: Vec<String> = row.try_get(i)?;
                Value::Text(json_text(&items)?)
            }
            "INT8[]" => {
                let items: Vec<i64> = row.try_get(i)?;
                Value::Text(json_text(&items)?)
            }
            "INT4[]" => {
                let items: Vec<i32> = row.try_get(i)?;
                Value::Text(json_text(&items)?)
            }
            other => return Err(Error::Unsupported(format!("column type {other}"))),
        };
        out.push(value);
    }
    Ok(out)
}

fn json_text<T: serde::Serialize>(items: &T) -> Result<String> {
    serde_json::to_string(items).map_err(|e| Error::Unsupported(e.to_string()))
}

fn decode_sqlite_row(row: &SqliteRow) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            out.push(Value::Null);
            continue;
        }
        let ty = raw.type_info().name().to_owned();
        let value = match ty.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "NUMERIC" => Value::Int(row.try_get(i)?),
            "REAL" => Value::Float(row.try_get(i)?),
            "BOOLEAN" => Value::Bool(row.try_get(i)?),
            "TEXT" | "DATE" | "DATETIME" | "TIME" => Value::Text(row.try_get(i)?),
            "BLOB" => Value::Bytes(row.try_get(i)?),
            other => return Err(Error::Unsupported(format!("column type {other}"))),
        };
        out.push(value);
    }
    Ok(out)
}

/// CSV payload for `COPY … (FORMAT csv)`. NULL is the empty unquoted field;
/// text is always quoted so empty strings survive.
fn copy_payload(rows: &[Vec<Value>]) -> String {
    let mut out = String::new();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            match value {
                Value::Null => {}
                Value::Bool(b) => out.push_str(if *b { "t" } else { "f" }),
                Value::Int(n) => out.push_str(&n.to_string()),
                Value::Float(x) => out.push_str(&x.to_string()),
                Value::Text(s) => {
                    out.push('"');
                    out.push_str(&s.replace('"', "\"\""));
                    out.push('"');
                }
                Value::Bytes(_) | Value::Date(_) | Value::Timestamp(_) => {
                    out.push_str(&value.to_string())
                }
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_payload_quotes_text_and_leaves_null_empty() {
        let rows = vec![
            vec![Value::Text("a,b".into()), Value::Null, Value::Int(3)],
            vec![Value::Text(String::new()), Value::Bool(true), Value::Float(1.5)],
        ];
        assert_eq!(copy_payload(&rows), "\"a,b\",,3\n\"\",t,1.5\n");
    }

    #[test]
    fn config_keeps_unknown_keys_as_values() {
        let config = Config::from_yaml(
            r#"
db_uri: "sqlite::memory:"
tenant: acme
"#,
        )
        .unwrap();
        assert_eq!(
            config.values.get("tenant"),
            Some(&serde_json::Value::String("acme".into()))
        );
    }
}
