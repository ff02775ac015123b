//! Views: declarative projections over one base table, with dotted paths,
//! s-expression fields and filters, argument bindings, and batched writes.
//! A view owns no state across calls; every read or write is one statement.

pub(crate) mod read;
pub(crate) mod resolve;
pub(crate) mod write;

pub use read::Rows;

use crate::engine::Scope;
use crate::error::{Error, Result};
use crate::expr::{reader, Expr};
use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) struct FieldSpec {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone)]
enum FilterSrc {
    Text(String),
    Ast(Expr),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ViewSpec {
    pub table: String,
    pub fields: Vec<FieldSpec>,
    pub filters: Vec<Expr>,
    pub order: Vec<(String, Option<String>)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Builder over one base table, bound to a scope. Compilation errors
/// surface when the terminal call (`read`, `write`, `delete`) runs, before
/// any SQL is sent.
pub struct View<'s, 't> {
    scope: &'s mut Scope<'t>,
    table: String,
    fields: Vec<FieldSpec>,
    filters: Vec<FilterSrc>,
    order: Vec<(String, Option<String>)>,
    limit: Option<u64>,
    offset: Option<u64>,
    named: serde_json::Map<String, serde_json::Value>,
    positional: Vec<serde_json::Value>,
    eq_counter: usize,
}

impl<'s, 't> View<'s, 't> {
    pub(crate) fn new(scope: &'s mut Scope<'t>, table: &str) -> View<'s, 't> {
        View {
            scope,
            table: table.to_owned(),
            fields: Vec::new(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            named: serde_json::Map::new(),
            positional: Vec::new(),
            eq_counter: 0,
        }
    }

    /// Add fields; each is both the output name and the source (a dotted
    /// path, or an s-expression when it starts with `(`).
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for f in fields {
            let f = f.as_ref();
            self.fields.push(FieldSpec {
                name: f.to_owned(),
                source: f.to_owned(),
            });
        }
        self
    }

    /// Add one named field with an explicit source expression.
    pub fn field(mut self, name: &str, source: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_owned(),
            source: source.to_owned(),
        });
        self
    }

    /// Add a filter; multiple filters are conjoined.
    pub fn filter(mut self, filter: &str) -> Self {
        self.filters.push(FilterSrc::Text(filter.to_owned()));
        self
    }

    /// Mapping sugar: `column = value`, conjoined with other filters.
    pub fn filter_eq(mut self, column: &str, value: serde_json::Value) -> Self {
        let key = format!("__eq{}", self.eq_counter);
        self.eq_counter += 1;
        self.named.insert(key.clone(), value);
        self.filters.push(FilterSrc::Ast(Expr::List(vec![
            Expr::sym("="),
            Expr::sym(column),
            Expr::Placeholder(vec![key]),
        ])));
        self
    }

    /// Bind one named argument, referenced as `{name}`.
    pub fn arg(mut self, name: &str, value: serde_json::Value) -> Self {
        self.named.insert(name.to_owned(), value);
        self
    }

    /// Merge a mapping of named arguments.
    pub fn args(mut self, values: serde_json::Map<String, serde_json::Value>) -> Self {
        self.named.extend(values);
        self
    }

    /// Append one positional argument, consumed by `{}` in order.
    pub fn bind(mut self, value: serde_json::Value) -> Self {
        self.positional.push(value);
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order.push((field.to_owned(), None));
        self
    }

    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order.push((field.to_owned(), Some("desc".to_owned())));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    /// The effective field list: what was declared, or every stored column
    /// of the base table.
    fn effective_fields(&self) -> Result<Vec<FieldSpec>> {
        if !self.fields.is_empty() {
            return Ok(self.fields.clone());
        }
        let table = self.scope.schema().table(&self.table)?;
        Ok(table
            .stored_columns()
            .map(|c| FieldSpec {
                name: c.name.clone(),
                source: c.name.clone(),
            })
            .collect())
    }

    fn build_spec(&self) -> Result<ViewSpec> {
        let mut filters = Vec::new();
        for f in &self.filters {
            match f {
                FilterSrc::Text(text) => filters.push(reader::parse(text)?),
                FilterSrc::Ast(ast) => filters.push(ast.clone()),
            }
        }
        Ok(ViewSpec {
            table: self.table.clone(),
            fields: self.effective_fields()?,
            filters,
            order: self.order.clone(),
            limit: self.limit,
            offset: self.offset,
        })
    }

    /// Compile and run the SELECT; returns the materialised result handle.
    pub async fn read(self) -> Result<Rows> {
        let spec = self.build_spec()?;
        let select = read::build_select(
            self.scope.schema(),
            self.scope.dialect(),
            self.scope.heads(),
            &self.scope.config().acl_read,
            &spec,
            &self.named,
            &self.scope.config().values,
            &self.positional,
        )?;
        let rows = self.scope.fetch_all(&select.sql, &select.params).await?;
        Ok(Rows::new(select.names, rows))
    }

    /// Stage rows, resolve foreign keys by natural key, and apply one
    /// upsert keyed on the target's natural key.
    ///
    /// When an ACL-write filter is configured, rows that fail it are
    /// skipped; an update moving a row out of the ACL is indistinguishable
    /// from a disallowed insert.
    pub async fn write(self, rows: Vec<Vec<Value>>) -> Result<u64> {
        let spec = self.build_spec()?;
        check_widths(&spec, &rows)?;
        let plan = write::build_upsert(
            self.scope.schema(),
            self.scope.dialect(),
            self.scope.heads(),
            &self.scope.config().acl_write,
            &spec,
            &self.named,
            &self.scope.config().values,
            &self.positional,
        )?;
        let affected = self.run_staged(&plan, rows).await?;
        tracing::info!(table = %spec.table, rows = affected, "write");
        Ok(affected)
    }

    /// Columnar write: a mapping from field name to values, transposed.
    pub async fn write_columns(
        mut self,
        columns: indexmap::IndexMap<String, Vec<Value>>,
    ) -> Result<u64> {
        let mut len = None;
        for (name, values) in &columns {
            match len {
                None => len = Some(values.len()),
                Some(n) if n == values.len() => {}
                Some(n) => {
                    return Err(Error::Arg(format!(
                        "column {name:?} has {} values, expected {n}",
                        values.len()
                    )))
                }
            }
        }
        if self.fields.is_empty() {
            self.fields = columns
                .keys()
                .map(|name| FieldSpec {
                    name: name.clone(),
                    source: name.clone(),
                })
                .collect();
        }
        let names: Vec<&String> = self.fields.iter().map(|f| &f.source).collect();
        let mut ordered = Vec::with_capacity(names.len());
        for name in names {
            let values = columns
                .get(name)
                .ok_or_else(|| Error::Arg(format!("no column {name:?} in input")))?;
            ordered.push(values.clone());
        }
        let rows = (0..len.unwrap_or(0))
            .map(|i| ordered.iter().map(|col| col[i].clone()).collect())
            .collect();
        self.write(rows).await
    }

    /// Delete rows matching the view's filter.
    pub async fn delete(self) -> Result<u64> {
        let spec = self.build_spec()?;
        let (sql, params) = write::build_delete_by_filter(
            self.scope.schema(),
            self.scope.dialect(),
            self.scope.heads(),
            &spec,
            &self.named,
            &self.scope.config().values,
            &self.positional,
        )?;
        let affected = self.scope.execute(&sql, &params).await?;
        tracing::info!(table = %spec.table, rows = affected, "delete");
        Ok(affected)
    }

    /// Stage rows and delete their natural-key matches.
    pub async fn delete_rows(self, rows: Vec<Vec<Value>>) -> Result<u64> {
        let spec = self.build_spec()?;
        check_widths(&spec, &rows)?;
        let plan =
            write::build_delete_by_rows(self.scope.schema(), self.scope.dialect(), &spec)?;
        let affected = self.run_staged(&plan, rows).await?;
        tracing::info!(table = %spec.table, rows = affected, "delete by rows");
        Ok(affected)
    }

    async fn run_staged(self, plan: &write::WritePlan, rows: Vec<Vec<Value>>) -> Result<u64> {
        let scope = self.scope;
        scope.execute(&plan.create_tmp, &[]).await?;
        let columns: Vec<String> = plan.tmp_columns.iter().map(|(n, _)| n.clone()).collect();
        scope.bulk_load(write::TMP, &columns, &rows).await?;
        let affected = scope.execute(&plan.apply, &plan.params).await?;
        scope.execute(&plan.drop_tmp, &[]).await?;
        Ok(affected)
    }
}

fn check_widths(spec: &ViewSpec, rows: &[Vec<Value>]) -> Result<()> {
    let want = spec.fields.len();
    for (i, row) in rows.iter().enumerate() {
        if row.len() != want {
            return Err(Error::Arg(format!(
                "row {i} has {} values, view has {want} fields",
                row.len()
            )));
        }
    }
    Ok(())
}
