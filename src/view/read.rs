//! Read-side assembly: projections, joins, filter, ACL injection, group-by
//! inference, order and limit, emitted as one SELECT.

use indexmap::IndexMap;

use crate::engine::backend::Dialect;
use crate::error::Result;
use crate::expr::compile::{HeadRegistry, QueryBuild};
use crate::expr::{reader, Expr};
use crate::schema::Schema;
use crate::value::Value;
use crate::view::{FieldSpec, ViewSpec};

#[derive(Debug)]
pub(crate) struct Select {
    pub sql: String,
    pub params: Vec<Value>,
    pub names: Vec<String>,
}

/// A field source is either a dotted path or an s-expression.
fn field_expr(source: &str) -> Result<Expr> {
    if source.trim_start().starts_with('(') {
        reader::parse(source)
    } else {
        Ok(Expr::Sym(source.trim().to_owned()))
    }
}

pub(crate) fn build_select(
    schema: &Schema,
    dialect: &'static dyn Dialect,
    heads: &HeadRegistry,
    acl_read: &IndexMap<String, String>,
    spec: &ViewSpec,
    named: &serde_json::Map<String, serde_json::Value>,
    config_values: &serde_json::Map<String, serde_json::Value>,
    positional: &[serde_json::Value],
) -> Result<Select> {
    let mut qb = QueryBuild::new(
        schema,
        dialect,
        heads,
        named,
        config_values,
        positional,
        &spec.table,
    );

    // 1. Projections. Each is tagged with whether it contains an aggregate.
    let mut names = Vec::new();
    let mut projections = Vec::new();
    for FieldSpec { name, source } in &spec.fields {
        qb.take_aggregate_flag();
        let sql = qb.compile(&field_expr(source)?)?;
        let aggregate = qb.take_aggregate_flag();
        names.push(name.clone());
        projections.push((sql, aggregate));
    }

    // 2. Filters, conjoined.
    let mut wheres = Vec::new();
    for filter in &spec.filters {
        wheres.push(qb.compile(filter)?);
    }

    // 3. ACL-read: one conjunct per guarded table occurrence in the join
    //    set, compiled rooted at that occurrence's alias.
    let occurrences = qb.frames[0].join_set();
    for (table, alias) in occurrences {
        if let Some(filter) = acl_read.get(&table) {
            let ast = reader::parse(filter)?;
            let sql = qb.with_root(&table, &alias, |qb| qb.compile(&ast))?;
            wheres.push(sql);
        }
    }

    // 4. Order clauses.
    let mut orders = Vec::new();
    for (source, direction) in &spec.order {
        let sql = qb.compile(&field_expr(source)?)?;
        match direction.as_deref() {
            Some("desc") => orders.push(format!("{sql} DESC")),
            _ => orders.push(format!("{sql} ASC")),
        }
    }

    // 5. Assemble. Joins are always LEFT so o2m absence yields NULLs.
    let mut sql = format!(
        "SELECT {} FROM {}",
        projections
            .iter()
            .map(|(s, _)| s.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        spec.table
    );
    for join in &qb.frames[0].joins {
        sql.push_str(&format!(
            " LEFT JOIN {} AS {} ON ({})",
            join.table, join.alias, join.on
        ));
    }
    if !wheres.is_empty() {
        sql.push_str(&format!(" WHERE {}", wheres.join(" AND ")));
    }

    // Mixing aggregates with bare references groups over every
    // non-aggregate projection, in projection order.
    let any_aggregate = projections.iter().any(|(_, agg)| *agg);
    let plain: Vec<&str> = projections
        .iter()
        .filter(|(_, agg)| !agg)
        .map(|(s, _)| s.as_str())
        .collect();
    if any_aggregate && !plain.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", plain.join(", ")));
    }

    if !orders.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
    }
    if let Some(limit) = spec.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = spec.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    Ok(Select {
        sql,
        params: qb.params,
        names,
    })
}

/// Materialised result set. Column names are the view's field names (the
/// original dotted paths).
#[derive(Debug, Clone)]
pub struct Rows {
    names: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Rows {
    pub(crate) fn new(names: Vec<String>, rows: Vec<Vec<Value>>) -> Rows {
        Rows { names, rows }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn all(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn one(&self) -> Option<&[Value]> {
        self.rows.first().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate rows as name→value mappings.
    pub fn dicts(&self) -> impl Iterator<Item = IndexMap<String, Value>> + '_ {
        self.rows.iter().map(move |row| {
            self.names
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect()
        })
    }

    /// Batched tuples.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = &[Vec<Value>]> {
        self.rows.chunks(size.max(1))
    }

    /// Columnar accessor; the bridge surface for external dataframe codecs.
    pub fn columns(&self) -> Vec<(String, Vec<Value>)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let column = self.rows.iter().map(|row| row[i].clone()).collect();
                (name.clone(), column)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::POSTGRES;
    use crate::error::Error;
    use crate::schema::TableDecl;
    use crate::view::FieldSpec;

    fn schema() -> Schema {
        let decls: Vec<TableDecl> = serde_yaml::from_str(
            r#"
- table: country
  columns:
    name: varchar
  key: [name]
- table: team
  columns:
    name: varchar
    country: m2o country.id
  key: [name, country]
- table: member
  columns:
    name: varchar
    team: m2o team.id
  key: [name]
- table: speaker
  columns:
    name: varchar
    bio: varchar
  key: [name]
- table: event
  columns:
    name: varchar
    date: date
  key: [name]
- table: event_speaker
  columns:
    event: m2o event.id
    speaker: m2o speaker.id
  key: [event, speaker]
"#,
        )
        .unwrap();
        Schema::from_declarations(&decls).unwrap()
    }

    struct Builder {
        spec: ViewSpec,
        acl_read: IndexMap<String, String>,
        named: serde_json::Map<String, serde_json::Value>,
    }

    fn view(table: &str, fields: &[&str]) -> Builder {
        Builder {
            spec: ViewSpec {
                table: table.to_owned(),
                fields: fields
                    .iter()
                    .map(|f| FieldSpec {
                        name: (*f).to_owned(),
                        source: (*f).to_owned(),
                    })
                    .collect(),
                filters: Vec::new(),
                order: Vec::new(),
                limit: None,
                offset: None,
            },
            acl_read: IndexMap::new(),
            named: serde_json::Map::new(),
        }
    }

    impl Builder {
        fn field(mut self, name: &str, source: &str) -> Self {
            self.spec.fields.push(FieldSpec {
                name: name.to_owned(),
                source: source.to_owned(),
            });
            self
        }

        fn filter(mut self, f: &str) -> Self {
            self.spec.filters.push(crate::expr::reader::parse(f).unwrap());
            self
        }

        fn arg(mut self, name: &str, value: serde_json::Value) -> Self {
            self.named.insert(name.to_owned(), value);
            self
        }

        fn acl(mut self, table: &str, filter: &str) -> Self {
            self.acl_read.insert(table.to_owned(), filter.to_owned());
            self
        }

        fn order(mut self, field: &str, dir: Option<&str>) -> Self {
            self.spec.order.push(((*field).to_owned(), dir.map(str::to_owned)));
            self
        }

        fn build(self) -> crate::error::Result<Select> {
            let schema = schema();
            let heads = crate::expr::compile::HeadRegistry::builtin();
            let empty = serde_json::Map::new();
            build_select(
                &schema,
                &POSTGRES,
                &heads,
                &self.acl_read,
                &self.spec,
                &self.named,
                &empty,
                &[],
            )
        }
    }

    #[test]
    fn plain_select() {
        let select = view("country", &["name"]).build().unwrap();
        assert_eq!(select.sql, "SELECT country.name FROM country");
        assert_eq!(select.names, vec!["name"]);
    }

    #[test]
    fn joined_select_with_filter_argument() {
        let select = view("team", &["name"])
            .filter("(= country.name {c})")
            .arg("c", serde_json::json!("Belgium"))
            .build()
            .unwrap();
        assert_eq!(
            select.sql,
            "SELECT team.name FROM team \
             LEFT JOIN country AS country_0 ON (team.country = country_0.id) \
             WHERE country_0.name = $1"
        );
        assert_eq!(select.params, vec![Value::Text("Belgium".into())]);
    }

    #[test]
    fn shared_prefixes_produce_one_join_per_prefix() {
        let select = view("member", &["name", "team.name", "team.country.name"])
            .build()
            .unwrap();
        assert_eq!(
            select.sql,
            "SELECT member.name, team_0.name, country_1.name FROM member \
             LEFT JOIN team AS team_0 ON (member.team = team_0.id) \
             LEFT JOIN country AS country_1 ON (team_0.country = country_1.id)"
        );
        // Two distinct non-empty prefixes → exactly two joins.
        assert_eq!(select.sql.matches("LEFT JOIN").count(), 2);
    }

    #[test]
    fn compilation_is_deterministic() {
        let a = view("member", &["team.country.name", "team.name"]).build().unwrap();
        let b = view("member", &["team.country.name", "team.name"]).build().unwrap();
        assert_eq!(a.sql, b.sql);
    }

    #[test]
    fn aggregates_trigger_group_by_over_plain_projections() {
        let select = view("event", &[])
            .field("year", r#"(extract "year" date)"#)
            .field("n", "(count *)")
            .build()
            .unwrap();
        assert_eq!(
            select.sql,
            "SELECT CAST(EXTRACT(YEAR FROM event.date) AS BIGINT), COUNT(*) FROM event \
             GROUP BY CAST(EXTRACT(YEAR FROM event.date) AS BIGINT)"
        );
    }

    #[test]
    fn aggregate_only_projection_has_no_group_by() {
        let select = view("event", &[]).field("n", "(count *)").build().unwrap();
        assert_eq!(select.sql, "SELECT COUNT(*) FROM event");
    }

    #[test]
    fn acl_read_is_conjoined_per_guarded_table() {
        let select = view("speaker", &["name"])
            .acl(
                "speaker",
                "(exists (from event_speaker (select 1) (where (= speaker _parent.id))))",
            )
            .build()
            .unwrap();
        assert_eq!(
            select.sql,
            "SELECT speaker.name FROM speaker WHERE EXISTS \
             (SELECT 1 FROM event_speaker WHERE event_speaker.speaker = speaker.id)"
        );
    }

    #[test]
    fn acl_on_joined_table_roots_at_its_alias() {
        let select = view("team", &["name", "country.name"])
            .acl("country", "(!= name 'Atlantis')")
            .build()
            .unwrap();
        assert_eq!(
            select.sql,
            "SELECT team.name, country_0.name FROM team \
             LEFT JOIN country AS country_0 ON (team.country = country_0.id) \
             WHERE country_0.name != 'Atlantis'"
        );
    }

    #[test]
    fn order_limit_offset() {
        let mut b = view("team", &["name"]).order("name", Some("desc"));
        b.spec.limit = Some(10);
        b.spec.offset = Some(5);
        let select = b.build().unwrap();
        assert_eq!(
            select.sql,
            "SELECT team.name FROM team ORDER BY team.name DESC LIMIT 10 OFFSET 5"
        );
    }

    #[test]
    fn unknown_field_is_resolve_error() {
        let err = view("team", &["nope"]).build().unwrap_err();
        assert!(matches!(err, Error::Resolve(_)), "{err}");
    }
}
