//! Write-side planning: staging through a transaction-scoped temp table,
//! foreign-key resolution by natural key, and a single upsert keyed on the
//! target's natural-key unique index. Deletion by filter or by staged rows.

use indexmap::IndexMap;

use crate::engine::backend::Dialect;
use crate::error::{Error, Result};
use crate::expr::compile::{HeadRegistry, QueryBuild};
use crate::expr::reader;
use crate::schema::{ColKind, Schema, SqlType, Table};
use crate::value::Value;
use crate::view::resolve::Join;
use crate::view::ViewSpec;

/// The staging table lives inside the transaction only.
pub(crate) const TMP: &str = "tmp";

#[derive(Debug)]
pub(crate) struct WritePlan {
    pub tmp_columns: Vec<(String, SqlType)>,
    pub create_tmp: String,
    /// The single statement applied after staging: upsert or key-delete.
    pub apply: String,
    pub params: Vec<Value>,
    pub drop_tmp: String,
}

/// Classified input fields: plain stored columns of the target, and dotted
/// foreign-key inputs grouped by their first segment (the FK column).
struct WriteFields {
    plain: Vec<String>,
    groups: IndexMap<String, Vec<String>>,
}

fn classify(schema: &Schema, target: &Table, spec: &ViewSpec) -> Result<WriteFields> {
    let mut plain = Vec::new();
    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();

    for field in &spec.fields {
        let path = field.source.trim();
        if path.starts_with('(') {
            return Err(Error::Resolve(format!(
                "cannot write through expression field {path:?}"
            )));
        }
        let segments: Vec<&str> = path.split('.').collect();
        let first = target.column(segments[0]).ok_or_else(|| {
            Error::Resolve(format!(
                "no column {:?} on table {:?}",
                segments[0], target.name
            ))
        })?;

        if segments.len() == 1 {
            if first.is_o2m() {
                return Err(Error::Resolve(format!(
                    "cannot write one-to-many column {path:?}"
                )));
            }
            plain.push(path.to_owned());
            continue;
        }

        // A dotted input follows m2o edges along natural keys and lands on a
        // natural-key scalar of the last referenced table.
        let ColKind::ManyToOne { table: mut cur, .. } = first.kind.clone() else {
            return Err(Error::Resolve(format!(
                "field {path:?} does not start at a many-to-one column"
            )));
        };
        for (i, seg) in segments[1..].iter().enumerate() {
            let table = schema.table(&cur)?;
            let col = table.column(seg).ok_or_else(|| {
                Error::Resolve(format!(
                    "no column {seg:?} on table {cur:?} (in field {path:?})"
                ))
            })?;
            if !table.key.iter().any(|k| k == seg) {
                return Err(Error::Resolve(format!(
                    "{seg:?} is not part of the natural key of {cur:?} (in field {path:?})"
                )));
            }
            let last = i + 2 == segments.len();
            match &col.kind {
                ColKind::Scalar(_) if last => {}
                ColKind::ManyToOne { table: t, .. } if !last => cur = t.clone(),
                _ => {
                    return Err(Error::Resolve(format!(
                        "field {path:?} must end on a natural-key scalar"
                    )))
                }
            }
        }
        groups
            .entry(segments[0].to_owned())
            .or_default()
            .push(path.to_owned());
    }
    Ok(WriteFields { plain, groups })
}

/// The dotted inputs a foreign key needs: its target's natural key, expanded
/// through nested m2o key columns.
fn expand_key(schema: &Schema, table: &str, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let table = schema.table(table)?;
    for k in &table.key {
        let col = table.column(k).expect("keys validated at build");
        match &col.kind {
            ColKind::Scalar(_) => out.push(format!("{prefix}.{k}")),
            ColKind::ManyToOne { table: t, .. } => {
                expand_key(schema, t, &format!("{prefix}.{k}"), out)?
            }
            ColKind::OneToMany { .. } => unreachable!("o2m keys rejected at build"),
        }
    }
    Ok(())
}

fn check_coverage(schema: &Schema, target: &Table, fields: &WriteFields) -> Result<()> {
    for (fk, provided) in &fields.groups {
        let ColKind::ManyToOne { table: t, .. } = &target.column(fk).unwrap().kind else {
            unreachable!("groups only hold m2o columns")
        };
        let mut required = Vec::new();
        expand_key(schema, t, fk, &mut required)?;
        for need in &required {
            if !provided.contains(need) {
                return Err(Error::Resolve(format!(
                    "foreign key {fk:?} needs field {need:?} to resolve {t:?} by natural key"
                )));
            }
        }
        for have in provided {
            if !required.contains(have) {
                return Err(Error::Resolve(format!(
                    "field {have:?} is not part of the natural key expansion of {fk:?}"
                )));
            }
        }
    }

    for k in &target.key {
        let covered = fields.plain.iter().any(|f| f == k) || fields.groups.contains_key(k);
        if !covered {
            return Err(Error::Resolve(format!(
                "view fields must cover the natural key of {:?}; missing {k:?}",
                target.name
            )));
        }
    }
    Ok(())
}

/// Join one referenced table by its natural key against the staged columns,
/// recursing through m2o key members, and return its alias.
fn key_join(
    schema: &Schema,
    table_name: &str,
    prefix: &str,
    joins: &mut Vec<Join>,
    counter: &mut usize,
) -> Result<String> {
    let table = schema.table(table_name)?;
    let alias = format!("{}_{}", table_name, *counter);
    *counter += 1;

    let mut conds = Vec::new();
    for k in &table.key {
        let col = table.column(k).expect("keys validated at build");
        match &col.kind {
            ColKind::Scalar(_) => {
                conds.push(format!("{alias}.{k} = {TMP}.\"{prefix}.{k}\""));
            }
            ColKind::ManyToOne { table: t, .. } => {
                let sub = key_join(schema, t, &format!("{prefix}.{k}"), joins, counter)?;
                conds.push(format!("{alias}.{k} = {sub}.id"));
            }
            ColKind::OneToMany { .. } => unreachable!("o2m keys rejected at build"),
        }
    }
    joins.push(Join {
        alias: alias.clone(),
        table: table_name.to_owned(),
        on: conds.join(" AND "),
    });
    Ok(alias)
}

fn tmp_columns(
    schema: &Schema,
    target: &Table,
    spec: &ViewSpec,
) -> Result<Vec<(String, SqlType)>> {
    let mut out = Vec::new();
    for field in &spec.fields {
        let path = field.source.trim();
        let segments: Vec<&str> = path.split('.').collect();
        let ty = if segments.len() == 1 {
            target
                .column(segments[0])
                .and_then(|c| c.stored_type())
                .expect("classified before staging")
        } else {
            let mut cur = target.name.clone();
            let mut ty = None;
            for seg in &segments {
                let col = schema.table(&cur)?.column(seg).expect("classified");
                match &col.kind {
                    ColKind::ManyToOne { table: t, .. } => cur = t.clone(),
                    ColKind::Scalar(t) => ty = Some(t.clone()),
                    ColKind::OneToMany { .. } => unreachable!("classified"),
                }
            }
            ty.expect("dotted fields end on scalars")
        };
        out.push((path.to_owned(), ty));
    }
    Ok(out)
}

struct StagedJoins {
    joins: Vec<Join>,
    fk_alias: IndexMap<String, String>,
    counter: usize,
}

fn stage_joins(schema: &Schema, target: &Table, fields: &WriteFields) -> Result<StagedJoins> {
    let mut joins = Vec::new();
    let mut fk_alias = IndexMap::new();
    let mut counter = 0;
    for fk in fields.groups.keys() {
        let ColKind::ManyToOne { table: t, .. } = &target.column(fk).unwrap().kind else {
            unreachable!("groups only hold m2o columns")
        };
        let alias = key_join(schema, t, fk, &mut joins, &mut counter)?;
        fk_alias.insert(fk.clone(), alias);
    }
    Ok(StagedJoins {
        joins,
        fk_alias,
        counter,
    })
}

/// The ON clause matching the target by natural key against staged values.
fn target_key_match(target: &Table, fields: &WriteFields, staged: &StagedJoins) -> String {
    let t = &target.name;
    target
        .key
        .iter()
        .map(|k| match staged.fk_alias.get(k) {
            Some(alias) => format!("{t}.{k} = {alias}.id"),
            None => format!("{t}.{k} = {TMP}.\"{k}\""),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn build_upsert(
    schema: &Schema,
    dialect: &'static dyn Dialect,
    heads: &HeadRegistry,
    acl_write: &IndexMap<String, String>,
    spec: &ViewSpec,
    named: &serde_json::Map<String, serde_json::Value>,
    config_values: &serde_json::Map<String, serde_json::Value>,
    positional: &[serde_json::Value],
) -> Result<WritePlan> {
    let target = schema.table(&spec.table)?;
    let fields = classify(schema, target, spec)?;
    check_coverage(schema, target, &fields)?;
    let staged = stage_joins(schema, target, &fields)?;

    // Insert column list and aligned select expressions, in field order;
    // every dotted group contributes its FK column exactly once.
    let mut insert_cols: Vec<String> = Vec::new();
    let mut select_exprs: Vec<String> = Vec::new();
    for field in &spec.fields {
        let path = field.source.trim();
        match path.split_once('.') {
            None => {
                insert_cols.push(path.to_owned());
                select_exprs.push(format!("{TMP}.\"{path}\""));
            }
            Some((fk, _)) => {
                if !insert_cols.iter().any(|c| c == fk) {
                    insert_cols.push(fk.to_owned());
                    select_exprs.push(format!("{}.id", staged.fk_alias[fk]));
                }
            }
        }
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {TMP}",
        target.name,
        insert_cols.join(", "),
        select_exprs.join(", ")
    );
    for join in &staged.joins {
        sql.push_str(&format!(
            " LEFT JOIN {} AS {} ON ({})",
            join.table, join.alias, join.on
        ));
    }
    sql.push_str(&format!(
        " LEFT JOIN {} ON ({})",
        target.name,
        target_key_match(target, &fields, &staged)
    ));

    // ACL-write filters the staged rows. A row updating out of the ACL is
    // indistinguishable here from a disallowed insert; both are skipped,
    // never deleted.
    let mut params = Vec::new();
    let mut guard = None;
    if let Some(filter) = acl_write.get(&target.name) {
        let ast = reader::parse(filter)?;
        let mut qb = QueryBuild::new(
            schema,
            dialect,
            heads,
            named,
            config_values,
            positional,
            &target.name,
        );
        qb.frames[0].set_counter(staged.counter);
        let sql_guard = qb.compile(&ast)?;
        for join in &qb.frames[0].joins {
            sql.push_str(&format!(
                " LEFT JOIN {} AS {} ON ({})",
                join.table, join.alias, join.on
            ));
        }
        params = qb.params;
        guard = Some(sql_guard);
    }

    match guard {
        Some(g) => sql.push_str(&format!(" WHERE {g}")),
        // SQLite cannot parse an upsert after a joined SELECT without a
        // WHERE clause.
        None if dialect.upsert_select_needs_where() => sql.push_str(" WHERE true"),
        None => {}
    }

    let key_list = target.key.join(", ");
    let updates: Vec<String> = insert_cols
        .iter()
        .filter(|c| !target.key.contains(*c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    if updates.is_empty() {
        sql.push_str(&format!(" ON CONFLICT ({key_list}) DO NOTHING"));
    } else {
        sql.push_str(&format!(
            " ON CONFLICT ({key_list}) DO UPDATE SET {}",
            updates.join(", ")
        ));
    }

    let tmp_cols = tmp_columns(schema, target, spec)?;
    Ok(WritePlan {
        create_tmp: dialect.create_temp_table(TMP, &tmp_cols),
        tmp_columns: tmp_cols,
        apply: sql,
        params,
        drop_tmp: format!("DROP TABLE {TMP}"),
    })
}

/// Delete rows matching staged natural keys.
pub(crate) fn build_delete_by_rows(
    schema: &Schema,
    dialect: &'static dyn Dialect,
    spec: &ViewSpec,
) -> Result<WritePlan> {
    let target = schema.table(&spec.table)?;
    let fields = classify(schema, target, spec)?;
    check_coverage(schema, target, &fields)?;
    let staged = stage_joins(schema, target, &fields)?;

    let mut sub = format!("SELECT {}.id FROM {TMP}", target.name);
    for join in &staged.joins {
        sub.push_str(&format!(
            " LEFT JOIN {} AS {} ON ({})",
            join.table, join.alias, join.on
        ));
    }
    sub.push_str(&format!(
        " LEFT JOIN {} ON ({})",
        target.name,
        target_key_match(target, &fields, &staged)
    ));

    let tmp_cols = tmp_columns(schema, target, spec)?;
    Ok(WritePlan {
        create_tmp: dialect.create_temp_table(TMP, &tmp_cols),
        tmp_columns: tmp_cols,
        apply: format!("DELETE FROM {} WHERE id IN ({sub})", target.name),
        params: Vec::new(),
        drop_tmp: format!("DROP TABLE {TMP}"),
    })
}

/// Delete rows matching a compiled filter.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_delete_by_filter(
    schema: &Schema,
    dialect: &'static dyn Dialect,
    heads: &HeadRegistry,
    spec: &ViewSpec,
    named: &serde_json::Map<String, serde_json::Value>,
    config_values: &serde_json::Map<String, serde_json::Value>,
    positional: &[serde_json::Value],
) -> Result<(String, Vec<Value>)> {
    let target = schema.table(&spec.table)?;
    if spec.filters.is_empty() {
        return Err(Error::Arg(format!(
            "refusing to delete from {:?} without a filter",
            target.name
        )));
    }

    let mut qb = QueryBuild::new(
        schema,
        dialect,
        heads,
        named,
        config_values,
        positional,
        &target.name,
    );
    let mut wheres = Vec::new();
    for filter in &spec.filters {
        wheres.push(qb.compile(filter)?);
    }

    let mut sub = format!("SELECT {0}.id FROM {0}", target.name);
    for join in &qb.frames[0].joins {
        sub.push_str(&format!(
            " LEFT JOIN {} AS {} ON ({})",
            join.table, join.alias, join.on
        ));
    }
    sub.push_str(&format!(" WHERE {}", wheres.join(" AND ")));

    Ok((
        format!("DELETE FROM {} WHERE id IN ({sub})", target.name),
        qb.params,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::{POSTGRES, SQLITE};
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
"#,
        )
        .unwrap();
        Schema::from_declarations(&decls).unwrap()
    }

    fn spec(table: &str, fields: &[&str]) -> ViewSpec {
        ViewSpec {
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
        }
    }

    fn upsert(
        dialect: &'static dyn Dialect,
        spec: &ViewSpec,
        acl: &IndexMap<String, String>,
    ) -> Result<WritePlan> {
        let schema = schema();
        let heads = crate::expr::compile::HeadRegistry::builtin();
        let empty = serde_json::Map::new();
        build_upsert(&schema, dialect, &heads, acl, spec, &empty, &empty, &[])
    }

    #[test]
    fn key_only_upsert_does_nothing_on_conflict() {
        let plan = upsert(&POSTGRES, &spec("team", &["name", "country.name"]), &IndexMap::new())
            .unwrap();
        assert_eq!(
            plan.apply,
            "INSERT INTO team (name, country) \
             SELECT tmp.\"name\", country_0.id FROM tmp \
             LEFT JOIN country AS country_0 ON (country_0.name = tmp.\"country.name\") \
             LEFT JOIN team ON (team.name = tmp.\"name\" AND team.country = country_0.id) \
             ON CONFLICT (name, country) DO NOTHING"
        );
        assert_eq!(
            plan.tmp_columns,
            vec![
                ("name".to_owned(), SqlType::Varchar),
                ("country.name".to_owned(), SqlType::Varchar),
            ]
        );
        assert_eq!(
            plan.create_tmp,
            "CREATE TEMPORARY TABLE tmp (\"name\" VARCHAR, \"country.name\" VARCHAR) ON COMMIT DROP"
        );
    }

    #[test]
    fn non_key_columns_update_on_conflict() {
        let plan =
            upsert(&POSTGRES, &spec("speaker", &["name", "bio"]), &IndexMap::new()).unwrap();
        assert_eq!(
            plan.apply,
            "INSERT INTO speaker (name, bio) \
             SELECT tmp.\"name\", tmp.\"bio\" FROM tmp \
             LEFT JOIN speaker ON (speaker.name = tmp.\"name\") \
             ON CONFLICT (name) DO UPDATE SET bio = EXCLUDED.bio"
        );
    }

    #[test]
    fn multi_hop_fk_resolves_through_each_natural_key() {
        let plan = upsert(
            &POSTGRES,
            &spec("member", &["name", "team.name", "team.country.name"]),
            &IndexMap::new(),
        )
        .unwrap();
        assert_eq!(
            plan.apply,
            "INSERT INTO member (name, team) \
             SELECT tmp.\"name\", team_0.id FROM tmp \
             LEFT JOIN country AS country_1 ON (country_1.name = tmp.\"team.country.name\") \
             LEFT JOIN team AS team_0 ON (team_0.name = tmp.\"team.name\" \
             AND team_0.country = country_1.id) \
             LEFT JOIN member ON (member.name = tmp.\"name\") \
             ON CONFLICT (name) DO UPDATE SET team = EXCLUDED.team"
        );
    }

    #[test]
    fn sqlite_upsert_select_carries_a_where_guard() {
        let plan =
            upsert(&SQLITE, &spec("speaker", &["name", "bio"]), &IndexMap::new()).unwrap();
        assert!(
            plan.apply.contains(" WHERE true ON CONFLICT"),
            "{}",
            plan.apply
        );
    }

    #[test]
    fn acl_write_guards_the_staging_select() {
        let mut acl = IndexMap::new();
        acl.insert("speaker".to_owned(), "(!= name 'root')".to_owned());
        let plan = upsert(&POSTGRES, &spec("speaker", &["name", "bio"]), &acl).unwrap();
        assert!(
            plan.apply.contains("WHERE speaker.name != 'root' ON CONFLICT"),
            "{}",
            plan.apply
        );
    }

    #[test]
    fn natural_key_must_be_covered() {
        let err = upsert(&POSTGRES, &spec("team", &["name"]), &IndexMap::new()).unwrap_err();
        assert!(matches!(err, Error::Resolve(_)), "{err}");

        let err = upsert(
            &POSTGRES,
            &spec("speaker", &["bio"]),
            &IndexMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Resolve(_)), "{err}");
    }

    #[test]
    fn dotted_fields_must_follow_natural_keys() {
        // `id` is not part of country's natural key.
        let err = upsert(
            &POSTGRES,
            &spec("team", &["name", "country.id"]),
            &IndexMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Resolve(_)), "{err}");
    }

    #[test]
    fn raw_fk_ids_are_accepted_as_plain_columns() {
        let plan =
            upsert(&POSTGRES, &spec("team", &["name", "country"]), &IndexMap::new()).unwrap();
        assert_eq!(
            plan.apply,
            "INSERT INTO team (name, country) \
             SELECT tmp.\"name\", tmp.\"country\" FROM tmp \
             LEFT JOIN team ON (team.name = tmp.\"name\" AND team.country = tmp.\"country\") \
             ON CONFLICT (name, country) DO NOTHING"
        );
        assert_eq!(plan.tmp_columns[1], ("country".to_owned(), SqlType::BigInt));
    }

    #[test]
    fn delete_by_filter_builds_a_subselect() {
        let schema = schema();
        let heads = crate::expr::compile::HeadRegistry::builtin();
        let empty = serde_json::Map::new();
        let mut s = spec("team", &["name"]);
        s.filters
            .push(crate::expr::reader::parse("(= country.name 'Atlantis')").unwrap());
        let (sql, params) =
            build_delete_by_filter(&schema, &POSTGRES, &heads, &s, &empty, &empty, &[]).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM team WHERE id IN (SELECT team.id FROM team \
             LEFT JOIN country AS country_0 ON (team.country = country_0.id) \
             WHERE country_0.name = 'Atlantis')"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn delete_without_filter_is_refused() {
        let schema = schema();
        let heads = crate::expr::compile::HeadRegistry::builtin();
        let empty = serde_json::Map::new();
        let err = build_delete_by_filter(
            &schema,
            &POSTGRES,
            &heads,
            &spec("team", &["name"]),
            &empty,
            &empty,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Arg(_)), "{err}");
    }

    #[test]
    fn delete_by_rows_matches_on_natural_key() {
        let schema = schema();
        let plan =
            build_delete_by_rows(&schema, &POSTGRES, &spec("speaker", &["name"])).unwrap();
        assert_eq!(
            plan.apply,
            "DELETE FROM speaker WHERE id IN (SELECT speaker.id FROM tmp \
             LEFT JOIN speaker ON (speaker.name = tmp.\"name\"))"
        );
    }
}
