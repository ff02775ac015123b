//! Dotted field-path resolution. `"a.b.c"` becomes a chain of join specs
//! plus a terminal qualified column. Aliases are `<target_table>_<k>` with a
//! counter scoped to one compilation, and prefixes are memoised so two paths
//! sharing a prefix reuse the same join.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::schema::{ColKind, Schema};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Join {
    pub alias: String,
    pub table: String,
    pub on: String,
}

/// One compilation frame: the outer view, or a nested sub-view. The root can
/// be rebased temporarily (ACL filters compile rooted at the alias of the
/// table they guard).
#[derive(Debug)]
pub(crate) struct Frame {
    pub root_table: String,
    pub root_alias: String,
    pub joins: Vec<Join>,
    memo: HashMap<String, String>,
    counter: usize,
    pub has_aggregate: bool,
}

impl Frame {
    pub fn new(table: &str) -> Frame {
        Frame {
            root_table: table.to_owned(),
            root_alias: table.to_owned(),
            joins: Vec::new(),
            memo: HashMap::new(),
            counter: 0,
            has_aggregate: false,
        }
    }

    /// Continue alias numbering after externally allocated aliases.
    pub fn set_counter(&mut self, counter: usize) {
        self.counter = counter;
    }

    /// Tables visible in this frame with their aliases, base first.
    pub fn join_set(&self) -> Vec<(String, String)> {
        let mut set = vec![(self.root_table.clone(), self.root_alias.clone())];
        set.extend(self.joins.iter().map(|j| (j.table.clone(), j.alias.clone())));
        set
    }
}

/// Resolve one dotted path within a frame, appending any joins it needs.
/// Identical path strings within one frame yield identical SQL.
pub(crate) fn resolve_path(schema: &Schema, frame: &mut Frame, path: &str) -> Result<String> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::Resolve(format!("malformed path {path:?}")));
    }

    let mut cur_table = frame.root_table.clone();
    let mut cur_alias = frame.root_alias.clone();
    // Memo keys carry the root alias so a rebased root never collides with
    // paths resolved from the frame's own base.
    let mut prefix = frame.root_alias.clone();

    for (i, seg) in segments.iter().enumerate() {
        let table = schema.table(&cur_table)?;
        let col = table.column(seg).ok_or_else(|| {
            Error::Resolve(format!(
                "no column {seg:?} on table {cur_table:?} (in path {path:?})"
            ))
        })?;
        let last = i + 1 == segments.len();

        // A terminal scalar is the column itself; a terminal m2o is the FK
        // column, not the joined side.
        if last && !col.is_o2m() {
            return Ok(format!("{cur_alias}.{seg}"));
        }

        let (target_table, make_on): (String, Box<dyn Fn(&str) -> String>) = match &col.kind {
            ColKind::ManyToOne { table: t, column: c } => {
                let (t, c, cur_alias, seg) =
                    (t.clone(), c.clone(), cur_alias.clone(), (*seg).to_owned());
                (
                    t.clone(),
                    Box::new(move |alias: &str| format!("{cur_alias}.{seg} = {alias}.{c}")),
                )
            }
            ColKind::OneToMany { table: t, column: c } => {
                // The back-column is an m2o on the referenced table; join on
                // whatever column it targets here.
                let back = schema.table(t)?.column(c).ok_or_else(|| {
                    Error::Resolve(format!("missing back-column {t}.{c} (in path {path:?})"))
                })?;
                let ColKind::ManyToOne { column: here, .. } = &back.kind else {
                    return Err(Error::Resolve(format!(
                        "back-column {t}.{c} is not many-to-one (in path {path:?})"
                    )));
                };
                let (t, c, here, cur_alias) =
                    (t.clone(), c.clone(), here.clone(), cur_alias.clone());
                (
                    t.clone(),
                    Box::new(move |alias: &str| format!("{alias}.{c} = {cur_alias}.{here}")),
                )
            }
            ColKind::Scalar(_) => {
                return Err(Error::Resolve(format!(
                    "cannot traverse scalar column {seg:?} (in path {path:?})"
                )))
            }
        };

        prefix = format!("{prefix}.{seg}");
        let alias = match frame.memo.get(&prefix) {
            Some(alias) => alias.clone(),
            None => {
                let alias = format!("{target_table}_{}", frame.counter);
                frame.counter += 1;
                frame.joins.push(Join {
                    alias: alias.clone(),
                    table: target_table.clone(),
                    on: make_on(&alias),
                });
                frame.memo.insert(prefix.clone(), alias.clone());
                alias
            }
        };

        cur_table = target_table;
        cur_alias = alias;
        if last {
            // Terminal o2m: the joined side's surrogate.
            return Ok(format!("{cur_alias}.id"));
        }
    }
    unreachable!("empty paths rejected above")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Schema, TableDecl};

    fn schema() -> Schema {
        let decls: Vec<TableDecl> = serde_yaml::from_str(
            r#"
- table: country
  columns:
    name: varchar
    teams: o2m team.country
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
"#,
        )
        .unwrap();
        Schema::from_declarations(&decls).unwrap()
    }

    #[test]
    fn bare_column_needs_no_join() {
        let schema = schema();
        let mut frame = Frame::new("team");
        assert_eq!(resolve_path(&schema, &mut frame, "name").unwrap(), "team.name");
        assert_eq!(resolve_path(&schema, &mut frame, "id").unwrap(), "team.id");
        assert!(frame.joins.is_empty());
    }

    #[test]
    fn terminal_m2o_is_the_fk_column() {
        let schema = schema();
        let mut frame = Frame::new("team");
        assert_eq!(
            resolve_path(&schema, &mut frame, "country").unwrap(),
            "team.country"
        );
        assert!(frame.joins.is_empty());
    }

    #[test]
    fn m2o_path_joins_target() {
        let schema = schema();
        let mut frame = Frame::new("team");
        assert_eq!(
            resolve_path(&schema, &mut frame, "country.name").unwrap(),
            "country_0.name"
        );
        assert_eq!(frame.joins.len(), 1);
        assert_eq!(frame.joins[0].table, "country");
        assert_eq!(frame.joins[0].on, "team.country = country_0.id");
    }

    #[test]
    fn o2m_path_joins_back() {
        let schema = schema();
        let mut frame = Frame::new("country");
        assert_eq!(
            resolve_path(&schema, &mut frame, "teams.name").unwrap(),
            "team_0.name"
        );
        assert_eq!(frame.joins[0].on, "team_0.country = country.id");
    }

    #[test]
    fn shared_prefixes_share_joins() {
        let schema = schema();
        let mut frame = Frame::new("member");
        let a = resolve_path(&schema, &mut frame, "team.name").unwrap();
        let b = resolve_path(&schema, &mut frame, "team.country.name").unwrap();
        assert_eq!(a, "team_0.name");
        assert_eq!(b, "country_1.name");
        // Two distinct non-empty prefixes: team, team.country.
        assert_eq!(frame.joins.len(), 2);
    }

    #[test]
    fn resolution_is_pure() {
        let schema = schema();
        let run = || {
            let mut frame = Frame::new("member");
            let a = resolve_path(&schema, &mut frame, "team.country.name").unwrap();
            let on: Vec<String> = frame.joins.iter().map(|j| j.on.clone()).collect();
            (a, on)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn unknown_segment_is_resolve_error() {
        let schema = schema();
        let mut frame = Frame::new("team");
        let err = resolve_path(&schema, &mut frame, "nope").unwrap_err();
        assert!(matches!(err, Error::Resolve(_)), "{err}");
        let err = resolve_path(&schema, &mut frame, "name.deeper").unwrap_err();
        assert!(matches!(err, Error::Resolve(_)), "{err}");
    }
}
