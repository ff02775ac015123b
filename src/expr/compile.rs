//! Lowering of parsed expressions to SQL fragments with parameter binding.
//!
//! Compilation happens inside a [`QueryBuild`]: a stack of frames (the outer
//! view plus one frame per nested sub-view), a shared parameter accumulator
//! filled in depth-first order, and the argument bindings. The head table is
//! an open registry so callers can add lowerings before compilation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::backend::Dialect;
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::schema::{Schema, SqlType};
use crate::value::Value;
use crate::view::resolve::{resolve_path, Frame};

pub type HeadFn = Arc<dyn Fn(&mut QueryBuild, &[Expr]) -> Result<String> + Send + Sync>;

/// Head-symbol → lowering function. Starts with the builtin table; callers
/// may register additional heads (or shadow builtins) before compilation.
#[derive(Clone)]
pub struct HeadRegistry {
    map: HashMap<String, HeadFn>,
}

impl std::fmt::Debug for HeadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut heads: Vec<&str> = self.map.keys().map(String::as_str).collect();
        heads.sort_unstable();
        f.debug_struct("HeadRegistry").field("heads", &heads).finish()
    }
}

impl HeadRegistry {
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut QueryBuild, &[Expr]) -> Result<String> + Send + Sync + 'static,
    {
        self.map.insert(name.to_owned(), Arc::new(f));
    }

    fn get(&self, name: &str) -> Option<HeadFn> {
        self.map.get(name).cloned()
    }

    pub fn builtin() -> HeadRegistry {
        let mut reg = HeadRegistry { map: HashMap::new() };

        for (op, sep) in [("and", " AND "), ("or", " OR ")] {
            reg.register(op, move |b, args| {
                arity_at_least(op, args, 1)?;
                let parts = args.iter().map(|a| b.compile(a)).collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", parts.join(sep)))
            });
        }

        reg.register("not", |b, args| {
            arity("not", args, 1)?;
            Ok(format!("NOT ({})", b.compile(&args[0])?))
        });

        for op in ["=", "!=", "<", "<=", ">", ">="] {
            reg.register(op, move |b, args| {
                arity(op, args, 2)?;
                Ok(format!("{} {op} {}", b.compile(&args[0])?, b.compile(&args[1])?))
            });
        }

        reg.register("like", |b, args| {
            arity("like", args, 2)?;
            Ok(format!("{} LIKE {}", b.compile(&args[0])?, b.compile(&args[1])?))
        });

        reg.register("ilike", |b, args| {
            arity("ilike", args, 2)?;
            let lhs = b.compile(&args[0])?;
            let rhs = b.compile(&args[1])?;
            Ok(b.dialect.ilike(&lhs, &rhs))
        });

        reg.register("in", |b, args| {
            arity_at_least("in", args, 2)?;
            let lhs = b.compile(&args[0])?;
            let mut items = Vec::new();
            for arg in &args[1..] {
                let part = b.compile(arg)?;
                if !part.is_empty() {
                    items.push(part);
                }
            }
            if items.is_empty() {
                // An empty binding list matches nothing rather than erroring.
                items.push("NULL".to_owned());
            }
            Ok(format!("{lhs} IN ({})", items.join(", ")))
        });

        reg.register("is", |b, args| {
            arity("is", args, 2)?;
            Ok(format!("{} IS {}", b.compile(&args[0])?, b.compile(&args[1])?))
        });

        for op in ["+", "-", "*", "/"] {
            reg.register(op, move |b, args| {
                arity(op, args, 2)?;
                Ok(format!(
                    "({} {op} {})",
                    b.compile(&args[0])?,
                    b.compile(&args[1])?
                ))
            });
        }

        reg.register("extract", |b, args| {
            arity("extract", args, 2)?;
            let Expr::Str(unit) = &args[0] else {
                return Err(Error::Parse(
                    "extract needs a quoted unit as first argument".to_owned(),
                ));
            };
            let operand = b.compile(&args[1])?;
            b.dialect.extract(unit, &operand)
        });

        for agg in ["count", "sum", "avg", "min", "max"] {
            let fname = agg.to_uppercase();
            reg.register(agg, move |b, args| {
                arity(agg, args, 1)?;
                b.mark_aggregate();
                let inner = match &args[0] {
                    Expr::Sym(s) if s == "*" => "*".to_owned(),
                    other => b.compile(other)?,
                };
                Ok(format!("{fname}({inner})"))
            });
        }

        reg.register("cast", |b, args| {
            arity("cast", args, 2)?;
            let value = b.compile(&args[0])?;
            let ty = match &args[1] {
                Expr::Str(s) => s.clone(),
                Expr::Sym(s) => s.clone(),
                _ => return Err(Error::Parse("cast needs a type name".to_owned())),
            };
            let ty = SqlType::parse(&ty).map_err(|_| Error::Parse(format!("cast to unknown type {ty:?}")))?;
            Ok(format!("CAST({value} AS {})", b.dialect.type_sql(&ty)))
        });

        reg.register("coalesce", |b, args| {
            arity("coalesce", args, 2)?;
            Ok(format!(
                "COALESCE({}, {})",
                b.compile(&args[0])?,
                b.compile(&args[1])?
            ))
        });

        reg.register("nullif", |b, args| {
            arity("nullif", args, 2)?;
            Ok(format!(
                "NULLIF({}, {})",
                b.compile(&args[0])?,
                b.compile(&args[1])?
            ))
        });

        reg.register("exists", |b, args| {
            arity("exists", args, 1)?;
            let sub = b.compile(&args[0])?;
            Ok(format!("EXISTS {sub}"))
        });

        reg.register("from", lower_from);

        reg
    }
}

fn arity(head: &str, args: &[Expr], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(Error::Parse(format!(
            "{head} takes {n} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn arity_at_least(head: &str, args: &[Expr], n: usize) -> Result<()> {
    if args.len() < n {
        return Err(Error::Parse(format!(
            "{head} takes at least {n} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

/// Sub-view: `(from <table> (select …) (where …))` lowers to a parenthesised
/// sub-SELECT with its own frame; `_parent.…` symbols reach the outer frame.
fn lower_from(b: &mut QueryBuild, args: &[Expr]) -> Result<String> {
    arity_at_least("from", args, 2)?;
    let Some(table) = args[0].as_sym() else {
        return Err(Error::Parse("from needs a table symbol".to_owned()));
    };
    b.schema.table(table)?;

    b.frames.push(Frame::new(table));
    let result = (|| {
        let mut selects = Vec::new();
        let mut wheres = Vec::new();
        for form in &args[1..] {
            let Expr::List(items) = form else {
                return Err(Error::Parse("from expects (select …) / (where …) forms".to_owned()));
            };
            match items.first().and_then(Expr::as_sym) {
                Some("select") => {
                    for e in &items[1..] {
                        let sql = b.compile(e)?;
                        selects.push(sql);
                    }
                }
                Some("where") => {
                    for e in &items[1..] {
                        let sql = b.compile(e)?;
                        wheres.push(sql);
                    }
                }
                _ => {
                    return Err(Error::Parse(
                        "only (select …) and (where …) are valid inside (from …)".to_owned(),
                    ))
                }
            }
        }
        if selects.is_empty() {
            return Err(Error::Parse("from needs a (select …) form".to_owned()));
        }

        let frame = b.frames.last().expect("frame pushed above");
        let mut sql = format!("SELECT {} FROM {table}", selects.join(", "));
        for join in &frame.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} AS {} ON ({})",
                join.table, join.alias, join.on
            ));
        }
        if !wheres.is_empty() {
            sql.push_str(&format!(" WHERE {}", wheres.join(" AND ")));
        }
        Ok(format!("({sql})"))
    })();
    b.frames.pop();
    result
}

/// Compilation context: schema + dialect + frames + parameters + bindings.
pub struct QueryBuild<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) dialect: &'static dyn Dialect,
    heads: &'a HeadRegistry,
    named: &'a serde_json::Map<String, serde_json::Value>,
    config_values: &'a serde_json::Map<String, serde_json::Value>,
    positional: &'a [serde_json::Value],
    next_positional: usize,
    pub(crate) frames: Vec<Frame>,
    pub(crate) params: Vec<Value>,
}

impl<'a> QueryBuild<'a> {
    pub(crate) fn new(
        schema: &'a Schema,
        dialect: &'static dyn Dialect,
        heads: &'a HeadRegistry,
        named: &'a serde_json::Map<String, serde_json::Value>,
        config_values: &'a serde_json::Map<String, serde_json::Value>,
        positional: &'a [serde_json::Value],
        base_table: &str,
    ) -> QueryBuild<'a> {
        QueryBuild {
            schema,
            dialect,
            heads,
            named,
            config_values,
            positional,
            next_positional: 0,
            frames: vec![Frame::new(base_table)],
            params: Vec::new(),
        }
    }

    /// Compile one expression to a SQL fragment, accumulating parameters and
    /// join specs as side effects.
    pub fn compile(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Sym(s) => self.compile_symbol(s),
            Expr::Int(i) => Ok(i.to_string()),
            Expr::Float(x) => Ok(x.to_string()),
            Expr::Str(s) => Ok(sql_string_literal(s)),
            Expr::Placeholder(path) => self.bind_placeholder(path),
            Expr::List(items) => {
                let head = items
                    .first()
                    .and_then(Expr::as_sym)
                    .ok_or_else(|| Error::Parse("form head must be a symbol".to_owned()))?
                    .to_owned();
                let Some(lower) = self.heads.get(&head) else {
                    return Err(Error::Parse(format!("unknown head {head:?}")));
                };
                lower(self, &items[1..])
            }
        }
    }

    /// Append one parameter and return its positional marker.
    pub fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.marker(self.params.len())
    }

    /// Mark the current frame as containing an aggregate, which drives
    /// group-by inference on the read side.
    pub fn mark_aggregate(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.has_aggregate = true;
        }
    }

    pub(crate) fn take_aggregate_flag(&mut self) -> bool {
        let frame = self.frames.first_mut().expect("base frame always present");
        std::mem::replace(&mut frame.has_aggregate, false)
    }

    /// Temporarily rebase the outermost frame's root (used for ACL filters,
    /// which are written rooted at the table they guard).
    pub(crate) fn with_root<T>(
        &mut self,
        table: &str,
        alias: &str,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let frame = self.frames.first_mut().expect("base frame always present");
        let saved = (frame.root_table.clone(), frame.root_alias.clone());
        frame.root_table = table.to_owned();
        frame.root_alias = alias.to_owned();
        let result = f(self);
        let frame = self.frames.first_mut().expect("base frame always present");
        (frame.root_table, frame.root_alias) = saved;
        result
    }

    fn compile_symbol(&mut self, sym: &str) -> Result<String> {
        match sym {
            "null" => return Ok("NULL".to_owned()),
            "true" => return Ok("TRUE".to_owned()),
            "false" => return Ok("FALSE".to_owned()),
            _ => {}
        }

        // `_parent.…` climbs one frame per prefix occurrence.
        let mut depth = self.frames.len() - 1;
        let mut rest = sym;
        while let Some(inner) = rest.strip_prefix("_parent.") {
            depth = depth.checked_sub(1).ok_or_else(|| {
                Error::Resolve(format!("{sym:?} reaches above the outermost view"))
            })?;
            rest = inner;
        }
        let frame = &mut self.frames[depth];
        resolve_path(self.schema, frame, rest)
    }

    fn bind_placeholder(&mut self, path: &[String]) -> Result<String> {
        let value = if path.is_empty() {
            let idx = self.next_positional;
            self.next_positional += 1;
            self.positional
                .get(idx)
                .ok_or_else(|| Error::Arg(format!("no positional argument #{idx}")))?
                .clone()
        } else {
            let root = path[0].as_str();
            let mut value = self
                .named
                .get(root)
                .or_else(|| self.config_values.get(root))
                .ok_or_else(|| Error::Arg(format!("no argument named {root:?}")))?;
            for attr in &path[1..] {
                value = match value {
                    serde_json::Value::Object(map) => map.get(attr).ok_or_else(|| {
                        Error::Arg(format!("no attribute {attr:?} in {{{}}}", path.join(".")))
                    })?,
                    serde_json::Value::Array(items) => {
                        let idx: usize = attr.parse().map_err(|_| {
                            Error::Arg(format!("index {attr:?} in {{{}}}", path.join(".")))
                        })?;
                        items.get(idx).ok_or_else(|| {
                            Error::Arg(format!("index {idx} out of range in {{{}}}", path.join(".")))
                        })?
                    }
                    _ => {
                        return Err(Error::Arg(format!(
                            "cannot look up {attr:?} in {{{}}}",
                            path.join(".")
                        )))
                    }
                };
            }
            value.clone()
        };

        // Lists expand to one marker per element.
        if let serde_json::Value::Array(items) = &value {
            let markers = items
                .iter()
                .map(|item| Value::from_json(item).map(|v| self.param(v)))
                .collect::<Result<Vec<_>>>()?;
            return Ok(markers.join(", "));
        }
        let v = Value::from_json(&value)?;
        Ok(self.param(v))
    }
}

fn sql_string_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::{POSTGRES, SQLITE};
    use crate::expr::reader;
    use crate::schema::TableDecl;

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

    fn compile_on(
        base: &str,
        src: &str,
        args: serde_json::Value,
        dialect: &'static dyn Dialect,
    ) -> Result<(String, Vec<Value>)> {
        let schema = schema();
        let heads = HeadRegistry::builtin();
        let named = args.as_object().cloned().unwrap_or_default();
        let empty = serde_json::Map::new();
        let mut qb = QueryBuild::new(&schema, dialect, &heads, &named, &empty, &[], base);
        let sql = qb.compile(&reader::parse(src)?)?;
        Ok((sql, qb.params))
    }

    fn compile(base: &str, src: &str, args: serde_json::Value) -> (String, Vec<Value>) {
        compile_on(base, src, args, &POSTGRES).unwrap()
    }

    #[test]
    fn literals_are_inlined_placeholders_are_bound() {
        let (sql, params) = compile("team", r#"(and (= name "Blue") (= id 7))"#, serde_json::json!({}));
        assert_eq!(sql, "(team.name = 'Blue' AND team.id = 7)");
        assert!(params.is_empty());

        let (sql, params) = compile("team", "(= country.name {c})", serde_json::json!({"c": "Belgium"}));
        assert_eq!(sql, "country_0.name = $1");
        assert_eq!(params, vec![Value::Text("Belgium".into())]);
    }

    #[test]
    fn params_accumulate_depth_first() {
        let (sql, params) = compile(
            "team",
            "(or (= name {x}) (in id {ids}))",
            serde_json::json!({"x": "a", "ids": [1, 2]}),
        );
        assert_eq!(sql, "(team.name = $1 OR team.id IN ($2, $3))");
        assert_eq!(
            params,
            vec![Value::Text("a".into()), Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn empty_list_binding_matches_nothing() {
        let (sql, params) = compile("team", "(in id {ids})", serde_json::json!({"ids": []}));
        assert_eq!(sql, "team.id IN (NULL)");
        assert!(params.is_empty());
    }

    #[test]
    fn attribute_chain_lookup() {
        let (sql, params) = compile(
            "team",
            "(= name {user.name})",
            serde_json::json!({"user": {"name": "ada"}}),
        );
        assert_eq!(sql, "team.name = $1");
        assert_eq!(params, vec![Value::Text("ada".into())]);

        let err = compile_on("team", "(= name {user.age})", serde_json::json!({"user": {}}), &POSTGRES)
            .unwrap_err();
        assert!(matches!(err, Error::Arg(_)), "{err}");
    }

    #[test]
    fn missing_argument_is_arg_error() {
        let err = compile_on("team", "(= name {c})", serde_json::json!({}), &POSTGRES).unwrap_err();
        assert!(matches!(err, Error::Arg(_)), "{err}");
    }

    #[test]
    fn unknown_head_is_parse_error() {
        let err = compile_on("team", "(frobnicate name)", serde_json::json!({}), &POSTGRES)
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "{err}");
    }

    #[test]
    fn null_and_is_form() {
        let (sql, _) = compile("team", "(is country null)", serde_json::json!({}));
        assert_eq!(sql, "team.country IS NULL");
    }

    #[test]
    fn ilike_goes_through_the_dialect() {
        let (pg, _) = compile("team", "(ilike name {p})", serde_json::json!({"p": "b%"}));
        assert_eq!(pg, "team.name ILIKE $1");
        let (lite, _) =
            compile_on("team", "(ilike name {p})", serde_json::json!({"p": "b%"}), &SQLITE)
                .unwrap();
        assert_eq!(lite, "team.name LIKE ? COLLATE NOCASE");
    }

    #[test]
    fn extract_takes_a_quoted_unit() {
        let (sql, _) = compile("event", r#"(extract "year" date)"#, serde_json::json!({}));
        assert_eq!(sql, "CAST(EXTRACT(YEAR FROM event.date) AS BIGINT)");
        let err = compile_on("event", "(extract year date)", serde_json::json!({}), &POSTGRES)
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "{err}");
    }

    #[test]
    fn count_star_and_aggregate_flag() {
        let schema = schema();
        let heads = HeadRegistry::builtin();
        let empty = serde_json::Map::new();
        let mut qb = QueryBuild::new(&schema, &POSTGRES, &heads, &empty, &empty, &[], "event");
        let sql = qb.compile(&reader::parse("(count *)").unwrap()).unwrap();
        assert_eq!(sql, "COUNT(*)");
        assert!(qb.take_aggregate_flag());
        assert!(!qb.take_aggregate_flag());
    }

    #[test]
    fn sub_view_with_correlated_parent() {
        let (sql, _) = compile(
            "speaker",
            "(exists (from event_speaker (select 1) (where (= speaker _parent.id))))",
            serde_json::json!({}),
        );
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM event_speaker WHERE event_speaker.speaker = speaker.id)"
        );
    }

    #[test]
    fn aggregates_inside_sub_views_stay_inside() {
        let schema = schema();
        let heads = HeadRegistry::builtin();
        let empty = serde_json::Map::new();
        let mut qb = QueryBuild::new(&schema, &POSTGRES, &heads, &empty, &empty, &[], "speaker");
        qb.compile(
            &reader::parse("(exists (from event_speaker (select (count *)) (where (= speaker _parent.id))))")
                .unwrap(),
        )
        .unwrap();
        assert!(!qb.take_aggregate_flag());
    }

    #[test]
    fn custom_heads_can_be_registered() {
        let schema = schema();
        let mut heads = HeadRegistry::builtin();
        heads.register("lower", |b, args| {
            Ok(format!("LOWER({})", b.compile(&args[0])?))
        });
        let empty = serde_json::Map::new();
        let mut qb = QueryBuild::new(&schema, &POSTGRES, &heads, &empty, &empty, &[], "team");
        let sql = qb.compile(&reader::parse("(lower name)").unwrap()).unwrap();
        assert_eq!(sql, "LOWER(team.name)");
    }

    #[test]
    fn string_literals_are_escaped() {
        let (sql, _) = compile("team", "(= name 'O''Brien')", serde_json::json!({}));
        assert_eq!(sql, "team.name = 'O''Brien'");
    }

    #[test]
    fn positional_placeholders_consume_in_order() {
        let schema = schema();
        let heads = HeadRegistry::builtin();
        let empty = serde_json::Map::new();
        let positional = vec![serde_json::json!("x"), serde_json::json!(2)];
        let mut qb = QueryBuild::new(&schema, &POSTGRES, &heads, &empty, &empty, &positional, "team");
        let sql = qb
            .compile(&reader::parse("(and (= name {}) (= id {}))").unwrap())
            .unwrap();
        assert_eq!(sql, "(team.name = $1 AND team.id = $2)");
        assert_eq!(qb.params, vec![Value::Text("x".into()), Value::Int(2)]);
    }
}
