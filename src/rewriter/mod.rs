//! The SQL rewriter: MySQL dialect in, PostgreSQL dialect out.
//!
//! A statement either becomes backend SQL (with a placeholder permutation),
//! a set of session-level operations, or a locally synthesized result set.

use log::debug;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::config::get_config;
use crate::errors::{Error, UnsupportedConstructError};
use crate::protocol::ColumnDefinition;
use crate::schema::SchemaCache;
use crate::session::{Session, UserValue};

pub mod params;
pub mod show;
pub mod split;
pub mod transform;

#[cfg(test)]
mod tests;

pub use split::split_statements;

/// A statement translated for the backend.
#[derive(Debug, Clone, Default)]
pub struct RewriteResult {
    pub sql: String,
    /// Placeholders in the MySQL input (what the client binds).
    pub input_params: usize,
    /// Placeholders in the PostgreSQL output.
    pub param_count: usize,
    /// `param_map[i]` is the input placeholder index bound at `$i+1`.
    pub param_map: Vec<usize>,
    /// Applied transforms, for observability.
    pub notes: Vec<&'static str>,
    pub kind: StatementKind,
    /// Identity column introduced by this DDL, for the session to record.
    pub identity_ddl: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatementKind {
    #[default]
    Passthrough,
    Query,
    Dml {
        returning_identity: bool,
    },
    Begin,
    Commit,
    Rollback,
    Ddl {
        table: Option<String>,
    },
}

/// Rows answered without touching the backend.
#[derive(Debug, Clone)]
pub struct LocalResultSet {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

/// Operations the session layer applies instead of the backend.
#[derive(Debug, Clone)]
pub enum SessionOp {
    UseDatabase(String),
    SetUserVar(String, UserValue),
    SetNames(String),
    SetTimeZone(String),
    /// A recognized session variable that has no backend meaning.
    Swallow(&'static str),
    PrepareText {
        name: String,
        query: String,
    },
    ExecuteText {
        name: String,
        using: Vec<String>,
    },
    DeallocateText {
        name: String,
    },
    Kill(u64),
}

#[derive(Debug)]
pub enum RewriteOutcome {
    Execute(RewriteResult),
    Session(Vec<SessionOp>),
    LocalRows(LocalResultSet),
}

/// Rewrite a single statement. Multi-statement payloads are split by the
/// caller with [`split_statements`].
pub async fn rewrite(
    sql: &str,
    session: &Session,
    schema: &SchemaCache,
) -> Result<RewriteOutcome, Error> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Ok(RewriteOutcome::Session(Vec::new()));
    }

    let (keyword, rest) = match split::leading_keyword(trimmed) {
        Some(parts) => parts,
        None => return Ok(RewriteOutcome::Session(Vec::new())),
    };

    // USE never reaches the backend, with or without rewriting enabled.
    if keyword == "USE" {
        return parse_use(rest);
    }

    if !get_config().sql_rewrite.enabled {
        return Ok(rewrite_passthrough(trimmed, &keyword));
    }

    match keyword.as_str() {
        "SHOW" => Ok(RewriteOutcome::Execute(show::translate_show(
            trimmed, session,
        )?)),
        "SET" => parse_set(trimmed, rest, session),
        "KILL" => parse_kill(rest),
        "PREPARE" => parse_prepare(trimmed),
        "EXECUTE" => parse_execute(trimmed),
        "DEALLOCATE" => parse_deallocate(trimmed),
        _ => rewrite_full(trimmed, session, schema).await,
    }
}

/// Full parse → transform → serialize pipeline.
async fn rewrite_full(
    sql: &str,
    session: &Session,
    schema: &SchemaCache,
) -> Result<RewriteOutcome, Error> {
    let config = get_config();
    let (clean, mut notes) = split::strip_mysql_hints(sql);

    let dialect = MySqlDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, &clean).map_err(|err| classify_parse_error(sql, err))?;
    let mut stmt = match statements.len() {
        0 => return Ok(RewriteOutcome::Session(Vec::new())),
        _ => statements.swap_remove(0),
    };

    let input_params = params::tag_placeholders(&mut stmt);
    let output = transform::transform_statement(&mut stmt, session, schema).await?;
    if let Some(local) = output.local {
        return Ok(RewriteOutcome::LocalRows(local));
    }
    let (param_count, param_map) = params::relabel_placeholders(&mut stmt);

    notes.extend(output.notes);
    let rewritten = stmt.to_string();
    if config.sql_rewrite.debug_sql {
        debug!("rewrite: {sql:?} -> {rewritten:?} (notes: {notes:?})");
    }

    Ok(RewriteOutcome::Execute(RewriteResult {
        sql: rewritten,
        input_params,
        param_count,
        param_map,
        notes,
        kind: output.kind,
        identity_ddl: output.identity_ddl,
    }))
}

/// With rewriting disabled only placeholder syntax is translated; the kind
/// is classified lexically so transaction tracking still works.
fn rewrite_passthrough(sql: &str, keyword: &str) -> RewriteOutcome {
    let (rewritten, param_count) = split::relabel_placeholders_lexical(sql);
    let kind = match keyword {
        "BEGIN" | "START" => StatementKind::Begin,
        "COMMIT" => StatementKind::Commit,
        "ROLLBACK" => StatementKind::Rollback,
        "SELECT" | "SHOW" | "VALUES" | "TABLE" | "WITH" => StatementKind::Query,
        "INSERT" | "UPDATE" | "DELETE" => StatementKind::Dml {
            returning_identity: false,
        },
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => StatementKind::Ddl { table: None },
        _ => StatementKind::Passthrough,
    };
    RewriteOutcome::Execute(RewriteResult {
        sql: rewritten,
        input_params: param_count,
        param_count,
        param_map: (0..param_count).collect(),
        notes: Vec::new(),
        kind,
        identity_ddl: None,
    })
}

/// The parser refuses a few MySQL-only shapes we must report as
/// unsupported rather than as syntax errors.
fn classify_parse_error(sql: &str, err: sqlparser::parser::ParserError) -> Error {
    if let Some((keyword, _)) = split::leading_keyword(sql) {
        if (keyword == "UPDATE" || keyword == "DELETE") && split::contains_code_word(sql, "LIMIT") {
            return Error::Unsupported(UnsupportedConstructError::new(
                if keyword == "UPDATE" {
                    "UPDATE ... LIMIT"
                } else {
                    "DELETE ... LIMIT"
                },
                "row-limited DML has no PostgreSQL equivalent",
            ));
        }
    }
    if get_config().sql_rewrite.debug_sql {
        debug!("parse error for {sql:?}: {err}");
    }
    Error::RewriteInternal(err.to_string())
}

fn parse_use(rest: &str) -> Result<RewriteOutcome, Error> {
    let name = rest
        .trim()
        .trim_end_matches(';')
        .trim()
        .trim_matches('`')
        .trim_matches('"')
        .to_string();
    if name.is_empty() {
        return Err(Error::RewriteInternal("USE requires a database name".into()));
    }
    Ok(RewriteOutcome::Session(vec![SessionOp::UseDatabase(name)]))
}

fn parse_kill(rest: &str) -> Result<RewriteOutcome, Error> {
    let rest = rest.trim().trim_end_matches(';').trim();
    let rest = rest
        .strip_prefix("CONNECTION ")
        .or_else(|| rest.strip_prefix("connection "))
        .or_else(|| rest.strip_prefix("QUERY "))
        .or_else(|| rest.strip_prefix("query "))
        .unwrap_or(rest);
    let id = rest
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::RewriteInternal("KILL requires a numeric session id".into()))?;
    Ok(RewriteOutcome::Session(vec![SessionOp::Kill(id)]))
}

/// `PREPARE name FROM 'statement'` (text-protocol prepared statements).
fn parse_prepare(sql: &str) -> Result<RewriteOutcome, Error> {
    let toks = show::tokens(sql);
    if toks.len() < 4 || !toks[2].eq_ignore_ascii_case("from") {
        return Err(Error::RewriteInternal(
            "PREPARE syntax is PREPARE <name> FROM '<statement>'".into(),
        ));
    }
    let name = toks[1].to_ascii_lowercase();
    let literal = &toks[3];
    if !literal.starts_with('\'') {
        return Err(Error::Unsupported(UnsupportedConstructError::new(
            "PREPARE",
            "PREPARE FROM a user variable is not translated",
        )));
    }
    let query = literal
        .trim_matches('\'')
        .replace("''", "'");
    Ok(RewriteOutcome::Session(vec![SessionOp::PrepareText {
        name,
        query,
    }]))
}

fn parse_execute(sql: &str) -> Result<RewriteOutcome, Error> {
    let toks = show::tokens(sql);
    if toks.len() < 2 {
        return Err(Error::RewriteInternal("EXECUTE requires a name".into()));
    }
    let name = toks[1].to_ascii_lowercase();
    let mut using = Vec::new();
    if toks.get(2).map(|t| t.eq_ignore_ascii_case("using")) == Some(true) {
        for tok in &toks[3..] {
            match tok.strip_prefix('@') {
                Some(var) => using.push(var.to_ascii_lowercase()),
                None => {
                    return Err(Error::RewriteInternal(
                        "EXECUTE ... USING takes @variables".into(),
                    ))
                }
            }
        }
    }
    Ok(RewriteOutcome::Session(vec![SessionOp::ExecuteText {
        name,
        using,
    }]))
}

fn parse_deallocate(sql: &str) -> Result<RewriteOutcome, Error> {
    let toks = show::tokens(sql);
    let name = match toks.len() {
        3 if toks[1].eq_ignore_ascii_case("prepare") => toks[2].to_ascii_lowercase(),
        2 => toks[1].to_ascii_lowercase(),
        _ => {
            return Err(Error::RewriteInternal(
                "DEALLOCATE syntax is DEALLOCATE PREPARE <name>".into(),
            ))
        }
    };
    Ok(RewriteOutcome::Session(vec![SessionOp::DeallocateText {
        name,
    }]))
}

/// SET statements: user variables are evaluated locally, a few session
/// variables translate to backend or session state, the rest are swallowed.
fn parse_set(sql: &str, rest: &str, session: &Session) -> Result<RewriteOutcome, Error> {
    let upper = rest.trim_start().to_ascii_uppercase();

    // Isolation-level forms run on the backend with PostgreSQL spelling.
    if upper.starts_with("TRANSACTION") {
        return Ok(RewriteOutcome::Execute(RewriteResult {
            sql: sql.trim_end_matches(';').to_string(),
            kind: StatementKind::Passthrough,
            notes: vec!["set_transaction"],
            ..Default::default()
        }));
    }
    if let Some(tail) = upper
        .strip_prefix("SESSION TRANSACTION")
        .or_else(|| upper.strip_prefix("GLOBAL TRANSACTION"))
    {
        return Ok(RewriteOutcome::Execute(RewriteResult {
            sql: format!("SET SESSION CHARACTERISTICS AS TRANSACTION{tail}"),
            kind: StatementKind::Passthrough,
            notes: vec!["set_transaction"],
            ..Default::default()
        }));
    }

    if upper.starts_with("NAMES") {
        let toks = show::tokens(rest);
        let charset = toks
            .get(1)
            .map(|t| t.trim_matches('\'').to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::RewriteInternal("SET NAMES requires a charset".into()))?;
        return Ok(RewriteOutcome::Session(vec![SessionOp::SetNames(charset)]));
    }

    let mut ops = Vec::new();
    for assignment in split_assignments(rest) {
        let (lhs, rhs) = match assignment
            .split_once(":=")
            .or_else(|| assignment.split_once('='))
        {
            Some((l, r)) => (l.trim(), r.trim().trim_end_matches(';').trim()),
            None => {
                return Err(Error::RewriteInternal(format!(
                    "malformed SET assignment {assignment:?}"
                )))
            }
        };

        if let Some(var) = lhs.strip_prefix('@').filter(|v| !v.starts_with('@')) {
            let value = eval_user_value(rhs, session)?;
            ops.push(SessionOp::SetUserVar(var.to_ascii_lowercase(), value));
            continue;
        }

        // System variable, possibly with SESSION/GLOBAL or @@ prefixes.
        let name = lhs
            .trim_start_matches("@@")
            .to_ascii_lowercase();
        let name = name
            .trim_start_matches("session ")
            .trim_start_matches("global ")
            .trim_start_matches("session.")
            .trim_start_matches("global.")
            .trim();
        match name {
            "time_zone" => ops.push(SessionOp::SetTimeZone(
                rhs.trim_matches('\'').to_string(),
            )),
            "character_set_client" | "character_set_connection" | "character_set_results" => {
                ops.push(SessionOp::SetNames(rhs.trim_matches('\'').to_ascii_lowercase()))
            }
            "autocommit" => ops.push(SessionOp::Swallow("autocommit")),
            "sql_mode" => ops.push(SessionOp::Swallow("sql_mode")),
            _ => ops.push(SessionOp::Swallow("session_variable")),
        }
    }
    Ok(RewriteOutcome::Session(ops))
}

/// Split `SET a = 1, @b = f(1, 2)` on top-level commas.
fn split_assignments(rest: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut current = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_string => in_string = true,
            '\'' if in_string => {
                if chars.peek() == Some(&'\'') {
                    current.push(c);
                    current.push(chars.next().unwrap());
                    continue;
                }
                in_string = false;
            }
            '(' if !in_string => depth += 1,
            ')' if !in_string => depth -= 1,
            ',' if !in_string && depth == 0 => {
                out.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

/// Evaluate the right-hand side of `SET @var = ...`. Only literal-foldable
/// expressions are allowed; anything with a subquery is rejected.
fn eval_user_value(rhs: &str, session: &Session) -> Result<UserValue, Error> {
    use sqlparser::ast::{Expr, UnaryOperator, Value};

    let dialect = MySqlDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(rhs)
        .map_err(|err| Error::RewriteInternal(format!("SET value parse: {err}")))?;
    let expr = parser
        .parse_expr()
        .map_err(|err| Error::RewriteInternal(format!("SET value parse: {err}")))?;

    fn eval(expr: &Expr, session: &Session) -> Result<UserValue, Error> {
        match expr {
            Expr::Value(Value::Number(text, _)) => Ok(match text.parse::<i64>() {
                Ok(int) => UserValue::Int(int),
                Err(_) => UserValue::Float(text.parse::<f64>().map_err(|_| {
                    Error::RewriteInternal(format!("bad numeric literal {text:?}"))
                })?),
            }),
            Expr::Value(Value::SingleQuotedString(s)) | Expr::Value(Value::DoubleQuotedString(s)) => {
                Ok(UserValue::Str(s.clone()))
            }
            Expr::Value(Value::Null) => Ok(UserValue::Null),
            Expr::Value(Value::Boolean(b)) => Ok(UserValue::Int(*b as i64)),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match eval(expr, session)? {
                UserValue::Int(int) => Ok(UserValue::Int(-int)),
                UserValue::Float(float) => Ok(UserValue::Float(-float)),
                other => Ok(other),
            },
            Expr::Nested(inner) => eval(inner, session),
            Expr::Identifier(ident) if ident.value.starts_with('@') => Ok(session
                .user_vars
                .get(&ident.value[1..].to_ascii_lowercase())
                .cloned()
                .unwrap_or(UserValue::Null)),
            Expr::Subquery(_) => Err(Error::Unsupported(UnsupportedConstructError::new(
                "SET @var = (SELECT ...)",
                "subquery assignments to user variables are not translated",
            ))),
            other => Err(Error::Unsupported(UnsupportedConstructError::new(
                "SET @var",
                format!("non-literal assignment {other} is not translated"),
            ))),
        }
    }

    eval(&expr, session)
}
