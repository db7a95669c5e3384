//! Single-pass AST transform from MySQL dialect to PostgreSQL dialect.
//!
//! Expression-level rules run in a `VisitorMut`; statement-shaped rules
//! (INSERT conflict clauses, DDL types) run in explicit matches before the
//! walk. Nodes the parser does not give us a stable constructor for are
//! built by parsing small PostgreSQL templates and grafting subtrees in.

use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, visit_expressions_mut, BinaryOperator, DataType, Expr, Ident, ObjectName,
    OnConflict, OnConflictAction, OnInsert, SelectItem, SetExpr, Statement, TableFactor, Value,
    VisitMut, VisitorMut,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::config::get_config;
use crate::errors::{Error, UnsupportedConstructError};
use crate::protocol::ColumnDefinition;
use crate::schema::{SchemaCache, TableSchema};
use crate::session::{Session, UserValue};

use super::{LocalResultSet, StatementKind};

/// What a statement transform produced besides the mutated AST.
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub kind: StatementKind,
    pub notes: Vec<&'static str>,
    /// Result synthesized without touching the backend.
    pub local: Option<LocalResultSet>,
    /// Identity column observed in DDL, for the session to remember.
    pub identity_ddl: Option<(String, String)>,
}

/// Functions that must be rejected before any transform runs.
const BANNED_FUNCTIONS: &[(&str, &str)] = &[
    ("get_lock", "GET_LOCK"),
    ("release_lock", "RELEASE_LOCK"),
    ("found_rows", "FOUND_ROWS"),
    ("load_file", "LOAD_FILE"),
];

/// The closed unsupported-construct check. Runs on the untouched AST.
pub fn check_unsupported(stmt: &Statement) -> Result<(), UnsupportedConstructError> {
    match stmt {
        Statement::Insert(insert) => {
            if insert.replace_into {
                return Err(UnsupportedConstructError::new(
                    "REPLACE INTO",
                    "REPLACE INTO is not translated; use INSERT ... ON DUPLICATE KEY UPDATE",
                ));
            }
            if let Some(priority) = &insert.priority {
                if priority.to_string().trim().eq_ignore_ascii_case("delayed") {
                    return Err(UnsupportedConstructError::new(
                        "INSERT DELAYED",
                        "delayed inserts do not exist in PostgreSQL",
                    ));
                }
            }
            if insert.partitioned.is_some() || !insert.after_columns.is_empty() {
                return Err(UnsupportedConstructError::new(
                    "PARTITION",
                    "MySQL partition selection syntax",
                ));
            }
        }
        Statement::Delete(delete) => {
            if delete.limit.is_some() {
                return Err(UnsupportedConstructError::new(
                    "DELETE ... LIMIT",
                    "row-limited DELETE has no PostgreSQL equivalent",
                ));
            }
        }
        _ => {}
    }

    let mut banned: Option<UnsupportedConstructError> = None;
    let _ = visit_expressions(stmt, |expr| {
        if let Expr::Function(func) = expr {
            let name = function_name(&func.name).to_ascii_lowercase();
            if let Some((_, display)) = BANNED_FUNCTIONS.iter().find(|(n, _)| *n == name) {
                banned = Some(UnsupportedConstructError::new(
                    display,
                    format!("{display}() cannot be translated"),
                ));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::<()>::Continue(())
    });
    match banned {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub async fn transform_statement(
    stmt: &mut Statement,
    session: &Session,
    schema: &SchemaCache,
) -> Result<TransformOutput, Error> {
    check_unsupported(stmt)?;

    let mut out = TransformOutput {
        kind: classify(stmt),
        ..Default::default()
    };

    // `SELECT LAST_INSERT_ID()` alone resolves entirely from session state.
    if let Some(local) = last_insert_id_probe(stmt, session) {
        out.local = Some(local);
        out.notes.push("last_insert_id");
        return Ok(out);
    }

    // Statement-shaped transforms, including the ones that need the schema
    // cache; lookups happen before the synchronous expression walk.
    match stmt {
        Statement::Insert(_) => transform_insert(stmt, session, schema, &mut out).await?,
        Statement::CreateTable(create) => {
            requote_object_name(&mut create.name);
            let table = object_table_name(&create.name);
            let mut identity = None;
            for column in &mut create.columns {
                requote_ident(&mut column.name);
                column.collation = None;
                let mut is_auto_increment = false;
                column.options.retain(|opt| {
                    let text = opt.to_string().to_ascii_uppercase();
                    if text == "AUTO_INCREMENT" {
                        is_auto_increment = true;
                        return false;
                    }
                    // Per-column charset/collation/comment have no direct
                    // PostgreSQL DDL spelling.
                    !(text.starts_with("CHARACTER SET")
                        || text.starts_with("COLLATE")
                        || text.starts_with("COMMENT"))
                });
                column.data_type = map_data_type(&column.data_type)?;
                if is_auto_increment {
                    column.options.push(identity_column_option());
                    identity = Some(column.name.value.clone());
                    out.notes.push("auto_increment");
                }
            }
            strip_index_constraints(create, &mut out);
            for constraint in &mut create.constraints {
                requote_constraint(constraint);
            }
            create.engine = None;
            create.auto_increment_offset = None;
            create.default_charset = None;
            create.collation = None;
            if let Some(column) = identity {
                out.identity_ddl = Some((table.clone(), column));
            }
            out.notes.push("ddl_types");
        }
        Statement::AlterTable { name, operations, .. } => {
            requote_object_name(name);
            for operation in operations.iter_mut() {
                if let sqlparser::ast::AlterTableOperation::AddColumn { column_def, .. } = operation
                {
                    requote_ident(&mut column_def.name);
                    column_def.data_type = map_data_type(&column_def.data_type)?;
                }
            }
        }
        _ => {}
    }

    // Expression walk: identifier quoting, function renames, user and
    // system variables, string literal normalization.
    let mut transformer = Transformer {
        session,
        notes: Vec::new(),
    };
    if let ControlFlow::Break(err) = stmt.visit(&mut transformer) {
        return Err(Error::Unsupported(err));
    }
    out.notes.extend(transformer.notes);

    Ok(out)
}

fn classify(stmt: &Statement) -> StatementKind {
    match stmt {
        Statement::Query(_) => StatementKind::Query,
        Statement::Insert(_) | Statement::Update { .. } | Statement::Delete(_) => {
            StatementKind::Dml {
                returning_identity: false,
            }
        }
        Statement::StartTransaction { .. } => StatementKind::Begin,
        Statement::Commit { .. } => StatementKind::Commit,
        Statement::Rollback { .. } => StatementKind::Rollback,
        Statement::CreateTable(create) => StatementKind::Ddl {
            table: Some(object_table_name(&create.name)),
        },
        Statement::AlterTable { name, .. } => StatementKind::Ddl {
            table: Some(object_table_name(name)),
        },
        Statement::Drop { names, .. } => StatementKind::Ddl {
            table: names.first().map(object_table_name),
        },
        Statement::CreateIndex(_) | Statement::Truncate { .. } => {
            StatementKind::Ddl { table: None }
        }
        _ => StatementKind::Passthrough,
    }
}

/// Detects a bare `SELECT LAST_INSERT_ID()` and answers it locally.
fn last_insert_id_probe(stmt: &Statement, session: &Session) -> Option<LocalResultSet> {
    let query = match stmt {
        Statement::Query(query) => query,
        _ => return None,
    };
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => return None,
    };
    if !select.from.is_empty() || select.selection.is_some() || select.projection.len() != 1 {
        return None;
    }
    let expr = match &select.projection[0] {
        SelectItem::UnnamedExpr(expr) => expr,
        _ => return None,
    };
    match expr {
        Expr::Function(func)
            if function_name(&func.name).eq_ignore_ascii_case("last_insert_id")
                && func_has_no_args(func) =>
        {
            Some(LocalResultSet {
                columns: vec![ColumnDefinition::longlong("LAST_INSERT_ID()")],
                rows: vec![vec![Some(session.last_insert_id.to_string().into_bytes())]],
            })
        }
        _ => None,
    }
}

async fn transform_insert(
    stmt: &mut Statement,
    session: &Session,
    schema: &SchemaCache,
    out: &mut TransformOutput,
) -> Result<(), Error> {
    let insert = match stmt {
        Statement::Insert(insert) => insert,
        _ => return Ok(()),
    };

    requote_object_name(&mut insert.table_name);
    for column in &mut insert.columns {
        requote_ident(column);
    }
    insert.priority = None;

    let table = object_table_name(&insert.table_name);
    let table_schema = schema.lookup(&session.database, &table).await?;

    if insert.ignore {
        insert.ignore = false;
        insert.on = Some(OnInsert::OnConflict(OnConflict {
            conflict_target: None,
            action: OnConflictAction::DoNothing,
        }));
        out.notes.push("insert_ignore");
    }

    match insert.on.take() {
        Some(OnInsert::DuplicateKeyUpdate(assignments)) => {
            transform_dup_key(insert, assignments, table_schema.as_deref(), &table, out)?;
        }
        other => insert.on = other,
    }

    // INSERT into an identity-bearing table feeds LAST_INSERT_ID(): append
    // RETURNING so the handler can record the generated key.
    let identity = session
        .identity_tables
        .get(&table)
        .cloned()
        .or_else(|| table_schema.as_ref().and_then(|s| s.identity.clone()));
    if let (Some(identity), None) = (identity, &insert.returning) {
        insert.returning = Some(vec![SelectItem::UnnamedExpr(Expr::Identifier(Ident::new(
            identity,
        )))]);
        out.kind = StatementKind::Dml {
            returning_identity: true,
        };
        out.notes.push("identity_returning");
    }

    Ok(())
}

fn transform_dup_key(
    insert: &mut sqlparser::ast::Insert,
    assignments: Vec<sqlparser::ast::Assignment>,
    table_schema: Option<&TableSchema>,
    table: &str,
    out: &mut TransformOutput,
) -> Result<(), Error> {
    {
        let table_schema = table_schema.ok_or_else(|| {
            Error::Unsupported(UnsupportedConstructError::new(
                "ON DUPLICATE KEY UPDATE",
                format!("no cached schema for table {table:?} to derive the conflict target"),
            ))
        })?;
        if table_schema.primary_key.is_empty() {
            return Err(Error::Unsupported(UnsupportedConstructError::new(
                "ON DUPLICATE KEY UPDATE",
                format!("table {table:?} has no primary key"),
            )));
        }

        let mut assignments = assignments;
        for assignment in assignments.iter_mut() {
            rewrite_dup_key_value(&mut assignment.value, &table);
        }

        let conflict_columns = table_schema
            .primary_key
            .iter()
            .map(|name| Ident::new(name.clone()))
            .collect();
        insert.on = Some(OnInsert::OnConflict(OnConflict {
            conflict_target: Some(sqlparser::ast::ConflictTarget::Columns(conflict_columns)),
            action: OnConflictAction::DoUpdate(sqlparser::ast::DoUpdate {
                assignments,
                selection: None,
            }),
        }));
        out.notes.push("on_duplicate_key");
    }

    Ok(())
}

/// Inside an ON DUPLICATE KEY UPDATE list: `VALUES(col)` refers to the
/// proposed row (`excluded.col` in PostgreSQL) and bare columns refer to the
/// existing row, which we qualify with the table name for clarity.
fn rewrite_dup_key_value(expr: &mut Expr, table: &str) {
    let _ = visit_expressions_mut(expr, |node| {
        match node {
            Expr::Function(func)
                if function_name(&func.name).eq_ignore_ascii_case("values") =>
            {
                if let Some(column) = single_ident_argument(func) {
                    *node = Expr::CompoundIdentifier(vec![Ident::new("excluded"), column]);
                }
            }
            Expr::Identifier(ident) if !ident.value.starts_with('@') => {
                let column = std::mem::replace(ident, Ident::new(""));
                *node = Expr::CompoundIdentifier(vec![Ident::new(table), dequote(column)]);
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
}

/// Expression-level rules, applied during the single AST walk.
struct Transformer<'a> {
    session: &'a Session,
    notes: Vec<&'static str>,
}

impl VisitorMut for Transformer<'_> {
    type Break = UnsupportedConstructError;

    fn pre_visit_relation(&mut self, relation: &mut ObjectName) -> ControlFlow<Self::Break> {
        requote_object_name(relation);
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(
        &mut self,
        table_factor: &mut TableFactor,
    ) -> ControlFlow<Self::Break> {
        if let TableFactor::Table { alias: Some(alias), .. } = table_factor {
            requote_ident(&mut alias.name);
            for column in &mut alias.columns {
                requote_ident(column);
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(
        &mut self,
        query: &mut sqlparser::ast::Query,
    ) -> ControlFlow<Self::Break> {
        if let SetExpr::Select(select) = query.body.as_mut() {
            for item in &mut select.projection {
                if let SelectItem::ExprWithAlias { alias, .. } = item {
                    requote_ident(alias);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        match self.rewrite_expr(expr) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }
}

impl Transformer<'_> {
    fn rewrite_expr(&mut self, expr: &mut Expr) -> Result<(), UnsupportedConstructError> {
        match expr {
            Expr::Identifier(ident) if ident.quote_style.is_none() => {
                if let Some(name) = ident.value.strip_prefix("@@") {
                    let name = name.to_string();
                    *expr = system_variable(&name, self.session);
                    self.notes.push("system_variable");
                } else if ident.value.starts_with('@') {
                    let value = self
                        .session
                        .user_vars
                        .get(&ident.value[1..].to_ascii_lowercase())
                        .cloned()
                        .unwrap_or(UserValue::Null);
                    *expr = value.into_expr();
                    self.notes.push("user_variable");
                }
            }
            Expr::Identifier(ident) => requote_ident(ident),
            Expr::CompoundIdentifier(parts) => {
                for part in parts.iter_mut() {
                    requote_ident(part);
                }
            }
            // Without ANSI_QUOTES, MySQL double-quoted tokens are string
            // literals; PostgreSQL would read them as identifiers.
            Expr::Value(Value::DoubleQuotedString(s)) => {
                let s = std::mem::take(s);
                *expr = Expr::Value(Value::SingleQuotedString(s));
            }
            Expr::MatchAgainst { .. } => {
                let taken = std::mem::replace(expr, Expr::Value(Value::Null));
                *expr = fulltext_predicate(taken)?;
                self.notes.push("match_against");
            }
            Expr::Function(_) => self.rewrite_function(expr)?,
            _ => {}
        }
        Ok(())
    }

    fn rewrite_function(&mut self, expr: &mut Expr) -> Result<(), UnsupportedConstructError> {
        let func = match expr {
            Expr::Function(func) => func,
            _ => return Ok(()),
        };
        let name = function_name(&func.name).to_ascii_lowercase();
        match name.as_str() {
            "ifnull" => {
                func.name = ObjectName(vec![Ident::new("coalesce")]);
                self.notes.push("ifnull");
            }
            "now" | "current_timestamp" => {
                func.name = ObjectName(vec![Ident::new("now")]);
            }
            "curdate" => {
                func.name = ObjectName(vec![Ident::new("current_date")]);
                func.args = sqlparser::ast::FunctionArguments::None;
                self.notes.push("curdate");
            }
            "unix_timestamp" => {
                let inner = match first_argument(func) {
                    Some(arg) => arg,
                    None => parse_projection_expr("now()").map_err(internal_template)?,
                };
                *expr = substitute(
                    parse_projection_expr("cast(extract(epoch from __x) as bigint)")
                        .map_err(internal_template)?,
                    "__x",
                    inner,
                );
                self.notes.push("unix_timestamp");
            }
            "concat" => {
                if let Some(chain) = concat_as_operator(func) {
                    *expr = chain;
                }
                self.notes.push("concat");
            }
            "group_concat" => {
                rewrite_group_concat(func).map_err(internal_template)?;
                self.notes.push("group_concat");
            }
            "last_insert_id" if func_has_no_args(func) => {
                *expr = Expr::Value(Value::Number(self.session.last_insert_id.to_string(), false));
                self.notes.push("last_insert_id");
            }
            "database" | "schema" => {
                *expr = if self.session.database.is_empty() {
                    Expr::Value(Value::Null)
                } else {
                    Expr::Value(Value::SingleQuotedString(self.session.database.clone()))
                };
                self.notes.push("database_fn");
            }
            "version" => {
                *expr = Expr::Value(Value::SingleQuotedString(
                    get_config().server.version.clone(),
                ));
                self.notes.push("version_fn");
            }
            "connection_id" => {
                *expr = Expr::Value(Value::Number(self.session.id.to_string(), false));
                self.notes.push("connection_id_fn");
            }
            _ => {}
        }
        Ok(())
    }
}

fn internal_template(err: Error) -> UnsupportedConstructError {
    // Template parses are static strings; failing to parse one is a bug,
    // reported as an untranslatable construct rather than a panic.
    UnsupportedConstructError::new("INTERNAL", err.to_string())
}

/// `MATCH(cols) AGAINST (expr)` → tsvector containment.
fn fulltext_predicate(expr: Expr) -> Result<Expr, UnsupportedConstructError> {
    let (columns, match_value) = match expr {
        Expr::MatchAgainst {
            columns,
            match_value,
            ..
        } => (columns, match_value),
        other => return Ok(other),
    };

    let mut concat: Option<Expr> = None;
    for column in columns {
        let mut ident = column;
        requote_ident(&mut ident);
        let piece = Expr::Identifier(ident);
        concat = Some(match concat {
            None => piece,
            Some(prev) => Expr::BinaryOp {
                left: Box::new(prev),
                op: BinaryOperator::StringConcat,
                right: Box::new(Expr::BinaryOp {
                    left: Box::new(Expr::Value(Value::SingleQuotedString(" ".into()))),
                    op: BinaryOperator::StringConcat,
                    right: Box::new(piece),
                }),
            },
        });
    }
    let columns_expr =
        concat.ok_or_else(|| UnsupportedConstructError::new("MATCH", "empty column list"))?;

    let vector = substitute(
        parse_projection_expr("to_tsvector('simple', __x)").map_err(internal_template)?,
        "__x",
        columns_expr,
    );
    let query = substitute(
        parse_projection_expr("plainto_tsquery('simple', __x)").map_err(internal_template)?,
        "__x",
        Expr::Value(match_value),
    );

    Ok(Expr::BinaryOp {
        left: Box::new(vector),
        op: BinaryOperator::PGCustomBinaryOperator(vec!["pg_catalog".into(), "@@".into()]),
        right: Box::new(query),
    })
}

/// `CONCAT(a, b, ...)` becomes `a || b || ...` when every argument provably
/// cannot be NULL (the operator propagates NULL, `concat()` does not).
fn concat_as_operator(func: &sqlparser::ast::Function) -> Option<Expr> {
    let args = argument_exprs(func)?;
    if args.is_empty() || !args.iter().all(is_non_null_literal) {
        return None;
    }
    let mut iter = args.into_iter();
    let mut chain = iter.next()?;
    for arg in iter {
        chain = Expr::BinaryOp {
            left: Box::new(chain),
            op: BinaryOperator::StringConcat,
            right: Box::new(arg),
        };
    }
    Some(chain)
}

fn is_non_null_literal(expr: &Expr) -> bool {
    match expr {
        Expr::Value(Value::SingleQuotedString(_))
        | Expr::Value(Value::DoubleQuotedString(_))
        | Expr::Value(Value::Number(_, _)) => true,
        Expr::Nested(inner) => is_non_null_literal(inner),
        _ => false,
    }
}

/// `GROUP_CONCAT(x SEPARATOR s)` → `string_agg(x::text, s)`; the separator
/// clause is recognized by its rendering so the exact clause variant the
/// parser produced does not matter.
fn rewrite_group_concat(func: &mut sqlparser::ast::Function) -> Result<(), Error> {
    func.name = ObjectName(vec![Ident::new("string_agg")]);

    let mut separator_sql = "','".to_string();
    if let sqlparser::ast::FunctionArguments::List(list) = &mut func.args {
        list.clauses.retain(|clause| {
            let rendered = clause.to_string();
            match rendered
                .strip_prefix("SEPARATOR ")
                .or_else(|| rendered.strip_prefix("separator "))
            {
                Some(rest) => {
                    separator_sql = rest.to_string();
                    false
                }
                None => true,
            }
        });

        if let Some(sqlparser::ast::FunctionArg::Unnamed(
            sqlparser::ast::FunctionArgExpr::Expr(first),
        )) = list.args.first_mut()
        {
            let inner = std::mem::replace(first, Expr::Value(Value::Null));
            *first = substitute(
                parse_projection_expr("cast(__x as text)")?,
                "__x",
                inner,
            );
        }

        let separator = parse_projection_expr(&separator_sql)?;
        list.args.push(sqlparser::ast::FunctionArg::Unnamed(
            sqlparser::ast::FunctionArgExpr::Expr(separator),
        ));
    }
    Ok(())
}

/// MySQL type name → PostgreSQL type, driven by the rendered name so it
/// covers every parser representation of the MySQL spellings.
pub fn map_data_type(data_type: &DataType) -> Result<DataType, Error> {
    let rendered = data_type.to_string().to_ascii_uppercase();
    let rendered = rendered.trim();
    let unsigned = rendered.contains("UNSIGNED");

    let mapped: Option<DataType> = if rendered.starts_with("TINYINT(1)") && !unsigned {
        Some(named_type("boolean"))
    } else if rendered.starts_with("TINYINT") || rendered.starts_with("SMALLINT") {
        Some(named_type(if unsigned { "integer" } else { "smallint" }))
    } else if rendered.starts_with("MEDIUMINT") {
        Some(named_type("integer"))
    } else if rendered.starts_with("BIGINT") {
        Some(if unsigned {
            DataType::Custom(ObjectName(vec![Ident::new("numeric")]), vec!["20".into()])
        } else {
            named_type("bigint")
        })
    } else if rendered.starts_with("INT") || rendered.starts_with("INTEGER") {
        Some(named_type(if unsigned { "bigint" } else { "integer" }))
    } else if rendered.starts_with("YEAR") {
        Some(named_type("smallint"))
    } else if rendered.starts_with("DATETIME") {
        Some(named_type("timestamp"))
    } else if rendered.starts_with("TINYTEXT")
        || rendered.starts_with("MEDIUMTEXT")
        || rendered.starts_with("LONGTEXT")
    {
        Some(named_type("text"))
    } else if rendered.starts_with("TINYBLOB")
        || rendered.starts_with("MEDIUMBLOB")
        || rendered.starts_with("LONGBLOB")
        || rendered.starts_with("BLOB")
    {
        Some(named_type("bytea"))
    } else if rendered.starts_with("JSON") {
        Some(named_type("jsonb"))
    } else if rendered.starts_with("ENUM") || rendered.starts_with("SET(") || rendered == "SET" {
        return Err(Error::Unsupported(UnsupportedConstructError::new(
            "ENUM/SET",
            format!("column type {rendered} is not translated"),
        )));
    } else if [
        "GEOMETRY",
        "POINT",
        "LINESTRING",
        "POLYGON",
        "MULTIPOINT",
        "MULTILINESTRING",
        "MULTIPOLYGON",
        "GEOMETRYCOLLECTION",
    ]
    .iter()
    .any(|s| rendered.starts_with(s))
    {
        return Err(Error::Unsupported(UnsupportedConstructError::new(
            "SPATIAL",
            format!("spatial type {rendered} is not translated"),
        )));
    } else {
        None
    };

    Ok(mapped.unwrap_or_else(|| data_type.clone()))
}

fn named_type(name: &str) -> DataType {
    DataType::Custom(ObjectName(vec![Ident::new(name)]), Vec::new())
}

/// `generated by default as identity`, spelled as raw tokens so it renders
/// identically across parser versions.
fn identity_column_option() -> sqlparser::ast::ColumnOptionDef {
    let tokens = ["GENERATED", "BY", "DEFAULT", "AS", "IDENTITY"]
        .iter()
        .map(|word| Token::make_keyword(word))
        .collect();
    sqlparser::ast::ColumnOptionDef {
        name: None,
        option: sqlparser::ast::ColumnOption::DialectSpecific(tokens),
    }
}

/// MySQL secondary-index clauses inside CREATE TABLE have no PostgreSQL
/// equivalent in-line; they are dropped (a separate CREATE INDEX would be
/// the faithful translation, which the proxy does not attempt).
fn strip_index_constraints(create: &mut sqlparser::ast::CreateTable, out: &mut TransformOutput) {
    let before = create.constraints.len();
    create.constraints.retain(|constraint| {
        let rendered = constraint.to_string().to_ascii_uppercase();
        !(rendered.starts_with("KEY")
            || rendered.starts_with("INDEX")
            || rendered.starts_with("FULLTEXT")
            || rendered.starts_with("SPATIAL"))
    });
    if create.constraints.len() != before {
        out.notes.push("index_clause_dropped");
    }
}

fn requote_constraint(constraint: &mut sqlparser::ast::TableConstraint) {
    use sqlparser::ast::TableConstraint;
    match constraint {
        TableConstraint::PrimaryKey { columns, .. } | TableConstraint::Unique { columns, .. } => {
            for column in columns.iter_mut() {
                requote_ident(column);
            }
        }
        TableConstraint::ForeignKey {
            columns,
            foreign_table,
            referred_columns,
            ..
        } => {
            for column in columns.iter_mut() {
                requote_ident(column);
            }
            requote_object_name(foreign_table);
            for column in referred_columns.iter_mut() {
                requote_ident(column);
            }
        }
        _ => {}
    }
}

/// System variables clients commonly probe; unknown names resolve to NULL.
fn system_variable(name: &str, session: &Session) -> Expr {
    let name = name
        .trim_start_matches("session.")
        .trim_start_matches("SESSION.")
        .trim_start_matches("global.")
        .trim_start_matches("GLOBAL.")
        .to_ascii_lowercase();
    let text = |s: &str| Expr::Value(Value::SingleQuotedString(s.to_string()));
    let number = |s: &str| Expr::Value(Value::Number(s.to_string(), false));
    match name.as_str() {
        "version" => text(&get_config().server.version),
        "version_comment" => text("AProxy"),
        "autocommit" => number(if session.transaction_active { "0" } else { "1" }),
        "max_allowed_packet" => number("67108864"),
        "sql_mode" => text(""),
        "tx_isolation" | "transaction_isolation" => text("REPEATABLE-READ"),
        "character_set_client" | "character_set_connection" | "character_set_results"
        | "character_set_server" => text("utf8mb4"),
        "collation_connection" | "collation_server" => text("utf8mb4_general_ci"),
        "lower_case_table_names" => number("0"),
        "wait_timeout" | "interactive_timeout" => number("28800"),
        _ => Expr::Value(Value::Null),
    }
}

// ---- small AST helpers ----

pub fn requote_ident(ident: &mut Ident) {
    if ident.quote_style == Some('`') {
        ident.quote_style = Some('"');
    }
}

fn dequote(mut ident: Ident) -> Ident {
    requote_ident(&mut ident);
    ident
}

pub fn requote_object_name(name: &mut ObjectName) {
    for ident in name.0.iter_mut() {
        requote_ident(ident);
    }
}

/// Unquoted last segment of a table reference, for cache keys.
pub fn object_table_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

pub fn function_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

fn func_has_no_args(func: &sqlparser::ast::Function) -> bool {
    match &func.args {
        sqlparser::ast::FunctionArguments::None => true,
        sqlparser::ast::FunctionArguments::List(list) => list.args.is_empty(),
        _ => false,
    }
}

fn argument_exprs(func: &sqlparser::ast::Function) -> Option<Vec<Expr>> {
    let list = match &func.args {
        sqlparser::ast::FunctionArguments::List(list) => list,
        _ => return None,
    };
    let mut out = Vec::with_capacity(list.args.len());
    for arg in &list.args {
        match arg {
            sqlparser::ast::FunctionArg::Unnamed(sqlparser::ast::FunctionArgExpr::Expr(expr)) => {
                out.push(expr.clone())
            }
            _ => return None,
        }
    }
    Some(out)
}

fn first_argument(func: &sqlparser::ast::Function) -> Option<Expr> {
    argument_exprs(func).and_then(|mut args| {
        if args.is_empty() {
            None
        } else {
            Some(args.remove(0))
        }
    })
}

fn single_ident_argument(func: &sqlparser::ast::Function) -> Option<Ident> {
    let args = argument_exprs(func)?;
    match args.as_slice() {
        [Expr::Identifier(ident)] => Some(dequote(ident.clone())),
        _ => None,
    }
}

/// Parse `SELECT <sql>` with the PostgreSQL dialect and return the
/// projection expression. Used to build nodes with one stable spelling.
pub fn parse_projection_expr(sql: &str) -> Result<Expr, Error> {
    let dialect = PostgreSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, &format!("SELECT {sql}"))
        .map_err(|err| Error::RewriteInternal(format!("template {sql:?}: {err}")))?;
    let statement = statements
        .pop()
        .ok_or_else(|| Error::RewriteInternal(format!("template {sql:?}: empty")))?;
    if let Statement::Query(query) = statement {
        if let SetExpr::Select(select) = *query.body {
            if let Some(SelectItem::UnnamedExpr(expr)) = select.projection.into_iter().next() {
                return Ok(expr);
            }
        }
    }
    Err(Error::RewriteInternal(format!(
        "template {sql:?}: unexpected shape"
    )))
}

/// Replace the `__x`-style marker identifier inside a template expression.
pub fn substitute(mut template: Expr, marker: &str, replacement: Expr) -> Expr {
    let mut replacement = Some(replacement);
    let _ = visit_expressions_mut(&mut template, |node| {
        if let Expr::Identifier(ident) = node {
            if ident.value == marker {
                if let Some(replacement) = replacement.take() {
                    *node = replacement;
                }
            }
        }
        ControlFlow::<()>::Continue(())
    });
    template
}
