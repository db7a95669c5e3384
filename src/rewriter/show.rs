//! SHOW statement translation.
//!
//! MySQL SHOW forms have no stable parse across the dialect grammar, so they
//! are recognized lexically and expanded into `information_schema` /
//! `pg_catalog` queries whose aliases carry the MySQL column names.

use crate::errors::{Error, UnsupportedConstructError};
use crate::session::Session;

use super::{RewriteResult, StatementKind};

/// One token of a SHOW statement: bare word, `quoted literal`, or name.
pub(crate) fn tokens(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == ';' || c == ',' {
            chars.next();
        } else if c == '\'' {
            chars.next();
            let mut lit = String::from("'");
            while let Some(ch) = chars.next() {
                lit.push(ch);
                if ch == '\'' {
                    if chars.peek() == Some(&'\'') {
                        lit.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                }
            }
            out.push(lit);
        } else if c == '`' {
            chars.next();
            let mut name = String::new();
            while let Some(ch) = chars.next() {
                if ch == '`' {
                    if chars.peek() == Some(&'`') {
                        name.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                } else {
                    name.push(ch);
                }
            }
            out.push(name);
        } else {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || ch == ';' || ch == ',' || ch == '\'' || ch == '`' {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            out.push(word);
        }
    }
    out
}

fn escape_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

fn escape_ident_in_alias(raw: &str) -> String {
    raw.replace('"', "\"\"")
}

/// The schema predicate: an explicit database or the session's search path.
fn schema_filter(db: Option<&str>) -> String {
    match db {
        Some(db) => escape_literal(db),
        None => "current_schema()".to_string(),
    }
}

pub fn translate_show(sql: &str, session: &Session) -> Result<RewriteResult, Error> {
    let toks = tokens(sql);
    let upper: Vec<String> = toks.iter().map(|t| t.to_ascii_uppercase()).collect();
    debug_assert!(!toks.is_empty());

    let mut i = 1; // past SHOW
    let mut full = false;
    while i < toks.len() {
        match upper[i].as_str() {
            "FULL" => {
                full = true;
                i += 1;
            }
            "GLOBAL" | "SESSION" | "EXTENDED" => i += 1,
            _ => break,
        }
    }
    let verb = upper.get(i).cloned().unwrap_or_default();
    let rest = &toks[i + 1..];
    let rest_upper = &upper[i + 1..];

    // Trailing `LIKE 'pattern'`.
    let like = rest_upper
        .iter()
        .position(|t| t == "LIKE")
        .and_then(|p| rest.get(p + 1))
        .filter(|lit| lit.starts_with('\''))
        .cloned();

    let sql = match verb.as_str() {
        "TABLES" => {
            let db = rest_upper
                .iter()
                .position(|t| t == "FROM" || t == "IN")
                .and_then(|p| rest.get(p + 1))
                .map(String::as_str);
            let label = escape_ident_in_alias(db.unwrap_or(session.database.as_str()));
            let mut query = format!(
                "SELECT table_name AS \"Tables_in_{label}\"{} FROM information_schema.tables \
                 WHERE table_schema = {}",
                if full {
                    ", CASE table_type WHEN 'VIEW' THEN 'VIEW' ELSE 'BASE TABLE' END AS \"Table_type\""
                } else {
                    ""
                },
                schema_filter(db),
            );
            if let Some(pattern) = like {
                query.push_str(&format!(" AND table_name LIKE {pattern}"));
            }
            query.push_str(" ORDER BY table_name");
            query
        }
        "DATABASES" | "SCHEMAS" => {
            let mut query = String::from(
                "SELECT nspname AS \"Database\" FROM pg_catalog.pg_namespace \
                 WHERE nspname NOT LIKE 'pg\\_%' AND nspname <> 'information_schema'",
            );
            if let Some(pattern) = like {
                query.push_str(&format!(" AND nspname LIKE {pattern}"));
            }
            query.push_str(" ORDER BY nspname");
            query
        }
        "COLUMNS" | "FIELDS" => {
            let from = rest_upper
                .iter()
                .position(|t| t == "FROM" || t == "IN")
                .ok_or_else(|| {
                    Error::RewriteInternal("SHOW COLUMNS requires FROM <table>".into())
                })?;
            let table = rest
                .get(from + 1)
                .ok_or_else(|| Error::RewriteInternal("SHOW COLUMNS requires a table".into()))?;
            let db = rest_upper[from + 2..]
                .iter()
                .position(|t| t == "FROM" || t == "IN")
                .and_then(|p| rest.get(from + 2 + p + 1))
                .map(String::as_str);
            let mut query = format!(
                "SELECT c.column_name AS \"Field\", c.data_type AS \"Type\", \
                 c.is_nullable AS \"Null\", \
                 CASE WHEN kcu.column_name IS NOT NULL THEN 'PRI' ELSE '' END AS \"Key\", \
                 c.column_default AS \"Default\", \
                 CASE WHEN c.is_identity = 'YES' THEN 'auto_increment' ELSE '' END AS \"Extra\" \
                 FROM information_schema.columns c \
                 LEFT JOIN information_schema.table_constraints tc \
                   ON tc.table_schema = c.table_schema AND tc.table_name = c.table_name \
                  AND tc.constraint_type = 'PRIMARY KEY' \
                 LEFT JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_name = tc.constraint_name \
                  AND kcu.table_schema = c.table_schema AND kcu.table_name = c.table_name \
                  AND kcu.column_name = c.column_name \
                 WHERE c.table_schema = {} AND c.table_name = {}",
                schema_filter(db),
                escape_literal(table),
            );
            if let Some(pattern) = like {
                query.push_str(&format!(" AND c.column_name LIKE {pattern}"));
            }
            query.push_str(" ORDER BY c.ordinal_position");
            query
        }
        "CREATE" => {
            if rest_upper.first().map(String::as_str) != Some("TABLE") {
                return Err(Error::Unsupported(UnsupportedConstructError::new(
                    "SHOW CREATE",
                    "only SHOW CREATE TABLE is translated",
                )));
            }
            let table = rest
                .get(1)
                .ok_or_else(|| Error::RewriteInternal("SHOW CREATE TABLE requires a table".into()))?;
            format!(
                "SELECT c.table_name AS \"Table\", \
                 'CREATE TABLE \"' || c.table_name || '\" (' || \
                 string_agg('\"' || c.column_name || '\" ' || c.data_type || \
                            CASE WHEN c.is_nullable = 'NO' THEN ' NOT NULL' ELSE '' END, \
                            ', ' ORDER BY c.ordinal_position) || ')' AS \"Create Table\" \
                 FROM information_schema.columns c \
                 WHERE c.table_schema = current_schema() AND c.table_name = {} \
                 GROUP BY c.table_name",
                escape_literal(table),
            )
        }
        "VARIABLES" | "STATUS" => {
            let mut query = String::from(
                "SELECT name AS \"Variable_name\", setting AS \"Value\" \
                 FROM pg_catalog.pg_settings",
            );
            if let Some(pattern) = like {
                query.push_str(&format!(" WHERE name LIKE {pattern}"));
            }
            query.push_str(" ORDER BY name");
            query
        }
        other => {
            return Err(Error::Unsupported(UnsupportedConstructError::new(
                "SHOW",
                format!("SHOW {other} is not translated"),
            )))
        }
    };

    Ok(RewriteResult {
        sql,
        notes: vec!["show"],
        kind: StatementKind::Query,
        ..Default::default()
    })
}
