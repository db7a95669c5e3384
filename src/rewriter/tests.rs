//! Rewriter tests: string in, string out, plus the session-level outcomes.

use super::split::{split_statements, strip_mysql_hints};
use super::*;
use crate::schema::{ColumnSchema, TableSchema, CACHE};
use crate::session::{Session, SESSIONS};

fn session() -> Session {
    SESSIONS.create("127.0.0.1:40000".parse().unwrap(), "tester", "appdb")
}

async fn rewrite_ok(sql: &str, session: &Session) -> RewriteOutcome {
    rewrite(sql, session, &CACHE)
        .await
        .unwrap_or_else(|err| panic!("rewrite of {sql:?} failed: {err}"))
}

async fn backend_sql(sql: &str, session: &Session) -> RewriteResult {
    match rewrite_ok(sql, session).await {
        RewriteOutcome::Execute(result) => result,
        other => panic!("expected backend statement for {sql:?}, got {other:?}"),
    }
}

fn prime_table(table: &str, primary_key: &[&str], identity: Option<&str>) {
    CACHE.prime(
        "appdb",
        table,
        TableSchema {
            table: table.to_string(),
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    type_oid: 23,
                    nullable: false,
                },
                ColumnSchema {
                    name: "c".into(),
                    type_oid: 23,
                    nullable: true,
                },
            ],
            primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
            identity: identity.map(|s| s.to_string()),
        },
    );
}

#[tokio::test]
async fn test_backtick_identifiers() {
    let session = session();
    let result = backend_sql(
        "SELECT `id`, `name` FROM `users` WHERE `id` = ?",
        &session,
    )
    .await;
    assert_eq!(
        result.sql,
        "SELECT \"id\", \"name\" FROM \"users\" WHERE \"id\" = $1"
    );
    assert_eq!(result.param_count, 1);
    assert_eq!(result.param_map, vec![0]);
}

#[tokio::test]
async fn test_placeholder_order_is_textual() {
    let session = session();
    let result = backend_sql(
        "SELECT * FROM t WHERE a = ? AND b = ? ORDER BY c LIMIT ?",
        &session,
    )
    .await;
    assert_eq!(result.input_params, 3);
    assert_eq!(result.param_count, 3);
    assert_eq!(result.param_map, vec![0, 1, 2]);
    assert!(result.sql.contains("$1"));
    assert!(result.sql.contains("$3"));
}

#[tokio::test]
async fn test_idempotent_on_plain_sql() {
    let session = session();
    let result = backend_sql("SELECT id, name FROM users WHERE id = 1", &session).await;
    assert_eq!(result.sql, "SELECT id, name FROM users WHERE id = 1");
    assert!(result.notes.is_empty());
}

#[tokio::test]
async fn test_ifnull_becomes_coalesce() {
    let session = session();
    let result = backend_sql("SELECT IFNULL(a, 0) FROM t", &session).await;
    assert_eq!(result.sql, "SELECT coalesce(a, 0) FROM t");
    assert!(result.notes.contains(&"ifnull"));
}

#[tokio::test]
async fn test_group_concat() {
    let session = session();
    let result = backend_sql(
        "SELECT GROUP_CONCAT(name SEPARATOR '|') FROM t WHERE id = 1",
        &session,
    )
    .await;
    assert!(result.sql.contains("string_agg"), "got {}", result.sql);
    assert!(result.sql.contains("'|'"), "got {}", result.sql);
    assert!(result.sql.contains("AS TEXT"), "got {}", result.sql);
}

#[tokio::test]
async fn test_concat_of_literals_uses_operator() {
    let session = session();
    let result = backend_sql("SELECT CONCAT('a', 'b', 'c')", &session).await;
    assert!(result.sql.contains("'a' || 'b' || 'c'"), "got {}", result.sql);

    // Possibly-NULL arguments keep the NULL-ignoring function form.
    let result = backend_sql("SELECT CONCAT(a, b) FROM t", &session).await;
    assert!(result.sql.contains("CONCAT(a, b)"), "got {}", result.sql);
}

#[tokio::test]
async fn test_unix_timestamp() {
    let session = session();
    let result = backend_sql("SELECT UNIX_TIMESTAMP(created_at) FROM t", &session).await;
    let upper = result.sql.to_uppercase();
    assert!(upper.contains("EXTRACT(EPOCH FROM"), "got {}", result.sql);
    assert!(upper.contains("AS BIGINT"), "got {}", result.sql);
}

#[tokio::test]
async fn test_match_against() {
    let session = session();
    let result = backend_sql(
        "SELECT * FROM docs WHERE MATCH(title, body) AGAINST ('rust')",
        &session,
    )
    .await;
    assert!(result.sql.contains("to_tsvector('simple'"), "got {}", result.sql);
    assert!(result.sql.contains("plainto_tsquery('simple', 'rust')"), "got {}", result.sql);
    assert!(result.sql.contains("OPERATOR(pg_catalog.@@)"), "got {}", result.sql);
}

#[tokio::test]
async fn test_lock_in_share_mode() {
    let session = session();
    let result = backend_sql("SELECT * FROM t WHERE id = 1 LOCK IN SHARE MODE", &session).await;
    assert!(result.sql.to_uppercase().contains("FOR SHARE"), "got {}", result.sql);
}

#[tokio::test]
async fn test_index_hints_stripped() {
    let session = session();
    let result = backend_sql(
        "SELECT * FROM t FORCE INDEX (idx_a) WHERE a = 1",
        &session,
    )
    .await;
    assert!(!result.sql.to_uppercase().contains("FORCE"), "got {}", result.sql);
}

#[tokio::test]
async fn test_double_quoted_string_literal() {
    let session = session();
    let result = backend_sql("SELECT \"hello\"", &session).await;
    assert!(result.sql.contains("'hello'"), "got {}", result.sql);
}

#[tokio::test]
async fn test_on_duplicate_key_update() {
    let session = session();
    prime_table("t1", &["id"], None);
    let result = backend_sql(
        "INSERT INTO t1 (id, c) VALUES (1, 10) ON DUPLICATE KEY UPDATE c = c + VALUES(c)",
        &session,
    )
    .await;
    let upper = result.sql.to_uppercase();
    assert!(upper.contains("ON CONFLICT"), "got {}", result.sql);
    assert!(upper.contains("DO UPDATE SET"), "got {}", result.sql);
    assert!(result.sql.contains("excluded.c"), "got {}", result.sql);
    assert!(result.sql.contains("t1.c"), "got {}", result.sql);
}

#[tokio::test]
async fn test_on_duplicate_key_without_schema_is_rejected() {
    let session = session();
    let err = rewrite(
        "INSERT INTO never_cached (id, c) VALUES (1, 10) ON DUPLICATE KEY UPDATE c = 2",
        &session,
        &CACHE,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("ON DUPLICATE KEY UPDATE"));
}

#[tokio::test]
async fn test_insert_identity_returning() {
    let session = session();
    prime_table("items", &["id"], Some("id"));
    let result = backend_sql("INSERT INTO items (c) VALUES (100)", &session).await;
    assert!(result.sql.to_uppercase().contains("RETURNING"), "got {}", result.sql);
    assert!(matches!(
        result.kind,
        StatementKind::Dml {
            returning_identity: true
        }
    ));
}

#[tokio::test]
async fn test_bare_last_insert_id_is_local() {
    let mut session = session();
    session.last_insert_id = 41;
    match rewrite_ok("SELECT LAST_INSERT_ID()", &session).await {
        RewriteOutcome::LocalRows(rows) => {
            assert_eq!(rows.rows, vec![vec![Some(b"41".to_vec())]]);
            assert_eq!(rows.columns[0].name, "LAST_INSERT_ID()");
        }
        other => panic!("expected local rows, got {other:?}"),
    }
}

#[tokio::test]
async fn test_embedded_last_insert_id_is_literal() {
    let mut session = session();
    session.last_insert_id = 7;
    let result = backend_sql("SELECT LAST_INSERT_ID() + 1 FROM t", &session).await;
    assert!(result.sql.contains("7 + 1"), "got {}", result.sql);
}

#[tokio::test]
async fn test_create_table_types() {
    let session = session();
    let result = backend_sql(
        "CREATE TABLE m (id INT AUTO_INCREMENT PRIMARY KEY, \
         flag TINYINT(1), small SMALLINT, big BIGINT UNSIGNED, \
         body LONGTEXT, doc JSON, at DATETIME) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        &session,
    )
    .await;
    let sql = &result.sql;
    assert!(sql.contains("GENERATED BY DEFAULT AS IDENTITY"), "got {sql}");
    assert!(sql.contains("boolean"), "got {sql}");
    assert!(sql.contains("numeric(20)"), "got {sql}");
    assert!(sql.contains("text"), "got {sql}");
    assert!(sql.contains("jsonb"), "got {sql}");
    assert!(sql.contains("timestamp"), "got {sql}");
    assert!(!sql.to_uppercase().contains("ENGINE"), "got {sql}");
    assert!(!sql.to_uppercase().contains("CHARSET"), "got {sql}");
    assert_eq!(result.identity_ddl, Some(("m".to_string(), "id".to_string())));
    assert!(matches!(result.kind, StatementKind::Ddl { .. }));
}

#[tokio::test]
async fn test_replace_into_rejected() {
    let session = session();
    let err = rewrite("REPLACE INTO t VALUES (1, 'x')", &session, &CACHE)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("REPLACE INTO"), "got {err}");
}

#[tokio::test]
async fn test_dml_limit_rejected() {
    let session = session();
    let err = rewrite("DELETE FROM t LIMIT 5", &session, &CACHE)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("LIMIT"), "got {err}");

    let err = rewrite("UPDATE t SET a = 1 LIMIT 5", &session, &CACHE)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("LIMIT"), "got {err}");
}

#[tokio::test]
async fn test_banned_functions_rejected() {
    let session = session();
    for sql in [
        "SELECT GET_LOCK('x', 10)",
        "SELECT RELEASE_LOCK('x')",
        "SELECT FOUND_ROWS()",
        "SELECT LOAD_FILE('/etc/passwd')",
    ] {
        assert!(
            rewrite(sql, &session, &CACHE).await.is_err(),
            "{sql} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_enum_column_rejected() {
    let session = session();
    let err = rewrite(
        "CREATE TABLE e (id INT, kind ENUM('a', 'b'))",
        &session,
        &CACHE,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("ENUM"), "got {err}");
}

#[tokio::test]
async fn test_use_is_session_level() {
    let session = session();
    match rewrite_ok("USE `shop`", &session).await {
        RewriteOutcome::Session(ops) => {
            assert!(matches!(&ops[..], [SessionOp::UseDatabase(db)] if db == "shop"));
        }
        other => panic!("expected session op, got {other:?}"),
    }
}

#[tokio::test]
async fn test_set_user_variables() {
    let session = session();
    match rewrite_ok("SET @x = 5, @y = 'abc'", &session).await {
        RewriteOutcome::Session(ops) => {
            assert_eq!(ops.len(), 2);
            assert!(matches!(
                &ops[0],
                SessionOp::SetUserVar(name, UserValue::Int(5)) if name == "x"
            ));
            assert!(matches!(
                &ops[1],
                SessionOp::SetUserVar(name, UserValue::Str(s)) if name == "y" && s == "abc"
            ));
        }
        other => panic!("expected session ops, got {other:?}"),
    }
}

#[tokio::test]
async fn test_set_var_from_subquery_rejected() {
    let session = session();
    let err = rewrite("SET @x = (SELECT 1)", &session, &CACHE)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("SELECT"), "got {err}");
}

#[tokio::test]
async fn test_set_names_and_autocommit() {
    let session = session();
    match rewrite_ok("SET NAMES utf8mb4", &session).await {
        RewriteOutcome::Session(ops) => {
            assert!(matches!(&ops[..], [SessionOp::SetNames(cs)] if cs == "utf8mb4"));
        }
        other => panic!("expected session op, got {other:?}"),
    }
    match rewrite_ok("SET autocommit = 1", &session).await {
        RewriteOutcome::Session(ops) => {
            assert!(matches!(&ops[..], [SessionOp::Swallow("autocommit")]));
        }
        other => panic!("expected session op, got {other:?}"),
    }
}

#[tokio::test]
async fn test_user_variable_substitution() {
    let mut session = session();
    session
        .user_vars
        .insert("who".into(), UserValue::Str("ada".into()));
    let result = backend_sql("SELECT * FROM t WHERE name = @who", &session).await;
    assert!(result.sql.contains("'ada'"), "got {}", result.sql);
}

#[tokio::test]
async fn test_system_variable_probe() {
    let session = session();
    let result = backend_sql("SELECT @@version_comment LIMIT 1", &session).await;
    assert!(result.sql.contains("'AProxy'"), "got {}", result.sql);
}

#[tokio::test]
async fn test_show_tables() {
    let session = session();
    let result = backend_sql("SHOW TABLES", &session).await;
    assert!(result.sql.contains("information_schema.tables"), "got {}", result.sql);
    assert!(result.sql.contains("Tables_in_appdb"), "got {}", result.sql);
    assert_eq!(result.kind, StatementKind::Query);
}

#[tokio::test]
async fn test_show_columns_and_variables() {
    let session = session();
    let result = backend_sql("SHOW COLUMNS FROM users LIKE 'a%'", &session).await;
    assert!(result.sql.contains("information_schema.columns"), "got {}", result.sql);
    assert!(result.sql.contains("LIKE 'a%'"), "got {}", result.sql);
    assert!(result.sql.contains("\"Field\""), "got {}", result.sql);

    let result = backend_sql("SHOW VARIABLES", &session).await;
    assert!(result.sql.contains("pg_settings"), "got {}", result.sql);
    assert!(result.sql.contains("\"Variable_name\""), "got {}", result.sql);
}

#[tokio::test]
async fn test_prepare_execute_text_protocol() {
    let session = session();
    match rewrite_ok("PREPARE s1 FROM 'SELECT * FROM t WHERE id = ?'", &session).await {
        RewriteOutcome::Session(ops) => {
            assert!(matches!(
                &ops[..],
                [SessionOp::PrepareText { name, query }]
                    if name == "s1" && query == "SELECT * FROM t WHERE id = ?"
            ));
        }
        other => panic!("expected session op, got {other:?}"),
    }
    match rewrite_ok("EXECUTE s1 USING @a", &session).await {
        RewriteOutcome::Session(ops) => {
            assert!(matches!(
                &ops[..],
                [SessionOp::ExecuteText { name, using }] if name == "s1" && using == &["a"]
            ));
        }
        other => panic!("expected session op, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transaction_statements() {
    let session = session();
    assert_eq!(backend_sql("BEGIN", &session).await.kind, StatementKind::Begin);
    assert_eq!(
        backend_sql("START TRANSACTION", &session).await.kind,
        StatementKind::Begin
    );
    assert_eq!(backend_sql("COMMIT", &session).await.kind, StatementKind::Commit);
    assert_eq!(
        backend_sql("ROLLBACK", &session).await.kind,
        StatementKind::Rollback
    );
}

#[test]
fn test_split_statements() {
    assert_eq!(
        split_statements("SELECT 1; SELECT 2; -- done"),
        vec!["SELECT 1", "SELECT 2"]
    );
    assert_eq!(
        split_statements("SELECT 'a;b'; SELECT `x;y` FROM t;"),
        vec!["SELECT 'a;b'", "SELECT `x;y` FROM t"]
    );
    assert_eq!(
        split_statements("/* c1; c2 */ SELECT 1 # trailing; comment"),
        vec!["/* c1; c2 */ SELECT 1 # trailing; comment"]
    );
    assert!(split_statements("  ;; ").is_empty());
}

#[test]
fn test_strip_hints_preserves_strings() {
    let (sql, notes) = strip_mysql_hints("SELECT 'USE INDEX (i)' FROM t");
    assert_eq!(sql, "SELECT 'USE INDEX (i)' FROM t");
    assert!(notes.is_empty());

    let (sql, notes) = strip_mysql_hints("SELECT * FROM a STRAIGHT_JOIN b ON a.x = b.x");
    assert!(sql.contains(" JOIN b"), "got {sql}");
    assert!(notes.contains(&"straight_join"));
}

#[test]
fn test_lexical_placeholder_relabeling() {
    // The pass-through path (sql_rewrite.enabled = false) translates only
    // placeholder syntax, leaving everything else byte for byte.
    let (sql, count) = super::split::relabel_placeholders_lexical(
        "SELECT `x` FROM t WHERE a = ? AND b = '?' AND c = ?",
    );
    assert_eq!(sql, "SELECT `x` FROM t WHERE a = $1 AND b = '?' AND c = $2");
    assert_eq!(count, 2);
}
