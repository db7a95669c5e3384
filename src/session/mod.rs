//! Per-client session state.
//!
//! A `Session` is owned by its handler task and mutated without locking; the
//! global `SessionManager` tracks shareable `SessionInfo` records so other
//! tasks (metrics, KILL) can observe sessions without touching live state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sqlparser::ast::{Expr, Value};

use crate::protocol::ColumnDefinition;
use crate::rewriter::StatementKind;

pub static SESSIONS: Lazy<SessionManager> = Lazy::new(SessionManager::new);

/// A typed user-variable value (`SET @x = ...`).
#[derive(Debug, Clone, PartialEq)]
pub enum UserValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl UserValue {
    /// The literal to splice into rewritten SQL where `@var` appeared.
    pub fn into_expr(self) -> Expr {
        match self {
            UserValue::Null => Expr::Value(Value::Null),
            UserValue::Int(int) => Expr::Value(Value::Number(int.to_string(), false)),
            UserValue::Float(float) => Expr::Value(Value::Number(float.to_string(), false)),
            UserValue::Str(s) => Expr::Value(Value::SingleQuotedString(s)),
        }
    }

    /// SQL literal text, for textual substitution in EXECUTE ... USING.
    pub fn to_sql_literal(&self) -> String {
        match self {
            UserValue::Null => "NULL".to_string(),
            UserValue::Int(int) => int.to_string(),
            UserValue::Float(float) => float.to_string(),
            UserValue::Str(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

/// A binary-protocol prepared statement.
pub struct PreparedStatement {
    pub id: u32,
    /// Original MySQL text, kept for re-preparing after a pool hop and for
    /// statements resolved at the session layer.
    pub source: String,
    pub rewritten: String,
    /// Placeholders the client binds (input order).
    pub input_params: usize,
    /// Backend placeholders after rewriting.
    pub param_count: usize,
    pub param_map: Vec<usize>,
    /// Backend parameter types captured at prepare time.
    pub param_types: Vec<tokio_postgres::types::Type>,
    /// MySQL parameter type codes from the first COM_STMT_EXECUTE.
    pub param_mysql_types: Option<Vec<(u8, bool)>>,
    /// MySQL column definitions for the prepare response and row encoding.
    pub columns: Vec<ColumnDefinition>,
    pub kind: StatementKind,
    /// Resolved without the backend (session ops or local rows); execution
    /// re-runs the rewrite against current session state.
    pub local: bool,
    /// Backend handle, valid only while the session holds its pinned
    /// connection; cleared whenever the lease moves.
    pub handle: Option<tokio_postgres::Statement>,
}

/// One logical MySQL client.
pub struct Session {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub username: String,
    /// Current database; maps to a schema on the PostgreSQL side.
    pub database: String,
    /// Charset code negotiated in the handshake.
    pub charset: u8,
    /// Explicit SET NAMES override, reconciled as client_encoding.
    pub client_encoding: Option<String>,
    pub timezone: Option<String>,
    pub user_vars: HashMap<String, UserValue>,
    pub last_insert_id: u64,
    pub affected_rows: u64,
    pub transaction_active: bool,
    pub prepared: HashMap<u32, PreparedStatement>,
    /// Text-protocol prepared statements (PREPARE name FROM ...).
    pub text_prepared: HashMap<String, String>,
    /// Identity columns observed in DDL this session, table → column.
    pub identity_tables: HashMap<String, String>,
    killed: Arc<AtomicBool>,
    next_statement_id: u32,
}

impl Session {
    pub fn next_statement_id(&mut self) -> u32 {
        self.next_statement_id += 1;
        self.next_statement_id
    }

    pub fn kill_requested(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Backend session parameters this session expects, diffed against a
    /// pool connection's last-applied set on every lease. Values are
    /// SQL-rendered, ready for `SET <key> TO <value>`.
    pub fn desired_parameters(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if !self.database.is_empty() {
            params.push((
                "search_path".to_string(),
                format!("\"{}\"", self.database.replace('"', "\"\"")),
            ));
        }
        if let Some(encoding) = self
            .client_encoding
            .as_deref()
            .and_then(pg_encoding_for_charset)
        {
            params.push(("client_encoding".to_string(), format!("'{encoding}'")));
        }
        if let Some(timezone) = &self.timezone {
            params.push((
                "TimeZone".to_string(),
                format!("'{}'", timezone.replace('\'', "''")),
            ));
        }
        params
    }
}

/// MySQL charset name → PostgreSQL encoding, where one exists.
pub fn pg_encoding_for_charset(charset: &str) -> Option<&'static str> {
    match charset {
        "utf8" | "utf8mb3" | "utf8mb4" => Some("UTF8"),
        "latin1" => Some("LATIN1"),
        "latin2" => Some("LATIN2"),
        "ascii" => Some("SQL_ASCII"),
        "cp1251" => Some("WIN1251"),
        "gbk" => Some("GBK"),
        "big5" => Some("BIG5"),
        _ => None,
    }
}

/// What the manager shares about a live session.
#[derive(Debug)]
pub struct SessionInfo {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub username: String,
    pub connected_at: Instant,
    killed: Arc<AtomicBool>,
}

impl SessionInfo {
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }
}

/// Registry of live sessions. The mutex guards only the map; it is never
/// held across I/O.
pub struct SessionManager {
    sessions: Mutex<HashMap<u64, Arc<SessionInfo>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> SessionManager {
        SessionManager {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the id before the handshake: the greeting advertises it as
    /// the MySQL connection id, the session registers with it afterwards.
    pub fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create(&self, remote_addr: SocketAddr, username: &str, database: &str) -> Session {
        let id = self.reserve_id();
        self.register(id, remote_addr, username, database)
    }

    pub fn register(
        &self,
        id: u64,
        remote_addr: SocketAddr,
        username: &str,
        database: &str,
    ) -> Session {
        let killed = Arc::new(AtomicBool::new(false));
        let info = Arc::new(SessionInfo {
            id,
            remote_addr,
            username: username.to_string(),
            connected_at: Instant::now(),
            killed: killed.clone(),
        });
        self.sessions.lock().insert(id, info);

        Session {
            id,
            remote_addr,
            username: username.to_string(),
            database: database.to_string(),
            charset: crate::protocol::CHARSET_UTF8MB4,
            client_encoding: None,
            timezone: None,
            user_vars: HashMap::new(),
            last_insert_id: 0,
            affected_rows: 0,
            transaction_active: false,
            prepared: HashMap::new(),
            text_prepared: HashMap::new(),
            identity_tables: HashMap::new(),
            killed,
            next_statement_id: 0,
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<SessionInfo>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    pub fn all(&self) -> Vec<Arc<SessionInfo>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Flag a session for termination; its handler notices between commands.
    pub fn kill(&self, id: u64) -> bool {
        match self.get(id) {
            Some(info) => {
                info.kill();
                true
            }
            None => false,
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_session_ids_are_unique_and_registered() {
        let manager = SessionManager::new();
        let a = manager.create(addr(), "u", "db");
        let b = manager.create(addr(), "u", "db");
        assert_ne!(a.id, b.id);
        assert_eq!(manager.count(), 2);
        assert!(manager.get(a.id).is_some());

        manager.remove(a.id);
        assert!(manager.get(a.id).is_none());
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_statement_ids_start_at_one() {
        let manager = SessionManager::new();
        let mut session = manager.create(addr(), "u", "db");
        assert_eq!(session.next_statement_id(), 1);
        assert_eq!(session.next_statement_id(), 2);
    }

    #[test]
    fn test_kill_flag_reaches_session() {
        let manager = SessionManager::new();
        let session = manager.create(addr(), "u", "db");
        assert!(!session.kill_requested());
        assert!(manager.kill(session.id));
        assert!(session.kill_requested());
        assert!(!manager.kill(9999));
    }

    #[test]
    fn test_desired_parameters_follow_session_state() {
        let manager = SessionManager::new();
        let mut session = manager.create(addr(), "u", "");
        assert!(session.desired_parameters().is_empty());

        session.database = "shop".into();
        session.client_encoding = Some("utf8mb4".into());
        session.timezone = Some("UTC".into());
        let params = session.desired_parameters();
        assert_eq!(
            params,
            vec![
                ("search_path".to_string(), "\"shop\"".to_string()),
                ("client_encoding".to_string(), "'UTF8'".to_string()),
                ("TimeZone".to_string(), "'UTC'".to_string()),
            ]
        );
    }

    #[test]
    fn test_user_value_literals() {
        assert_eq!(UserValue::Null.to_sql_literal(), "NULL");
        assert_eq!(UserValue::Int(-7).to_sql_literal(), "-7");
        assert_eq!(
            UserValue::Str("o'brien".into()).to_sql_literal(),
            "'o''brien'"
        );
    }
}
