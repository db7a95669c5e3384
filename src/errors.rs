//! Errors.

use std::io;

/// Various errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error occurred: {0}")]
    SocketError(String),
    #[error("malformed frame from {0}: {1}")]
    ProtocolDecode(ClientIdentifier, String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedConstructError),
    #[error("rewrite failed: {0}")]
    RewriteInternal(String),
    #[error(transparent)]
    Backend(#[from] tokio_postgres::Error),
    #[error("backend connection broken: {0}")]
    BackendFatal(String),
    #[error("connection pool exhausted after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },
    #[error("command timed out")]
    CommandTimeout,
    #[error("bad configuration: {0}")]
    BadConfig(String),
    #[error("prepared statement {0} does not exist")]
    NoPreparedStatement(u32),
    #[error("shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("client sent an empty handshake response")]
    EmptyResponse,
    #[error("client does not speak protocol 4.1")]
    Pre41Client,
    #[error("client requested TLS but the listener does not advertise it")]
    TlsNotAdvertised,
    #[error("no username in handshake response")]
    UserUnspecified,
}

/// The rewriter refuses a documented set of MySQL constructs; the handler
/// turns this into error packet 1235 with the construct named.
#[derive(Debug, thiserror::Error)]
#[error("unsupported construct {construct}: {detail}")]
pub struct UnsupportedConstructError {
    pub construct: &'static str,
    pub detail: String,
}

impl UnsupportedConstructError {
    pub fn new(construct: &'static str, detail: impl Into<String>) -> Self {
        UnsupportedConstructError {
            construct,
            detail: detail.into(),
        }
    }
}

/// MySQL error number + SQLSTATE pair for the client-facing error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MysqlErrorCode {
    pub errno: u16,
    pub sqlstate: &'static str,
}

pub const ER_NOT_SUPPORTED_YET: MysqlErrorCode = MysqlErrorCode {
    errno: 1235,
    sqlstate: "42000",
};
pub const ER_CON_COUNT: MysqlErrorCode = MysqlErrorCode {
    errno: 1040,
    sqlstate: "08004",
};
pub const ER_QUERY_TIMEOUT: MysqlErrorCode = MysqlErrorCode {
    errno: 1317,
    sqlstate: "70100",
};
pub const ER_SYNTAX: MysqlErrorCode = MysqlErrorCode {
    errno: 1064,
    sqlstate: "42000",
};
pub const ER_UNKNOWN_COM: MysqlErrorCode = MysqlErrorCode {
    errno: 1047,
    sqlstate: "08S01",
};
pub const ER_UNKNOWN_STMT: MysqlErrorCode = MysqlErrorCode {
    errno: 1243,
    sqlstate: "HY000",
};
pub const ER_INTERNAL: MysqlErrorCode = MysqlErrorCode {
    errno: 1105,
    sqlstate: "HY000",
};
pub const ER_HANDSHAKE: MysqlErrorCode = MysqlErrorCode {
    errno: 1043,
    sqlstate: "08S01",
};

impl Error {
    /// Client-facing classification. Everything surfaced to a MySQL client
    /// is one of a small fixed set of (errno, sqlstate) pairs; backend
    /// errors are translated separately because they carry a PG SQLSTATE.
    pub fn mysql_code(&self) -> MysqlErrorCode {
        match self {
            Error::Unsupported(_) => ER_NOT_SUPPORTED_YET,
            Error::PoolExhausted { .. } => ER_CON_COUNT,
            Error::CommandTimeout => ER_QUERY_TIMEOUT,
            Error::RewriteInternal(_) => ER_SYNTAX,
            Error::Handshake(_) => ER_HANDSHAKE,
            Error::NoPreparedStatement(_) => ER_UNKNOWN_STMT,
            Error::Backend(_) | Error::BackendFatal(_) => ER_SYNTAX,
            _ => ER_INTERNAL,
        }
    }

    /// True when the client connection must be torn down instead of
    /// receiving a reply-and-continue error packet.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Error::ProtocolDecode(_, _) | Error::Handshake(_) | Error::ShuttingDown
        )
    }
}

/// Who we are talking to, for log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub username: String,
    pub database: String,
}

impl ClientIdentifier {
    pub fn new(addr: &str, username: &str, database: &str) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            username: username.into(),
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self {
            addr,
            username,
            database,
        } = self;
        write!(f, "{{ {username}@{addr}/{database} }}")
    }
}
