//! MySQL command dispatcher: one handler per client connection.
//!
//! Greeting, handshake response, then a strict request/response command
//! loop until COM_QUIT or disconnect. Commands never overlap; the handler
//! owns its session outright and holds the pool lease according to the
//! connection mode.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::app::server::SHUTDOWN_IN_PROGRESS;
use crate::config::{get_config, ConnectionMode};
use crate::errors::{ClientIdentifier, Error, HandshakeError};
use crate::metrics;
use crate::pool::{get_pool, AcquireReason, PooledConn};
use crate::protocol::*;
use crate::rewriter::SessionOp;
use crate::session::{pg_encoding_for_charset, Session, SESSIONS};

pub mod query;
pub mod stmt;
pub mod translate;

pub struct Handler<S> {
    pub(crate) stream: PacketStream<S>,
    pub(crate) session: Session,
    pub(crate) lease: Option<PooledConn>,
    #[allow(dead_code)]
    pub(crate) capabilities: u32,
}

/// What a dispatched command decided about the connection.
pub(crate) enum Flow {
    Continue,
    Quit,
}

pub async fn handle_client(stream: TcpStream, peer: SocketAddr) -> Result<(), Error> {
    let config = get_config();
    let mut stream = PacketStream::new(stream);

    let connection_id = SESSIONS.reserve_id();
    let scramble = new_scramble();
    stream
        .write_frame(&greeting(
            connection_id as u32,
            &config.server.version,
            &scramble,
        ))
        .await?;
    stream.flush().await?;

    let frame = stream
        .read_frame()
        .await?
        .ok_or(HandshakeError::EmptyResponse)?;
    let response = match parse_handshake_response(frame) {
        Ok(response) => response,
        Err(err) => {
            // Failed negotiation still gets an error packet when the socket
            // allows one, then the connection closes.
            let _ = stream
                .write_frame(&err_packet(1043, "08S01", &err.to_string()))
                .await;
            let _ = stream.flush().await;
            return Err(Error::Handshake(err));
        }
    };

    // Authentication is deliberately permissive: any client credentials are
    // accepted, the proxy authenticates to the backend with its own.
    let mut session = SESSIONS.register(
        connection_id,
        peer,
        &response.username,
        response.database.as_deref().unwrap_or(""),
    );
    session.charset = response.charset;

    stream
        .write_frame(&ok_packet(0, 0, SERVER_STATUS_AUTOCOMMIT, 0))
        .await?;
    stream.flush().await?;
    info!(
        "session {connection_id} authenticated as {:?} (database {:?})",
        response.username, session.database
    );

    let mut handler = Handler {
        stream,
        session,
        lease: None,
        capabilities: response.capabilities,
    };
    let result = handler.run().await;
    SESSIONS.remove(handler.session.id);
    result
}

/// Status bits for OK/EOF packets, computed from session state alone so it
/// can be called while the lease is mutably borrowed.
pub(crate) fn status_bits(session: &Session, more_results: bool) -> u16 {
    let mut status = SERVER_STATUS_AUTOCOMMIT;
    if session.transaction_active {
        status |= SERVER_STATUS_IN_TRANS;
    }
    if more_results {
        status |= SERVER_MORE_RESULTS_EXISTS;
    }
    status
}

/// Classify a backend failure and poison the lease when the connection is
/// gone.
pub(crate) fn wrap_backend(lease: &PooledConn, err: tokio_postgres::Error) -> Error {
    metrics::BACKEND_ERRORS.inc();
    if err.is_closed() {
        lease.mark_broken();
        Error::BackendFatal(err.to_string())
    } else {
        Error::Backend(err)
    }
}

/// Reconciliation prologue: diff the session's desired parameters against
/// what was last applied on this connection and SET the difference.
pub(crate) async fn reconcile(session: &Session, conn: &mut PooledConn) -> Result<(), Error> {
    let desired = session.desired_parameters();
    let mut prologue = String::new();
    for (key, value) in &desired {
        if conn.applied_parameters().get(key) != Some(value) {
            prologue.push_str(&format!("SET {key} TO {value}; "));
        }
    }
    if prologue.is_empty() {
        return Ok(());
    }
    let result = conn.client().batch_execute(&prologue).await;
    if let Err(err) = result {
        return Err(wrap_backend(conn, err));
    }
    for (key, value) in desired {
        conn.applied_parameters().insert(key, value);
    }
    Ok(())
}

fn command_label(command: u8) -> &'static str {
    match command {
        COM_QUIT => "quit",
        COM_INIT_DB => "init_db",
        COM_QUERY => "query",
        COM_FIELD_LIST => "field_list",
        COM_PING => "ping",
        COM_STMT_PREPARE => "stmt_prepare",
        COM_STMT_EXECUTE => "stmt_execute",
        COM_STMT_CLOSE => "stmt_close",
        COM_STMT_RESET => "stmt_reset",
        COM_SET_OPTION => "set_option",
        COM_RESET_CONNECTION => "reset_connection",
        _ => "unknown",
    }
}

impl<S> Handler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn client_id(&self) -> ClientIdentifier {
        ClientIdentifier::new(
            &self.session.remote_addr.to_string(),
            &self.session.username,
            &self.session.database,
        )
    }

    async fn run(&mut self) -> Result<(), Error> {
        loop {
            self.stream.reset_seq();
            let mut frame = match self.stream.read_frame().await? {
                Some(frame) => frame,
                None => break, // client went away
            };

            if SHUTDOWN_IN_PROGRESS.load(Ordering::SeqCst) {
                self.stream
                    .write_frame(&err_packet(1053, "08S01", "Server shutdown in progress"))
                    .await?;
                self.stream.flush().await?;
                break;
            }
            if self.session.kill_requested() {
                self.stream
                    .write_frame(&err_packet(1927, "70100", "Connection was killed"))
                    .await?;
                self.stream.flush().await?;
                break;
            }
            if frame.is_empty() {
                return Err(Error::ProtocolDecode(
                    self.client_id(),
                    "empty command frame".into(),
                ));
            }

            let command = frame[0];
            let payload = frame.split_off(1);
            let label = command_label(command);
            metrics::COMMANDS_TOTAL.with_label_values(&[label]).inc();
            let timer = metrics::COMMAND_DURATION
                .with_label_values(&[label])
                .start_timer();

            let timeout_ms = get_config().server.command_timeout;
            let result = if timeout_ms > 0 {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    self.dispatch(command, payload),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        self.cancel_inflight();
                        Err(Error::CommandTimeout)
                    }
                }
            } else {
                self.dispatch(command, payload).await
            };

            let flow = match result {
                Ok(flow) => flow,
                Err(err) => {
                    self.reply_error(&err).await?;
                    if err.closes_connection() {
                        self.stream.flush().await?;
                        return Err(err);
                    }
                    // A lost pinned backend cannot be replaced transparently
                    // in session mode: the client's backend-visible state
                    // died with it.
                    if matches!(err, Error::BackendFatal(_))
                        && get_pool().mode() == ConnectionMode::Session
                    {
                        self.stream.flush().await?;
                        return Err(err);
                    }
                    Flow::Continue
                }
            };

            self.stream.flush().await?;
            timer.observe_duration();
            self.release_after_command();

            if matches!(flow, Flow::Quit) {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, command: u8, mut payload: BytesMut) -> Result<Flow, Error> {
        match command {
            COM_QUIT => return Ok(Flow::Quit),
            COM_PING => {
                let status = status_bits(&self.session, false);
                self.stream.write_frame(&ok_packet(0, 0, status, 0)).await?;
            }
            COM_INIT_DB => {
                let database = String::from_utf8_lossy(&payload).trim().to_string();
                self.change_database(&database).await?;
                let status = status_bits(&self.session, false);
                self.stream.write_frame(&ok_packet(0, 0, status, 0)).await?;
            }
            COM_QUERY => {
                let sql = String::from_utf8_lossy(&payload).into_owned();
                query::handle_query(self, &sql).await?;
            }
            COM_FIELD_LIST => {
                query::handle_field_list(self, payload).await?;
            }
            COM_STMT_PREPARE => {
                let sql = String::from_utf8_lossy(&payload).into_owned();
                stmt::handle_prepare(self, &sql).await?;
            }
            COM_STMT_EXECUTE => {
                stmt::handle_execute(self, payload).await?;
            }
            COM_STMT_CLOSE => {
                stmt::handle_close(self, payload);
                // The protocol specifies no response to COM_STMT_CLOSE.
            }
            COM_STMT_RESET => {
                if payload.len() >= 4 {
                    let id = payload.get_u32_le();
                    if !self.session.prepared.contains_key(&id) {
                        return Err(Error::NoPreparedStatement(id));
                    }
                }
                let status = status_bits(&self.session, false);
                self.stream.write_frame(&ok_packet(0, 0, status, 0)).await?;
            }
            COM_SET_OPTION => {
                let status = status_bits(&self.session, false);
                self.stream.write_frame(&eof_packet(status)).await?;
            }
            COM_RESET_CONNECTION => {
                self.reset_connection();
                let status = status_bits(&self.session, false);
                self.stream.write_frame(&ok_packet(0, 0, status, 0)).await?;
            }
            other => {
                warn!("unknown command {other:#04x} from {}", self.client_id());
                self.stream
                    .write_frame(&err_packet(
                        1047,
                        "08S01",
                        &format!("Unknown command {other:#04x}"),
                    ))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn reply_error(&mut self, err: &Error) -> Result<(), Error> {
        match err {
            Error::Unsupported(_) => {
                metrics::REWRITE_ERRORS
                    .with_label_values(&["unsupported"])
                    .inc();
            }
            Error::RewriteInternal(_) => {
                metrics::REWRITE_ERRORS
                    .with_label_values(&["internal"])
                    .inc();
            }
            _ => {}
        }

        let payload = match err {
            Error::Backend(backend) => {
                let (errno, sqlstate, message) = translate::mysql_error_from_backend(backend);
                err_packet(errno, &sqlstate, &message)
            }
            other => {
                let code = other.mysql_code();
                err_packet(code.errno, code.sqlstate, &other.to_string())
            }
        };
        self.stream.write_frame(&payload).await
    }

    /// Make sure a backend connection is leased, emitting the
    /// reconciliation prologue on a fresh lease.
    pub(crate) async fn ensure_lease(&mut self, reason: AcquireReason) -> Result<(), Error> {
        if self.lease.as_ref().is_some_and(|lease| lease.is_broken()) {
            self.drop_lease();
        }
        if self.lease.is_none() {
            let mut conn = get_pool().acquire(self.session.id, reason).await?;
            reconcile(&self.session, &mut conn).await?;
            // Statement handles belonged to whatever connection served this
            // session before.
            for ps in self.session.prepared.values_mut() {
                ps.handle = None;
            }
            self.lease = Some(conn);
        }
        Ok(())
    }

    pub(crate) fn drop_lease(&mut self) {
        for ps in self.session.prepared.values_mut() {
            ps.handle = None;
        }
        self.lease = None;
    }

    /// Apply the pool mode's release policy at command end.
    fn release_after_command(&mut self) {
        let keep = match get_pool().mode() {
            ConnectionMode::Session => true,
            ConnectionMode::Transaction => self.session.transaction_active,
            ConnectionMode::Statement => false,
        };
        if !keep || self.lease.as_ref().is_some_and(|lease| lease.is_broken()) {
            self.drop_lease();
        }
    }

    /// Abort the in-flight backend operation on a side channel and poison
    /// the lease; whatever was mid-stream cannot be reused.
    fn cancel_inflight(&mut self) {
        if let Some(lease) = &self.lease {
            let token = lease.cancel_token();
            lease.mark_broken();
            tokio::spawn(async move {
                let _ = token.cancel_query(tokio_postgres::NoTls).await;
            });
        }
    }

    pub(crate) async fn change_database(&mut self, database: &str) -> Result<(), Error> {
        self.session.database = database.to_string();
        // A pinned connection reconciles immediately; unpinned modes pick
        // the change up in the next lease's prologue.
        if self.lease.is_some() {
            let mut conn = self.lease.take().expect("lease checked");
            let result = reconcile(&self.session, &mut conn).await;
            self.lease = Some(conn);
            result?;
        }
        Ok(())
    }

    fn reset_connection(&mut self) {
        self.session.user_vars.clear();
        self.session.prepared.clear();
        self.session.text_prepared.clear();
        self.session.last_insert_id = 0;
        self.session.affected_rows = 0;
        self.session.transaction_active = false;
        self.drop_lease();
    }

    /// Apply session-layer operations from the rewriter. Returns true when
    /// one of them already wrote a response.
    pub(crate) async fn apply_session_ops(
        &mut self,
        ops: Vec<SessionOp>,
        more_results: bool,
    ) -> Result<bool, Error> {
        let mut responded = false;
        for op in ops {
            match op {
                SessionOp::UseDatabase(database) => self.change_database(&database).await?,
                SessionOp::SetUserVar(name, value) => {
                    self.session.user_vars.insert(name, value);
                }
                SessionOp::SetNames(charset) => {
                    if pg_encoding_for_charset(&charset).is_none() {
                        warn!("SET NAMES {charset:?} has no backend encoding; ignored");
                    }
                    self.session.client_encoding = Some(charset);
                    if self.lease.is_some() {
                        let mut conn = self.lease.take().expect("lease checked");
                        let result = reconcile(&self.session, &mut conn).await;
                        self.lease = Some(conn);
                        result?;
                    }
                }
                SessionOp::SetTimeZone(timezone) => {
                    self.session.timezone = Some(timezone);
                    if self.lease.is_some() {
                        let mut conn = self.lease.take().expect("lease checked");
                        let result = reconcile(&self.session, &mut conn).await;
                        self.lease = Some(conn);
                        result?;
                    }
                }
                SessionOp::Swallow(_name) => {}
                SessionOp::Kill(id) => {
                    if !SESSIONS.kill(id) {
                        return Err(Error::Internal(format!("Unknown thread id: {id}")));
                    }
                }
                SessionOp::PrepareText { name, query } => {
                    self.session.text_prepared.insert(name, query);
                }
                SessionOp::DeallocateText { name } => {
                    if self.session.text_prepared.remove(&name).is_none() {
                        return Err(Error::Internal(format!(
                            "Unknown prepared statement handler ({name}) given to DEALLOCATE PREPARE"
                        )));
                    }
                }
                SessionOp::ExecuteText { name, using } => {
                    let query = match self.session.text_prepared.get(&name) {
                        Some(query) => query.clone(),
                        None => {
                            return Err(Error::Internal(format!(
                                "Unknown prepared statement handler ({name}) given to EXECUTE"
                            )))
                        }
                    };
                    let literals: Vec<String> = using
                        .iter()
                        .map(|var| {
                            self.session
                                .user_vars
                                .get(var)
                                .map(|value| value.to_sql_literal())
                                .unwrap_or_else(|| "NULL".to_string())
                        })
                        .collect();
                    let substituted = query::substitute_placeholders_text(&query, &literals);
                    query::run_statement(self, &substituted, more_results, false).await?;
                    responded = true;
                }
            }
        }
        Ok(responded)
    }
}
