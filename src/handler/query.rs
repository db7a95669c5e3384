//! COM_QUERY: split, rewrite, execute, frame.

use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::TryStreamExt;

use crate::config::ConnectionMode;
use crate::errors::Error;
use crate::metrics;
use crate::pool::{get_pool, AcquireReason};
use crate::protocol::*;
use crate::rewriter::{
    self, split_statements, LocalResultSet, RewriteOutcome, RewriteResult, StatementKind,
};
use crate::schema;

use super::{status_bits, translate, wrap_backend, Handler};
use translate::BindValue;

use tokio::io::{AsyncRead, AsyncWrite};

pub async fn handle_query<S>(handler: &mut Handler<S>, sql: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let statements = split_statements(sql);
    if statements.is_empty() {
        let status = status_bits(&handler.session, false);
        handler
            .stream
            .write_frame(&ok_packet(0, 0, status, 0))
            .await?;
        return Ok(());
    }

    // Each statement frames its own response; all but the last carry the
    // more-results flag.
    let count = statements.len();
    for (i, text) in statements.iter().enumerate() {
        let more = i + 1 < count;
        run_statement(handler, text, more, false).await?;
    }
    Ok(())
}

/// Rewrite and run one statement, framing the response. Boxed because the
/// session-op path (EXECUTE of a text prepared statement) re-enters it.
pub(crate) fn run_statement<'a, S>(
    handler: &'a mut Handler<S>,
    text: &'a str,
    more: bool,
    binary: bool,
) -> BoxFuture<'a, Result<(), Error>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let timer = metrics::REWRITE_DURATION.start_timer();
        let outcome = rewriter::rewrite(text, &handler.session, &schema::CACHE).await;
        timer.observe_duration();
        let outcome = outcome?;

        match outcome {
            RewriteOutcome::Session(ops) => {
                let responded = handler.apply_session_ops(ops, more).await?;
                if !responded {
                    let status = status_bits(&handler.session, more);
                    handler
                        .stream
                        .write_frame(&ok_packet(0, 0, status, 0))
                        .await?;
                }
                Ok(())
            }
            RewriteOutcome::LocalRows(rows) => write_local_rows(handler, &rows, more, binary).await,
            RewriteOutcome::Execute(result) => {
                for note in &result.notes {
                    metrics::REWRITES_TOTAL.with_label_values(&[note]).inc();
                }
                execute_rewritten(handler, &result, &[], more, binary).await
            }
        }
    })
}

/// Frame a locally synthesized result set.
pub(crate) async fn write_local_rows<S>(
    handler: &mut Handler<S>,
    rows: &LocalResultSet,
    more: bool,
    binary: bool,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    write_resultset_columns(handler, &rows.columns).await?;
    for row in &rows.rows {
        let payload = if binary {
            let mut values = Vec::with_capacity(row.len());
            for (column, value) in rows.columns.iter().zip(row) {
                values.push(match value {
                    Some(value) => Some(translate::binary_value_from_text(column, value)?),
                    None => None,
                });
            }
            binary_row(&values)
        } else {
            text_row(row)
        };
        handler.stream.write_frame(&payload).await?;
    }
    let status = status_bits(&handler.session, more);
    handler.stream.write_frame(&eof_packet(status)).await?;
    Ok(())
}

/// Column count, definitions, and the separating EOF.
pub(crate) async fn write_resultset_columns<S>(
    handler: &mut Handler<S>,
    columns: &[ColumnDefinition],
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut header = BytesMut::new();
    put_lenenc_int(&mut header, columns.len() as u64);
    handler.stream.write_frame(&header).await?;
    for column in columns {
        handler
            .stream
            .write_frame(&column_definition(column))
            .await?;
    }
    let status = status_bits(&handler.session, false);
    handler.stream.write_frame(&eof_packet(status)).await?;
    Ok(())
}

pub(crate) fn acquire_reason(
    session_in_tx: bool,
    kind: &StatementKind,
    mode: ConnectionMode,
) -> AcquireReason {
    if matches!(kind, StatementKind::Begin) {
        AcquireReason::BeginTx
    } else if session_in_tx {
        AcquireReason::InTxStmt
    } else if mode == ConnectionMode::Session {
        AcquireReason::SessionPin
    } else {
        AcquireReason::AutocommitStmt
    }
}

/// Execute a rewritten statement on the backend and frame the response.
pub(crate) async fn execute_rewritten<S>(
    handler: &mut Handler<S>,
    result: &RewriteResult,
    params: &[BindValue],
    more: bool,
    binary: bool,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mode = get_pool().mode();
    let reason = acquire_reason(handler.session.transaction_active, &result.kind, mode);
    handler.ensure_lease(reason).await?;

    // Transaction control statements update session state as a side effect.
    match result.kind {
        StatementKind::Begin => {
            if !handler.session.transaction_active {
                backend_batch(handler, &result.sql).await?;
                handler.session.transaction_active = true;
            }
            let status = status_bits(&handler.session, more);
            handler
                .stream
                .write_frame(&ok_packet(0, 0, status, 0))
                .await?;
            return Ok(());
        }
        StatementKind::Commit | StatementKind::Rollback => {
            if handler.session.transaction_active {
                backend_batch(handler, &result.sql).await?;
            }
            handler.session.transaction_active = false;
            let status = status_bits(&handler.session, more);
            handler
                .stream
                .write_frame(&ok_packet(0, 0, status, 0))
                .await?;
            return Ok(());
        }
        _ => {}
    }

    let lease = handler.lease.as_ref().expect("lease ensured");
    let prepared = match lease.client().prepare(&result.sql).await {
        Ok(prepared) => prepared,
        Err(err) => return Err(wrap_backend(lease, err)),
    };

    run_prepared(handler, &prepared, params, &result.kind, more, binary).await?;

    // DDL invalidates whatever the cache knew about the table, and records
    // identity columns for LAST_INSERT_ID bookkeeping.
    if let StatementKind::Ddl { table } = &result.kind {
        if let Some(table) = table {
            schema::CACHE.invalidate(table);
        }
    }
    if let Some((table, column)) = &result.identity_ddl {
        schema::CACHE.invalidate(table);
        handler
            .session
            .identity_tables
            .insert(table.clone(), column.clone());
    }
    Ok(())
}

async fn backend_batch<S>(handler: &mut Handler<S>, sql: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let lease = handler.lease.as_ref().expect("lease ensured");
    let result = lease.client().batch_execute(sql).await;
    if let Err(err) = result {
        return Err(wrap_backend(lease, err));
    }
    Ok(())
}

/// Run an already-prepared backend statement and frame its response, either
/// as an OK packet (no columns) or a result set (text or binary rows).
pub(crate) async fn run_prepared<S>(
    handler: &mut Handler<S>,
    prepared: &tokio_postgres::Statement,
    params: &[BindValue],
    kind: &StatementKind,
    more: bool,
    binary: bool,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let lease = handler.lease.as_ref().expect("lease ensured");

    if prepared.columns().is_empty() {
        let affected = match lease.client().execute_raw(prepared, params.iter()).await {
            Ok(affected) => affected,
            Err(err) => return Err(wrap_backend(lease, err)),
        };
        handler.session.affected_rows = affected;
        let status = status_bits(&handler.session, more);
        handler
            .stream
            .write_frame(&ok_packet(affected, 0, status, 0))
            .await?;
        return Ok(());
    }

    let row_stream = match lease.client().query_raw(prepared, params.iter()).await {
        Ok(stream) => stream,
        Err(err) => return Err(wrap_backend(lease, err)),
    };
    futures::pin_mut!(row_stream);

    if matches!(
        kind,
        StatementKind::Dml {
            returning_identity: true
        }
    ) {
        // The RETURNING clause was appended by the rewriter; the client gets
        // a plain OK carrying the first generated id (MySQL batch
        // semantics).
        let mut first_id: Option<u64> = None;
        let mut seen = 0u64;
        loop {
            let row = match row_stream.try_next().await {
                Ok(row) => row,
                Err(err) => return Err(wrap_backend(lease, err)),
            };
            let row = match row {
                Some(row) => row,
                None => break,
            };
            seen += 1;
            if first_id.is_none() {
                first_id = identity_from_row(&row);
            }
        }
        let affected = row_stream.rows_affected().unwrap_or(seen);
        handler.session.affected_rows = affected;
        if let Some(id) = first_id {
            handler.session.last_insert_id = id;
        }
        let status = status_bits(&handler.session, more);
        handler
            .stream
            .write_frame(&ok_packet(affected, first_id.unwrap_or(0), status, 0))
            .await?;
        return Ok(());
    }

    let columns = translate::columns_from_statement(prepared);
    {
        // Header frames interleave with the row stream borrow, so they are
        // written through the stream field directly.
        let mut header = BytesMut::new();
        put_lenenc_int(&mut header, columns.len() as u64);
        handler.stream.write_frame(&header).await?;
        for column in &columns {
            handler
                .stream
                .write_frame(&column_definition(column))
                .await?;
        }
        let status = status_bits(&handler.session, false);
        handler.stream.write_frame(&eof_packet(status)).await?;
    }

    loop {
        let row = match row_stream.try_next().await {
            Ok(row) => row,
            Err(err) => return Err(wrap_backend(lease, err)),
        };
        let row = match row {
            Some(row) => row,
            None => break,
        };

        let payload = if binary {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                values.push(translate::binary_value(&row, idx)?);
            }
            binary_row(&values)
        } else {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                values.push(translate::text_value(&row, idx)?);
            }
            text_row(&values)
        };
        handler.stream.write_frame(&payload).await?;
    }

    let status = status_bits(&handler.session, more);
    handler.stream.write_frame(&eof_packet(status)).await?;
    Ok(())
}

fn identity_from_row(row: &tokio_postgres::Row) -> Option<u64> {
    if row.is_empty() {
        return None;
    }
    let ty = row.columns()[0].type_();
    match ty.oid() {
        20 => row.try_get::<_, i64>(0).ok().map(|v| v as u64),
        21 => row.try_get::<_, i16>(0).ok().map(|v| v as u64),
        23 => row.try_get::<_, i32>(0).ok().map(|v| v as u64),
        _ => None,
    }
}

/// COM_FIELD_LIST: column definitions straight from the schema cache.
pub(crate) async fn handle_field_list<S>(
    handler: &mut Handler<S>,
    mut payload: BytesMut,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let table = get_cstring(&mut payload).unwrap_or_default();
    if table.is_empty() {
        return Err(Error::ProtocolDecode(
            handler.client_id(),
            "COM_FIELD_LIST without a table".into(),
        ));
    }

    let schema = schema::CACHE
        .lookup(&handler.session.database, &table)
        .await?;
    match schema {
        Some(schema) => {
            for column in &schema.columns {
                let def = match tokio_postgres::types::Type::from_oid(column.type_oid) {
                    Some(ty) => translate::column_def_for_pg(&column.name, &table, &ty),
                    None => {
                        let mut def = ColumnDefinition::text(&column.name);
                        def.table = table.clone();
                        def
                    }
                };
                handler.stream.write_frame(&column_definition(&def)).await?;
            }
            let status = status_bits(&handler.session, false);
            handler.stream.write_frame(&eof_packet(status)).await?;
        }
        None => {
            handler
                .stream
                .write_frame(&err_packet(
                    1146,
                    "42S02",
                    &format!(
                        "Table '{}.{}' doesn't exist",
                        handler.session.database, table
                    ),
                ))
                .await?;
        }
    }
    Ok(())
}

/// Substitute `?` placeholders with pre-rendered literals, quote-aware.
/// Used by EXECUTE ... USING, which binds by position.
#[allow(clippy::while_let_on_iterator)]
pub(crate) fn substitute_placeholders_text(sql: &str, literals: &[String]) -> String {
    let mut out = String::with_capacity(sql.len() + 16 * literals.len());
    let mut next = 0usize;
    let mut in_string = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '\\' if in_string => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '?' if !in_string => {
                match literals.get(next) {
                    Some(literal) => out.push_str(literal),
                    None => out.push_str("NULL"),
                }
                next += 1;
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_placeholders_text() {
        let out = substitute_placeholders_text(
            "SELECT * FROM t WHERE a = ? AND b = '?' AND c = ?",
            &["1".to_string(), "'x'".to_string()],
        );
        assert_eq!(out, "SELECT * FROM t WHERE a = 1 AND b = '?' AND c = 'x'");
    }

    #[test]
    fn test_substitute_missing_binding_is_null() {
        let out = substitute_placeholders_text("SELECT ?", &[]);
        assert_eq!(out, "SELECT NULL");
    }

    #[test]
    fn test_acquire_reason_choice() {
        use crate::config::ConnectionMode;
        assert_eq!(
            acquire_reason(false, &StatementKind::Begin, ConnectionMode::Transaction),
            AcquireReason::BeginTx
        );
        assert_eq!(
            acquire_reason(true, &StatementKind::Query, ConnectionMode::Transaction),
            AcquireReason::InTxStmt
        );
        assert_eq!(
            acquire_reason(false, &StatementKind::Query, ConnectionMode::Session),
            AcquireReason::SessionPin
        );
        assert_eq!(
            acquire_reason(false, &StatementKind::Query, ConnectionMode::Statement),
            AcquireReason::AutocommitStmt
        );
    }
}
