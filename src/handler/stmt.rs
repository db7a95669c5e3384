//! COM_STMT_PREPARE / EXECUTE / CLOSE: the binary protocol half.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ConnectionMode;
use crate::errors::{Error, UnsupportedConstructError};
use crate::metrics;
use crate::pool::get_pool;
use crate::protocol::*;
use crate::rewriter::{self, RewriteOutcome, StatementKind};
use crate::schema;
use crate::session::PreparedStatement;

use super::{query, status_bits, translate, wrap_backend, Handler};
use translate::BindValue;

pub(crate) async fn handle_prepare<S>(handler: &mut Handler<S>, sql: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mode = get_pool().mode();
    if mode == ConnectionMode::Statement {
        return Err(Error::Unsupported(UnsupportedConstructError::new(
            "PREPARE",
            "prepared statements are incompatible with statement pool mode",
        )));
    }

    let timer = metrics::REWRITE_DURATION.start_timer();
    let outcome = rewriter::rewrite(sql, &handler.session, &schema::CACHE).await;
    timer.observe_duration();

    match outcome? {
        RewriteOutcome::Execute(result) => {
            for note in &result.notes {
                metrics::REWRITES_TOTAL.with_label_values(&[note]).inc();
            }
            let reason = query::acquire_reason(
                handler.session.transaction_active,
                &result.kind,
                mode,
            );
            handler.ensure_lease(reason).await?;
            let lease = handler.lease.as_ref().expect("lease ensured");
            let prepared = match lease.client().prepare(&result.sql).await {
                Ok(prepared) => prepared,
                Err(err) => return Err(wrap_backend(lease, err)),
            };

            let param_types = prepared.params().to_vec();
            let columns = translate::columns_from_statement(&prepared);
            let id = handler.session.next_statement_id();
            let handle = (mode == ConnectionMode::Session).then(|| prepared.clone());
            let statement = PreparedStatement {
                id,
                source: sql.to_string(),
                rewritten: result.sql.clone(),
                input_params: result.input_params,
                param_count: result.param_count,
                param_map: result.param_map.clone(),
                param_types: param_types.clone(),
                param_mysql_types: None,
                columns: columns.clone(),
                kind: result.kind.clone(),
                local: false,
                handle,
            };
            handler.session.prepared.insert(id, statement);

            write_prepare_response(
                handler,
                id,
                &columns,
                result.input_params,
                Some(&param_types),
            )
            .await
        }
        RewriteOutcome::LocalRows(rows) => {
            let id = handler.session.next_statement_id();
            let columns = rows.columns.clone();
            let statement = PreparedStatement {
                id,
                source: sql.to_string(),
                rewritten: String::new(),
                input_params: 0,
                param_count: 0,
                param_map: Vec::new(),
                param_types: Vec::new(),
                param_mysql_types: None,
                columns: columns.clone(),
                kind: StatementKind::Query,
                local: true,
                handle: None,
            };
            handler.session.prepared.insert(id, statement);
            write_prepare_response(handler, id, &columns, 0, None).await
        }
        RewriteOutcome::Session(_) => {
            // Session-layer statements (SET and friends) prepare fine in
            // MySQL; execution re-runs them against current session state.
            let id = handler.session.next_statement_id();
            let statement = PreparedStatement {
                id,
                source: sql.to_string(),
                rewritten: String::new(),
                input_params: 0,
                param_count: 0,
                param_map: Vec::new(),
                param_types: Vec::new(),
                param_mysql_types: None,
                columns: Vec::new(),
                kind: StatementKind::Passthrough,
                local: true,
                handle: None,
            };
            handler.session.prepared.insert(id, statement);
            write_prepare_response(handler, id, &[], 0, None).await
        }
    }
}

async fn write_prepare_response<S>(
    handler: &mut Handler<S>,
    id: u32,
    columns: &[ColumnDefinition],
    num_params: usize,
    param_types: Option<&[tokio_postgres::types::Type]>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    handler
        .stream
        .write_frame(&prepare_ok(id, columns.len() as u16, num_params as u16))
        .await?;

    if num_params > 0 {
        for index in 0..num_params {
            let def = param_types
                .and_then(|types| types.get(index))
                .map(|ty| translate::column_def_for_pg("?", "", ty))
                .unwrap_or_else(|| ColumnDefinition::text("?"));
            handler.stream.write_frame(&column_definition(&def)).await?;
        }
        let status = status_bits(&handler.session, false);
        handler.stream.write_frame(&eof_packet(status)).await?;
    }

    if !columns.is_empty() {
        for column in columns {
            handler
                .stream
                .write_frame(&column_definition(column))
                .await?;
        }
        let status = status_bits(&handler.session, false);
        handler.stream.write_frame(&eof_packet(status)).await?;
    }
    Ok(())
}

pub(crate) async fn handle_execute<S>(
    handler: &mut Handler<S>,
    mut payload: BytesMut,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if payload.len() < 9 {
        return Err(Error::ProtocolDecode(
            handler.client_id(),
            "short COM_STMT_EXECUTE".into(),
        ));
    }
    let stmt_id = payload.get_u32_le();
    let _flags = payload.get_u8();
    let _iteration_count = payload.get_u32_le();

    let (input_params, local, kind) = match handler.session.prepared.get(&stmt_id) {
        Some(ps) => (ps.input_params, ps.local, ps.kind.clone()),
        None => return Err(Error::NoPreparedStatement(stmt_id)),
    };

    let mut values: Vec<BindValue> = Vec::with_capacity(input_params);
    if input_params > 0 {
        let bitmap_len = (input_params + 7) / 8;
        if payload.len() < bitmap_len + 1 {
            return Err(Error::ProtocolDecode(
                handler.client_id(),
                "COM_STMT_EXECUTE missing null bitmap".into(),
            ));
        }
        let null_bitmap = payload[..bitmap_len].to_vec();
        payload.advance(bitmap_len);
        let new_params_bound = payload.get_u8();

        if new_params_bound == 1 {
            if payload.len() < input_params * 2 {
                return Err(Error::ProtocolDecode(
                    handler.client_id(),
                    "COM_STMT_EXECUTE missing parameter types".into(),
                ));
            }
            let mut types = Vec::with_capacity(input_params);
            for _ in 0..input_params {
                let type_code = payload.get_u8();
                let flags = payload.get_u8();
                types.push((type_code, flags & 0x80 != 0));
            }
            if let Some(ps) = handler.session.prepared.get_mut(&stmt_id) {
                ps.param_mysql_types = Some(types);
            }
        }

        let types = handler
            .session
            .prepared
            .get(&stmt_id)
            .and_then(|ps| ps.param_mysql_types.clone())
            .ok_or_else(|| {
                Error::ProtocolDecode(
                    handler.client_id(),
                    "COM_STMT_EXECUTE without parameter types".into(),
                )
            })?;

        for (index, &(type_code, unsigned)) in types.iter().enumerate().take(input_params) {
            if null_bitmap[index / 8] & (1 << (index % 8)) != 0 {
                values.push(BindValue::Null);
                continue;
            }
            values.push(decode_binary_param(&mut payload, type_code, unsigned).ok_or_else(
                || {
                    Error::ProtocolDecode(
                        handler.client_id(),
                        format!("truncated parameter {index} (type {type_code:#04x})"),
                    )
                },
            )?);
        }
    }

    // Statements resolved at the session layer, plus transaction control,
    // re-run the full pipeline against current session state.
    if local || matches!(kind, StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback) {
        let source = handler
            .session
            .prepared
            .get(&stmt_id)
            .map(|ps| ps.source.clone())
            .expect("statement checked above");
        return query::run_statement(handler, &source, false, true).await;
    }

    let reason = query::acquire_reason(handler.session.transaction_active, &kind, get_pool().mode());
    handler.ensure_lease(reason).await?;

    // Re-prepare when the handle does not survive pool hops.
    let (rewritten, param_map) = {
        let ps = handler
            .session
            .prepared
            .get(&stmt_id)
            .expect("statement checked above");
        (ps.rewritten.clone(), ps.param_map.clone())
    };
    let existing_handle = handler
        .session
        .prepared
        .get(&stmt_id)
        .and_then(|ps| ps.handle.clone());
    let prepared = match existing_handle {
        Some(handle) => handle,
        None => {
            let lease = handler.lease.as_ref().expect("lease ensured");
            let prepared = match lease.client().prepare(&rewritten).await {
                Ok(prepared) => prepared,
                Err(err) => return Err(wrap_backend(lease, err)),
            };
            if get_pool().mode() == ConnectionMode::Session {
                if let Some(ps) = handler.session.prepared.get_mut(&stmt_id) {
                    ps.handle = Some(prepared.clone());
                }
            }
            prepared
        }
    };

    // Reorder the client-supplied values into backend placeholder order.
    let mut backend_params = Vec::with_capacity(param_map.len());
    for &input_index in &param_map {
        backend_params.push(values.get(input_index).cloned().unwrap_or(BindValue::Null));
    }

    query::run_prepared(handler, &prepared, &backend_params, &kind, false, true).await?;

    if let StatementKind::Ddl { table: Some(table) } = &kind {
        schema::CACHE.invalidate(table);
    }
    Ok(())
}

pub(crate) fn handle_close<S>(handler: &mut Handler<S>, mut payload: BytesMut) {
    if payload.len() >= 4 {
        let stmt_id = payload.get_u32_le();
        // Dropping the backend handle deallocates it on the connection's
        // driver task; no client response is sent.
        handler.session.prepared.remove(&stmt_id);
    }
}

/// Decode one binary-protocol parameter value.
fn decode_binary_param(buf: &mut BytesMut, type_code: u8, unsigned: bool) -> Option<BindValue> {
    match type_code {
        MYSQL_TYPE_NULL => Some(BindValue::Null),
        MYSQL_TYPE_TINY => {
            if buf.is_empty() {
                return None;
            }
            let v = buf.get_u8();
            Some(if unsigned {
                BindValue::UInt(v as u64)
            } else {
                BindValue::Int(v as i8 as i64)
            })
        }
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR => {
            if buf.len() < 2 {
                return None;
            }
            let v = buf.get_u16_le();
            Some(if unsigned {
                BindValue::UInt(v as u64)
            } else {
                BindValue::Int(v as i16 as i64)
            })
        }
        MYSQL_TYPE_LONG | MYSQL_TYPE_INT24 => {
            if buf.len() < 4 {
                return None;
            }
            let v = buf.get_u32_le();
            Some(if unsigned {
                BindValue::UInt(v as u64)
            } else {
                BindValue::Int(v as i32 as i64)
            })
        }
        MYSQL_TYPE_LONGLONG => {
            if buf.len() < 8 {
                return None;
            }
            let v = buf.get_u64_le();
            Some(if unsigned {
                BindValue::UInt(v)
            } else {
                BindValue::Int(v as i64)
            })
        }
        MYSQL_TYPE_FLOAT => {
            if buf.len() < 4 {
                return None;
            }
            Some(BindValue::Double(buf.get_f32_le() as f64))
        }
        MYSQL_TYPE_DOUBLE => {
            if buf.len() < 8 {
                return None;
            }
            Some(BindValue::Double(buf.get_f64_le()))
        }
        MYSQL_TYPE_DATE | MYSQL_TYPE_DATETIME | MYSQL_TYPE_TIMESTAMP => {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let mut text = String::new();
            if len >= 4 {
                let year = buf.get_u16_le();
                let month = buf.get_u8();
                let day = buf.get_u8();
                text = format!("{year:04}-{month:02}-{day:02}");
            }
            if len >= 7 {
                let hour = buf.get_u8();
                let minute = buf.get_u8();
                let second = buf.get_u8();
                text.push_str(&format!(" {hour:02}:{minute:02}:{second:02}"));
            }
            if len >= 11 {
                let micros = buf.get_u32_le();
                text.push_str(&format!(".{micros:06}"));
            }
            if text.is_empty() {
                text = "0000-00-00".to_string();
            }
            Some(BindValue::Text(text))
        }
        MYSQL_TYPE_TIME => {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            if len == 0 {
                return Some(BindValue::Text("00:00:00".to_string()));
            }
            if len < 8 {
                return None;
            }
            let negative = buf.get_u8() != 0;
            let days = buf.get_u32_le();
            let hour = buf.get_u8();
            let minute = buf.get_u8();
            let second = buf.get_u8();
            let mut text = format!(
                "{}{:02}:{minute:02}:{second:02}",
                if negative { "-" } else { "" },
                days * 24 + hour as u32
            );
            if len >= 12 && buf.len() >= 4 {
                let micros = buf.get_u32_le();
                text.push_str(&format!(".{micros:06}"));
            }
            Some(BindValue::Text(text))
        }
        // Everything else arrives as a length-encoded byte string.
        _ => {
            let bytes = get_lenenc_bytes(buf)?;
            match String::from_utf8(bytes) {
                Ok(text) => Some(BindValue::Text(text)),
                Err(err) => Some(BindValue::Bytes(err.into_bytes())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_decode_int_params() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(-5);
        assert_eq!(
            decode_binary_param(&mut buf, MYSQL_TYPE_LONG, false),
            Some(BindValue::Int(-5))
        );

        let mut buf = BytesMut::new();
        buf.put_u64_le(u64::MAX);
        assert_eq!(
            decode_binary_param(&mut buf, MYSQL_TYPE_LONGLONG, true),
            Some(BindValue::UInt(u64::MAX))
        );
    }

    #[test]
    fn test_decode_string_param() {
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.put_slice(b"hello");
        assert_eq!(
            decode_binary_param(&mut buf, MYSQL_TYPE_VAR_STRING, false),
            Some(BindValue::Text("hello".to_string()))
        );
    }

    #[test]
    fn test_decode_datetime_param() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_u16_le(2024);
        buf.put_u8(3);
        buf.put_u8(7);
        buf.put_u8(9);
        buf.put_u8(5);
        buf.put_u8(1);
        assert_eq!(
            decode_binary_param(&mut buf, MYSQL_TYPE_DATETIME, false),
            Some(BindValue::Text("2024-03-07 09:05:01".to_string()))
        );
    }

    #[test]
    fn test_decode_truncated_param() {
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        assert_eq!(decode_binary_param(&mut buf, MYSQL_TYPE_LONG, false), None);
    }
}
