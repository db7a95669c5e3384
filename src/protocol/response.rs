//! Response payload builders: OK/ERR/EOF, column definitions, resultset rows.

use bytes::{BufMut, BytesMut};

use super::constants::*;
use super::packet::{put_lenenc_bytes, put_lenenc_int, put_lenenc_str};

/// A MySQL column definition, already translated from the backend type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub charset: u16,
    pub length: u32,
    pub type_code: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// A text column with sensible defaults; the common case for shaped
    /// catalog results.
    pub fn text(name: &str) -> ColumnDefinition {
        ColumnDefinition {
            schema: String::new(),
            table: String::new(),
            name: name.to_string(),
            charset: CHARSET_UTF8MB4 as u16,
            length: 255,
            type_code: MYSQL_TYPE_VAR_STRING,
            flags: 0,
            decimals: 0,
        }
    }

    pub fn longlong(name: &str) -> ColumnDefinition {
        ColumnDefinition {
            schema: String::new(),
            table: String::new(),
            name: name.to_string(),
            charset: CHARSET_BINARY,
            length: 20,
            type_code: MYSQL_TYPE_LONGLONG,
            flags: NOT_NULL_FLAG,
            decimals: 0,
        }
    }
}

pub fn ok_packet(affected_rows: u64, last_insert_id: u64, status: u16, warnings: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(0x00);
    put_lenenc_int(&mut buf, affected_rows);
    put_lenenc_int(&mut buf, last_insert_id);
    buf.put_u16_le(status);
    buf.put_u16_le(warnings);
    buf
}

pub fn err_packet(errno: u16, sqlstate: &str, message: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16 + message.len());
    buf.put_u8(0xff);
    buf.put_u16_le(errno);
    buf.put_u8(b'#');
    // SQLSTATE is exactly five bytes on the wire.
    let mut state = [b'0', b'0', b'0', b'0', b'0'];
    for (i, b) in sqlstate.bytes().take(5).enumerate() {
        state[i] = b;
    }
    buf.put_slice(&state);
    buf.put_slice(message.as_bytes());
    buf
}

pub fn eof_packet(status: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(0xfe);
    buf.put_u16_le(0); // warnings
    buf.put_u16_le(status);
    buf
}

/// ColumnDefinition41 payload.
pub fn column_definition(column: &ColumnDefinition) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    put_lenenc_str(&mut buf, "def");
    put_lenenc_str(&mut buf, &column.schema);
    put_lenenc_str(&mut buf, &column.table);
    put_lenenc_str(&mut buf, &column.table); // org_table
    put_lenenc_str(&mut buf, &column.name);
    put_lenenc_str(&mut buf, &column.name); // org_name
    buf.put_u8(0x0c); // fixed length of the remainder
    buf.put_u16_le(column.charset);
    buf.put_u32_le(column.length);
    buf.put_u8(column.type_code);
    buf.put_u16_le(column.flags);
    buf.put_u8(column.decimals);
    buf.put_u16_le(0); // filler
    buf
}

/// Text-protocol resultset row. `None` is SQL NULL.
pub fn text_row(values: &[Option<Vec<u8>>]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(32 * values.len());
    for value in values {
        match value {
            Some(bytes) => put_lenenc_bytes(&mut buf, bytes),
            None => buf.put_u8(0xfb),
        }
    }
    buf
}

/// Binary-protocol resultset row. Each `Some` holds the value already
/// encoded for its column type; NULLs go to the bitmap.
pub fn binary_row(values: &[Option<BytesMut>]) -> BytesMut {
    let bitmap_len = (values.len() + 7 + 2) / 8;
    let mut buf = BytesMut::with_capacity(1 + bitmap_len + 16 * values.len());
    buf.put_u8(0x00);

    let mut bitmap = vec![0u8; bitmap_len];
    for (i, value) in values.iter().enumerate() {
        if value.is_none() {
            let bit = i + 2; // binary rows offset the bitmap by two bits
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }
    buf.put_slice(&bitmap);

    for value in values.iter().flatten() {
        buf.put_slice(value);
    }
    buf
}

/// COM_STMT_PREPARE response header.
pub fn prepare_ok(statement_id: u32, num_columns: u16, num_params: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(0x00);
    buf.put_u32_le(statement_id);
    buf.put_u16_le(num_columns);
    buf.put_u16_le(num_params);
    buf.put_u8(0); // filler
    buf.put_u16_le(0); // warnings
    buf
}
