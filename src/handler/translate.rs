//! Backend-to-MySQL response translation: the fixed OID table, row value
//! re-encoding in text and binary protocol forms, bind-parameter encoding,
//! and PostgreSQL error mapping.

use bytes::{BufMut, BytesMut};
use chrono::Timelike;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::Row;

use crate::errors::Error;
use crate::protocol::constants::*;
use crate::protocol::{put_lenenc_bytes, ColumnDefinition};

// PostgreSQL type OIDs the proxy understands natively.
const OID_BOOL: u32 = 16;
const OID_BYTEA: u32 = 17;
const OID_CHAR: u32 = 18;
const OID_NAME: u32 = 19;
const OID_INT8: u32 = 20;
const OID_INT2: u32 = 21;
const OID_INT4: u32 = 23;
const OID_TEXT: u32 = 25;
const OID_OID: u32 = 26;
const OID_JSON: u32 = 114;
const OID_FLOAT4: u32 = 700;
const OID_FLOAT8: u32 = 701;
const OID_UNKNOWN: u32 = 705;
const OID_BPCHAR: u32 = 1042;
const OID_VARCHAR: u32 = 1043;
const OID_DATE: u32 = 1082;
const OID_TIME: u32 = 1083;
const OID_TIMESTAMP: u32 = 1114;
const OID_TIMESTAMPTZ: u32 = 1184;
const OID_NUMERIC: u32 = 1700;
const OID_UUID: u32 = 2950;
const OID_JSONB: u32 = 3802;

/// The fixed OID → MySQL column definition table.
pub fn column_def_for_pg(name: &str, table: &str, ty: &Type) -> ColumnDefinition {
    let (type_code, charset, length, flags, decimals) = match ty.oid() {
        OID_BOOL => (MYSQL_TYPE_TINY, CHARSET_BINARY, 1, 0, 0),
        OID_INT2 => (MYSQL_TYPE_SHORT, CHARSET_BINARY, 6, 0, 0),
        OID_INT4 => (MYSQL_TYPE_LONG, CHARSET_BINARY, 11, 0, 0),
        OID_INT8 => (MYSQL_TYPE_LONGLONG, CHARSET_BINARY, 20, 0, 0),
        OID_OID => (MYSQL_TYPE_LONG, CHARSET_BINARY, 10, UNSIGNED_FLAG, 0),
        OID_FLOAT4 => (MYSQL_TYPE_FLOAT, CHARSET_BINARY, 12, 0, 31),
        OID_FLOAT8 => (MYSQL_TYPE_DOUBLE, CHARSET_BINARY, 22, 0, 31),
        OID_NUMERIC => (MYSQL_TYPE_NEWDECIMAL, CHARSET_BINARY, 65, 0, 30),
        OID_BYTEA => (MYSQL_TYPE_BLOB, CHARSET_BINARY, 65535, BINARY_FLAG, 0),
        OID_TIMESTAMP | OID_TIMESTAMPTZ => (MYSQL_TYPE_DATETIME, CHARSET_BINARY, 26, 0, 6),
        OID_DATE => (MYSQL_TYPE_DATE, CHARSET_BINARY, 10, 0, 0),
        OID_TIME => (MYSQL_TYPE_TIME, CHARSET_BINARY, 16, 0, 6),
        OID_JSON | OID_JSONB => (MYSQL_TYPE_JSON, CHARSET_UTF8MB4 as u16, 4_194_304, 0, 0),
        _ => (MYSQL_TYPE_VAR_STRING, CHARSET_UTF8MB4 as u16, 1020, 0, 0),
    };
    ColumnDefinition {
        schema: String::new(),
        table: table.to_string(),
        name: name.to_string(),
        charset,
        length,
        type_code,
        flags,
        decimals,
    }
}

/// MySQL column definition straight from a prepared statement's columns.
pub fn columns_from_statement(stmt: &tokio_postgres::Statement) -> Vec<ColumnDefinition> {
    stmt.columns()
        .iter()
        .map(|col| column_def_for_pg(col.name(), "", col.type_()))
        .collect()
}

/// Decode one row value into MySQL text form.
pub fn text_value(row: &Row, idx: usize) -> Result<Option<Vec<u8>>, Error> {
    let ty = row.columns()[idx].type_();
    let value = match ty.oid() {
        OID_BOOL => row
            .try_get::<_, Option<bool>>(idx)?
            .map(|b| if b { b"1".to_vec() } else { b"0".to_vec() }),
        OID_INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| v.to_string().into_bytes()),
        OID_INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| v.to_string().into_bytes()),
        OID_INT8 => row
            .try_get::<_, Option<i64>>(idx)?
            .map(|v| v.to_string().into_bytes()),
        OID_OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| v.to_string().into_bytes()),
        OID_FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| v.to_string().into_bytes()),
        OID_FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)?
            .map(|v| v.to_string().into_bytes()),
        OID_NUMERIC => row
            .try_get::<_, Option<PgNumeric>>(idx)?
            .map(|v| v.0.into_bytes()),
        OID_BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?,
        OID_TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|v| format_datetime(v).into_bytes()),
        OID_TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|v| format_datetime(v.naive_utc()).into_bytes()),
        OID_DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(|v| v.format("%Y-%m-%d").to_string().into_bytes()),
        OID_TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map(|v| format_time(v).into_bytes()),
        OID_JSON | OID_JSONB => row
            .try_get::<_, Option<PgJsonText>>(idx)?
            .map(|v| v.0.into_bytes()),
        OID_UUID => row
            .try_get::<_, Option<PgUuidText>>(idx)?
            .map(|v| v.0.into_bytes()),
        OID_CHAR => row
            .try_get::<_, Option<i8>>(idx)?
            .map(|v| (v as u8 as char).to_string().into_bytes()),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .map_err(|_| {
                Error::Internal(format!(
                    "no MySQL translation for backend type {} (oid {})",
                    ty.name(),
                    ty.oid()
                ))
            })?
            .map(String::into_bytes),
    };
    Ok(value)
}

/// Encode one row value in binary-protocol form (already matched to the
/// column definition produced by [`column_def_for_pg`]).
pub fn binary_value(row: &Row, idx: usize) -> Result<Option<BytesMut>, Error> {
    let ty = row.columns()[idx].type_();
    let mut buf = BytesMut::new();
    let value = match ty.oid() {
        OID_BOOL => row.try_get::<_, Option<bool>>(idx)?.map(|v| {
            buf.put_u8(v as u8);
            buf
        }),
        OID_INT2 => row.try_get::<_, Option<i16>>(idx)?.map(|v| {
            buf.put_i16_le(v);
            buf
        }),
        OID_INT4 => row.try_get::<_, Option<i32>>(idx)?.map(|v| {
            buf.put_i32_le(v);
            buf
        }),
        OID_OID => row.try_get::<_, Option<u32>>(idx)?.map(|v| {
            buf.put_u32_le(v);
            buf
        }),
        OID_INT8 => row.try_get::<_, Option<i64>>(idx)?.map(|v| {
            buf.put_i64_le(v);
            buf
        }),
        OID_FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(|v| {
            buf.put_f32_le(v);
            buf
        }),
        OID_FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(|v| {
            buf.put_f64_le(v);
            buf
        }),
        OID_TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|v| {
                put_binary_datetime(&mut buf, v);
                buf
            }),
        OID_TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|v| {
                put_binary_datetime(&mut buf, v.naive_utc());
                buf
            }),
        OID_DATE => row.try_get::<_, Option<chrono::NaiveDate>>(idx)?.map(|v| {
            use chrono::Datelike;
            buf.put_u8(4);
            buf.put_u16_le(v.year() as u16);
            buf.put_u8(v.month() as u8);
            buf.put_u8(v.day() as u8);
            buf
        }),
        OID_TIME => row.try_get::<_, Option<chrono::NaiveTime>>(idx)?.map(|v| {
            let micros = v.nanosecond() / 1000;
            buf.put_u8(if micros == 0 { 8 } else { 12 });
            buf.put_u8(0); // not negative
            buf.put_u32_le(0); // days
            buf.put_u8(v.hour() as u8);
            buf.put_u8(v.minute() as u8);
            buf.put_u8(v.second() as u8);
            if micros != 0 {
                buf.put_u32_le(micros);
            }
            buf
        }),
        // Everything framed as a string in the column definition is a
        // length-encoded value in the binary protocol too.
        _ => text_value(row, idx)?.map(|bytes| {
            put_lenenc_bytes(&mut buf, &bytes);
            buf
        }),
    };
    Ok(value)
}

/// Encode an already-textual value for a binary-protocol row, following the
/// column definition's type code. Used for locally synthesized results.
pub fn binary_value_from_text(
    column: &ColumnDefinition,
    value: &[u8],
) -> Result<BytesMut, Error> {
    let mut buf = BytesMut::new();
    let text = String::from_utf8_lossy(value);
    match column.type_code {
        MYSQL_TYPE_TINY => buf.put_i8(text.parse::<i8>().unwrap_or(0)),
        MYSQL_TYPE_SHORT => buf.put_i16_le(text.parse::<i16>().unwrap_or(0)),
        MYSQL_TYPE_LONG => buf.put_i32_le(text.parse::<i32>().unwrap_or(0)),
        MYSQL_TYPE_LONGLONG => buf.put_i64_le(text.parse::<i64>().unwrap_or(0)),
        MYSQL_TYPE_FLOAT => buf.put_f32_le(text.parse::<f32>().unwrap_or(0.0)),
        MYSQL_TYPE_DOUBLE => buf.put_f64_le(text.parse::<f64>().unwrap_or(0.0)),
        _ => put_lenenc_bytes(&mut buf, value),
    }
    Ok(buf)
}

fn put_binary_datetime(buf: &mut BytesMut, v: chrono::NaiveDateTime) {
    use chrono::{Datelike, Timelike};
    let micros = v.nanosecond() / 1000;
    buf.put_u8(if micros == 0 { 7 } else { 11 });
    buf.put_u16_le(v.year() as u16);
    buf.put_u8(v.month() as u8);
    buf.put_u8(v.day() as u8);
    buf.put_u8(v.hour() as u8);
    buf.put_u8(v.minute() as u8);
    buf.put_u8(v.second() as u8);
    if micros != 0 {
        buf.put_u32_le(micros);
    }
}

/// `YYYY-MM-DD HH:MM:SS[.ffffff]`, fraction only when present.
pub fn format_datetime(v: chrono::NaiveDateTime) -> String {
    if v.nanosecond() == 0 {
        v.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        v.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }
}

fn format_time(v: chrono::NaiveTime) -> String {
    if v.nanosecond() == 0 {
        v.format("%H:%M:%S").to_string()
    } else {
        v.format("%H:%M:%S%.6f").to_string()
    }
}

/// PostgreSQL `numeric` in binary form, decoded to its decimal text.
pub struct PgNumeric(pub String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(PgNumeric(decode_numeric(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        ty.oid() == OID_NUMERIC
    }
}

/// Base-10000 digit groups with a weight and scale; see the PostgreSQL
/// on-disk `NumericVar` layout.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn std::error::Error + Sync + Send>> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }
    let ndigits = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    let weight = i16::from_be_bytes([raw[2], raw[3]]) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;
    if sign == 0xc000 {
        return Ok("NaN".to_string());
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric digit array truncated".into());
    }
    let digits: Vec<u16> = (0..ndigits)
        .map(|i| u16::from_be_bytes([raw[8 + i * 2], raw[9 + i * 2]]))
        .collect();

    let mut integer = String::new();
    if weight >= 0 {
        for i in 0..=(weight as usize) {
            let group = digits.get(i).copied().unwrap_or(0);
            if integer.is_empty() {
                integer.push_str(&group.to_string());
            } else {
                integer.push_str(&format!("{group:04}"));
            }
        }
    } else {
        integer.push('0');
    }

    let mut fraction = String::new();
    let first_frac = if weight >= 0 { weight as usize + 1 } else { 0 };
    if weight < 0 {
        for _ in 0..((-weight - 1) * 4) {
            fraction.push('0');
        }
    }
    for i in first_frac..ndigits {
        fraction.push_str(&format!("{:04}", digits[i]));
    }
    fraction.truncate(dscale);
    while fraction.len() < dscale {
        fraction.push('0');
    }

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    out.push_str(&integer);
    if dscale > 0 {
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// json/jsonb binary payloads are text, jsonb prefixed with a version byte.
pub struct PgJsonText(pub String);

impl<'a> FromSql<'a> for PgJsonText {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let body = if ty.oid() == OID_JSONB {
            if raw.is_empty() {
                return Err("empty jsonb value".into());
            }
            &raw[1..]
        } else {
            raw
        };
        Ok(PgJsonText(String::from_utf8(body.to_vec())?))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.oid(), OID_JSON | OID_JSONB)
    }
}

pub struct PgUuidText(pub String);

impl<'a> FromSql<'a> for PgUuidText {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if raw.len() != 16 {
            return Err("uuid value must be 16 bytes".into());
        }
        let hex: Vec<String> = raw.iter().map(|b| format!("{b:02x}")).collect();
        let hex = hex.concat();
        Ok(PgUuidText(format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )))
    }

    fn accepts(ty: &Type) -> bool {
        ty.oid() == OID_UUID
    }
}

/// A client-supplied parameter, decoded from COM_STMT_EXECUTE, encoded for
/// whatever type PostgreSQL inferred for the placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ToSql for BindValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            BindValue::Null => Ok(IsNull::Yes),
            BindValue::Int(v) => encode_integer(*v, ty, out),
            BindValue::UInt(v) => {
                if *v <= i64::MAX as u64 {
                    encode_integer(*v as i64, ty, out)
                } else {
                    // Out of signed range; numeric is the only lossless home.
                    encode_numeric_text(&v.to_string(), out)?;
                    Ok(IsNull::No)
                }
            }
            BindValue::Double(v) => match ty.oid() {
                OID_FLOAT4 => {
                    out.put_f32(*v as f32);
                    Ok(IsNull::No)
                }
                OID_FLOAT8 => {
                    out.put_f64(*v);
                    Ok(IsNull::No)
                }
                OID_NUMERIC => {
                    encode_numeric_text(&v.to_string(), out)?;
                    Ok(IsNull::No)
                }
                OID_TEXT | OID_VARCHAR | OID_BPCHAR | OID_UNKNOWN | OID_NAME => {
                    out.put_slice(v.to_string().as_bytes());
                    Ok(IsNull::No)
                }
                other => Err(format!("cannot bind float to backend type oid {other}").into()),
            },
            BindValue::Text(s) => encode_text(s, ty, out),
            BindValue::Bytes(b) => match ty.oid() {
                OID_BYTEA | OID_UNKNOWN => {
                    out.put_slice(b);
                    Ok(IsNull::No)
                }
                OID_TEXT | OID_VARCHAR | OID_BPCHAR | OID_NAME | OID_JSON => {
                    out.put_slice(b);
                    Ok(IsNull::No)
                }
                other => Err(format!("cannot bind bytes to backend type oid {other}").into()),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn encode_integer(
    v: i64,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
    match ty.oid() {
        OID_BOOL => out.put_u8((v != 0) as u8),
        OID_INT2 => out.put_i16(i16::try_from(v)?),
        OID_INT4 => out.put_i32(i32::try_from(v)?),
        OID_INT8 => out.put_i64(v),
        OID_OID => out.put_u32(u32::try_from(v)?),
        OID_FLOAT4 => out.put_f32(v as f32),
        OID_FLOAT8 => out.put_f64(v as f64),
        OID_NUMERIC => {
            encode_numeric_text(&v.to_string(), out)?;
        }
        OID_TEXT | OID_VARCHAR | OID_BPCHAR | OID_UNKNOWN | OID_NAME => {
            out.put_slice(v.to_string().as_bytes())
        }
        other => return Err(format!("cannot bind integer to backend type oid {other}").into()),
    }
    Ok(IsNull::No)
}

fn encode_text(
    s: &str,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
    match ty.oid() {
        OID_TEXT | OID_VARCHAR | OID_BPCHAR | OID_NAME | OID_UNKNOWN | OID_JSON | OID_BYTEA => {
            out.put_slice(s.as_bytes());
            Ok(IsNull::No)
        }
        OID_JSONB => {
            out.put_u8(1);
            out.put_slice(s.as_bytes());
            Ok(IsNull::No)
        }
        OID_BOOL => {
            let v = matches!(s, "1" | "t" | "true" | "TRUE" | "on");
            out.put_u8(v as u8);
            Ok(IsNull::No)
        }
        OID_INT2 | OID_INT4 | OID_INT8 | OID_OID => encode_integer(s.trim().parse::<i64>()?, ty, out),
        OID_FLOAT4 => {
            out.put_f32(s.trim().parse::<f32>()?);
            Ok(IsNull::No)
        }
        OID_FLOAT8 => {
            out.put_f64(s.trim().parse::<f64>()?);
            Ok(IsNull::No)
        }
        OID_NUMERIC => {
            encode_numeric_text(s.trim(), out)?;
            Ok(IsNull::No)
        }
        OID_TIMESTAMP => {
            let parsed = parse_mysql_datetime(s)?;
            parsed.to_sql(ty, out)
        }
        OID_TIMESTAMPTZ => {
            let parsed = parse_mysql_datetime(s)?;
            chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(parsed, chrono::Utc)
                .to_sql(ty, out)
        }
        OID_DATE => {
            let parsed = chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?;
            parsed.to_sql(ty, out)
        }
        OID_TIME => {
            let parsed = parse_mysql_time(s)?;
            parsed.to_sql(ty, out)
        }
        OID_UUID => {
            let cleaned: String = s.chars().filter(|c| *c != '-').collect();
            if cleaned.len() != 32 {
                return Err(format!("bad uuid literal {s:?}").into());
            }
            for i in 0..16 {
                out.put_u8(u8::from_str_radix(&cleaned[i * 2..i * 2 + 2], 16)?);
            }
            Ok(IsNull::No)
        }
        other => Err(format!("cannot bind string to backend type oid {other}").into()),
    }
}

fn parse_mysql_datetime(
    s: &str,
) -> Result<chrono::NaiveDateTime, Box<dyn std::error::Error + Sync + Send>> {
    let s = s.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Ok(parsed);
        }
    }
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    Ok(date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

fn parse_mysql_time(
    s: &str,
) -> Result<chrono::NaiveTime, Box<dyn std::error::Error + Sync + Send>> {
    let s = s.trim();
    for format in ["%H:%M:%S%.f", "%H:%M:%S"] {
        if let Ok(parsed) = chrono::NaiveTime::parse_from_str(s, format) {
            return Ok(parsed);
        }
    }
    Err(format!("bad time literal {s:?}").into())
}

/// Encode a decimal string as a PostgreSQL binary `numeric`.
fn encode_numeric_text(
    s: &str,
    out: &mut BytesMut,
) -> Result<(), Box<dyn std::error::Error + Sync + Send>> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.chars().chain(frac_part.chars()).any(|c| !c.is_ascii_digit()) {
        return Err(format!("bad numeric literal {s:?}").into());
    }
    let dscale = frac_part.len() as u16;

    // Left-pad the integer part and right-pad the fraction to whole base-10000
    // groups, keeping the group boundary at the decimal point.
    let int_groups = int_part.len().div_ceil(4);
    let mut padded = String::new();
    for _ in 0..(int_groups * 4 - int_part.len()) {
        padded.push('0');
    }
    padded.push_str(int_part);
    padded.push_str(frac_part);
    while padded.len() % 4 != 0 {
        padded.push('0');
    }

    let mut groups: Vec<u16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).unwrap().parse::<u16>().unwrap())
        .collect();

    let mut weight = int_groups as i32 - 1;
    while groups.first() == Some(&0) && weight >= 0 && groups.len() > 1 {
        groups.remove(0);
        weight -= 1;
    }
    while groups.last() == Some(&0) && groups.len() > 1 {
        groups.pop();
    }
    if groups == [0] {
        weight = 0;
    }

    out.put_u16(groups.len() as u16);
    out.put_i16(weight as i16);
    out.put_u16(if negative { 0x4000 } else { 0x0000 });
    out.put_u16(dscale);
    for group in groups {
        out.put_u16(group);
    }
    Ok(())
}

/// Map a backend error onto a MySQL (errno, sqlstate, message) triple.
pub fn mysql_error_from_backend(err: &tokio_postgres::Error) -> (u16, String, String) {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        let (errno, sqlstate) = match code {
            "42P01" => (1146, "42S02"),
            "42703" | "42701" => (1054, "42S22"),
            "23505" => (1062, "23000"),
            "23503" => (1452, "23000"),
            "23502" => (1048, "23000"),
            "22001" => (1406, "22001"),
            "22012" => (1365, "22012"),
            "28000" | "28P01" => (1045, "28000"),
            "3D000" | "3F000" => (1049, "42000"),
            "42601" => (1064, "42000"),
            "40001" | "40P01" => (1213, "40001"),
            "55P03" => (1205, "HY000"),
            "57014" => (1317, "70100"),
            // Pass the standard SQLSTATE through with the generic code.
            _ => (1064, code),
        };
        (errno, sqlstate.to_string(), db.message().to_string())
    } else {
        (2013, "HY000".to_string(), format!("Lost connection to backend: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &[u8]) -> String {
        decode_numeric(raw).unwrap()
    }

    fn encode(s: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_numeric_text(s, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_numeric_roundtrip() {
        for value in [
            "0", "1", "42", "9999", "10000", "123456789", "0.5", "3.14159", "-12.3450",
            "20000000000000000000",
        ] {
            let encoded = encode(value);
            assert_eq!(decode(&encoded), value, "value {value}");
        }
    }

    #[test]
    fn test_numeric_nan() {
        let raw = [0u8, 0, 0, 0, 0xc0, 0x00, 0, 0];
        assert_eq!(decode(&raw), "NaN");
    }

    #[test]
    fn test_datetime_format() {
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 1)
            .unwrap();
        assert_eq!(format_datetime(dt), "2024-03-07 09:05:01");

        let dt = dt.with_nanosecond(123_456_000).unwrap();
        assert_eq!(format_datetime(dt), "2024-03-07 09:05:01.123456");
    }

    #[test]
    fn test_bind_integer_to_int4() {
        let mut out = BytesMut::new();
        let result = BindValue::Int(42).to_sql(&Type::INT4, &mut out).unwrap();
        assert!(matches!(result, IsNull::No));
        assert_eq!(&out[..], &42i32.to_be_bytes());
    }

    #[test]
    fn test_bind_text_to_int8() {
        let mut out = BytesMut::new();
        BindValue::Text("7".into()).to_sql(&Type::INT8, &mut out).unwrap();
        assert_eq!(&out[..], &7i64.to_be_bytes());
    }

    #[test]
    fn test_bind_rejects_mismatch() {
        let mut out = BytesMut::new();
        assert!(BindValue::Bytes(vec![1]).to_sql(&Type::INT4, &mut out).is_err());
    }

    #[test]
    fn test_column_def_table() {
        let def = column_def_for_pg("id", "users", &Type::INT8);
        assert_eq!(def.type_code, MYSQL_TYPE_LONGLONG);
        let def = column_def_for_pg("name", "users", &Type::TEXT);
        assert_eq!(def.type_code, MYSQL_TYPE_VAR_STRING);
        let def = column_def_for_pg("payload", "users", &Type::BYTEA);
        assert_ne!(def.flags & BINARY_FLAG, 0);
    }
}
