//! Tests for wire message encoding and decoding.

use bytes::BytesMut;

use super::constants::*;
use super::handshake::{greeting, new_scramble, parse_handshake_response};
use super::packet::{get_lenenc_int, put_lenenc_int, put_lenenc_str};
use super::response::*;

#[test]
fn test_lenenc_int_roundtrip() {
    for value in [0u64, 1, 250, 251, 0xffff, 0x1_0000, 0xff_ffff, 0x100_0000, u64::MAX] {
        let mut buf = BytesMut::new();
        put_lenenc_int(&mut buf, value);
        assert_eq!(get_lenenc_int(&mut buf), Some(value), "value {value}");
        assert!(buf.is_empty());
    }
}

#[test]
fn test_lenenc_int_boundaries() {
    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, 250);
    assert_eq!(buf.len(), 1);

    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, 251);
    assert_eq!(buf.len(), 3);
    assert_eq!(buf[0], 0xfc);

    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, 0x1_0000);
    assert_eq!(buf.len(), 4);
    assert_eq!(buf[0], 0xfd);
}

#[test]
fn test_ok_packet_layout() {
    let buf = ok_packet(3, 7, SERVER_STATUS_AUTOCOMMIT, 0);
    assert_eq!(buf[0], 0x00);
    assert_eq!(buf[1], 3); // affected rows
    assert_eq!(buf[2], 7); // last insert id
    assert_eq!(u16::from_le_bytes([buf[3], buf[4]]), SERVER_STATUS_AUTOCOMMIT);
}

#[test]
fn test_err_packet_layout() {
    let buf = err_packet(1235, "42000", "not supported");
    assert_eq!(buf[0], 0xff);
    assert_eq!(u16::from_le_bytes([buf[1], buf[2]]), 1235);
    assert_eq!(buf[3], b'#');
    assert_eq!(&buf[4..9], b"42000");
    assert_eq!(&buf[9..], b"not supported");
}

#[test]
fn test_err_packet_pads_short_sqlstate() {
    let buf = err_packet(1064, "42", "x");
    assert_eq!(&buf[4..9], b"42000");
}

#[test]
fn test_eof_packet() {
    let buf = eof_packet(SERVER_MORE_RESULTS_EXISTS);
    assert_eq!(buf[0], 0xfe);
    assert_eq!(buf.len(), 5);
    assert_eq!(
        u16::from_le_bytes([buf[3], buf[4]]),
        SERVER_MORE_RESULTS_EXISTS
    );
}

#[test]
fn test_text_row_null_marker() {
    let row = text_row(&[Some(b"42".to_vec()), None, Some(b"".to_vec())]);
    assert_eq!(&row[..], &[2, b'4', b'2', 0xfb, 0][..]);
}

#[test]
fn test_binary_row_null_bitmap() {
    // Three columns, the middle one NULL: bit 3 (offset 2) set.
    let row = binary_row(&[
        Some(BytesMut::from(&[0x2a, 0x00, 0x00, 0x00][..])),
        None,
        Some(BytesMut::from(&[0x01][..])),
    ]);
    assert_eq!(row[0], 0x00);
    assert_eq!(row[1], 0b0000_1000);
    assert_eq!(&row[2..6], &[0x2a, 0x00, 0x00, 0x00]);
    assert_eq!(row[6], 0x01);
}

#[test]
fn test_column_definition_charsets() {
    let text = column_definition(&ColumnDefinition::text("name"));
    assert!(text.windows(4).any(|w| w == b"name"));

    let ll = ColumnDefinition::longlong("id");
    assert_eq!(ll.type_code, MYSQL_TYPE_LONGLONG);
    assert_eq!(ll.charset, CHARSET_BINARY);
    assert_ne!(ll.flags & NOT_NULL_FLAG, 0);
}

#[test]
fn test_prepare_ok_layout() {
    let buf = prepare_ok(5, 2, 3);
    assert_eq!(buf[0], 0x00);
    assert_eq!(u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]), 5);
    assert_eq!(u16::from_le_bytes([buf[5], buf[6]]), 2);
    assert_eq!(u16::from_le_bytes([buf[7], buf[8]]), 3);
}

#[test]
fn test_greeting_shape() {
    let scramble = new_scramble();
    assert!(scramble.iter().all(|&b| b != 0));

    let buf = greeting(99, "8.0.35-aproxy", &scramble);
    assert_eq!(buf[0], PROTOCOL_VERSION);
    // The version string is NUL-terminated right after the protocol byte.
    let nul = 1 + "8.0.35-aproxy".len();
    assert_eq!(buf[nul], 0);
    let conn_id = u32::from_le_bytes([buf[nul + 1], buf[nul + 2], buf[nul + 3], buf[nul + 4]]);
    assert_eq!(conn_id, 99);
    // After connection id: 8 salt bytes and a filler, then the lower
    // capability word. Capabilities must not advertise SSL.
    assert_eq!(buf[nul + 13], 0);
    let caps_lo = u16::from_le_bytes([buf[nul + 14], buf[nul + 15]]) as u32;
    assert_eq!(caps_lo & CLIENT_SSL, 0);
}

#[test]
fn test_handshake_response_roundtrip() {
    use bytes::BufMut;

    let mut buf = BytesMut::new();
    let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_WITH_DB;
    buf.put_u32_le(caps);
    buf.put_u32_le(16 * 1024 * 1024);
    buf.put_u8(45);
    buf.put_slice(&[0u8; 23]);
    buf.put_slice(b"appuser\0");
    buf.put_u8(4);
    buf.put_slice(&[1, 2, 3, 4]);
    buf.put_slice(b"mydb\0");

    let response = parse_handshake_response(buf).unwrap();
    assert_eq!(response.username, "appuser");
    assert_eq!(response.auth_response, vec![1, 2, 3, 4]);
    assert_eq!(response.database.as_deref(), Some("mydb"));
    assert_eq!(response.charset, 45);
}

#[test]
fn test_handshake_response_pre41_rejected() {
    use bytes::BufMut;

    let mut buf = BytesMut::new();
    buf.put_u32_le(CLIENT_LONG_PASSWORD);
    buf.put_u32_le(0);
    buf.put_u8(8);
    buf.put_slice(&[0u8; 23]);
    buf.put_slice(b"u\0");
    assert!(parse_handshake_response(buf).is_err());
}
