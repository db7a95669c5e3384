//! Protocol 10 greeting and the client's handshake response.

use bytes::{Buf, BufMut, BytesMut};

use super::constants::*;
use super::packet::{get_cstring, get_lenenc_bytes};
use crate::errors::HandshakeError;

/// Build the HandshakeV10 greeting payload. The 20-byte scramble is unused
/// for authentication (any credentials are accepted) but clients hash their
/// password against it, so it must be present and non-zero.
pub fn greeting(connection_id: u32, server_version: &str, scramble: &[u8; 20]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_u8(PROTOCOL_VERSION);
    buf.put_slice(server_version.as_bytes());
    buf.put_u8(0);
    buf.put_u32_le(connection_id);
    buf.put_slice(&scramble[..8]);
    buf.put_u8(0);
    buf.put_u16_le((SERVER_CAPABILITIES & 0xffff) as u16);
    buf.put_u8(CHARSET_UTF8MB4);
    buf.put_u16_le(SERVER_STATUS_AUTOCOMMIT);
    buf.put_u16_le((SERVER_CAPABILITIES >> 16) as u16);
    buf.put_u8(21); // length of the full auth-plugin data
    buf.put_slice(&[0u8; 10]);
    buf.put_slice(&scramble[8..]);
    buf.put_u8(0);
    buf.put_slice(AUTH_PLUGIN_NAME.as_bytes());
    buf.put_u8(0);

    buf
}

pub fn new_scramble() -> [u8; 20] {
    let mut scramble = [0u8; 20];
    for byte in scramble.iter_mut() {
        // Keep within the non-zero ASCII range libmysqlclient expects.
        *byte = rand::random::<u8>() % 94 + 33;
    }
    scramble
}

/// Parsed HandshakeResponse41.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

pub fn parse_handshake_response(mut buf: BytesMut) -> Result<HandshakeResponse, HandshakeError> {
    if buf.len() < 4 + 4 + 1 + 23 {
        // A 32-byte payload with CLIENT_SSL set is an SSLRequest; we did not
        // advertise SSL so anything this short is a protocol violation.
        if buf.len() >= 4 {
            let flags = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if flags & CLIENT_SSL != 0 {
                return Err(HandshakeError::TlsNotAdvertised);
            }
        }
        return Err(HandshakeError::EmptyResponse);
    }

    let capabilities = buf.get_u32_le();
    if capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(HandshakeError::Pre41Client);
    }
    // An SSLRequest is exactly the 32-byte prefix with CLIENT_SSL set.
    if capabilities & CLIENT_SSL != 0 && buf.len() == 4 + 1 + 23 {
        return Err(HandshakeError::TlsNotAdvertised);
    }

    let max_packet_size = buf.get_u32_le();
    let charset = buf.get_u8();
    buf.advance(23);

    let username = get_cstring(&mut buf).ok_or(HandshakeError::UserUnspecified)?;
    if username.is_empty() {
        return Err(HandshakeError::UserUnspecified);
    }

    let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        get_lenenc_bytes(&mut buf).unwrap_or_default()
    } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        if buf.is_empty() {
            Vec::new()
        } else {
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return Err(HandshakeError::EmptyResponse);
            }
            let out = buf[..len].to_vec();
            buf.advance(len);
            out
        }
    } else {
        get_cstring(&mut buf).map(String::into_bytes).unwrap_or_default()
    };

    let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        get_cstring(&mut buf).filter(|db| !db.is_empty())
    } else {
        None
    };

    let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        get_cstring(&mut buf)
    } else {
        None
    };

    Ok(HandshakeResponse {
        capabilities,
        max_packet_size,
        charset,
        username,
        auth_response,
        database,
        auth_plugin,
    })
}
