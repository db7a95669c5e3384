//! MySQL wire protocol: packet framing, handshake, and response encoding.

use log::warn;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;

pub mod constants;
pub mod handshake;
pub mod packet;
pub mod response;

pub use constants::*;
pub use handshake::{greeting, new_scramble, parse_handshake_response, HandshakeResponse};
pub use packet::{
    get_cstring, get_lenenc_bytes, get_lenenc_int, put_lenenc_bytes, put_lenenc_int,
    put_lenenc_str, PacketStream,
};
pub use response::{
    binary_row, column_definition, eof_packet, err_packet, ok_packet, prepare_ok, text_row,
    ColumnDefinition,
};

#[cfg(test)]
mod tests;

/// Keepalives detect dead clients within ~30 seconds; tokio leaves them off
/// by default, which keeps dead connections pinned to pool slots forever.
pub fn configure_tcp_socket(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!("can't set nodelay on client socket: {err}");
    }
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(5))
        .with_interval(Duration::from_secs(5));
    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("can't set keepalive on client socket: {err}");
    }
}
