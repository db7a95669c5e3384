//! MySQL packet framing: 3-byte little-endian payload length plus a
//! sequence id, with continuation packets above 16 MB.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::constants::{MAX_FRAME_SIZE, MAX_PAYLOAD_LEN};
use crate::errors::Error;

/// A duplex MySQL packet stream. Reads are buffered; the sequence id is
/// tracked here so command handlers never touch it.
pub struct PacketStream<S> {
    stream: BufReader<S>,
    seq: u8,
}

impl<S> PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> PacketStream<S> {
        PacketStream {
            stream: BufReader::new(stream),
            seq: 0,
        }
    }

    /// Every client command starts a fresh sequence.
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Read one logical frame, joining continuation packets. Returns `None`
    /// on a clean EOF at a packet boundary.
    pub async fn read_frame(&mut self) -> Result<Option<BytesMut>, Error> {
        let mut frame = BytesMut::new();
        loop {
            let mut header = [0u8; 4];
            match self.stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof && frame.is_empty() => {
                    return Ok(None);
                }
                Err(err) => {
                    return Err(Error::SocketError(format!(
                        "failed to read packet header: {err}"
                    )))
                }
            }

            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.seq = header[3].wrapping_add(1);

            if frame.len() + len > MAX_FRAME_SIZE {
                return Err(Error::SocketError("frame exceeds maximum size".into()));
            }

            let start = frame.len();
            frame.resize(start + len, 0);
            self.stream
                .read_exact(&mut frame[start..])
                .await
                .map_err(|err| Error::SocketError(format!("failed to read packet body: {err}")))?;

            if len < MAX_PAYLOAD_LEN {
                return Ok(Some(frame));
            }
        }
    }

    /// Write one logical frame, splitting into continuation packets when the
    /// payload reaches 16 MB. Does not flush.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut rest = payload;
        loop {
            let chunk_len = rest.len().min(MAX_PAYLOAD_LEN);
            let (chunk, tail) = rest.split_at(chunk_len);

            let mut header = [0u8; 4];
            header[..3].copy_from_slice(&(chunk_len as u32).to_le_bytes()[..3]);
            header[3] = self.seq;
            self.seq = self.seq.wrapping_add(1);

            self.stream
                .write_all(&header)
                .await
                .map_err(|err| Error::SocketError(format!("failed to write to socket: {err}")))?;
            self.stream
                .write_all(chunk)
                .await
                .map_err(|err| Error::SocketError(format!("failed to write to socket: {err}")))?;

            rest = tail;
            // A payload of exactly 16 MB - 1 needs a trailing empty packet.
            if rest.is_empty() && chunk_len < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream
            .flush()
            .await
            .map_err(|err| Error::SocketError(format!("failed to flush socket: {err}")))
    }
}

/// Length-encoded integer, reading from the front of `buf`.
pub fn get_lenenc_int(buf: &mut BytesMut) -> Option<u64> {
    if buf.is_empty() {
        return None;
    }
    let first = buf.get_u8();
    match first {
        0xfb => None, // NULL marker in row context; callers special-case
        0xfc => {
            if buf.len() < 2 {
                return None;
            }
            Some(buf.get_u16_le() as u64)
        }
        0xfd => {
            if buf.len() < 3 {
                return None;
            }
            let mut v = [0u8; 4];
            v[..3].copy_from_slice(&buf[..3]);
            buf.advance(3);
            Some(u32::from_le_bytes(v) as u64)
        }
        0xfe => {
            if buf.len() < 8 {
                return None;
            }
            Some(buf.get_u64_le())
        }
        v => Some(v as u64),
    }
}

pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    match value {
        0..=250 => buf.put_u8(value as u8),
        251..=0xffff => {
            buf.put_u8(0xfc);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xff_ffff => {
            buf.put_u8(0xfd);
            buf.put_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            buf.put_u8(0xfe);
            buf.put_u64_le(value);
        }
    }
}

pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.put_slice(value);
}

pub fn put_lenenc_str(buf: &mut BytesMut, value: &str) {
    put_lenenc_bytes(buf, value.as_bytes());
}

/// Length-encoded byte string from the front of `buf`.
pub fn get_lenenc_bytes(buf: &mut BytesMut) -> Option<Vec<u8>> {
    let len = get_lenenc_int(buf)? as usize;
    if buf.len() < len {
        return None;
    }
    let out = buf[..len].to_vec();
    buf.advance(len);
    Some(out)
}

/// NUL-terminated string from the front of `buf`.
pub fn get_cstring(buf: &mut BytesMut) -> Option<String> {
    let pos = buf.iter().position(|&b| b == 0)?;
    let out = String::from_utf8_lossy(&buf[..pos]).into_owned();
    buf.advance(pos + 1);
    Some(out)
}
