//! Async TCP transport for the TWS API.
//!
//! Handles V100+ framing (4-byte big-endian length prefix), the connect
//! handshake, START_API, and reading/writing complete messages.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::decoder::MessageDecoder;
use crate::encoder::{build_connect_request, MessageEncoder};
use crate::errors::{Result, TwsError};
use crate::protocol::{
    outgoing, server_version, HEADER_LEN, MAX_CLIENT_VER, MAX_MSG_LEN, MIN_CLIENT_VER,
};

/// Read one complete framed message, accumulating across TCP fragments.
async fn read_framed(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<Vec<u8>> {
    while buf.len() < HEADER_LEN {
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(TwsError::Disconnected(
                "connection closed while reading message header".into(),
            ));
        }
    }

    let len_bytes: [u8; 4] = buf[..HEADER_LEN]
        .try_into()
        .map_err(|_| TwsError::Decoding("short length header".into()))?;
    let msg_len = u32::from_be_bytes(len_bytes) as usize;

    if msg_len == 0 || msg_len > MAX_MSG_LEN {
        return Err(TwsError::Protocol(format!(
            "invalid message length: {msg_len}"
        )));
    }

    let total_needed = HEADER_LEN + msg_len;
    while buf.len() < total_needed {
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(TwsError::Disconnected(
                "connection closed while reading message body".into(),
            ));
        }
    }

    buf.advance(HEADER_LEN);
    Ok(buf.split_to(msg_len).to_vec())
}

/// A connected transport: TCP stream plus the negotiated handshake state.
///
/// `connect` performs the full `API\0` + version-range handshake and leaves
/// the transport ready for START_API. Split it for concurrent read/write.
pub struct Transport {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    server_version: i32,
    tws_time: String,
}

impl Transport {
    /// Connect to TWS/Gateway and perform the V100+ handshake.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TwsError::Connection(format!("failed to connect to {addr}: {e}")))?;

        let (reader, writer) = stream.into_split();
        let mut transport = Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(8192),
            server_version: 0,
            tws_time: String::new(),
        };

        transport.send_connect_request().await?;
        transport.process_connect_ack().await?;
        Ok(transport)
    }

    async fn send_connect_request(&mut self) -> Result<()> {
        let bytes = build_connect_request()?;
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| TwsError::Connection(format!("failed to send connect request: {e}")))?;
        Ok(())
    }

    /// Read the connect acknowledgment: `[len][server_version\0][tws_time\0]`,
    /// or a negative version plus `host:port` for a redirect.
    async fn process_connect_ack(&mut self) -> Result<()> {
        let msg = self.read_message().await?;
        let mut dec = MessageDecoder::new(&msg, 0);

        let sv = dec.decode_i32()?;
        if sv < 0 {
            let hostport = dec.decode_string()?;
            return Err(TwsError::Protocol(format!("server redirect to {hostport}")));
        }
        if !(MIN_CLIENT_VER..=MAX_CLIENT_VER).contains(&sv) {
            return Err(TwsError::Protocol(format!(
                "unsupported server version {sv} (expected {MIN_CLIENT_VER}..{MAX_CLIENT_VER})"
            )));
        }

        self.tws_time = dec.decode_string()?;
        self.server_version = sv;

        tracing::info!(
            server_version = sv,
            tws_time = %self.tws_time,
            "TWS API handshake complete"
        );
        Ok(())
    }

    /// Read a single complete message body (length header stripped).
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        read_framed(&mut self.reader, &mut self.read_buf).await
    }

    /// Send a pre-encoded framed message (as produced by
    /// `MessageEncoder::finalize`).
    pub async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| TwsError::Connection(format!("failed to send message: {e}")))?;
        Ok(())
    }

    /// Build and send START_API. Must follow a successful `connect`.
    pub async fn start_api(&mut self, client_id: i32) -> Result<()> {
        let mut enc = MessageEncoder::new();
        enc.encode_field_i32(outgoing::START_API);
        enc.encode_field_i32(2); // version
        enc.encode_field_i32(client_id);
        if self.server_version >= server_version::OPTIONAL_CAPABILITIES {
            enc.encode_field_str("");
        }
        let bytes = enc.finalize()?;
        self.send_message(&bytes).await
    }

    /// Negotiated server version from the handshake.
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    /// TWS connection time string from the handshake.
    pub fn tws_time(&self) -> &str {
        &self.tws_time
    }

    /// Split into reader and writer halves for concurrent tasks.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        (
            TransportReader {
                reader: self.reader,
                read_buf: self.read_buf,
                server_version: self.server_version,
            },
            TransportWriter {
                writer: self.writer,
                server_version: self.server_version,
            },
        )
    }
}

/// Read half of a split transport; owns the accumulation buffer.
pub struct TransportReader {
    reader: OwnedReadHalf,
    read_buf: BytesMut,
    server_version: i32,
}

impl TransportReader {
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        read_framed(&mut self.reader, &mut self.read_buf).await
    }
}

/// Write half of a split transport.
pub struct TransportWriter {
    writer: OwnedWriteHalf,
    server_version: i32,
}

impl TransportWriter {
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    pub async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| TwsError::Connection(format!("failed to send: {e}")))?;
        Ok(())
    }

    /// Shut down the write half (TCP FIN). The reader will see EOF once the
    /// server closes its side.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
