//! Outgoing message encoder.
//!
//! Messages are null-terminated ASCII fields with a 4-byte big-endian length
//! prefix (V100+ framing). One `MessageEncoder` builds one outgoing message.

use bytes::{BufMut, BytesMut};
use std::fmt;

use crate::errors::{Result, TwsError};
use crate::protocol::{API_SIGN, HEADER_LEN, MAX_CLIENT_VER, MAX_MSG_LEN, MIN_CLIENT_VER};

/// ASCII printable (32-126) plus tab, LF, CR.
fn is_ascii_printable(s: &str) -> bool {
    s.bytes()
        .all(|b| (32..127).contains(&b) || b == 9 || b == 10 || b == 13)
}

/// Builds a single framed outgoing message.
///
/// Reserves 4 bytes up front for the length header; `finalize` fills it in.
pub struct MessageEncoder {
    buf: BytesMut,
}

impl Default for MessageEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageEncoder {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_bytes(0, HEADER_LEN);
        Self { buf }
    }

    /// Compute the body length, write the big-endian header, return the
    /// complete framed message.
    pub fn finalize(mut self) -> Result<BytesMut> {
        let msg_len = self.buf.len() - HEADER_LEN;
        if msg_len > MAX_MSG_LEN {
            return Err(TwsError::Encoding(format!(
                "message too long: {msg_len} bytes (max {MAX_MSG_LEN})"
            )));
        }
        let len_bytes = (msg_len as u32).to_be_bytes();
        self.buf[0..HEADER_LEN].copy_from_slice(&len_bytes);
        Ok(self.buf)
    }

    /// Encode a string field: bytes + '\0'.
    pub fn encode_field_str(&mut self, value: &str) -> &mut Self {
        if !value.is_empty() && !is_ascii_printable(value) {
            tracing::warn!(value, "non-ASCII-printable string in field encoding");
        }
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Encode an i32 field: ASCII decimal + '\0'.
    pub fn encode_field_i32(&mut self, value: i32) -> &mut Self {
        self.write_display(value);
        self.buf.put_u8(0);
        self
    }

    /// Encode an i64 field: ASCII decimal + '\0'.
    pub fn encode_field_i64(&mut self, value: i64) -> &mut Self {
        self.write_display(value);
        self.buf.put_u8(0);
        self
    }

    /// Encode a f64 field: decimal string or "Infinity" + '\0'.
    pub fn encode_field_f64(&mut self, value: f64) -> &mut Self {
        if value.is_infinite() && value.is_sign_positive() {
            self.buf.extend_from_slice(b"Infinity");
        } else {
            self.write_display(value);
        }
        self.buf.put_u8(0);
        self
    }

    /// Encode a bool field: "1\0" for true, "0\0" for false.
    pub fn encode_field_bool(&mut self, value: bool) -> &mut Self {
        self.buf.extend_from_slice(if value { b"1" } else { b"0" });
        self.buf.put_u8(0);
        self
    }

    /// Encode Option<f64>: None → empty field (the wire's UNSET sentinel).
    pub fn encode_field_max_f64(&mut self, value: Option<f64>) -> &mut Self {
        match value {
            Some(v) => self.encode_field_f64(v),
            None => {
                self.buf.put_u8(0);
                self
            }
        }
    }

    fn write_display<T: fmt::Display>(&mut self, value: T) {
        let s = value.to_string();
        self.buf.extend_from_slice(s.as_bytes());
    }
}

/// Build the V100+ connection request bytes.
///
/// Wire format: `b"API\0"` + `[4-byte BE length]` + `b"v100..200"`. The
/// version string is raw bytes in a length-prefixed frame, not a
/// null-terminated field.
pub fn build_connect_request() -> Result<BytesMut> {
    let body = format!("v{MIN_CLIENT_VER}..{MAX_CLIENT_VER}");
    let body_bytes = body.as_bytes();
    if body_bytes.len() > MAX_MSG_LEN {
        return Err(TwsError::Encoding("connect request too long".into()));
    }

    let mut buf = BytesMut::with_capacity(API_SIGN.len() + HEADER_LEN + body_bytes.len());
    buf.extend_from_slice(API_SIGN);
    buf.extend_from_slice(&(body_bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(body_bytes);
    Ok(buf)
}
