//! PostgreSQL v3 protocol messages used while a session is being established,
//! plus the extended-query Bind message built from a parameter block.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use thiserror::Error;

use crate::query::QueryParams;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    #[default]
    Binary = 1,
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    #[default]
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("protocol error: {0}")]
pub struct ProtocolError(pub String);

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        // Length placeholder, patched below
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstring(&mut buf, "user");
        put_cstring(&mut buf, &self.user);

        if let Some(ref db) = self.database {
            put_cstring(&mut buf, "database");
            put_cstring(&mut buf, db);
        }

        for (key, value) in &self.options {
            put_cstring(&mut buf, key);
            put_cstring(&mut buf, value);
        }

        buf.put_u8(0);

        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        buf
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'p');
        buf.put_i32(4 + self.password.len() as i32 + 1);
        put_cstring(&mut buf, &self.password);
        buf
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'p');

        // 4 (len) + mechanism + null + 4 (data len) + data
        let len = 4 + self.mechanism.len() as i32 + 1 + 4 + self.data.len() as i32;
        buf.put_i32(len);

        put_cstring(&mut buf, &self.mechanism);
        buf.put_i32(self.data.len() as i32);
        buf.put_slice(&self.data);

        buf
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'p');
        buf.put_i32(4 + self.data.len() as i32);
        buf.put_slice(&self.data);
        buf
    }
}

/// Bind message ('B') - Binds an encoded parameter block to a prepared
/// statement.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a QueryParams,
    pub result_formats: &'a [Format],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();

        put_cstring(&mut body, self.portal);
        put_cstring(&mut body, self.statement);

        let formats = self.params.formats();
        body.put_i16(formats.len() as i16);
        for fmt in formats {
            body.put_i16(*fmt as i16);
        }

        body.put_i16(self.params.len() as i16);
        for value in self.params.values() {
            match value {
                Some(bytes) => {
                    body.put_i32(bytes.len() as i32);
                    body.put_slice(bytes);
                }
                None => body.put_i32(-1),
            }
        }

        body.put_i16(self.result_formats.len() as i16);
        for fmt in self.result_formats {
            body.put_i16(*fmt as i16);
        }

        let mut buf = BytesMut::with_capacity(body.len() + 5);
        buf.put_u8(b'B');
        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(&body);
        buf
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'X');
        buf.put_i32(4);
        buf
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Backend messages that can arrive before the first ReadyForQuery.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    /// Anything else, kept by tag.
    Other { tag: u8 },
}

impl BackendMessage {
    /// Length of the first complete message in `buf`, or `None` when more
    /// bytes are needed.
    pub fn frame_len(buf: &[u8]) -> ProtocolResult<Option<usize>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(ProtocolError(format!("invalid message length: {}", len)));
        }
        let total = 1 + len as usize;
        Ok((buf.len() >= total).then_some(total))
    }

    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> ProtocolResult<Self> {
        if buf.remaining() < 5 {
            return Err(ProtocolError("incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();

        if len < 4 || buf.remaining() < len as usize - 4 {
            return Err(ProtocolError("incomplete message body".to_string()));
        }

        let body = buf.split_to(len as usize - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            tag => Ok(BackendMessage::Other { tag }),
        }
    }

    fn decode_auth(mut body: Bytes) -> ProtocolResult<Self> {
        ensure(&body, 4, "authentication request")?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                ensure(&body, 4, "MD5 salt")?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(ProtocolError(format!(
                "unsupported authentication method: {}",
                auth_type
            ))),
        }
    }

    fn decode_ready_for_query(mut body: Bytes) -> ProtocolResult<Self> {
        ensure(&body, 1, "ReadyForQuery")?;
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_status(mut body: Bytes) -> ProtocolResult<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> ProtocolResult<Self> {
        ensure(&body, 8, "BackendKeyData")?;
        let process_id = body.get_i32();
        let secret_key = body.get_i32();
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn ensure(body: &Bytes, needed: usize, what: &str) -> ProtocolResult<()> {
    if body.remaining() < needed {
        return Err(ProtocolError(format!("truncated {}", what)));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> ProtocolResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProtocolError("missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> ProtocolResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

/// Render error fields as `SEVERITY:  message`, the way libpq prints them.
pub fn error_text(fields: &HashMap<u8, String>) -> String {
    let severity = fields
        .get(&b'V')
        .or_else(|| fields.get(&b'S'))
        .map(String::as_str)
        .unwrap_or("ERROR");
    let message = fields.get(&b'M').map(String::as_str).unwrap_or("unknown error");
    format!("{}:  {}", severity, message)
}
