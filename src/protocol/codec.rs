//! PostgreSQL message codec
//!
//! Pure functions over byte slices: nothing here performs I/O or keeps state
//! between calls. All integers are big-endian on the wire.
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use crate::error::{ProxyError, Result};

use super::constants::*;
use super::messages::*;

// ============================================================================
// Constants
// ============================================================================

/// Maximum declared message length, PostgreSQL's own 1GB allocation limit
pub const MAX_MESSAGE_SIZE: u32 = 0x3FFF_FFFF;

/// Minimum message length (just the 4-byte length field)
pub const MIN_MESSAGE_LENGTH: u32 = 4;

/// Largest startup packet PostgreSQL itself accepts
pub const MAX_STARTUP_LENGTH: u32 = 10_000;

/// Most bytes buffered whole before a leg reaches steady state, where
/// messages are streamed instead
pub const MAX_AUTH_BUFFER: usize = 1024 * 1024;

/// Tag byte plus length field
pub const TAGGED_HEADER_LEN: usize = 5;

// ============================================================================
// Slice helpers
// ============================================================================

fn be_u16(buf: &[u8], offset: usize) -> Result<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ProxyError::Framing(format!("truncated int16 at offset {}", offset)))
}

fn be_u32(buf: &[u8], offset: usize) -> Result<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| ProxyError::Framing(format!("truncated int32 at offset {}", offset)))
}

/// Read a NUL-terminated string starting at `offset`.
///
/// Returns the string and the number of bytes consumed including the NUL.
/// Non-UTF-8 bytes are replaced rather than rejected, since the value may be
/// in any client encoding.
pub fn read_cstring(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let rest = buf
        .get(offset..)
        .ok_or_else(|| ProxyError::Framing(format!("string offset {} out of bounds", offset)))?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Framing("missing NUL terminator in string".into()))?;

    Ok((String::from_utf8_lossy(&rest[..end]).into_owned(), end + 1))
}

fn put_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

// ============================================================================
// Framing
// ============================================================================

/// Decode the tagged message header at `offset`.
///
/// Fails with a framing error if the header or the declared body would run
/// past the end of `buf`, or if the declared length is impossible.
pub fn decode_frame(buf: &[u8], offset: usize) -> Result<Frame> {
    if offset + TAGGED_HEADER_LEN > buf.len() {
        return Err(ProxyError::Framing(format!(
            "incomplete header at offset {} (buffer {} bytes)",
            offset,
            buf.len()
        )));
    }

    let tag = buf[offset];
    let length = be_u32(buf, offset + 1)?;
    check_length(tag, length)?;

    let end = offset + 1 + length as usize;
    if end > buf.len() {
        return Err(ProxyError::Framing(format!(
            "message '{}' declares length {} but only {} bytes remain",
            tag as char,
            length,
            buf.len() - offset - 1
        )));
    }

    Ok(Frame {
        tag: Some(tag),
        length,
        payload: offset + TAGGED_HEADER_LEN..end,
    })
}

/// Reject a declared length that no legal message can have.
pub fn check_length(tag: u8, length: u32) -> Result<()> {
    if length < MIN_MESSAGE_LENGTH {
        return Err(ProxyError::Framing(format!(
            "message '{}' declares invalid length {}",
            tag as char, length
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(ProxyError::Framing(format!(
            "message '{}' length {} exceeds maximum {}",
            tag as char, length, MAX_MESSAGE_SIZE
        )));
    }
    Ok(())
}

/// Complete frames found at the front of a buffer.
#[derive(Debug, Default)]
pub struct FrameScan {
    pub frames: Vec<Frame>,
    /// Bytes covered by `frames`; anything after is a partial message
    pub consumed: usize,
}

impl FrameScan {
    /// Whether bytes after the last complete frame remain.
    pub fn has_partial(&self, buf_len: usize) -> bool {
        self.consumed < buf_len
    }
}

/// Split `buf` into complete tagged frames, stopping at a trailing partial
/// message. Only an impossible declared length is an error.
pub fn scan_frames(buf: &[u8]) -> Result<FrameScan> {
    let mut scan = FrameScan::default();
    let mut offset = 0;

    while offset + TAGGED_HEADER_LEN <= buf.len() {
        let tag = buf[offset];
        let length = be_u32(buf, offset + 1)?;
        check_length(tag, length)?;
        if offset + 1 + length as usize > buf.len() {
            break;
        }
        let frame = decode_frame(buf, offset)?;
        offset += frame.wire_len();
        scan.frames.push(frame);
    }

    scan.consumed = offset;
    Ok(scan)
}

/// Re-encode a decoded frame from the buffer it was decoded from.
pub fn reframe(frame: &Frame, buf: &[u8]) -> Vec<u8> {
    let payload = frame.payload(buf);
    let mut out = Vec::with_capacity(frame.wire_len());
    if let Some(tag) = frame.tag {
        out.push(tag);
    }
    out.extend_from_slice(&(payload.len() as u32 + 4).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode a tagged message.
pub fn encode_message(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TAGGED_HEADER_LEN + payload.len());
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32 + 4).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

// ============================================================================
// Startup family
// ============================================================================

/// Classify the first message on a client connection.
///
/// Returns `Ok(None)` while the message is still incomplete, otherwise the
/// message and the number of bytes it occupied. A length-8 message that is
/// not an SSLRequest is rejected instead of being taken for a startup.
pub fn decode_initial(buf: &[u8]) -> Result<Option<(InitialMessage, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = be_u32(buf, 0)?;
    if length < 8 || length > MAX_STARTUP_LENGTH {
        return Err(ProxyError::Framing(format!(
            "invalid startup packet length {}",
            length
        )));
    }
    let length = length as usize;
    if buf.len() < length {
        return Ok(None);
    }

    let code = be_u32(buf, 4)?;
    if length == SSL_REQUEST_LENGTH as usize {
        if code == SSL_REQUEST_CODE {
            return Ok(Some((InitialMessage::SslRequest, length)));
        }
        return Err(ProxyError::Framing(format!(
            "length-8 message with unknown request code {}",
            code
        )));
    }

    if code == CANCEL_REQUEST_CODE {
        if length != 16 {
            return Err(ProxyError::Framing(format!(
                "CancelRequest with length {}",
                length
            )));
        }
        let msg = InitialMessage::CancelRequest {
            process_id: be_u32(buf, 8)?,
            secret_key: be_u32(buf, 12)?,
        };
        return Ok(Some((msg, length)));
    }

    let startup = decode_startup(&buf[4..length])?;
    Ok(Some((InitialMessage::Startup(startup), length)))
}

/// Decode a StartupMessage body (everything after the length field).
pub fn decode_startup(payload: &[u8]) -> Result<StartupMessage> {
    let major = be_u16(payload, 0)?;
    let minor = be_u16(payload, 2)?;

    let mut parameters = Vec::new();
    let mut offset = 4;
    loop {
        match payload.get(offset) {
            None => {
                return Err(ProxyError::Framing(
                    "startup parameters missing final terminator".into(),
                ))
            }
            Some(0) => break,
            Some(_) => {}
        }
        let (key, used) = read_cstring(payload, offset)?;
        offset += used;
        let (value, used) = read_cstring(payload, offset)?;
        offset += used;
        parameters.push((key, value));
    }

    Ok(StartupMessage {
        major,
        minor,
        parameters,
    })
}

/// Encode a complete StartupMessage, length prefix included.
pub fn encode_startup(msg: &StartupMessage) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&msg.major.to_be_bytes());
    body.extend_from_slice(&msg.minor.to_be_bytes());
    for (key, value) in &msg.parameters {
        put_cstring(&mut body, key);
        put_cstring(&mut body, value);
    }
    body.push(0);

    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

// ============================================================================
// Field extraction
// ============================================================================

/// Extract the fields of a backend message that matter for logging and for
/// the proxy's own control decisions.
pub fn decode_field(tag: u8, payload: &[u8]) -> Result<DecodedField> {
    let field = match tag {
        MSG_AUTHENTICATION => {
            let subtype = be_u32(payload, 0)?;
            let salt = if subtype == AUTH_MD5_PASSWORD {
                let bytes = payload.get(4..8).ok_or_else(|| {
                    ProxyError::Framing("MD5 authentication request without salt".into())
                })?;
                Some([bytes[0], bytes[1], bytes[2], bytes[3]])
            } else {
                None
            };
            DecodedField::Authentication { subtype, salt }
        }
        MSG_BACKEND_KEY_DATA => DecodedField::BackendKeyData {
            process_id: be_u32(payload, 0)?,
            secret_key: be_u32(payload, 4)?,
        },
        MSG_ROW_DESCRIPTION => DecodedField::RowDescription {
            field_count: be_u16(payload, 0)?,
        },
        MSG_DATA_ROW => {
            let column_count = be_u16(payload, 0)?;
            let first_column_length = if column_count > 0 {
                Some(be_u32(payload, 2)? as i32)
            } else {
                None
            };
            DecodedField::DataRow {
                column_count,
                first_column_length,
            }
        }
        MSG_COMMAND_COMPLETE => DecodedField::CommandComplete(display_string(payload)),
        MSG_ERROR_RESPONSE | MSG_NOTICE_RESPONSE => {
            DecodedField::ErrorResponse(decode_error_fields(payload)?)
        }
        MSG_PARAMETER_STATUS => {
            let (name, used) = read_cstring(payload, 0)?;
            let (value, _) = read_cstring(payload, used)?;
            DecodedField::ParameterStatus { name, value }
        }
        MSG_READY_FOR_QUERY => {
            let status = payload.first().copied().ok_or_else(|| {
                ProxyError::Framing("ReadyForQuery without transaction status".into())
            })?;
            DecodedField::ReadyForQuery(TransactionStatus::from(status))
        }
        MSG_NEGOTIATE_PROTOCOL_VERSION => {
            let minor_version = be_u32(payload, 0)?;
            let count = be_u32(payload, 4)?;
            let mut unrecognized = Vec::new();
            let mut offset = 8;
            for _ in 0..count {
                let (name, used) = read_cstring(payload, offset)?;
                offset += used;
                unrecognized.push(name);
            }
            DecodedField::NegotiateProtocolVersion {
                minor_version,
                unrecognized,
            }
        }
        _ => DecodedField::Raw {
            payload_len: payload.len(),
        },
    };
    Ok(field)
}

/// Parse ErrorResponse/NoticeResponse fields.
pub fn decode_error_fields(payload: &[u8]) -> Result<ErrorFields> {
    let mut fields = Vec::new();
    let mut offset = 0;
    loop {
        match payload.get(offset) {
            None | Some(0) => break,
            Some(&code) => {
                let (value, used) = read_cstring(payload, offset + 1)?;
                fields.push((code, value));
                offset += 1 + used;
            }
        }
    }
    Ok(ErrorFields { fields })
}

fn display_string(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Decode a frontend message for the audit log.
pub fn decode_frontend(tag: u8, payload: &[u8]) -> Result<FrontendMessage> {
    let msg = match tag {
        MSG_QUERY => FrontendMessage::Query {
            text: read_cstring(payload, 0)?.0,
        },
        MSG_PARSE => {
            let (statement, used) = read_cstring(payload, 0)?;
            let (query, _) = read_cstring(payload, used)?;
            FrontendMessage::Parse { statement, query }
        }
        MSG_PASSWORD => FrontendMessage::Password,
        MSG_TERMINATE => FrontendMessage::Terminate,
        _ => FrontendMessage::Other {
            payload_len: payload.len(),
        },
    };
    Ok(msg)
}

// ============================================================================
// Message builders
// ============================================================================

/// Build an ErrorResponse carrying severity, SQLSTATE and message.
pub fn build_error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + message.len());
    payload.push(ERROR_FIELD_SEVERITY);
    put_cstring(&mut payload, severity);
    payload.push(ERROR_FIELD_SEVERITY_V);
    put_cstring(&mut payload, severity);
    payload.push(ERROR_FIELD_CODE);
    put_cstring(&mut payload, code);
    payload.push(ERROR_FIELD_MESSAGE);
    put_cstring(&mut payload, message);
    payload.push(0);
    encode_message(MSG_ERROR_RESPONSE, &payload)
}
