//! PostgreSQL protocol message structures
//!
//! Only the subset the proxy needs for routing, authentication and audit
//! logging is modelled here. Everything else is relayed as raw bytes.
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use std::fmt;
use std::ops::Range;

use super::constants::*;

// ============================================================================
// Framing
// ============================================================================

/// Location of one message inside a receive buffer.
///
/// `length` is the value of the wire length field, which counts itself but
/// not the tag. `payload` indexes into the buffer the frame was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message tag, `None` for the untagged startup-family messages
    pub tag: Option<u8>,
    /// Declared length (includes the 4 length bytes)
    pub length: u32,
    /// Payload span within the source buffer
    pub payload: Range<usize>,
}

impl Frame {
    /// Total bytes the frame occupies on the wire, tag included.
    pub fn wire_len(&self) -> usize {
        self.length as usize + usize::from(self.tag.is_some())
    }

    /// Borrow the payload out of the buffer the frame was decoded from.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.payload.clone()]
    }
}

// ============================================================================
// Startup-family messages (no tag byte)
// ============================================================================

/// StartupMessage parameters, in the order the client sent them.
///
/// Keys that the proxy does not interpret are kept so they can be forwarded
/// to the backend unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    /// Major protocol version (3)
    pub major: u16,
    /// Minor protocol version (0)
    pub minor: u16,
    /// Key/value pairs
    pub parameters: Vec<(String, String)>,
}

impl StartupMessage {
    /// Protocol 3.0 startup message with no parameters.
    pub fn new() -> Self {
        Self {
            major: (PROTOCOL_VERSION_3_0 >> 16) as u16,
            minor: (PROTOCOL_VERSION_3_0 & 0xFFFF) as u16,
            parameters: Vec::new(),
        }
    }

    /// Look up a parameter. Key comparison ignores ASCII case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Replace an existing parameter in place, or append it.
    pub fn set_parameter(&mut self, key: &str, value: &str) {
        match self
            .parameters
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.parameters.push((key.to_string(), value.to_string())),
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.get("database")
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    pub fn client_encoding(&self) -> Option<&str> {
        self.get("client_encoding")
    }

    pub fn application_name(&self) -> Option<&str> {
        self.get("application_name")
    }
}

impl Default for StartupMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// First message on a fresh client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialMessage {
    /// 8-byte probe asking whether the proxy speaks TLS
    SslRequest,
    /// Out-of-band cancellation of a running query
    CancelRequest { process_id: u32, secret_key: u32 },
    /// Regular startup
    Startup(StartupMessage),
}

// ============================================================================
// Decoded fields (logging and control decisions)
// ============================================================================

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
    Unknown(u8),
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            other => TransactionStatus::Unknown(other),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Idle => write!(f, "idle"),
            TransactionStatus::InTransaction => write!(f, "in transaction"),
            TransactionStatus::Failed => write!(f, "failed transaction"),
            TransactionStatus::Unknown(b) => write!(f, "unknown (0x{:02x})", b),
        }
    }
}

/// ErrorResponse / NoticeResponse body as (field code, value) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub fields: Vec<(u8, String)>,
}

impl ErrorFields {
    fn field(&self, code: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    pub fn severity(&self) -> Option<&str> {
        self.field(ERROR_FIELD_SEVERITY_V)
            .or_else(|| self.field(ERROR_FIELD_SEVERITY))
    }

    pub fn code(&self) -> Option<&str> {
        self.field(ERROR_FIELD_CODE)
    }

    pub fn message(&self) -> Option<&str> {
        self.field(ERROR_FIELD_MESSAGE)
    }
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.severity().unwrap_or("ERROR"),
            self.code().unwrap_or("?????"),
            self.message().unwrap_or("")
        )
    }
}

/// Result of tag-specific field extraction on a backend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedField {
    /// 'R'
    Authentication { subtype: u32, salt: Option<[u8; 4]> },
    /// 'K'
    BackendKeyData { process_id: u32, secret_key: u32 },
    /// 'T'
    RowDescription { field_count: u16 },
    /// 'D'
    DataRow {
        column_count: u16,
        first_column_length: Option<i32>,
    },
    /// 'C'
    CommandComplete(String),
    /// 'E' and 'N'
    ErrorResponse(ErrorFields),
    /// 'S'
    ParameterStatus { name: String, value: String },
    /// 'Z'
    ReadyForQuery(TransactionStatus),
    /// 'v'
    NegotiateProtocolVersion {
        minor_version: u32,
        unrecognized: Vec<String>,
    },
    /// Any other tag: only the size is reported
    Raw { payload_len: usize },
}

impl DecodedField {
    /// Flatten into name/value pairs for log lines and audit records.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        match self {
            DecodedField::Authentication { subtype, salt } => {
                let mut pairs = vec![
                    ("auth_subtype", subtype.to_string()),
                    ("auth_method", auth_subtype_name(*subtype).to_string()),
                ];
                if let Some(salt) = salt {
                    pairs.push(("salt", super::auth::hex_encode(salt)));
                }
                pairs
            }
            DecodedField::BackendKeyData {
                process_id,
                secret_key,
            } => vec![
                ("process_id", process_id.to_string()),
                ("secret_key", secret_key.to_string()),
            ],
            DecodedField::RowDescription { field_count } => {
                vec![("field_count", field_count.to_string())]
            }
            DecodedField::DataRow {
                column_count,
                first_column_length,
            } => {
                let mut pairs = vec![("column_count", column_count.to_string())];
                if let Some(len) = first_column_length {
                    pairs.push(("first_column_length", len.to_string()));
                }
                pairs
            }
            DecodedField::CommandComplete(tag) => vec![("command_tag", tag.clone())],
            DecodedField::ErrorResponse(fields) => vec![("error", fields.to_string())],
            DecodedField::ParameterStatus { name, value } => {
                vec![("name", name.clone()), ("value", value.clone())]
            }
            DecodedField::ReadyForQuery(status) => {
                vec![("transaction_status", status.to_string())]
            }
            DecodedField::NegotiateProtocolVersion {
                minor_version,
                unrecognized,
            } => vec![
                ("minor_version", minor_version.to_string()),
                ("unrecognized_options", unrecognized.join(",")),
            ],
            DecodedField::Raw { payload_len } => {
                vec![("payload_len", payload_len.to_string())]
            }
        }
    }
}

/// Audit view of a frontend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Simple query
    Query { text: String },
    /// Extended-protocol Parse
    Parse { statement: String, query: String },
    /// PasswordMessage; contents are never logged
    Password,
    /// Terminate
    Terminate,
    /// Any other tag: only the size is reported
    Other { payload_len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_message_accessors_ignore_case() {
        let mut msg = StartupMessage::new();
        msg.set_parameter("User", "alice");
        msg.set_parameter("DATABASE", "db1");

        assert_eq!(msg.user(), Some("alice"));
        assert_eq!(msg.database(), Some("db1"));
        assert_eq!(msg.client_encoding(), None);
        assert_eq!(msg.major, 3);
        assert_eq!(msg.minor, 0);
    }

    #[test]
    fn test_set_parameter_replaces_in_place() {
        let mut msg = StartupMessage::new();
        msg.set_parameter("user", "alice");
        msg.set_parameter("application_name", "psql");
        msg.set_parameter("user", "svc_backend");

        assert_eq!(
            msg.parameters,
            vec![
                ("user".to_string(), "svc_backend".to_string()),
                ("application_name".to_string(), "psql".to_string()),
            ]
        );
    }

    #[test]
    fn test_frame_wire_len() {
        let tagged = Frame {
            tag: Some(b'Z'),
            length: 5,
            payload: 5..6,
        };
        assert_eq!(tagged.wire_len(), 6);

        let untagged = Frame {
            tag: None,
            length: 8,
            payload: 4..8,
        };
        assert_eq!(untagged.wire_len(), 8);
    }

    #[test]
    fn test_transaction_status() {
        assert_eq!(TransactionStatus::from(b'I'), TransactionStatus::Idle);
        assert_eq!(TransactionStatus::from(b'T'), TransactionStatus::InTransaction);
        assert_eq!(TransactionStatus::from(b'E'), TransactionStatus::Failed);
        assert_eq!(TransactionStatus::from(b'x'), TransactionStatus::Unknown(b'x'));
    }

    #[test]
    fn test_error_fields_display() {
        let fields = ErrorFields {
            fields: vec![
                (b'S', "FATAL".into()),
                (b'C', "28P01".into()),
                (b'M', "password authentication failed".into()),
            ],
        };
        assert_eq!(
            fields.to_string(),
            "FATAL 28P01: password authentication failed"
        );
    }

    #[test]
    fn test_decoded_field_pairs() {
        let auth = DecodedField::Authentication {
            subtype: 5,
            salt: Some([1, 2, 3, 4]),
        };
        let pairs = auth.to_pairs();
        assert_eq!(pairs[0], ("auth_subtype", "5".to_string()));
        assert_eq!(pairs[1], ("auth_method", "AuthenticationMD5Password".to_string()));
        assert_eq!(pairs[2], ("salt", "01020304".to_string()));
    }
}
