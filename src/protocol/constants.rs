//! Wire constants for PostgreSQL protocol 3.0
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

// ----------------------------------------------------------------------------
// Untagged request codes
// ----------------------------------------------------------------------------

/// Protocol 3.0 as packed in a StartupMessage: (3 << 16) | 0
pub const PROTOCOL_VERSION_3_0: u32 = 3 << 16;

/// SSLRequest magic: (1234 << 16) | 5679 = 80877103
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// CancelRequest magic: (1234 << 16) | 5678 = 80877102
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Declared total length of an SSLRequest
pub const SSL_REQUEST_LENGTH: u32 = 8;

/// The full 8-byte SSLRequest as it appears on the wire
pub const SSL_REQUEST_BYTES: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F];

/// Single-byte answer to an SSLRequest: TLS accepted
pub const SSL_ACCEPTED: u8 = b'S';

/// Single-byte answer to an SSLRequest: TLS refused
pub const SSL_REFUSED: u8 = b'N';

// ----------------------------------------------------------------------------
// Frontend tags (client -> server)
// ----------------------------------------------------------------------------

pub const MSG_BIND: u8 = b'B';
pub const MSG_CLOSE: u8 = b'C';
pub const MSG_DESCRIBE: u8 = b'D';
pub const MSG_EXECUTE: u8 = b'E';
pub const MSG_FUNCTION_CALL: u8 = b'F';
pub const MSG_FLUSH: u8 = b'H';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_QUERY: u8 = b'Q';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_TERMINATE: u8 = b'X';
pub const MSG_COPY_DONE: u8 = b'c';
pub const MSG_COPY_DATA: u8 = b'd';
pub const MSG_COPY_FAIL: u8 = b'f';
/// PasswordMessage, also carries SASL and GSS responses
pub const MSG_PASSWORD: u8 = b'p';

// ----------------------------------------------------------------------------
// Backend tags (server -> client)
// ----------------------------------------------------------------------------

pub const MSG_PARSE_COMPLETE: u8 = b'1';
pub const MSG_BIND_COMPLETE: u8 = b'2';
pub const MSG_CLOSE_COMPLETE: u8 = b'3';
pub const MSG_NOTIFICATION: u8 = b'A';
pub const MSG_COMMAND_COMPLETE: u8 = b'C';
pub const MSG_DATA_ROW: u8 = b'D';
pub const MSG_ERROR_RESPONSE: u8 = b'E';
pub const MSG_COPY_IN_RESPONSE: u8 = b'G';
pub const MSG_COPY_OUT_RESPONSE: u8 = b'H';
pub const MSG_EMPTY_QUERY: u8 = b'I';
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';
pub const MSG_NOTICE_RESPONSE: u8 = b'N';
pub const MSG_AUTHENTICATION: u8 = b'R';
pub const MSG_PARAMETER_STATUS: u8 = b'S';
pub const MSG_ROW_DESCRIPTION: u8 = b'T';
pub const MSG_FUNCTION_CALL_RESPONSE: u8 = b'V';
pub const MSG_COPY_BOTH_RESPONSE: u8 = b'W';
pub const MSG_READY_FOR_QUERY: u8 = b'Z';
pub const MSG_NO_DATA: u8 = b'n';
pub const MSG_PORTAL_SUSPENDED: u8 = b's';
pub const MSG_PARAMETER_DESCRIPTION: u8 = b't';
pub const MSG_NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';

// ----------------------------------------------------------------------------
// Authentication subtypes (first int32 of an 'R' payload)
// ----------------------------------------------------------------------------

pub const AUTH_OK: u32 = 0;
pub const AUTH_KERBEROS_V5: u32 = 2;
pub const AUTH_CLEARTEXT_PASSWORD: u32 = 3;
pub const AUTH_MD5_PASSWORD: u32 = 5;
pub const AUTH_SCM_CREDENTIAL: u32 = 6;
pub const AUTH_GSS: u32 = 7;
pub const AUTH_GSS_CONTINUE: u32 = 8;
pub const AUTH_SSPI: u32 = 9;
pub const AUTH_SASL: u32 = 10;
pub const AUTH_SASL_CONTINUE: u32 = 11;
pub const AUTH_SASL_FINAL: u32 = 12;

// ----------------------------------------------------------------------------
// ErrorResponse / NoticeResponse fields
// ----------------------------------------------------------------------------

pub const ERROR_FIELD_SEVERITY: u8 = b'S';
pub const ERROR_FIELD_SEVERITY_V: u8 = b'V';
pub const ERROR_FIELD_CODE: u8 = b'C';
pub const ERROR_FIELD_MESSAGE: u8 = b'M';

// ----------------------------------------------------------------------------
// SQLSTATE codes used in proxy-generated errors
// ----------------------------------------------------------------------------

pub const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";
pub const SQLSTATE_CONNECTION_FAILURE: &str = "08006";
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";
pub const SQLSTATE_TOO_MANY_CONNECTIONS: &str = "53300";
pub const SQLSTATE_ADMIN_SHUTDOWN: &str = "57P01";
pub const SQLSTATE_IDLE_SESSION_TIMEOUT: &str = "57P05";

/// Human-readable name of a backend (server -> client) message tag.
///
/// Several tags are shared with the frontend; this is the backend reading.
pub fn backend_message_name(tag: u8) -> &'static str {
    match tag {
        MSG_AUTHENTICATION => "Authentication",
        MSG_BACKEND_KEY_DATA => "BackendKeyData",
        MSG_PARAMETER_STATUS => "ParameterStatus",
        MSG_READY_FOR_QUERY => "ReadyForQuery",
        MSG_ROW_DESCRIPTION => "RowDescription",
        MSG_DATA_ROW => "DataRow",
        MSG_COMMAND_COMPLETE => "CommandComplete",
        MSG_EMPTY_QUERY => "EmptyQueryResponse",
        MSG_ERROR_RESPONSE => "ErrorResponse",
        MSG_NOTICE_RESPONSE => "NoticeResponse",
        MSG_NEGOTIATE_PROTOCOL_VERSION => "NegotiateProtocolVersion",
        MSG_PARSE_COMPLETE => "ParseComplete",
        MSG_BIND_COMPLETE => "BindComplete",
        MSG_CLOSE_COMPLETE => "CloseComplete",
        MSG_NO_DATA => "NoData",
        MSG_PORTAL_SUSPENDED => "PortalSuspended",
        MSG_PARAMETER_DESCRIPTION => "ParameterDescription",
        MSG_NOTIFICATION => "NotificationResponse",
        MSG_FUNCTION_CALL_RESPONSE => "FunctionCallResponse",
        MSG_COPY_IN_RESPONSE => "CopyInResponse",
        MSG_COPY_OUT_RESPONSE => "CopyOutResponse",
        MSG_COPY_BOTH_RESPONSE => "CopyBothResponse",
        MSG_COPY_DATA => "CopyData",
        MSG_COPY_DONE => "CopyDone",
        _ => "Unknown",
    }
}

/// Human-readable name of a frontend (client -> server) message tag.
pub fn frontend_message_name(tag: u8) -> &'static str {
    match tag {
        MSG_PASSWORD => "PasswordMessage",
        MSG_QUERY => "Query",
        MSG_TERMINATE => "Terminate",
        MSG_PARSE => "Parse",
        MSG_BIND => "Bind",
        MSG_EXECUTE => "Execute",
        MSG_DESCRIBE => "Describe",
        MSG_SYNC => "Sync",
        MSG_FLUSH => "Flush",
        MSG_CLOSE => "Close",
        MSG_FUNCTION_CALL => "FunctionCall",
        MSG_COPY_DATA => "CopyData",
        MSG_COPY_DONE => "CopyDone",
        MSG_COPY_FAIL => "CopyFail",
        _ => "Unknown",
    }
}

/// Name of an authentication subtype, for logging.
pub fn auth_subtype_name(subtype: u32) -> &'static str {
    match subtype {
        AUTH_OK => "AuthenticationOk",
        AUTH_KERBEROS_V5 => "AuthenticationKerberosV5",
        AUTH_CLEARTEXT_PASSWORD => "AuthenticationCleartextPassword",
        AUTH_MD5_PASSWORD => "AuthenticationMD5Password",
        AUTH_SCM_CREDENTIAL => "AuthenticationSCMCredential",
        AUTH_GSS => "AuthenticationGSS",
        AUTH_GSS_CONTINUE => "AuthenticationGSSContinue",
        AUTH_SSPI => "AuthenticationSSPI",
        AUTH_SASL => "AuthenticationSASL",
        AUTH_SASL_CONTINUE => "AuthenticationSASLContinue",
        AUTH_SASL_FINAL => "AuthenticationSASLFinal",
        _ => "AuthenticationUnknown",
    }
}
