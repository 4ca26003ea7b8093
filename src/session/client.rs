//! Client leg state machine

use crate::error::{ProxyError, Result};
use crate::protocol::{
    decode_initial, InitialMessage, StartupMessage, MAX_AUTH_BUFFER, SSL_ACCEPTED, SSL_REFUSED,
};

use super::assembler::{Capture, MessageTracker};
use super::{ClientPhase, TlsState};

/// What the client leg made of one read.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientInput {
    /// More bytes are needed before anything can be decided
    Incomplete,
    /// An SSLRequest; answer with the contained byte
    SslRequest { reply: u8, raw: Vec<u8> },
    /// A complete startup message
    Startup { message: StartupMessage, raw: Vec<u8> },
    /// Bytes arrived after startup but before the backend is ready
    Held,
    /// Steady-state bytes to relay verbatim; `captures` holds the messages
    /// finished by this read, for analysis
    Relay { raw: Vec<u8>, captures: Vec<Capture> },
}

/// Inbound half of a session.
#[derive(Debug)]
pub struct ClientLeg {
    phase: ClientPhase,
    tls: TlsState,
    tls_available: bool,
    startup_buf: Vec<u8>,
    startup: Option<StartupMessage>,
    held: Vec<u8>,
    tracker: MessageTracker,
}

impl ClientLeg {
    /// `tls_available` decides the answer to an SSLRequest.
    pub fn new(tls_available: bool) -> Self {
        Self {
            phase: ClientPhase::AwaitingStartup,
            tls: TlsState::Plain,
            tls_available,
            startup_buf: Vec::new(),
            startup: None,
            held: Vec::new(),
            tracker: MessageTracker::default(),
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn tls(&self) -> TlsState {
        self.tls
    }

    pub fn startup(&self) -> Option<&StartupMessage> {
        self.startup.as_ref()
    }

    /// Whether the client is positioned at a message boundary and expects
    /// framed backend messages, so a proxy-generated ErrorResponse is safe.
    pub fn accepts_error_response(&self) -> bool {
        self.startup.is_some() && self.tls != TlsState::HandshakePending
    }

    pub fn receive(&mut self, data: &[u8]) -> Result<ClientInput> {
        if self.tls == TlsState::HandshakePending {
            return Err(ProxyError::ProtocolViolation(
                "client data while TLS handshake is pending".into(),
            ));
        }

        match self.phase {
            ClientPhase::AwaitingStartup if self.startup.is_some() => {
                if self.held.len() + data.len() > MAX_AUTH_BUFFER {
                    return Err(ProxyError::ResourceExhaustion(format!(
                        "client sent more than {} bytes before backend authentication",
                        MAX_AUTH_BUFFER
                    )));
                }
                self.held.extend_from_slice(data);
                Ok(ClientInput::Held)
            }
            ClientPhase::AwaitingStartup => self.receive_initial(data),
            ClientPhase::AwaitingQuery | ClientPhase::AwaitingQueryContinuation => {
                self.relay(data.to_vec())
            }
        }
    }

    fn receive_initial(&mut self, data: &[u8]) -> Result<ClientInput> {
        self.startup_buf.extend_from_slice(data);

        let Some((message, used)) = decode_initial(&self.startup_buf)? else {
            return Ok(ClientInput::Incomplete);
        };
        if used != self.startup_buf.len() {
            return Err(ProxyError::Framing(format!(
                "{} unexpected bytes after initial message",
                self.startup_buf.len() - used
            )));
        }
        let raw = std::mem::take(&mut self.startup_buf);

        match message {
            InitialMessage::SslRequest => {
                if self.tls != TlsState::Plain {
                    return Err(ProxyError::ProtocolViolation(
                        "SSLRequest received over an established TLS channel".into(),
                    ));
                }
                let reply = if self.tls_available {
                    self.tls = TlsState::HandshakePending;
                    SSL_ACCEPTED
                } else {
                    SSL_REFUSED
                };
                Ok(ClientInput::SslRequest { reply, raw })
            }
            InitialMessage::CancelRequest { process_id, .. } => {
                Err(ProxyError::ProtocolViolation(format!(
                    "CancelRequest for backend pid {} is not supported",
                    process_id
                )))
            }
            InitialMessage::Startup(message) => {
                if message.major != 3 {
                    return Err(ProxyError::ProtocolViolation(format!(
                        "unsupported frontend protocol {}.{}",
                        message.major, message.minor
                    )));
                }
                self.startup = Some(message.clone());
                Ok(ClientInput::Startup { message, raw })
            }
        }
    }

    fn relay(&mut self, raw: Vec<u8>) -> Result<ClientInput> {
        let captures = self.tracker.push(&raw)?;
        self.phase = if self.tracker.is_partial() {
            ClientPhase::AwaitingQueryContinuation
        } else {
            ClientPhase::AwaitingQuery
        };
        Ok(ClientInput::Relay { raw, captures })
    }

    /// The server-side TLS handshake finished.
    pub fn tls_established(&mut self) -> Result<()> {
        if self.tls != TlsState::HandshakePending {
            return Err(ProxyError::ProtocolViolation(
                "client TLS established without a pending handshake".into(),
            ));
        }
        self.tls = TlsState::Secured;
        Ok(())
    }

    /// Backend authentication completed: move to query-ready and release
    /// anything the client sent in the meantime.
    pub fn promote(&mut self) -> Result<Option<ClientInput>> {
        if self.startup.is_none() {
            return Err(ProxyError::ProtocolViolation(
                "backend ready before client startup".into(),
            ));
        }
        self.phase = ClientPhase::AwaitingQuery;
        if self.held.is_empty() {
            return Ok(None);
        }
        let held = std::mem::take(&mut self.held);
        self.relay(held).map(Some)
    }
}
