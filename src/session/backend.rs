//! Backend leg state machine
//!
//! ```text
//! Disconnected ──connect──▶ StartupSent ──R(0)──▶ Authenticated ──Z──▶ SteadyState
//!                              │  ▲
//!                              └──┘ R(5): answer MD5 challenge
//! ```
//!
//! TLS negotiation happens inside `StartupSent` before the startup message
//! is written: SSLRequest, one-byte answer, optional handshake.

use crate::config::RouteConfig;
use crate::error::{ProxyError, Result};
use crate::protocol::{
    auth_subtype_name, backend_message_name, compute_md5_response, decode_field, reframe,
    scan_frames, DecodedField, AUTH_MD5_PASSWORD, AUTH_OK, MSG_AUTHENTICATION,
    MSG_ERROR_RESPONSE, MSG_NEGOTIATE_PROTOCOL_VERSION, MSG_READY_FOR_QUERY, SSL_ACCEPTED,
    SSL_REFUSED, SSL_REQUEST_BYTES,
};

use super::assembler::{Capture, FrameAssembler, MessageTracker};
use super::{BackendPhase, TlsState};

/// What the backend leg wants done after an event.
#[derive(Debug, PartialEq, Eq)]
pub enum BackendOutput {
    /// Proxy-originated bytes for the backend (SSLRequest, startup, password)
    Send(Vec<u8>),
    /// Backend bytes to relay to the client unchanged
    Forward(Vec<u8>),
    /// Backend messages to queue for analysis
    Analyze(Capture),
    /// The backend agreed to TLS; run the client-side handshake
    UpgradeTls,
    /// Authentication succeeded; the client leg may go query-ready
    PromoteClient,
}

/// Outbound half of a session, created once routing has succeeded.
#[derive(Debug)]
pub struct BackendLeg {
    phase: BackendPhase,
    tls: TlsState,
    awaiting_continuation: bool,
    /// Whole-message buffer until ReadyForQuery
    assembler: FrameAssembler,
    tracker: MessageTracker,
    route: RouteConfig,
    startup: Vec<u8>,
}

impl BackendLeg {
    /// `startup` is the encoded StartupMessage to send once the channel is
    /// ready.
    pub fn new(route: RouteConfig, startup: Vec<u8>) -> Self {
        Self {
            phase: BackendPhase::Disconnected,
            tls: TlsState::Plain,
            awaiting_continuation: false,
            assembler: FrameAssembler::new(),
            tracker: MessageTracker::default(),
            route,
            startup,
        }
    }

    pub fn phase(&self) -> BackendPhase {
        self.phase
    }

    pub fn tls(&self) -> TlsState {
        self.tls
    }

    /// Whether the last read ended inside a message.
    pub fn awaiting_continuation(&self) -> bool {
        self.awaiting_continuation
    }

    pub fn route(&self) -> &RouteConfig {
        &self.route
    }

    /// The socket is open. Either ask for TLS or go straight to startup.
    pub fn on_connected(&mut self) -> Result<Vec<BackendOutput>> {
        if self.phase != BackendPhase::Disconnected {
            return Err(ProxyError::ProtocolViolation(format!(
                "backend connected twice (phase {:?})",
                self.phase
            )));
        }
        self.phase = BackendPhase::StartupSent;

        if self.route.negotiates_tls() {
            self.tls = TlsState::Requested;
            Ok(vec![BackendOutput::Send(SSL_REQUEST_BYTES.to_vec())])
        } else {
            Ok(vec![BackendOutput::Send(self.startup.clone())])
        }
    }

    /// The client-side TLS handshake finished; the startup goes out encrypted.
    pub fn on_tls_established(&mut self) -> Result<Vec<BackendOutput>> {
        if self.tls != TlsState::HandshakePending {
            return Err(ProxyError::ProtocolViolation(
                "backend TLS established without a pending handshake".into(),
            ));
        }
        self.tls = TlsState::Secured;
        Ok(vec![BackendOutput::Send(self.startup.clone())])
    }

    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<BackendOutput>> {
        match (self.phase, self.tls) {
            (BackendPhase::Disconnected, _) => Err(ProxyError::ProtocolViolation(
                "backend data before connect".into(),
            )),
            (_, TlsState::Requested) => self.receive_ssl_response(data),
            (_, TlsState::HandshakePending) => Err(ProxyError::ProtocolViolation(
                "backend data while TLS handshake is pending".into(),
            )),
            (BackendPhase::StartupSent, _) | (BackendPhase::Authenticated, _) => {
                self.receive_startup(data)
            }
            (BackendPhase::SteadyState, _) => {
                let captures = self.tracker.push(data)?;
                self.awaiting_continuation = self.tracker.is_partial();
                let mut out = Vec::with_capacity(1 + captures.len());
                out.push(BackendOutput::Forward(data.to_vec()));
                out.extend(captures.into_iter().map(BackendOutput::Analyze));
                Ok(out)
            }
        }
    }

    fn receive_ssl_response(&mut self, data: &[u8]) -> Result<Vec<BackendOutput>> {
        // Anything after the answer byte would have been sent before the
        // handshake and cannot be trusted.
        if data.len() != 1 {
            return Err(ProxyError::ProtocolViolation(format!(
                "expected a single SSL response byte from backend, got {} bytes",
                data.len()
            )));
        }
        match data[0] {
            SSL_ACCEPTED => {
                self.tls = TlsState::HandshakePending;
                Ok(vec![BackendOutput::UpgradeTls])
            }
            SSL_REFUSED if self.route.tls.require => Err(ProxyError::Connection(format!(
                "backend {} refused TLS and the route requires it",
                self.route.endpoint()
            ))),
            SSL_REFUSED => {
                self.tls = TlsState::Plain;
                Ok(vec![BackendOutput::Send(self.startup.clone())])
            }
            other => Err(ProxyError::ProtocolViolation(format!(
                "unexpected SSL response byte 0x{:02x} from backend",
                other
            ))),
        }
    }

    fn receive_startup(&mut self, data: &[u8]) -> Result<Vec<BackendOutput>> {
        let complete = self.assembler.push(data)?;
        let mut out = Vec::new();

        let scan = scan_frames(&complete)?;
        for frame in &scan.frames {
            let bytes = reframe(frame, &complete);
            let tag = frame.tag.unwrap_or_default();

            out.push(BackendOutput::Analyze(Capture::Frames(bytes.clone())));
            if self.phase == BackendPhase::SteadyState {
                // ReadyForQuery already seen earlier in this read
                out.push(BackendOutput::Forward(bytes));
                continue;
            }

            match self.phase {
                BackendPhase::StartupSent => {
                    self.startup_message(tag, frame.payload(&complete), bytes, &mut out)?
                }
                _ => {
                    if tag == MSG_READY_FOR_QUERY {
                        self.phase = BackendPhase::SteadyState;
                        debug!("Backend {} ready for query", self.route.endpoint());
                    } else {
                        trace!("Backend sent {} during authentication", backend_message_name(tag));
                    }
                    out.push(BackendOutput::Forward(bytes));
                }
            }
        }

        // Once relaying verbatim the partial tail goes out now and the
        // tracker follows the rest of that message.
        if self.phase == BackendPhase::SteadyState && self.assembler.is_partial() {
            let tail = self.assembler.take_pending();
            out.extend(self.tracker.push(&tail)?.into_iter().map(BackendOutput::Analyze));
            out.push(BackendOutput::Forward(tail));
        }
        self.awaiting_continuation = self.assembler.is_partial() || self.tracker.is_partial();
        Ok(out)
    }

    fn startup_message(
        &mut self,
        tag: u8,
        payload: &[u8],
        bytes: Vec<u8>,
        out: &mut Vec<BackendOutput>,
    ) -> Result<()> {
        match tag {
            MSG_AUTHENTICATION => {
                let DecodedField::Authentication { subtype, salt } = decode_field(tag, payload)?
                else {
                    return Err(ProxyError::ProtocolViolation(
                        "malformed authentication request".into(),
                    ));
                };
                match (subtype, salt) {
                    (AUTH_OK, _) => {
                        self.phase = BackendPhase::Authenticated;
                        out.push(BackendOutput::Forward(bytes));
                        out.push(BackendOutput::PromoteClient);
                    }
                    (AUTH_MD5_PASSWORD, Some(salt)) => {
                        debug!("Answering MD5 challenge from {}", self.route.endpoint());
                        out.push(BackendOutput::Send(compute_md5_response(
                            &self.route.password,
                            self.route.backend_username(),
                            &salt,
                        )));
                    }
                    (other, _) => {
                        warn!(
                            "Backend {} requested {}",
                            self.route.endpoint(),
                            auth_subtype_name(other)
                        );
                        return Err(ProxyError::AuthenticationUnsupported(other));
                    }
                }
            }
            MSG_ERROR_RESPONSE => {
                if let Ok(DecodedField::ErrorResponse(fields)) = decode_field(tag, payload) {
                    warn!("Backend {} rejected startup: {}", self.route.endpoint(), fields);
                }
                out.push(BackendOutput::Forward(bytes));
            }
            MSG_NEGOTIATE_PROTOCOL_VERSION => {
                debug!("Backend {} negotiated protocol version", self.route.endpoint());
                out.push(BackendOutput::Forward(bytes));
            }
            other => {
                return Err(ProxyError::ProtocolViolation(format!(
                    "unexpected {} ('{}') before authentication completed",
                    backend_message_name(other),
                    other as char
                )))
            }
        }
        Ok(())
    }
}
