//! Sans-IO session engine
//!
//! Pairs the client leg with the backend leg, performs routing and credential
//! substitution, and copies every observed chunk into the analysis FIFO.

use std::sync::Arc;
use uuid::Uuid;

use crate::analysis::{AnalysisSender, ChunkKind, Direction, QueuedMessage};
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::protocol::{
    build_error_response, encode_startup, StartupMessage, SQLSTATE_ADMIN_SHUTDOWN,
    SQLSTATE_CONNECTION_FAILURE, SQLSTATE_IDLE_SESSION_TIMEOUT, SQLSTATE_INVALID_AUTHORIZATION,
    SQLSTATE_PROTOCOL_VIOLATION, SQLSTATE_TOO_MANY_CONNECTIONS, SSL_ACCEPTED,
};

use super::assembler::Capture;
use super::backend::{BackendLeg, BackendOutput};
use super::client::{ClientInput, ClientLeg};
use super::{Action, BackendPhase, DisconnectReason, Event, Leg, PhaseSnapshot, TlsState};

/// One client connection and, once routed, its backend connection.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    config: Arc<Config>,
    client: ClientLeg,
    backend: Option<BackendLeg>,
    route_index: Option<usize>,
    analysis: Option<AnalysisSender>,
}

impl Session {
    /// `tls_available` controls the answer to a client SSLRequest.
    pub fn new(
        id: Uuid,
        config: Arc<Config>,
        tls_available: bool,
        analysis: Option<AnalysisSender>,
    ) -> Self {
        Self {
            id,
            config,
            client: ClientLeg::new(tls_available),
            backend: None,
            route_index: None,
            analysis,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client(&self) -> &ClientLeg {
        &self.client
    }

    pub fn backend(&self) -> Option<&BackendLeg> {
        self.backend.as_ref()
    }

    /// Both legs' phases right now.
    pub fn snapshot(&self) -> PhaseSnapshot {
        PhaseSnapshot {
            client: self.client.phase(),
            client_tls: self.client.tls(),
            backend: self
                .backend
                .as_ref()
                .map_or(BackendPhase::Disconnected, |b| b.phase()),
            backend_tls: self.backend.as_ref().map_or(TlsState::Plain, |b| b.tls()),
        }
    }

    /// Feed one event. Any error is fatal for the whole session.
    pub fn handle(&mut self, event: Event<'_>) -> Result<Vec<Action>> {
        match event {
            Event::ClientData(data) => self.on_client_data(data),
            Event::BackendData(data) => {
                // The SSL answer is logged with the phases it was read in.
                let phases = self.snapshot();
                let backend = self.backend_mut()?;
                let ssl_answer = backend.tls() == TlsState::Requested;
                let outputs = backend.receive(data)?;
                if ssl_answer {
                    self.enqueue_at(
                        Direction::BackendToProxy,
                        ChunkKind::SslResponse,
                        data.to_vec(),
                        phases,
                    )?;
                }
                self.apply_backend(outputs)
            }
            Event::BackendConnected => {
                let outputs = self.backend_mut()?.on_connected()?;
                self.apply_backend(outputs)
            }
            Event::TlsEstablished(Leg::Client) => {
                self.client.tls_established()?;
                Ok(Vec::new())
            }
            Event::TlsEstablished(Leg::Backend) => {
                let outputs = self.backend_mut()?.on_tls_established()?;
                self.apply_backend(outputs)
            }
            Event::Closed(leg) => Err(ProxyError::PeerClosed(leg)),
        }
    }

    fn backend_mut(&mut self) -> Result<&mut BackendLeg> {
        self.backend.as_mut().ok_or_else(|| {
            ProxyError::ProtocolViolation("backend event before routing".into())
        })
    }

    fn on_client_data(&mut self, data: &[u8]) -> Result<Vec<Action>> {
        match self.client.receive(data)? {
            ClientInput::Incomplete | ClientInput::Held => Ok(Vec::new()),
            ClientInput::SslRequest { reply, raw } => {
                self.enqueue(Direction::ClientToProxy, ChunkKind::Initial, raw)?;
                self.enqueue(Direction::ProxyToClient, ChunkKind::SslResponse, vec![reply])?;
                let mut actions = vec![Action::WriteClient(vec![reply])];
                if reply == SSL_ACCEPTED {
                    actions.push(Action::UpgradeClientTls);
                }
                Ok(actions)
            }
            ClientInput::Startup { message, raw } => {
                self.enqueue(Direction::ClientToProxy, ChunkKind::Initial, raw)?;
                self.route(&message)
            }
            ClientInput::Relay { raw, captures } => self.relay_client(raw, captures),
        }
    }

    /// Pick the backend for the client's database/user and ask the driver to
    /// connect to it.
    fn route(&mut self, message: &StartupMessage) -> Result<Vec<Action>> {
        let user = message.user().ok_or_else(|| {
            ProxyError::ProtocolViolation("startup message without user".into())
        })?;
        // PostgreSQL defaults the database to the user name
        let database = message.database().unwrap_or(user);

        let Some((index, route)) = self.config.find_route(database, user) else {
            return Err(ProxyError::Routing {
                database: database.to_string(),
                user: user.to_string(),
            });
        };

        let mut startup = message.clone();
        startup.set_parameter("user", route.backend_username());
        startup.set_parameter("database", route.backend_database());

        let endpoint = route.endpoint();
        info!(
            session_id = %self.id,
            "Routing {}@{} to {} as {}@{}",
            user,
            database,
            endpoint,
            route.backend_username(),
            route.backend_database()
        );

        self.backend = Some(BackendLeg::new(route.clone(), encode_startup(&startup)));
        self.route_index = Some(index);
        Ok(vec![Action::ConnectBackend {
            route_index: index,
            endpoint,
        }])
    }

    fn relay_client(&mut self, raw: Vec<u8>, captures: Vec<Capture>) -> Result<Vec<Action>> {
        for capture in captures {
            self.enqueue_capture(Direction::ClientToProxy, capture)?;
        }
        Ok(vec![Action::WriteBackend(raw)])
    }

    fn apply_backend(&mut self, outputs: Vec<BackendOutput>) -> Result<Vec<Action>> {
        let mut actions = Vec::with_capacity(outputs.len());
        for output in outputs {
            match output {
                BackendOutput::Send(bytes) => {
                    // Untagged startup-family messages start with the high
                    // byte of a small length; tagged ones with a letter.
                    let kind = if bytes.first() == Some(&0) {
                        ChunkKind::Initial
                    } else {
                        ChunkKind::Frames
                    };
                    self.enqueue(Direction::ProxyToBackend, kind, bytes.clone())?;
                    actions.push(Action::WriteBackend(bytes));
                }
                BackendOutput::Forward(bytes) => actions.push(Action::WriteClient(bytes)),
                BackendOutput::Analyze(capture) => {
                    self.enqueue_capture(Direction::BackendToProxy, capture)?
                }
                BackendOutput::UpgradeTls => {
                    let (route_index, server_name) = match (&self.backend, self.route_index) {
                        (Some(backend), Some(index)) => {
                            (index, backend.route().tls_server_name().to_string())
                        }
                        _ => {
                            return Err(ProxyError::ProtocolViolation(
                                "TLS upgrade without a routed backend".into(),
                            ))
                        }
                    };
                    actions.push(Action::UpgradeBackendTls {
                        route_index,
                        server_name,
                    });
                }
                BackendOutput::PromoteClient => {
                    debug!(session_id = %self.id, "Backend authenticated, client query-ready");
                    if let Some(ClientInput::Relay { raw, captures }) = self.client.promote()? {
                        actions.extend(self.relay_client(raw, captures)?);
                    }
                }
            }
        }
        Ok(actions)
    }

    fn enqueue(&self, direction: Direction, kind: ChunkKind, bytes: Vec<u8>) -> Result<()> {
        self.enqueue_at(direction, kind, bytes, self.snapshot())
    }

    fn enqueue_at(
        &self,
        direction: Direction,
        kind: ChunkKind,
        bytes: Vec<u8>,
        phases: PhaseSnapshot,
    ) -> Result<()> {
        match &self.analysis {
            Some(tx) => tx.enqueue(QueuedMessage::new(self.id, direction, kind, bytes, phases)),
            None => Ok(()),
        }
    }

    fn enqueue_capture(&self, direction: Direction, capture: Capture) -> Result<()> {
        match capture {
            Capture::Frames(bytes) => self.enqueue(direction, ChunkKind::Frames, bytes),
            Capture::Truncated(bytes) => self.enqueue(direction, ChunkKind::Truncated, bytes),
        }
    }

    /// Queue a proxy-generated note for the audit log. Best effort.
    pub fn note(&self, text: impl Into<String>) {
        if let Some(tx) = &self.analysis {
            let _ = tx.enqueue(QueuedMessage::note(self.id, text, self.snapshot()));
        }
    }

    /// Whether a proxy-generated message can be written to the client
    /// without splicing it into a half-relayed backend message.
    fn client_at_boundary(&self) -> bool {
        if !self.client.accepts_error_response() {
            return false;
        }
        !matches!(&self.backend, Some(b) if b.phase() == BackendPhase::SteadyState && b.awaiting_continuation())
    }

    /// FATAL ErrorResponse telling the client why the session is ending, if
    /// the client is in a position to receive one.
    pub fn fatal_response(&self, err: &ProxyError) -> Option<Vec<u8>> {
        let code = match err {
            ProxyError::PeerClosed(_) => return None,
            ProxyError::Routing { .. } => SQLSTATE_INVALID_AUTHORIZATION,
            ProxyError::Framing(_)
            | ProxyError::ProtocolViolation(_)
            | ProxyError::AuthenticationUnsupported(_) => SQLSTATE_PROTOCOL_VIOLATION,
            ProxyError::ResourceExhaustion(_) => SQLSTATE_TOO_MANY_CONNECTIONS,
            ProxyError::Transport(_)
            | ProxyError::Connection(_)
            | ProxyError::Timeout(_)
            | ProxyError::Tls(_)
            | ProxyError::Config(_) => SQLSTATE_CONNECTION_FAILURE,
        };
        self.error_to_client(code, &err.to_string())
    }

    /// Notice for a teardown the registry asked for.
    pub fn termination_notice(&self, reason: &DisconnectReason) -> Option<Vec<u8>> {
        match reason {
            DisconnectReason::IdleTimeout { .. } => self.error_to_client(
                SQLSTATE_IDLE_SESSION_TIMEOUT,
                "terminating connection due to idle-session timeout",
            ),
            DisconnectReason::Shutdown => self.error_to_client(
                SQLSTATE_ADMIN_SHUTDOWN,
                "terminating connection due to proxy shutdown",
            ),
            _ => None,
        }
    }

    fn error_to_client(&self, code: &str, message: &str) -> Option<Vec<u8>> {
        if !self.client_at_boundary() {
            return None;
        }
        let bytes = build_error_response("FATAL", code, message);
        let _ = self.enqueue(Direction::ProxyToClient, ChunkKind::Frames, bytes.clone());
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::channel;
    use crate::config::BackendEndpoint;
    use crate::protocol::{
        compute_md5_response, decode_error_fields, decode_initial, encode_message,
        InitialMessage, MSG_PASSWORD, SSL_REQUEST_BYTES,
    };
    use crate::session::ClientPhase;
    use tokio::sync::mpsc;

    const CONFIG: &str = r#"
server:
  listen_port: 6432
routes:
  - database: db1
    username: alice
    password: pw
    host: db.internal
  - database: reporting
    username: alice
    password: s3cret
    host: warehouse.internal
    port: 5433
    backend_database: warehouse
    backend_username: svc_reporting
    tls:
      enabled: false
"#;

    fn config() -> Arc<Config> {
        Arc::new(serde_yaml::from_str(CONFIG).unwrap())
    }

    fn session() -> (Session, mpsc::Receiver<QueuedMessage>) {
        let (tx, rx) = channel(1024);
        (Session::new(Uuid::new_v4(), config(), false, Some(tx)), rx)
    }

    fn startup(params: &[(&str, &str)]) -> Vec<u8> {
        let mut msg = StartupMessage::new();
        for (k, v) in params {
            msg.set_parameter(k, v);
        }
        encode_startup(&msg)
    }

    fn auth(subtype: u32, extra: &[u8]) -> Vec<u8> {
        let mut payload = subtype.to_be_bytes().to_vec();
        payload.extend_from_slice(extra);
        encode_message(b'R', &payload)
    }

    fn backend_writes(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::WriteBackend(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    fn decoded_startup(bytes: &[u8]) -> StartupMessage {
        match decode_initial(bytes).unwrap() {
            Some((InitialMessage::Startup(msg), _)) => msg,
            other => panic!("expected startup, got {:?}", other),
        }
    }

    #[test]
    fn test_happy_path_md5() {
        let (mut s, mut rx) = session();

        let actions = s
            .handle(Event::ClientData(&startup(&[
                ("user", "alice"),
                ("database", "db1"),
                ("client_encoding", "UTF8"),
            ])))
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::ConnectBackend {
                route_index: 0,
                endpoint: BackendEndpoint::Tcp {
                    host: "db.internal".into(),
                    port: 5432
                },
            }]
        );

        let actions = s.handle(Event::BackendConnected).unwrap();
        assert_eq!(actions, vec![Action::WriteBackend(SSL_REQUEST_BYTES.to_vec())]);

        let actions = s.handle(Event::BackendData(b"N")).unwrap();
        let writes = backend_writes(&actions);
        assert_eq!(writes.len(), 1);
        let sent = decoded_startup(&writes[0]);
        assert_eq!(sent.user(), Some("alice"));
        assert_eq!(sent.database(), Some("db1"));
        assert_eq!(sent.client_encoding(), Some("UTF8"));

        let actions = s
            .handle(Event::BackendData(&auth(5, &[1, 2, 3, 4])))
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::WriteBackend(compute_md5_response(
                "pw",
                "alice",
                &[1, 2, 3, 4]
            ))]
        );

        let mut ready = auth(0, &[]);
        ready.extend(encode_message(b'Z', b"I"));
        let actions = s.handle(Event::BackendData(&ready)).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::WriteClient(auth(0, &[])),
                Action::WriteClient(encode_message(b'Z', b"I")),
            ]
        );
        let snap = s.snapshot();
        assert_eq!(snap.client, ClientPhase::AwaitingQuery);
        assert_eq!(snap.backend, BackendPhase::SteadyState);

        let query = encode_message(b'Q', b"SELECT 1\0");
        let actions = s.handle(Event::ClientData(&query)).unwrap();
        assert_eq!(actions, vec![Action::WriteBackend(query.clone())]);

        // everything observed went to the analysis queue, in order
        let mut directions = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            directions.push((msg.direction, msg.kind));
        }
        assert_eq!(
            directions,
            vec![
                (Direction::ClientToProxy, ChunkKind::Initial),
                (Direction::ProxyToBackend, ChunkKind::Initial),
                (Direction::BackendToProxy, ChunkKind::SslResponse),
                (Direction::ProxyToBackend, ChunkKind::Initial),
                (Direction::BackendToProxy, ChunkKind::Frames),
                (Direction::ProxyToBackend, ChunkKind::Frames),
                (Direction::BackendToProxy, ChunkKind::Frames),
                (Direction::BackendToProxy, ChunkKind::Frames),
                (Direction::ClientToProxy, ChunkKind::Frames),
            ]
        );
    }

    #[test]
    fn test_credential_substitution() {
        let (mut s, _rx) = session();
        let actions = s
            .handle(Event::ClientData(&startup(&[
                ("user", "alice"),
                ("database", "reporting"),
                ("application_name", "psql"),
            ])))
            .unwrap();
        assert!(matches!(
            actions[0],
            Action::ConnectBackend { route_index: 1, .. }
        ));

        // tls disabled: startup goes out immediately
        let actions = s.handle(Event::BackendConnected).unwrap();
        let sent = decoded_startup(&backend_writes(&actions)[0]);
        assert_eq!(sent.user(), Some("svc_reporting"));
        assert_eq!(sent.database(), Some("warehouse"));
        assert_eq!(sent.application_name(), Some("psql"));
        assert_eq!(sent.parameters[0].0, "user");

        let actions = s
            .handle(Event::BackendData(&auth(5, &[9, 9, 9, 9])))
            .unwrap();
        assert_eq!(
            backend_writes(&actions),
            vec![compute_md5_response("s3cret", "svc_reporting", &[9, 9, 9, 9])]
        );
    }

    #[test]
    fn test_unknown_route_never_connects() {
        let (mut s, _rx) = session();
        let err = s
            .handle(Event::ClientData(&startup(&[
                ("user", "mallory"),
                ("database", "db1"),
            ])))
            .unwrap_err();
        assert!(matches!(err, ProxyError::Routing { .. }));
        assert!(s.backend().is_none());

        let response = s.fatal_response(&err).unwrap();
        assert_eq!(response[0], b'E');
        let fields = decode_error_fields(&response[5..]).unwrap();
        assert_eq!(fields.severity(), Some("FATAL"));
        assert_eq!(fields.code(), Some("28000"));
    }

    #[test]
    fn test_database_defaults_to_user() {
        let (mut s, _rx) = session();
        let err = s
            .handle(Event::ClientData(&startup(&[("user", "alice")])))
            .unwrap_err();
        match err {
            ProxyError::Routing { database, user } => {
                assert_eq!(database, "alice");
                assert_eq!(user, "alice");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_startup_without_user_rejected() {
        let (mut s, _rx) = session();
        let err = s
            .handle(Event::ClientData(&startup(&[("database", "db1")])))
            .unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolViolation(_)));
    }

    #[test]
    fn test_unsupported_auth_sends_no_password() {
        let (mut s, mut rx) = session();
        s.handle(Event::ClientData(&startup(&[
            ("user", "alice"),
            ("database", "db1"),
        ])))
        .unwrap();
        s.handle(Event::BackendConnected).unwrap();
        s.handle(Event::BackendData(b"N")).unwrap();

        let err = s
            .handle(Event::BackendData(&auth(7, &[])))
            .unwrap_err();
        assert!(matches!(err, ProxyError::AuthenticationUnsupported(7)));

        while let Ok(msg) = rx.try_recv() {
            assert!(
                !(msg.direction == Direction::ProxyToBackend
                    && msg.bytes.first() == Some(&MSG_PASSWORD)),
                "password message was sent"
            );
        }
        let response = s.fatal_response(&err).unwrap();
        let fields = decode_error_fields(&response[5..]).unwrap();
        assert_eq!(fields.code(), Some("08P01"));
    }

    #[test]
    fn test_peer_close_is_session_fatal() {
        let (mut s, _rx) = session();
        let err = s.handle(Event::Closed(Leg::Client)).unwrap_err();
        assert!(matches!(err, ProxyError::PeerClosed(Leg::Client)));
        assert!(err.is_graceful());
        assert!(s.fatal_response(&err).is_none());
    }

    #[test]
    fn test_client_ssl_request_accepted() {
        let (tx, _rx) = channel(64);
        let mut s = Session::new(Uuid::new_v4(), config(), true, Some(tx));

        let actions = s.handle(Event::ClientData(&SSL_REQUEST_BYTES)).unwrap();
        assert_eq!(
            actions,
            vec![Action::WriteClient(b"S".to_vec()), Action::UpgradeClientTls]
        );
        assert_eq!(s.snapshot().client_tls, TlsState::HandshakePending);
        // no error response may be injected into a pending handshake
        assert!(s
            .fatal_response(&ProxyError::Timeout("handshake".into()))
            .is_none());

        assert!(s
            .handle(Event::TlsEstablished(Leg::Client))
            .unwrap()
            .is_empty());
        let actions = s
            .handle(Event::ClientData(&startup(&[
                ("user", "alice"),
                ("database", "db1"),
            ])))
            .unwrap();
        assert!(matches!(actions[0], Action::ConnectBackend { .. }));
    }

    #[test]
    fn test_client_ssl_request_refused() {
        let (mut s, _rx) = session();
        let actions = s.handle(Event::ClientData(&SSL_REQUEST_BYTES)).unwrap();
        assert_eq!(actions, vec![Action::WriteClient(b"N".to_vec())]);
        assert_eq!(s.snapshot().client_tls, TlsState::Plain);
    }

    #[test]
    fn test_backend_tls_upgrade_action() {
        let (mut s, _rx) = session();
        s.handle(Event::ClientData(&startup(&[
            ("user", "alice"),
            ("database", "db1"),
        ])))
        .unwrap();
        s.handle(Event::BackendConnected).unwrap();

        let actions = s.handle(Event::BackendData(b"S")).unwrap();
        assert_eq!(
            actions,
            vec![Action::UpgradeBackendTls {
                route_index: 0,
                server_name: "db.internal".into()
            }]
        );
        let actions = s.handle(Event::TlsEstablished(Leg::Backend)).unwrap();
        let sent = decoded_startup(&backend_writes(&actions)[0]);
        assert_eq!(sent.user(), Some("alice"));
        assert_eq!(s.snapshot().backend_tls, TlsState::Secured);
    }

    #[test]
    fn test_backend_ssl_answer_logged_with_phases_it_arrived_in() {
        let (mut s, mut rx) = session();
        s.handle(Event::ClientData(&startup(&[
            ("user", "alice"),
            ("database", "db1"),
        ])))
        .unwrap();
        s.handle(Event::BackendConnected).unwrap();
        while rx.try_recv().is_ok() {}

        s.handle(Event::BackendData(b"S")).unwrap();
        let answer = rx.try_recv().unwrap();
        assert_eq!(answer.kind, ChunkKind::SslResponse);
        assert_eq!(answer.bytes, b"S");
        assert_eq!(answer.phases.backend_tls, TlsState::Requested);
        assert_eq!(s.snapshot().backend_tls, TlsState::HandshakePending);
    }

    #[test]
    fn test_large_query_is_relayed_and_queued_truncated() {
        let (mut s, mut rx) = session();
        s.handle(Event::ClientData(&startup(&[
            ("user", "alice"),
            ("database", "reporting"),
        ])))
        .unwrap();
        s.handle(Event::BackendConnected).unwrap();
        let mut data = auth(0, &[]);
        data.extend(encode_message(b'Z', b"I"));
        s.handle(Event::BackendData(&data)).unwrap();
        while rx.try_recv().is_ok() {}

        let declared: u32 = 150 * 1024 * 1024;
        let mut header = vec![b'Q'];
        header.extend_from_slice(&declared.to_be_bytes());
        let actions = s.handle(Event::ClientData(&header)).unwrap();
        assert_eq!(actions, vec![Action::WriteBackend(header.clone())]);
        assert_eq!(s.snapshot().client, ClientPhase::AwaitingQueryContinuation);

        let chunk = vec![b' '; 4 * 1024 * 1024];
        let mut remaining = declared as usize - 4;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            let actions = s.handle(Event::ClientData(&chunk[..n])).unwrap();
            assert_eq!(backend_writes(&actions)[0].len(), n);
            remaining -= n;
        }
        assert_eq!(s.snapshot().client, ClientPhase::AwaitingQuery);

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.kind, ChunkKind::Truncated);
        assert_eq!(&queued.bytes[..5], &header[..]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_query_sent_before_auth_is_released_after() {
        let (mut s, _rx) = session();
        let mut data = startup(&[("user", "alice"), ("database", "reporting")]);
        let query = encode_message(b'Q', b"SELECT 1\0");
        s.handle(Event::ClientData(&data)).unwrap();
        s.handle(Event::BackendConnected).unwrap();

        // pipelined query arrives before the backend is ready
        assert!(s.handle(Event::ClientData(&query)).unwrap().is_empty());

        data = auth(0, &[]);
        let actions = s.handle(Event::BackendData(&data)).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::WriteClient(auth(0, &[])),
                Action::WriteBackend(query)
            ]
        );
    }

    #[test]
    fn test_full_analysis_queue_is_fatal() {
        let (tx, _rx) = channel(1);
        let mut s = Session::new(Uuid::new_v4(), config(), false, Some(tx));
        // startup takes the only slot, the proxy's own startup overflows
        s.handle(Event::ClientData(&startup(&[
            ("user", "alice"),
            ("database", "reporting"),
        ])))
        .unwrap();
        let err = s.handle(Event::BackendConnected).unwrap_err();
        assert!(matches!(err, ProxyError::ResourceExhaustion(_)));
        let response = s.fatal_response(&err).unwrap();
        let fields = decode_error_fields(&response[5..]).unwrap();
        assert_eq!(fields.code(), Some("53300"));
    }

    #[test]
    fn test_no_error_response_mid_backend_message() {
        let (mut s, _rx) = session();
        s.handle(Event::ClientData(&startup(&[
            ("user", "alice"),
            ("database", "reporting"),
        ])))
        .unwrap();
        s.handle(Event::BackendConnected).unwrap();
        let mut data = auth(0, &[]);
        data.extend(encode_message(b'Z', b"I"));
        s.handle(Event::BackendData(&data)).unwrap();

        let row = encode_message(b'D', &[0, 1, 0, 0, 0, 3, b'a', b'b', b'c']);
        s.handle(Event::BackendData(&row[..7])).unwrap();
        assert!(s
            .termination_notice(&DisconnectReason::Shutdown)
            .is_none());

        s.handle(Event::BackendData(&row[7..])).unwrap();
        let notice = s.termination_notice(&DisconnectReason::Shutdown).unwrap();
        let fields = decode_error_fields(&notice[5..]).unwrap();
        assert_eq!(fields.code(), Some("57P01"));
    }

    #[test]
    fn test_analysis_disabled() {
        let mut s = Session::new(Uuid::new_v4(), config(), false, None);
        let actions = s
            .handle(Event::ClientData(&startup(&[
                ("user", "alice"),
                ("database", "db1"),
            ])))
            .unwrap();
        assert_eq!(actions.len(), 1);
        s.note("nothing to see");
    }
}
