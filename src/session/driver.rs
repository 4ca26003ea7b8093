//! Tokio driver for one session
//!
//! Owns both sockets, turns reads into [`Event`]s for the engine and carries
//! out the [`Action`]s it returns. One task per session; the client read,
//! the backend read and the registry's cancel signal are multiplexed with
//! `tokio::select!`.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::analysis::AnalysisSender;
use crate::config::{BackendEndpoint, Config};
use crate::error::{ProxyError, Result};
use crate::protocol::hex_encode;
use crate::server::{LegActivity, NetworkStream, RegistryHandle};
use crate::tls::{TlsAcceptor, TlsConnector};

use super::engine::Session;
use super::{Action, DisconnectReason, Event, Leg};

/// Read buffer size per leg.
const BUFFER_SIZE: usize = 64 * 1024;

/// Shared, per-listener state every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    /// Present when client-facing TLS is configured
    pub acceptor: Option<TlsAcceptor>,
    /// One entry per route, `None` where the route never negotiates TLS
    pub connectors: Arc<Vec<Option<TlsConnector>>>,
    pub analysis: Option<AnalysisSender>,
    pub registry: RegistryHandle,
}

/// Drive one client connection until it ends and report why.
pub async fn run_session(
    stream: NetworkStream,
    peer: String,
    ctx: SessionContext,
) -> DisconnectReason {
    let id = Uuid::new_v4();
    let activity = Arc::new(LegActivity::new());
    let cancel = ctx.registry.register(id, peer.clone(), Arc::clone(&activity));

    let tls_available = ctx.acceptor.is_some() && stream.can_upgrade();
    let session = Session::new(
        id,
        Arc::clone(&ctx.config),
        tls_available,
        ctx.analysis.clone(),
    );
    session.note(format!("session opened from {}", peer));
    debug!(session_id = %id, "Session started for {}", peer);

    let mut driver = Driver {
        session,
        client: Some(stream),
        backend: None,
        activity,
        connect_timeout: Duration::from_secs(ctx.config.server.connect_timeout_secs),
        protocol_debug: ctx.config.logging.protocol_debug,
        ctx,
    };

    let (reason, notice) = driver.run(cancel).await;
    driver.close(notice).await;

    match &reason {
        DisconnectReason::Error(e) => {
            warn!(session_id = %id, "Session from {} failed: {}", peer, e)
        }
        other => info!(session_id = %id, "Session from {} closed: {}", peer, other),
    }
    driver.session.note(format!("session closed: {}", reason));
    driver.ctx.registry.deregister(id);
    reason
}

struct Driver {
    session: Session,
    client: Option<NetworkStream>,
    backend: Option<NetworkStream>,
    activity: Arc<LegActivity>,
    connect_timeout: Duration,
    protocol_debug: bool,
    ctx: SessionContext,
}

/// Read from a leg that may not exist yet. A missing leg never yields.
async fn read_leg(stream: Option<&mut NetworkStream>, buf: &mut [u8]) -> io::Result<usize> {
    match stream {
        Some(s) => s.read(buf).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    /// Relay until a leg closes, an error occurs or the registry cancels us.
    /// Returns the reason and the notice, if any, owed to the client.
    async fn run(
        &mut self,
        mut cancel: oneshot::Receiver<DisconnectReason>,
    ) -> (DisconnectReason, Option<Vec<u8>>) {
        let mut client_buf = vec![0u8; BUFFER_SIZE];
        let mut backend_buf = vec![0u8; BUFFER_SIZE];
        let mut registry_gone = false;

        loop {
            let result = tokio::select! {
                biased;

                reason = &mut cancel, if !registry_gone => match reason {
                    Ok(reason) => {
                        let notice = self.session.termination_notice(&reason);
                        return (reason, notice);
                    }
                    Err(_) => {
                        // Registry stopped; keep relaying without idle sweeps.
                        registry_gone = true;
                        Ok(())
                    }
                },

                n = read_leg(self.client.as_mut(), &mut client_buf) => {
                    self.on_read(Leg::Client, n, &client_buf).await
                }

                n = read_leg(self.backend.as_mut(), &mut backend_buf) => {
                    self.on_read(Leg::Backend, n, &backend_buf).await
                }
            };

            if let Err(err) = result {
                let notice = self.session.fatal_response(&err);
                let reason = match err {
                    ProxyError::PeerClosed(Leg::Client) => DisconnectReason::ClientDisconnect,
                    ProxyError::PeerClosed(Leg::Backend) => DisconnectReason::ServerDisconnect,
                    other => DisconnectReason::Error(other.to_string()),
                };
                return (reason, notice);
            }
        }
    }

    async fn on_read(&mut self, leg: Leg, n: io::Result<usize>, buf: &[u8]) -> Result<()> {
        let n = n?;
        if n == 0 {
            let actions = self.session.handle(Event::Closed(leg))?;
            return self.perform(actions).await;
        }
        self.activity.touch(leg);

        let data = &buf[..n];
        if self.protocol_debug {
            trace!(
                session_id = %self.session.id(),
                "{} read {} bytes: {}",
                leg,
                n,
                hex_encode(data)
            );
        }

        let event = match leg {
            Leg::Client => Event::ClientData(data),
            Leg::Backend => Event::BackendData(data),
        };
        let actions = self.session.handle(event)?;
        self.perform(actions).await
    }

    /// Carry out actions in order. Actions produced while performing one
    /// (connect, TLS upgrade) run before the rest of the list.
    async fn perform(&mut self, actions: Vec<Action>) -> Result<()> {
        let mut pending: VecDeque<Action> = actions.into();

        while let Some(action) = pending.pop_front() {
            let follow_up = match action {
                Action::WriteClient(bytes) => {
                    self.write(Leg::Client, &bytes).await?;
                    Vec::new()
                }
                Action::WriteBackend(bytes) => {
                    self.write(Leg::Backend, &bytes).await?;
                    Vec::new()
                }
                Action::ConnectBackend { endpoint, .. } => {
                    let stream = self.connect(&endpoint).await?;
                    self.backend = Some(stream);
                    self.activity.touch(Leg::Backend);
                    self.session.handle(Event::BackendConnected)?
                }
                Action::UpgradeClientTls => {
                    self.upgrade_client().await?;
                    self.session.handle(Event::TlsEstablished(Leg::Client))?
                }
                Action::UpgradeBackendTls {
                    route_index,
                    server_name,
                } => {
                    self.upgrade_backend(route_index, &server_name).await?;
                    self.session.handle(Event::TlsEstablished(Leg::Backend))?
                }
            };

            for action in follow_up.into_iter().rev() {
                pending.push_front(action);
            }
        }
        Ok(())
    }

    async fn write(&mut self, leg: Leg, bytes: &[u8]) -> Result<()> {
        let stream = match leg {
            Leg::Client => self.client.as_mut(),
            Leg::Backend => self.backend.as_mut(),
        }
        .ok_or_else(|| ProxyError::ProtocolViolation(format!("write to closed {} leg", leg)))?;

        stream.write_all(bytes).await?;
        stream.flush().await?;
        self.activity.touch(leg);

        if self.protocol_debug {
            trace!(
                session_id = %self.session.id(),
                "{} wrote {} bytes: {}",
                leg,
                bytes.len(),
                hex_encode(bytes)
            );
        }
        Ok(())
    }

    async fn connect(&self, endpoint: &BackendEndpoint) -> Result<NetworkStream> {
        debug!(session_id = %self.session.id(), "Connecting to backend {}", endpoint);

        match endpoint {
            BackendEndpoint::Tcp { host, port } => {
                let stream = tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| ProxyError::Timeout(format!("connecting to {}", endpoint)))?
                .map_err(|e| ProxyError::Connection(format!("{}: {}", endpoint, e)))?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY on backend socket: {}", e);
                }
                Ok(NetworkStream::Tcp(stream))
            }
            #[cfg(unix)]
            BackendEndpoint::Unix(path) => {
                let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| ProxyError::Timeout(format!("connecting to {}", endpoint)))?
                    .map_err(|e| ProxyError::Connection(format!("{}: {}", endpoint, e)))?;
                Ok(NetworkStream::Unix(stream))
            }
            #[cfg(not(unix))]
            BackendEndpoint::Unix(_) => Err(ProxyError::Connection(format!(
                "{}: domain sockets are not available on this platform",
                endpoint
            ))),
        }
    }

    async fn upgrade_client(&mut self) -> Result<()> {
        let acceptor = self
            .ctx
            .acceptor
            .as_ref()
            .ok_or_else(|| ProxyError::Config("client TLS is not configured".into()))?;
        let tcp = self
            .client
            .take()
            .ok_or_else(|| ProxyError::ProtocolViolation("client leg already closed".into()))?
            .into_tcp()
            .map_err(|_| ProxyError::ProtocolViolation("client stream cannot use TLS".into()))?;

        let tls = tokio::time::timeout(self.connect_timeout, acceptor.accept(tcp))
            .await
            .map_err(|_| ProxyError::Timeout("client TLS handshake".into()))??;

        let stream = NetworkStream::ServerTls(Box::new(tls));
        debug!(
            session_id = %self.session.id(),
            "Client TLS established ({})",
            stream.tls_version().unwrap_or("unknown")
        );
        self.client = Some(stream);
        Ok(())
    }

    async fn upgrade_backend(&mut self, route_index: usize, server_name: &str) -> Result<()> {
        let connector = self
            .ctx
            .connectors
            .get(route_index)
            .and_then(|c| c.as_ref())
            .ok_or_else(|| {
                ProxyError::Config(format!("no TLS connector for route {}", route_index))
            })?;
        let tcp = self
            .backend
            .take()
            .ok_or_else(|| ProxyError::ProtocolViolation("backend leg already closed".into()))?
            .into_tcp()
            .map_err(|_| ProxyError::ProtocolViolation("backend stream cannot use TLS".into()))?;

        let tls = tokio::time::timeout(self.connect_timeout, connector.connect(tcp, server_name))
            .await
            .map_err(|_| ProxyError::Timeout(format!("backend TLS handshake with {}", server_name)))??;

        let stream = NetworkStream::ClientTls(Box::new(tls));
        debug!(
            session_id = %self.session.id(),
            "Backend TLS established with {} ({})",
            server_name,
            stream.tls_version().unwrap_or("unknown")
        );
        self.backend = Some(stream);
        Ok(())
    }

    /// Send the closing notice, if any, and shut both legs down.
    async fn close(&mut self, notice: Option<Vec<u8>>) {
        if let (Some(bytes), Some(client)) = (notice, self.client.as_mut()) {
            let write = async {
                client.write_all(&bytes).await?;
                client.flush().await
            };
            match tokio::time::timeout(self.connect_timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Failed to send closing notice: {}", e),
                Err(_) => debug!("Timed out sending closing notice"),
            }
        }

        for mut stream in [self.client.take(), self.backend.take()].into_iter().flatten() {
            let _ = tokio::time::timeout(Duration::from_secs(1), stream.shutdown()).await;
        }
    }
}
