//! Listeners for incoming PostgreSQL client connections

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::registry::{spawn_registry, RegistryHandle};
use super::stream::NetworkStream;
use crate::analysis::AnalysisSender;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::session::{run_session, SessionContext};
use crate::tls::{TlsAcceptor, TlsConnector};

#[cfg(unix)]
type LocalListener = tokio::net::UnixListener;
#[cfg(not(unix))]
type LocalListener = std::convert::Infallible;

/// Listener statistics
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections rejected due to limit
    pub connections_rejected: AtomicU64,
}

/// Accepts client connections on one or more TCP addresses and, optionally,
/// a Unix-domain socket and runs one session task per connection.
pub struct Listener {
    tcp: Vec<TcpListener>,
    /// Unix-domain listener, if `server.unix_socket_path` is set
    local: Option<LocalListener>,
    config: Arc<Config>,
    ctx: SessionContext,
    registry_task: JoinHandle<()>,
    stats: Arc<ListenerStats>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Connection limit semaphore (None = unlimited)
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl Listener {
    /// Bind the configured address(es), build the TLS contexts and start the
    /// session registry.
    pub async fn bind(
        config: Arc<Config>,
        analysis: Option<AnalysisSender>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let acceptor = if config.server.tls.enabled {
            Some(TlsAcceptor::new(&config.server.tls)?)
        } else {
            None
        };

        let connectors = config
            .routes
            .iter()
            .map(|route| {
                if route.negotiates_tls() {
                    TlsConnector::new(&route.tls).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if config.server.listen_address.is_empty() {
            return Err(ProxyError::Config("no listen address configured".into()));
        }
        let mut tcp = Vec::with_capacity(config.server.listen_address.len());
        for addr in config.server.bind_addresses() {
            let listener = TcpListener::bind(&addr).await.map_err(|e| {
                ProxyError::Connection(format!("binding {}: {}", addr, e))
            })?;
            tcp.push(listener);
        }
        let addr = tcp
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let local = match &config.server.unix_socket_path {
            Some(path) => Some(bind_local(path)?),
            None => None,
        };

        // Create connection limit semaphore (0 = unlimited)
        let connection_semaphore = if config.server.max_connections > 0 {
            info!(
                "Listening on {} (max {} connections, client TLS {})",
                addr,
                config.server.max_connections,
                if acceptor.is_some() { "on" } else { "off" }
            );
            Some(Arc::new(Semaphore::new(config.server.max_connections)))
        } else {
            info!(
                "Listening on {} (unlimited connections, client TLS {})",
                addr,
                if acceptor.is_some() { "on" } else { "off" }
            );
            None
        };

        let (registry, registry_task) = spawn_registry(&config.session);
        let ctx = SessionContext {
            config: Arc::clone(&config),
            acceptor,
            connectors: Arc::new(connectors),
            analysis,
            registry,
        };

        Ok(Self {
            tcp,
            local,
            config,
            ctx,
            registry_task,
            stats: Arc::new(ListenerStats::default()),
            shutdown_rx,
            connection_semaphore,
        })
    }

    /// Get listener statistics
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Handle to the live-session registry.
    pub fn registry(&self) -> RegistryHandle {
        self.ctx.registry.clone()
    }

    /// Get the local address of the first TCP listener.
    ///
    /// This is useful when binding to port 0 to get an OS-assigned port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.tcp.first() {
            Some(l) => l.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no TCP listener")),
        }
    }

    /// Local addresses of every TCP listener, in configuration order.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.tcp.iter().map(TcpListener::local_addr).collect()
    }

    /// Run the accept loop until the shutdown signal, then cancel every live
    /// session.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                result = accept_tcp(&self.tcp) => match result {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        self.spawn_session(NetworkStream::Tcp(stream), addr.to_string());
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        // Brief delay before retrying
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },

                result = accept_local(self.local.as_ref()) => match result {
                    Ok(stream) => self.spawn_session(stream, "unix socket".to_string()),
                    Err(e) => {
                        error!("Unix socket accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        let cancelled = self.ctx.registry.shutdown_all().await;
        if cancelled > 0 {
            info!("Cancelled {} live session(s)", cancelled);
        }

        if let (Some(_), Some(path)) = (&self.local, &self.config.server.unix_socket_path) {
            let _ = std::fs::remove_file(path);
        }

        info!(
            "Listener stopped. Total: {}, Active: {}, Rejected: {}",
            self.stats.connections_accepted.load(Ordering::Relaxed),
            self.stats.connections_active.load(Ordering::Relaxed),
            self.stats.connections_rejected.load(Ordering::Relaxed)
        );

        // The registry task ends once the last session drops its handle.
        let Self {
            ctx, registry_task, ..
        } = self;
        drop(ctx);
        let _ = registry_task.await;
        Ok(())
    }

    /// Try to acquire a connection permit if limiting is enabled.
    ///
    /// `Err(())` means the limit is reached and the connection must be
    /// dropped.
    fn acquire_permit(&self, peer: &str) -> std::result::Result<Option<OwnedSemaphorePermit>, ()> {
        let Some(semaphore) = &self.connection_semaphore else {
            return Ok(None);
        };
        match Arc::clone(semaphore).try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => {
                warn!(
                    "Connection from {} rejected: max connections ({}) reached",
                    peer, self.config.server.max_connections
                );
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                Err(())
            }
        }
    }

    fn spawn_session(&self, stream: NetworkStream, peer: String) {
        let Ok(permit) = self.acquire_permit(&peer) else {
            drop(stream);
            return;
        };

        debug!("Accepted connection from {}", peer);
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let ctx = self.ctx.clone();
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            // Hold permit for connection lifetime (drops when connection closes)
            let _permit = permit;
            let reason = run_session(stream, peer.clone(), ctx).await;
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            debug!("Connection from {} closed ({})", peer, reason);
        });
    }
}

/// Accept from whichever TCP listener is ready first.
async fn accept_tcp(listeners: &[TcpListener]) -> io::Result<(TcpStream, SocketAddr)> {
    std::future::poll_fn(|cx| {
        for listener in listeners {
            if let Poll::Ready(result) = listener.poll_accept(cx) {
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    })
    .await
}

#[cfg(unix)]
fn bind_local(path: &std::path::Path) -> Result<LocalListener> {
    // A stale socket file from a previous run blocks bind.
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = LocalListener::bind(path)?;
    info!("Listening on unix socket {}", path.display());
    Ok(listener)
}

#[cfg(not(unix))]
fn bind_local(_path: &std::path::Path) -> Result<LocalListener> {
    Err(ProxyError::Config(
        "server.unix_socket_path requires a Unix platform".into(),
    ))
}

#[cfg(unix)]
async fn accept_local(listener: Option<&LocalListener>) -> io::Result<NetworkStream> {
    match listener {
        Some(l) => l.accept().await.map(|(s, _)| NetworkStream::Unix(s)),
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn accept_local(listener: Option<&LocalListener>) -> io::Result<NetworkStream> {
    match listener {
        Some(never) => match *never {},
        None => std::future::pending().await,
    }
}
