//! Network stream abstraction for TCP, Unix-domain and TLS connections
//!
//! `NetworkStream` lets the session driver hold either leg as one type and
//! swap a plain TCP stream for its TLS-wrapped form after the SSLRequest
//! exchange.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

/// A stream that can be plain TCP, a Unix-domain socket, or TLS over TCP.
///
/// The TLS variants are boxed to reduce the size difference between
/// variants, as `TlsStream` is significantly larger than `TcpStream`.
pub enum NetworkStream {
    /// Plain TCP connection
    Tcp(TcpStream),
    /// Local domain socket (never upgraded to TLS)
    #[cfg(unix)]
    Unix(UnixStream),
    /// TLS-encrypted client connection (proxy is the server)
    ServerTls(Box<ServerTlsStream<TcpStream>>),
    /// TLS-encrypted backend connection (proxy is the client)
    ClientTls(Box<ClientTlsStream<TcpStream>>),
}

impl NetworkStream {
    /// Check if this stream is TLS-encrypted
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            NetworkStream::ServerTls(_) | NetworkStream::ClientTls(_)
        )
    }

    /// Whether a TLS upgrade is possible on this stream.
    pub fn can_upgrade(&self) -> bool {
        matches!(self, NetworkStream::Tcp(_))
    }

    /// Get the TLS protocol version if this is a TLS stream
    pub fn tls_version(&self) -> Option<&'static str> {
        let version = match self {
            NetworkStream::ServerTls(tls) => tls.get_ref().1.protocol_version(),
            NetworkStream::ClientTls(tls) => tls.get_ref().1.protocol_version(),
            _ => None,
        };
        version.map(|v| match v {
            rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
            rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
            _ => "TLS (unknown version)",
        })
    }

    /// Extract the TCP stream for a TLS upgrade.
    ///
    /// Returns `Err(self)` for Unix sockets and streams that are already
    /// encrypted.
    pub fn into_tcp(self) -> Result<TcpStream, Self> {
        match self {
            NetworkStream::Tcp(stream) => Ok(stream),
            other => Err(other),
        }
    }
}

impl std::fmt::Debug for NetworkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStream::Tcp(_) => write!(f, "NetworkStream::Tcp"),
            #[cfg(unix)]
            NetworkStream::Unix(_) => write!(f, "NetworkStream::Unix"),
            NetworkStream::ServerTls(_) => write!(f, "NetworkStream::ServerTls"),
            NetworkStream::ClientTls(_) => write!(f, "NetworkStream::ClientTls"),
        }
    }
}

impl AsyncRead for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            NetworkStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetworkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            NetworkStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            NetworkStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            NetworkStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_tcp_stream_round_trip() {
        let (a, b) = tcp_pair().await;
        let mut a = NetworkStream::Tcp(a);
        let mut b = NetworkStream::Tcp(b);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(!a.is_encrypted());
        assert!(a.can_upgrade());
        assert_eq!(a.tls_version(), None);
        assert!(a.into_tcp().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_stream_cannot_upgrade() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut a = NetworkStream::Unix(a);
        let mut b = NetworkStream::Unix(b);

        b.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert!(!a.can_upgrade());
        assert!(a.into_tcp().is_err());
    }
}
