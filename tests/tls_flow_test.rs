//! SSLRequest handling and TLS on both legs, end to end.
//!
//! The client speaks first with libpq's SSLRequest bytes; the proxy sends its
//! own SSLRequest to the backend. Certificates are generated per test.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;

use pgaudit_proxy::config::load_config_from_str;
use pgaudit_proxy::protocol::{
    compute_md5_response, decode_error_fields, decode_initial, encode_message, encode_startup,
    InitialMessage, StartupMessage,
};
use pgaudit_proxy::{
    Listener, TlsAcceptor, TlsClientConfig, TlsConnector, TlsServerConfig, TlsVerifyMode,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SALT: [u8; 4] = [0x09, 0x08, 0x07, 0x06];

/// SSLRequest exactly as libpq writes it under `sslmode=prefer`.
const LIBPQ_SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F];

fn write_test_cert(dir: &Path) -> (PathBuf, PathBuf) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();

    let cert_path = dir.join("server.crt");
    let key_path = dir.join("server.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

fn acceptor(cert: &Path, key: &Path) -> TlsAcceptor {
    TlsAcceptor::new(&TlsServerConfig {
        enabled: true,
        cert_path: Some(cert.to_path_buf()),
        key_path: Some(key.to_path_buf()),
    })
    .unwrap()
}

fn trusting_connector() -> TlsConnector {
    TlsConnector::new(&TlsClientConfig {
        verify_mode: TlsVerifyMode::None,
        ..TlsClientConfig::default()
    })
    .unwrap()
}

fn auth(subtype: u32, extra: &[u8]) -> Vec<u8> {
    let mut payload = subtype.to_be_bytes().to_vec();
    payload.extend_from_slice(extra);
    encode_message(b'R', &payload)
}

async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.ok()?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload).await.ok()?;
    Some((header[0], payload))
}

async fn read_startup<S: AsyncRead + Unpin>(stream: &mut S) -> Option<StartupMessage> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.ok()?;
    let mut buf = len.to_vec();
    buf.resize(u32::from_be_bytes(len) as usize, 0);
    stream.read_exact(&mut buf[4..]).await.ok()?;
    match decode_initial(&buf).ok()? {
        Some((InitialMessage::Startup(msg), _)) => Some(msg),
        _ => None,
    }
}

/// What the backend observed over one session.
#[derive(Debug)]
struct BackendReport {
    encrypted: bool,
    startup: StartupMessage,
    password: Vec<u8>,
    query: Vec<u8>,
}

/// Accept one connection that must open with an SSLRequest. With an
/// acceptor the backend answers `S` and continues over TLS, otherwise `N`.
async fn spawn_backend(tls: Option<TlsAcceptor>) -> (u16, oneshot::Receiver<BackendReport>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 8];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(request, LIBPQ_SSL_REQUEST);

        let report = match tls {
            Some(acceptor) => {
                stream.write_all(b"S").await.unwrap();
                let mut secured = acceptor.accept(stream).await.unwrap();
                serve(&mut secured, true).await
            }
            None => {
                stream.write_all(b"N").await.unwrap();
                serve(&mut stream, false).await
            }
        };
        if let Some(report) = report {
            let _ = tx.send(report);
        }
    });

    (port, rx)
}

async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    encrypted: bool,
) -> Option<BackendReport> {
    let startup = read_startup(stream).await?;
    stream.write_all(&auth(5, &SALT)).await.ok()?;
    stream.flush().await.ok()?;

    let (b'p', password) = read_message(stream).await? else {
        return None;
    };
    let mut ready = auth(0, &[]);
    ready.extend(encode_message(b'S', b"server_version\x0016.2\x00"));
    ready.extend(encode_message(b'Z', b"I"));
    stream.write_all(&ready).await.ok()?;
    stream.flush().await.ok()?;

    let (b'Q', query) = read_message(stream).await? else {
        return None;
    };
    let mut reply = encode_message(b'C', b"SELECT 1\x00");
    reply.extend(encode_message(b'Z', b"I"));
    stream.write_all(&reply).await.ok()?;
    stream.flush().await.ok()?;

    // Terminate
    let _ = read_message(stream).await;

    Some(BackendReport {
        encrypted,
        startup,
        password: encode_message(b'p', &password),
        query: encode_message(b'Q', &query),
    })
}

fn proxy_yaml(backend_port: u16, server_tls: Option<(&Path, &Path)>, require: bool) -> String {
    let server_tls = server_tls
        .map(|(cert, key)| {
            format!(
                "  tls:\n    enabled: true\n    cert_path: \"{}\"\n    key_path: \"{}\"\n",
                cert.display(),
                key.display()
            )
        })
        .unwrap_or_default();
    format!(
        r#"
server:
  listen_address: "127.0.0.1"
  listen_port: 0
  connect_timeout_secs: 5
{server_tls}
analysis:
  enabled: false

routes:
  - database: app
    username: alice
    password: s3cret
    host: 127.0.0.1
    port: {port}
    backend_username: svc_app
    tls:
      require: {require}
      verify_mode: none
      server_name: localhost
"#,
        server_tls = server_tls,
        port = backend_port,
        require = require
    )
}

struct Proxy {
    port: u16,
    _shutdown_tx: broadcast::Sender<()>,
}

impl Proxy {
    async fn start(yaml: &str) -> Self {
        let config = Arc::new(load_config_from_str(yaml).unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let listener = Listener::bind(config, None, shutdown_rx).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.run().await;
        });
        Self {
            port,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).await.unwrap()
    }
}

fn client_startup() -> Vec<u8> {
    let mut msg = StartupMessage::new();
    msg.set_parameter("user", "alice");
    msg.set_parameter("database", "app");
    encode_startup(&msg)
}

/// Log in, run one query and terminate.
async fn login_and_query<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) {
    stream.write_all(&client_startup()).await.unwrap();
    stream.flush().await.unwrap();

    let mut tags = Vec::new();
    loop {
        let (tag, _) = read_message(stream).await.expect("proxy closed during login");
        tags.push(tag);
        if tag == b'Z' {
            break;
        }
    }
    assert_eq!(tags, vec![b'R', b'S', b'Z']);

    stream
        .write_all(&encode_message(b'Q', b"SELECT 1\0"))
        .await
        .unwrap();
    stream.flush().await.unwrap();
    let (tag, _) = read_message(stream).await.unwrap();
    assert_eq!(tag, b'C');
    let (tag, _) = read_message(stream).await.unwrap();
    assert_eq!(tag, b'Z');

    stream.write_all(&encode_message(b'X', b"")).await.unwrap();
    stream.flush().await.unwrap();
}

fn assert_backend_login(report: &BackendReport) {
    assert_eq!(report.startup.user(), Some("svc_app"));
    assert_eq!(report.startup.database(), Some("app"));
    assert_eq!(
        report.password,
        compute_md5_response("s3cret", "svc_app", &SALT)
    );
    assert_eq!(report.query, encode_message(b'Q', b"SELECT 1\0"));
}

#[tokio::test]
async fn test_ssl_request_refused_then_plain_login() {
    let (backend_port, report) = spawn_backend(None).await;
    let proxy = Proxy::start(&proxy_yaml(backend_port, None, false)).await;

    timeout(TEST_TIMEOUT, async {
        let mut client = proxy.connect().await;
        client.write_all(&LIBPQ_SSL_REQUEST).await.unwrap();
        let mut answer = [0u8; 1];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"N");

        login_and_query(&mut client).await;

        let report = report.await.unwrap();
        assert!(!report.encrypted);
        assert_backend_login(&report);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_client_tls_handshake_then_login() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_test_cert(dir.path());
    let (backend_port, report) = spawn_backend(None).await;
    let proxy = Proxy::start(&proxy_yaml(backend_port, Some((&cert, &key)), false)).await;

    timeout(TEST_TIMEOUT, async {
        let mut client = proxy.connect().await;
        client.write_all(&LIBPQ_SSL_REQUEST).await.unwrap();
        let mut answer = [0u8; 1];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"S");

        let mut secured = trusting_connector()
            .connect(client, "localhost")
            .await
            .unwrap();
        login_and_query(&mut secured).await;

        let report = report.await.unwrap();
        assert!(!report.encrypted);
        assert_backend_login(&report);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_backend_tls_negotiated_by_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_test_cert(dir.path());
    let (backend_port, report) = spawn_backend(Some(acceptor(&cert, &key))).await;
    let proxy = Proxy::start(&proxy_yaml(backend_port, None, false)).await;

    timeout(TEST_TIMEOUT, async {
        let mut client = proxy.connect().await;
        login_and_query(&mut client).await;

        let report = report.await.unwrap();
        assert!(report.encrypted);
        assert_backend_login(&report);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_required_backend_tls_refused_is_fatal() {
    let (backend_port, _report) = spawn_backend(None).await;
    let proxy = Proxy::start(&proxy_yaml(backend_port, None, true)).await;

    timeout(TEST_TIMEOUT, async {
        let mut client = proxy.connect().await;
        client.write_all(&client_startup()).await.unwrap();

        let (tag, payload) = read_message(&mut client).await.unwrap();
        assert_eq!(tag, b'E');
        let fields = decode_error_fields(&payload).unwrap();
        assert_eq!(fields.severity(), Some("FATAL"));
        assert_eq!(fields.code(), Some("08006"));
    })
    .await
    .expect("test timed out");
}
