//! Origin Transport: how the proxy talks to the real server once a request has
//! been intercepted. Two variants, chosen once at startup from the CLI flag —
//! an enum rather than a trait object, since nothing in the core needs to swap
//! transports at runtime.

use std::{
    io,
    pin::Pin,
    process::Stdio,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{Request, body::Incoming, client::conn::http1::SendRequest};
use hyper_util::rt::TokioIo;
use roxy_shared::{io::IOTypeNotSend, tls::TlsConfig};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum OriginError {
    Io(io::Error),
    Tls(io::Error),
    Handshake(hyper::Error),
    InvalidDnsName,
    Timeout,
}

impl std::error::Error for OriginError {}

impl std::fmt::Display for OriginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<io::Error> for OriginError {
    fn from(value: io::Error) -> Self {
        OriginError::Io(value)
    }
}

pub struct OriginResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Incoming,
}

#[derive(Clone)]
pub enum OriginTransport {
    Native(NativeTransport),
    Fingerprint(FingerprintTransport),
}

impl OriginTransport {
    pub fn native(tls_config: TlsConfig) -> Self {
        OriginTransport::Native(NativeTransport { tls_config })
    }

    pub fn fingerprint(profile: String, tls_config: TlsConfig) -> Self {
        OriginTransport::Fingerprint(FingerprintTransport::new(profile, tls_config))
    }

    pub async fn round_trip(
        &self,
        host: &str,
        port: u16,
        tls: bool,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<OriginResponse, OriginError> {
        match self {
            OriginTransport::Native(t) => {
                t.round_trip(host, port, tls, method, path_and_query, headers, body)
                    .await
            }
            OriginTransport::Fingerprint(t) => {
                t.round_trip(host, port, tls, method, path_and_query, headers, body)
                    .await
            }
        }
    }
}

/// A raw, byte-transparent connection to an origin, used by the WebSocket pump
/// which never parses HTTP on the origin side — it just relays bytes once the
/// upgrade handshake has been forwarded verbatim.
pub enum RawOriginStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    Sidecar(SidecarStream),
}

impl AsyncRead for RawOriginStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawOriginStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RawOriginStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            RawOriginStream::Sidecar(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawOriginStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RawOriginStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RawOriginStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            RawOriginStream::Sidecar(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawOriginStream::Plain(s) => Pin::new(s).poll_flush(cx),
            RawOriginStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            RawOriginStream::Sidecar(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawOriginStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RawOriginStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            RawOriginStream::Sidecar(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl OriginTransport {
    /// Opens a raw duplex byte stream to the origin, bypassing HTTP framing
    /// entirely. Used for WebSocket tunnels, which this proxy relays
    /// transparently rather than parsing frame by frame.
    pub async fn connect_raw(&self, host: &str, port: u16, tls: bool) -> Result<RawOriginStream, OriginError> {
        match self {
            OriginTransport::Native(t) => t.connect_raw(host, port, tls).await,
            OriginTransport::Fingerprint(t) => match t.connect_sidecar(host, port, tls).await {
                Ok(stream) => Ok(RawOriginStream::Sidecar(stream)),
                Err(e) => {
                    warn!("fingerprint sidecar unavailable ({e}), falling back to native transport");
                    t.native.connect_raw(host, port, tls).await
                }
            },
        }
    }
}

#[derive(Clone)]
pub struct NativeTransport {
    tls_config: TlsConfig,
}

impl NativeTransport {
    pub fn new(tls_config: TlsConfig) -> Self {
        Self { tls_config }
    }

    async fn connect_raw(&self, host: &str, port: u16, tls: bool) -> Result<RawOriginStream, OriginError> {
        let tcp = TcpStream::connect((host, port)).await?;
        if !tls {
            return Ok(RawOriginStream::Plain(tcp));
        }
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|_| OriginError::InvalidDnsName)?;
        let mut client_config = self.tls_config.rustls_client_config_insecure().client_config;
        client_config.alpn_protocols = roxy_shared::alpn::alp_h1();
        let connector = TlsConnector::from(Arc::new(client_config));
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(OriginError::Tls)?;
        Ok(RawOriginStream::Tls(Box::new(tls_stream)))
    }

    async fn round_trip(
        &self,
        host: &str,
        port: u16,
        tls: bool,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<OriginResponse, OriginError> {
        let tcp = TcpStream::connect((host, port)).await?;

        if tls {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| OriginError::InvalidDnsName)?;
            let mut client_config = self.tls_config.rustls_client_config_insecure().client_config;
            client_config.alpn_protocols = roxy_shared::alpn::alp_h1();
            let connector = TlsConnector::from(Arc::new(client_config));
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(OriginError::Tls)?;
            let io = IOTypeNotSend::new(TokioIo::new(tls_stream));
            send(io, method, path_and_query, headers, body).await
        } else {
            let io = IOTypeNotSend::new(TokioIo::new(tcp));
            send(io, method, path_and_query, headers, body).await
        }
    }
}

async fn send<S>(
    io: IOTypeNotSend<S>,
    method: Method,
    path_and_query: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<OriginResponse, OriginError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(OriginError::Handshake)?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("origin connection closed: {e}");
        }
    });

    let mut builder = Request::builder().method(method).uri(path_and_query);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    let req = builder
        .body(Full::new(body).boxed())
        .map_err(|e| OriginError::Io(io::Error::other(format!("failed to build origin request: {e}"))))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(OriginError::Handshake)?;
    let (parts, body) = resp.into_parts();
    Ok(OriginResponse {
        status: parts.status,
        reason: parts.status.canonical_reason().map(str::to_string),
        headers: parts.headers,
        body,
    })
}

/// Speaks to an external TLS-fingerprint-spoofing sidecar process over its
/// stdio: a JSON handshake line requesting `{host, port, profile}`, followed by
/// a raw HTTP/1.1 byte stream once the sidecar answers `{"status":"ok"}`.
/// Falls back to the Native transport (with a warning) if the sidecar binary
/// can't be found or the handshake fails.
#[derive(Clone)]
pub struct FingerprintTransport {
    profile: String,
    native: NativeTransport,
    sidecar: Arc<Mutex<Option<Child>>>,
}

impl FingerprintTransport {
    pub fn new(profile: String, tls_config: TlsConfig) -> Self {
        Self {
            profile,
            native: NativeTransport::new(tls_config),
            sidecar: Arc::new(Mutex::new(None)),
        }
    }

    fn sidecar_binary() -> String {
        std::env::var("ROXY_FINGERPRINT_SIDECAR")
            .unwrap_or_else(|_| "roxy-fingerprint-sidecar".to_string())
    }

    async fn round_trip(
        &self,
        host: &str,
        port: u16,
        tls: bool,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<OriginResponse, OriginError> {
        match self.connect_sidecar(host, port, tls).await {
            Ok(stream) => send(IOTypeNotSend::new_raw(stream), method, path_and_query, headers, body).await,
            Err(e) => {
                warn!(
                    "fingerprint sidecar unavailable ({e}), falling back to native transport"
                );
                self.native
                    .round_trip(host, port, tls, method, path_and_query, headers, body)
                    .await
            }
        }
    }

    async fn connect_sidecar(
        &self,
        host: &str,
        port: u16,
        tls: bool,
    ) -> Result<SidecarStream, OriginError> {
        let mut guard = self.sidecar.lock().await;
        if guard.is_none() {
            let child = Command::new(Self::sidecar_binary())
                .arg("--profile")
                .arg(&self.profile)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()?;
            *guard = Some(child);
        }

        let child = match guard.as_mut() {
            Some(c) => c,
            None => return Err(OriginError::Io(io::Error::other("sidecar not running"))),
        };
        let stdin = child.stdin.take().ok_or(OriginError::Io(io::Error::other(
            "sidecar stdin unavailable",
        )))?;
        let stdout = child.stdout.take().ok_or(OriginError::Io(io::Error::other(
            "sidecar stdout unavailable",
        )))?;

        let mut stream = SidecarStream { stdin, stdout };
        let request = serde_json::json!({
            "type": "connect",
            "host": host,
            "port": port,
            "tls": tls,
        })
        .to_string();
        stream.stdin.write_all(request.as_bytes()).await?;
        stream.stdin.write_all(b"\n").await?;

        Ok(stream)
    }
}

struct SidecarStream {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for SidecarStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for SidecarStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
