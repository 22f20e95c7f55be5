//! Process Supervisor: binds the single listener, demultiplexes incoming
//! connections by method/target, and manages graceful shutdown.
//!
//! Grounded on the teacher's `proxy/src/proxy.rs::ProxyManager`/`start_http`
//! accept-loop shape, generalized to the plain method/path demux this spec
//! calls for (CONNECT vs absolute-URI HTTP vs local API) and simplified to
//! HTTP/1.1 only.

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::{Full, combinators::BoxBody};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use roxy_shared::{RoxyCA, io::local_tcp_listener, tls::TlsConfig};
use tokio::{io::AsyncReadExt, net::TcpStream, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{self, ApiContext},
    flow::FlowStore,
    http_forward::{self, HttpForwarderConfig},
    origin::OriginTransport,
    tunnel::{self, TunnelContext},
};

const GRACE_PERIOD: Duration = Duration::from_secs(3);
const WS_SUBSCRIBE_PATH: &str = "/";

#[derive(Clone)]
pub struct SupervisorConfig {
    pub port: u16,
    pub ca: RoxyCA,
    pub tls_config: TlsConfig,
    pub flow_store: FlowStore,
    pub transport: OriginTransport,
    pub forwarder_config: HttpForwarderConfig,
    pub tls_profile: Arc<tokio::sync::RwLock<String>>,
}

pub async fn run(config: SupervisorConfig) -> std::io::Result<()> {
    let listener = local_tcp_listener(config.port).await?;
    info!("roxy listening on 0.0.0.0:{}", config.port);

    let shutdown = CancellationToken::new();
    let mut connections = JoinSet::new();

    let api_ctx = ApiContext {
        flow_store: config.flow_store.clone(),
        tls_profile: config.tls_profile.clone(),
        started_at: std::time::Instant::now(),
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown_signal() => {
                info!("shutdown signal received, closing listener");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => { warn!("accept error: {e}"); continue; }
                };
                let ctx = config.clone();
                let api_ctx = api_ctx.clone();
                let token = shutdown.child_token();
                connections.spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        res = handle_connection(stream, peer, ctx, api_ctx) => {
                            if let Err(e) = res {
                                debug!("connection from {peer} ended: {e}");
                            }
                        }
                    }
                });
            }
        }
    }

    shutdown.cancel();
    match tokio::time::timeout(GRACE_PERIOD, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    {
        Ok(_) => info!("all connections drained"),
        Err(_) => warn!("grace period elapsed, forcing shutdown of remaining connections"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: SupervisorConfig,
    api_ctx: ApiContext,
) -> std::io::Result<()> {
    let mut probe = [0u8; 7];
    let n = stream.peek(&mut probe).await?;
    if n == 0 {
        return Ok(());
    }

    if probe[..n].starts_with(b"CONNECT") || b"CONNECT".starts_with(&probe[..n]) {
        return handle_connect(stream, peer, ctx).await;
    }

    let io = TokioIo::new(stream);
    let flow_store = ctx.flow_store.clone();
    let transport = ctx.transport.clone();
    let forwarder_config = ctx.forwarder_config;
    let api_ctx = api_ctx.clone();

    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let flow_store = flow_store.clone();
        let transport = transport.clone();
        let api_ctx = api_ctx.clone();
        async move { route_plain(req, flow_store, transport, forwarder_config, api_ctx).await }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(std::io::Error::other)
}

async fn handle_connect(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: SupervisorConfig,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let head = read_connect_head(&mut stream).await?;
    let Some((host, port)) = parse_connect_target(&head) else {
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Ok(());
    };

    debug!("CONNECT {host}:{port} from {peer}");
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let tunnel_ctx = TunnelContext {
        ca: ctx.ca.clone(),
        tls_config: ctx.tls_config.clone(),
        flow_store: ctx.flow_store.clone(),
        transport: ctx.transport.clone(),
        forwarder_config: ctx.forwarder_config,
    };

    tunnel::intercept_connect(tunnel_ctx, stream, host, port)
        .await
        .map_err(std::io::Error::other)
}

const MAX_CONNECT_HEAD: usize = 16 * 1024;

async fn read_connect_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buf);
        }
        if buf.len() > MAX_CONNECT_HEAD {
            return Err(std::io::Error::other("CONNECT head too large"));
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(std::io::Error::other("connection closed mid-CONNECT"));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

fn parse_connect_target(preview: &[u8]) -> Option<(String, u16)> {
    let text = std::str::from_utf8(preview).ok()?;
    let line_end = text.find("\r\n")?;
    let line = &text[..line_end];
    let mut parts = line.split_whitespace();
    if parts.next()? != "CONNECT" {
        return None;
    }
    let authority = parts.next()?;
    let (host, port) = authority.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

async fn route_plain(
    req: hyper::Request<Incoming>,
    flow_store: FlowStore,
    transport: OriginTransport,
    forwarder_config: HttpForwarderConfig,
    api_ctx: ApiContext,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let is_ws_upgrade = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_ws_upgrade && req.uri().path() == WS_SUBSCRIBE_PATH {
        return Ok(upgrade_to_dashboard_ws(req, flow_store));
    }

    if req.uri().scheme().is_some() {
        return http_forward::forward(req, flow_store, transport, forwarder_config).await;
    }

    if req.uri().path().starts_with("/api/") {
        return api::handle_rest(req, api_ctx).await;
    }

    Ok(bad_request())
}

fn upgrade_to_dashboard_ws(
    mut req: hyper::Request<Incoming>,
    flow_store: FlowStore,
) -> Response<BoxBody<Bytes, Infallible>> {
    let key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let accept = tokio_tungstenite::tungstenite::handshake::derive_accept_key(key.as_bytes());

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                if let Err(e) = api::run_subscriber(io, flow_store).await {
                    warn!("dashboard subscriber error: {e}");
                }
            }
            Err(e) => warn!("websocket upgrade failed: {e}"),
        }
    });

    let mut resp = Response::new(Full::new(Bytes::new()).boxed());
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = resp.headers_mut();
    headers.insert(http::header::UPGRADE, http::HeaderValue::from_static("websocket"));
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("Upgrade"));
    if let Ok(v) = http::HeaderValue::from_str(&accept) {
        headers.insert("sec-websocket-accept", v);
    }
    resp
}

fn bad_request() -> Response<BoxBody<Bytes, Infallible>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(b"Bad Request")).boxed());
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_target() {
        let preview = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (host, port) = parse_connect_target(preview).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn rejects_non_connect() {
        let preview = b"GET / HTTP/1.1\r\n\r\n";
        assert!(parse_connect_target(preview).is_none());
    }
}
