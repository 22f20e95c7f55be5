//! CONNECT tunnel and TLS interceptor. Walks the state machine described for
//! intercepted HTTPS traffic:
//!
//! READING_CONNECT -> TUNNEL_ESTABLISHED -> TLS_HANDSHAKING -> READING_REQUEST
//! -> FORWARDING/STREAMING -> READING_REQUEST (keep-alive loop) -> CLOSED
//!
//! Request/response heads are parsed by hand with `httparse` rather than
//! handed to hyper's server connection, since a single read of the client's
//! bytes has to fan out three ways: onward to the origin, into the flow
//! store's raw-bytes capture, and (for streaming bodies) into the SSE/Bedrock
//! parsers.

use std::{io, ops::Deref, sync::Arc, time::Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use http_body_util::BodyExt;
use roxy_shared::{RoxyCA, alpn::alp_h1, cert::ServerTlsConnectionData, tls::TlsConfig};
use rustls::{pki_types::PrivateKeyDer, sign::CertifiedKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

use crate::{
    bedrock::BedrockEventStreamParser,
    flow::{FlowKind, FlowStore, InterceptedRequest, InterceptedResponse},
    http_forward::HttpForwarderConfig,
    origin::OriginTransport,
    peek_stream::PeekStream,
    sse::SseParser,
};

#[derive(Debug)]
pub enum TunnelError {
    Io(io::Error),
    Ca(roxy_shared::CaError),
    Tls(io::Error),
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
impl std::error::Error for TunnelError {}

impl From<io::Error> for TunnelError {
    fn from(value: io::Error) -> Self {
        TunnelError::Io(value)
    }
}

#[derive(Clone)]
pub struct TunnelContext {
    pub ca: RoxyCA,
    pub tls_config: TlsConfig,
    pub flow_store: FlowStore,
    pub transport: OriginTransport,
    pub forwarder_config: HttpForwarderConfig,
}

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Entrypoint once a CONNECT has been accepted and the client socket upgraded.
/// `host`/`port` come from the CONNECT request line.
pub async fn intercept_connect<S>(
    ctx: TunnelContext,
    client_stream: S,
    host: String,
    port: u16,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_stream, preview) = PeekStream::new(client_stream, 1024).await?;
    if looks_like_websocket_preamble(&preview) {
        return crate::ws::pump(client_stream, &host, port, false, ctx.flow_store, ctx.transport)
            .await
            .map_err(TunnelError::Io);
    }

    trace!("peek looks like TLS client hello for {host}");
    let (leaf, key_pair) = ctx.ca.leaf_for(&host).await.map_err(TunnelError::Ca)?;
    let pk_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| TunnelError::Tls(io::Error::other(e.to_string())))?;
    let provider = ctx.tls_config.crypto_provider();
    let certified_key = CertifiedKey::from_der(vec![leaf.der().clone()], pk_der, provider.deref())
        .map_err(|e| TunnelError::Tls(io::Error::other(e.to_string())))?;

    let roxy_shared::tls::RustlsServerConfig {
        mut server_config, ..
    } = ctx
        .tls_config
        .rustls_server_config(certified_key)
        .map_err(|e| TunnelError::Tls(io::Error::other(e.to_string())))?;
    server_config.alpn_protocols = alp_h1();

    let tls_stream = TlsAcceptor::from(Arc::new(server_config))
        .accept(client_stream)
        .await
        .map_err(|e| TunnelError::Tls(io::Error::other(format!("client TLS handshake failed: {e}"))))?;

    let tls_data: ServerTlsConnectionData = tls_stream.get_ref().1.into();
    debug!("client TLS established for {host}: {:?}", tls_data.protocol_version);

    let (tls_stream, preview) = PeekStream::new(tls_stream, 1024).await?;
    if looks_like_websocket_preamble(&preview) {
        return crate::ws::pump(tls_stream, &host, port, true, ctx.flow_store, ctx.transport)
            .await
            .map_err(TunnelError::Io);
    }

    run_http_loop(tls_stream, host, port, ctx).await
}

fn looks_like_websocket_preamble(preview: &[u8]) -> bool {
    if !preview.starts_with(b"GET ") {
        return false;
    }
    let text = String::from_utf8_lossy(preview).to_ascii_lowercase();
    text.contains("upgrade: websocket")
}

async fn run_http_loop<S>(
    stream: S,
    host: String,
    port: u16,
    ctx: TunnelContext,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = HeadReader::new(stream);

    loop {
        let Some(head_bytes) = reader.read_head().await? else {
            break;
        };
        let started = Instant::now();

        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut header_storage);
        let parse_result = parsed
            .parse(&head_bytes)
            .map_err(|e| TunnelError::Io(io::Error::other(format!("malformed request head: {e}"))))?;
        if parse_result.is_partial() {
            return Err(TunnelError::Io(io::Error::other("incomplete request head")));
        }

        let method = Method::try_from(parsed.method.unwrap_or("GET"))
            .unwrap_or(Method::GET);
        let path = parsed.path.unwrap_or("/").to_string();

        let mut headers = HeaderMap::new();
        for h in parsed.headers.iter() {
            if h.name.is_empty() {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(h.name.as_bytes()),
                HeaderValue::from_bytes(h.value),
            ) {
                headers.append(name, value);
            }
        }

        let body = reader.read_body(&headers).await?;

        let mut raw_request = Vec::with_capacity(head_bytes.len() + body.len());
        raw_request.extend_from_slice(&head_bytes);
        raw_request.extend_from_slice(&body);

        let flow = ctx
            .flow_store
            .create_flow(format!("{host}:{port}"), FlowKind::Https)
            .await;
        ctx.flow_store.update_flow(flow.id, |f| {
            f.request = Some(InterceptedRequest {
                method: method.clone(),
                uri: path.parse().unwrap_or_else(|_| http::Uri::from_static("/")),
                headers: headers.clone(),
                body: body.clone(),
            });
        });
        ctx.flow_store.set_raw_request(flow.id, Bytes::from(raw_request));

        let result = ctx
            .transport
            .round_trip(&host, port, true, method, &path, headers, body)
            .await;

        let origin_resp = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("origin round trip failed for {host}:{port}: {e}");
                let message = e.to_string();
                ctx.flow_store.update_flow(flow.id, |f| {
                    f.response = Some(InterceptedResponse {
                        status: 502,
                        reason: "Bad Gateway".to_string(),
                        headers: HeaderMap::new(),
                        body: Bytes::from(message),
                    });
                    f.duration = Some(started.elapsed());
                });
                reader
                    .write_simple_response(502, "Bad Gateway", b"Bad Gateway")
                    .await?;
                break;
            }
        };

        let is_streaming = is_stream_content_type(&origin_resp.headers);
        ctx.flow_store.update_flow(flow.id, |f| f.is_streaming = is_streaming);

        let status_line = format!(
            "HTTP/1.1 {} {}\r\n",
            origin_resp.status.as_u16(),
            origin_resp.reason.clone().unwrap_or_default()
        );
        let mut response_head = Vec::new();
        response_head.extend_from_slice(status_line.as_bytes());
        for (name, value) in origin_resp.headers.iter() {
            response_head.extend_from_slice(name.as_str().as_bytes());
            response_head.extend_from_slice(b": ");
            response_head.extend_from_slice(value.as_bytes());
            response_head.extend_from_slice(b"\r\n");
        }
        response_head.extend_from_slice(b"\r\n");
        reader.write_raw(&response_head).await?;

        let mut sse_parser = SseParser::new();
        let mut bedrock_parser = BedrockEventStreamParser::new();
        let is_sse = content_type_contains(&origin_resp.headers, "text/event-stream");
        let is_bedrock = content_type_contains(&origin_resp.headers, "vnd.amazon.eventstream");

        let mut response_body = Vec::new();
        let mut body_stream = origin_resp.body;
        loop {
            let frame = match body_stream.frame().await {
                Some(Ok(f)) => f,
                Some(Err(e)) => {
                    warn!("origin response body error: {e}");
                    break;
                }
                None => break,
            };
            let Some(data) = frame.data_ref().cloned() else {
                continue;
            };
            reader.write_raw(&data).await?;
            response_body.extend_from_slice(&data);

            if is_sse {
                for event in sse_parser.push(&data) {
                    ctx.flow_store.append_event(crate::flow::SseEvent {
                        event_id: crate::flow::next_id().await,
                        flow_id: flow.id,
                        event: event.event,
                        id: event.id,
                        retry: event.retry,
                        data: event.data,
                        timestamp: time::OffsetDateTime::now_utc(),
                    });
                }
            } else if is_bedrock {
                match bedrock_parser.push(&data) {
                    Ok(messages) => {
                        for m in messages {
                            ctx.flow_store.append_event(crate::flow::SseEvent {
                                event_id: crate::flow::next_id().await,
                                flow_id: flow.id,
                                event: m.event_name(),
                                id: None,
                                retry: None,
                                data: m.decoded_data(),
                                timestamp: time::OffsetDateTime::now_utc(),
                            });
                        }
                    }
                    Err(e) => warn!("bedrock event-stream parse error: {e:?}"),
                }
            }
        }

        if is_sse {
            if let Some(event) = sse_parser.flush() {
                ctx.flow_store.append_event(crate::flow::SseEvent {
                    event_id: crate::flow::next_id().await,
                    flow_id: flow.id,
                    event: event.event,
                    id: event.id,
                    retry: event.retry,
                    data: event.data,
                    timestamp: time::OffsetDateTime::now_utc(),
                });
            }
        } else if is_bedrock {
            let leftover = bedrock_parser.flush();
            if leftover > 0 {
                warn!("bedrock event-stream ended with {leftover} undecodable trailing bytes");
            }
        }

        let response_status = origin_resp.status.as_u16();
        let response_reason = origin_resp.reason.clone().unwrap_or_default();
        let response_headers = origin_resp.headers.clone();

        if is_sse || is_bedrock {
            ctx.flow_store.drop_raw(flow.id);
            let body = if is_bedrock {
                Bytes::from_static(b"[Bedrock Event Stream]")
            } else {
                crate::http_forward::decode_capped(
                    &Bytes::from(response_body),
                    &response_headers,
                    ctx.forwarder_config.max_decoded_body,
                )
            };
            ctx.flow_store.update_flow(flow.id, |f| {
                f.response = Some(InterceptedResponse {
                    status: response_status,
                    reason: response_reason,
                    headers: response_headers,
                    body,
                });
                f.duration = Some(started.elapsed());
            });
        } else {
            let mut raw_response = response_head.clone();
            raw_response.extend_from_slice(&response_body);
            ctx.flow_store
                .set_raw_response(flow.id, Bytes::from(raw_response));
            let decoded = crate::http_forward::decode_capped(
                &Bytes::from(response_body),
                &response_headers,
                ctx.forwarder_config.max_decoded_body,
            );
            ctx.flow_store.update_flow(flow.id, |f| {
                f.response = Some(InterceptedResponse {
                    status: response_status,
                    reason: response_reason,
                    headers: response_headers,
                    body: decoded,
                });
                f.duration = Some(started.elapsed());
            });
        }

        if should_close(&origin_resp.headers) {
            break;
        }
    }

    Ok(())
}

fn content_type_contains(headers: &HeaderMap, needle: &str) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains(needle))
        .unwrap_or(false)
}

fn is_stream_content_type(headers: &HeaderMap) -> bool {
    content_type_contains(headers, "text/event-stream")
        || content_type_contains(headers, "vnd.amazon.eventstream")
}

fn should_close(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

/// Buffers raw bytes off `stream` so request heads, chunked bodies and
/// pipelined requests can be read without losing anything across keep-alive
/// iterations.
struct HeadReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HeadReader<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut tmp = [0u8; 8192];
        let n = self.stream.read(&mut tmp).await?;
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    async fn read_head(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = find_double_crlf(&self.buf) {
                let head = self.buf[..pos].to_vec();
                self.buf.drain(..pos);
                return Ok(Some(head));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(io::Error::other("request head too large"));
            }
            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::other("connection closed mid-head"))
                };
            }
        }
    }

    /// `Transfer-Encoding: chunked` wins over `Content-Length` when both are
    /// present.
    async fn read_body(&mut self, headers: &HeaderMap) -> io::Result<Bytes> {
        let chunked = headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        if chunked {
            return self.read_chunked().await;
        }

        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        if content_length == 0 {
            return Ok(Bytes::new());
        }

        self.read_exact_n(content_length).await
    }

    async fn read_exact_n(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                warn!("origin closed before Content-Length bytes arrived, truncating at what was received");
                let data = std::mem::take(&mut self.buf);
                return Ok(Bytes::from(data));
            }
        }
        let data: Vec<u8> = self.buf.drain(..n).collect();
        Ok(Bytes::from(data))
    }

    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                    line.pop();
                }
                return Ok(line);
            }
            if self.fill().await? == 0 {
                return Err(io::Error::other("connection closed mid-line"));
            }
        }
    }

    async fn read_chunked(&mut self) -> io::Result<Bytes> {
        let mut out = Vec::new();
        loop {
            let size_line = self.read_line().await?;
            let size_str = String::from_utf8_lossy(&size_line);
            let size_str = size_str.split(';').next().unwrap_or("0").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| io::Error::other("invalid chunk size"))?;
            if size == 0 {
                loop {
                    let trailer = self.read_line().await?;
                    if trailer.is_empty() {
                        break;
                    }
                }
                break;
            }
            let chunk = self.read_exact_n(size).await?;
            out.extend_from_slice(&chunk);
            let _trailing_crlf = self.read_exact_n(2).await?;
        }
        Ok(Bytes::from(out))
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    async fn write_simple_response(&mut self, status: u16, reason: &str, body: &[u8]) -> io::Result<()> {
        let head = format!(
            "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        self.write_raw(head.as_bytes()).await?;
        self.write_raw(body).await
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_double_crlf() {
        let buf = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody";
        assert_eq!(find_double_crlf(buf), Some(30));
    }

    #[test]
    fn websocket_preamble_detected() {
        let preview = b"GET /chat HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\n\r\n";
        assert!(looks_like_websocket_preamble(preview));
    }

    #[test]
    fn non_websocket_get_not_detected() {
        let preview = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        assert!(!looks_like_websocket_preamble(preview));
    }
}
