//! WebSocket proxy path. The core never parses a WebSocket frame: once the
//! upgrade handshake has been recorded, the client and origin sockets are
//! spliced together and bytes flow untouched in both directions.

use std::{io, time::Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    flow::{FlowKind, FlowStore, InterceptedRequest, InterceptedResponse},
    origin::OriginTransport,
};

const MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

/// Reads the upgrade request off `client_stream`, records it as a flow (with
/// `has_raw_http` always false — see `Flow::has_raw_http`), opens a raw
/// connection to the origin, forwards the handshake bytes verbatim, reads and
/// records the origin's response, then pumps bytes between the two sockets
/// until either side closes.
pub async fn pump<S>(
    mut client_stream: S,
    host: &str,
    port: u16,
    tls: bool,
    flow_store: FlowStore,
    transport: OriginTransport,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();
    let handshake = read_handshake_head(&mut client_stream).await?;
    let (method, path, headers) = parse_handshake(&handshake)?;

    let flow = flow_store
        .create_flow(format!("{host}:{port}"), FlowKind::WebSocket)
        .await;
    flow_store.update_flow(flow.id, |f| {
        f.request = Some(InterceptedRequest {
            method,
            uri: path.parse().unwrap_or_else(|_| http::Uri::from_static("/")),
            headers,
            body: Bytes::new(),
        });
    });

    let outcome = run(client_stream, host, port, tls, &flow_store, flow.id, &transport, &handshake).await;

    flow_store.update_flow(flow.id, |f| f.duration = Some(started.elapsed()));

    outcome
}

async fn run<S>(
    mut client_stream: S,
    host: &str,
    port: u16,
    tls: bool,
    flow_store: &FlowStore,
    flow_id: i64,
    transport: &OriginTransport,
    handshake: &[u8],
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut origin_stream = transport
        .connect_raw(host, port, tls)
        .await
        .map_err(io::Error::other)?;
    origin_stream.write_all(handshake).await?;
    origin_stream.flush().await?;

    let (resp_head, leftover) = read_until_double_crlf(&mut origin_stream, MAX_HANDSHAKE_BYTES).await?;
    let (status, reason, resp_headers) = parse_response_head(&resp_head)?;
    let upgraded = status == 101;

    flow_store.update_flow(flow_id, |f| {
        f.response = Some(InterceptedResponse {
            status,
            reason: reason.unwrap_or_default(),
            headers: resp_headers,
            body: Bytes::new(),
        });
        f.is_streaming = upgraded;
    });

    client_stream.write_all(&resp_head).await?;
    if !leftover.is_empty() {
        client_stream.write_all(&leftover).await?;
    }
    client_stream.flush().await?;

    let (mut client_read, mut client_write) = tokio::io::split(client_stream);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin_stream);

    let client_to_origin = tokio::io::copy(&mut client_read, &mut origin_write);
    let origin_to_client = tokio::io::copy(&mut origin_read, &mut client_write);

    tokio::select! {
        res = client_to_origin => { res?; }
        res = origin_to_client => { res?; }
    }

    Ok(())
}

async fn read_handshake_head<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let (head, leftover) = read_until_double_crlf(stream, MAX_HANDSHAKE_BYTES).await?;
    let mut head = head;
    head.extend_from_slice(&leftover);
    Ok(head)
}

/// Reads from `stream` until a header-terminating blank line is seen,
/// returning the head bytes and whatever was read past it.
async fn read_until_double_crlf<S>(stream: &mut S, max: usize) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        if let Some(pos) = find_double_crlf(&buf) {
            let leftover = buf.split_off(pos);
            return Ok((buf, leftover));
        }
        if buf.len() > max {
            return Err(io::Error::other("websocket handshake too large"));
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(io::Error::other("connection closed mid-handshake"));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_handshake(head: &[u8]) -> io::Result<(Method, String, HeaderMap)> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);
    parsed
        .parse(head)
        .map_err(|e| io::Error::other(format!("malformed websocket handshake: {e}")))?;

    let method = Method::try_from(parsed.method.unwrap_or("GET")).unwrap_or(Method::GET);
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

    Ok((method, path, headers))
}

fn parse_response_head(head: &[u8]) -> io::Result<(u16, Option<String>, HeaderMap)> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    parsed
        .parse(head)
        .map_err(|e| io::Error::other(format!("malformed websocket handshake response: {e}")))?;

    let status = parsed.code.unwrap_or(0);
    let reason = parsed.reason.map(str::to_string);

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

    Ok((status, reason, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upgrade_request() {
        let head = b"GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (method, path, headers) = parse_handshake(head).unwrap();
        assert_eq!(method, Method::GET);
        assert_eq!(path, "/chat");
        assert_eq!(
            headers.get("upgrade").and_then(|v| v.to_str().ok()),
            Some("websocket")
        );
    }

    #[test]
    fn finds_double_crlf() {
        let buf = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(find_double_crlf(buf), Some(buf.len()));
    }

    #[test]
    fn parses_101_response_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        let (status, reason, headers) = parse_response_head(head).unwrap();
        assert_eq!(status, 101);
        assert_eq!(reason.as_deref(), Some("Switching Protocols"));
        assert_eq!(
            headers.get("sec-websocket-accept").and_then(|v| v.to_str().ok()),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }
}
