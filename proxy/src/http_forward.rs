//! HTTP Forwarder: handles plain `http://` requests sent to the proxy in
//! absolute-URI form (the request line a browser sends when it is *not*
//! CONNECT-tunneling, e.g. `GET http://example.com/ HTTP/1.1`).

use std::{convert::Infallible, time::Instant};

use bytes::Bytes;
use http::{Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Request, body::Incoming};
use tracing::warn;

use crate::{
    flow::{FlowKind, FlowStore, InterceptedRequest, InterceptedResponse},
    origin::OriginTransport,
};

#[derive(Debug, Clone, Copy)]
pub struct HttpForwarderConfig {
    pub max_decoded_body: usize,
}

impl Default for HttpForwarderConfig {
    fn default() -> Self {
        Self {
            max_decoded_body: 16 * 1024 * 1024,
        }
    }
}

pub async fn forward(
    req: Request<Incoming>,
    flow_store: FlowStore,
    transport: OriginTransport,
    config: HttpForwarderConfig,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(c) => c.to_bytes(),
        Err(_) => return Ok(bad_gateway()),
    };

    let uri = parts.uri.clone();
    let host = uri.host().unwrap_or("localhost").to_string();
    let port = uri.port_u16().unwrap_or(80);

    let flow = flow_store
        .create_flow(format!("{host}:{port}"), FlowKind::Http)
        .await;
    flow_store.update_flow(flow.id, |f| {
        f.request = Some(InterceptedRequest {
            method: parts.method.clone(),
            uri: uri.clone(),
            headers: parts.headers.clone(),
            body: body_bytes.clone(),
        });
    });

    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path());

    let result = transport
        .round_trip(
            &host,
            port,
            false,
            parts.method.clone(),
            path_and_query,
            parts.headers.clone(),
            body_bytes,
        )
        .await;

    match result {
        Ok(origin_resp) => {
            let resp_body = match origin_resp.body.collect().await {
                Ok(c) => c.to_bytes(),
                Err(_) => return Ok(bad_gateway()),
            };
            let decoded = decode_capped(&resp_body, &origin_resp.headers, config.max_decoded_body);

            flow_store.update_flow(flow.id, |f| {
                f.response = Some(InterceptedResponse {
                    status: origin_resp.status.as_u16(),
                    reason: origin_resp.reason.clone().unwrap_or_default(),
                    headers: origin_resp.headers.clone(),
                    body: decoded.clone(),
                });
                f.duration = Some(started.elapsed());
            });

            let mut builder = Response::builder().status(origin_resp.status);
            if let Some(h) = builder.headers_mut() {
                *h = origin_resp.headers;
            }
            Ok(builder
                .body(Full::new(resp_body).boxed())
                .unwrap_or_else(|_| bad_gateway()))
        }
        Err(e) => {
            warn!("origin round trip failed for {host}:{port}: {e}");
            let message = e.to_string();
            flow_store.update_flow(flow.id, |f| {
                f.response = Some(InterceptedResponse {
                    status: 502,
                    reason: "Bad Gateway".to_string(),
                    headers: http::HeaderMap::new(),
                    body: Bytes::from(message),
                });
                f.duration = Some(started.elapsed());
            });
            Ok(bad_gateway())
        }
    }
}

/// Decodes `Content-Encoding` for display purposes only; the bytes sent back to
/// the client are always the untouched origin response. Never fails the
/// pipeline — falls back to the raw (possibly still-encoded) bytes, truncated
/// to the cap, on any decode error.
pub(crate) fn decode_capped(body: &Bytes, headers: &http::HeaderMap, cap: usize) -> Bytes {
    let decoded = match roxy_shared::content::get_content_encoding(headers) {
        Some(encodings) => roxy_shared::content::decode_body(body, &encodings)
            .unwrap_or_else(|_| body.clone()),
        None => body.clone(),
    };

    if decoded.len() > cap {
        warn!("decoded body of {} bytes exceeds cap of {cap}, truncating", decoded.len());
        decoded.slice(0..cap)
    } else {
        decoded
    }
}

fn bad_gateway() -> Response<BoxBody<Bytes, Infallible>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(b"Bad Gateway")).boxed());
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}
