//! Control/API surface: JSON REST endpoints plus a root-path WebSocket that
//! pushes live Flow Store changes to the dashboard. No teacher equivalent —
//! the teacher's UI is an in-process `ratatui` TUI — so this is built fresh in
//! the surrounding modules' idiom: a `service_fn`-style handler returning
//! `serde_json` bodies, and a `tokio-tungstenite`-driven push loop for the
//! live feed.

use std::convert::Infallible;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::flow::{Flow, FlowStore, InterceptedRequest, InterceptedResponse, SseEvent, StoreEvent};

#[derive(Clone)]
pub struct ApiContext {
    pub flow_store: FlowStore,
    pub tls_profile: std::sync::Arc<tokio::sync::RwLock<String>>,
    pub started_at: std::time::Instant,
}

pub async fn handle_rest(
    req: Request<Incoming>,
    ctx: ApiContext,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let value = match (method, segments.as_slice()) {
        (http::Method::GET, ["api", "flows"]) => {
            let flows = ctx.flow_store.snapshot().await;
            json!({ "count": flows.len(), "flows": flows.iter().map(flow_json).collect::<Vec<_>>() })
        }
        (http::Method::DELETE, ["api", "flows"]) => {
            ctx.flow_store.clear().await;
            json!({ "cleared": true })
        }
        (http::Method::GET, ["api", "flows", id]) => match parse_id(id) {
            Some(id) => match ctx.flow_store.get_flow(id) {
                Some(flow) => flow_json(&flow),
                None => return Ok(not_found()),
            },
            None => return Ok(bad_request("invalid flow id")),
        },
        (http::Method::GET, ["api", "flows", id, "events"]) => match parse_id(id) {
            Some(id) => {
                let events = ctx.flow_store.events_for(id);
                json!({ "count": events.len(), "events": events.iter().map(event_json).collect::<Vec<_>>() })
            }
            None => return Ok(bad_request("invalid flow id")),
        },
        (http::Method::GET, ["api", "flows", id, "raw"]) => match parse_id(id) {
            Some(id) => match ctx.flow_store.get_flow(id) {
                Some(flow) if flow.has_raw_http() => json!({
                    "request": flow.raw.request.as_ref().map(|b| String::from_utf8_lossy(b).to_string()),
                    "response": flow.raw.response.as_ref().map(|b| String::from_utf8_lossy(b).to_string()),
                }),
                Some(_) => return Ok(not_found()),
                None => return Ok(not_found()),
            },
            None => return Ok(bad_request("invalid flow id")),
        },
        (http::Method::GET, ["api", "stats"]) => {
            let stats = ctx.flow_store.stats().await;
            json!({
                "requestCount": stats.flow_count,
                "uptime": ctx.started_at.elapsed().as_secs(),
                "connectedClients": stats.subscriber_count,
            })
        }
        (http::Method::GET, ["api", "debug", "raw-flows"]) => {
            let flows = ctx.flow_store.snapshot().await;
            let ids: Vec<i64> = flows.iter().filter(|f| f.has_raw_http()).map(|f| f.id).collect();
            json!({ "count": ids.len(), "flowIds": ids })
        }
        (http::Method::GET, ["api", "tls", "config"]) => {
            json!({ "profile": *ctx.tls_profile.read().await })
        }
        (http::Method::POST, ["api", "tls", "profile", profile]) => {
            *ctx.tls_profile.write().await = profile.to_string();
            json!({ "profile": profile })
        }
        _ => return Ok(not_found()),
    };

    Ok(json_response(StatusCode::OK, &value))
}

fn parse_id(raw: &str) -> Option<i64> {
    raw.parse().ok()
}

fn json_response(status: StatusCode, value: &Value) -> Response<BoxBody<Bytes, Infallible>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(Full::new(Bytes::from(body)).boxed());
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

fn not_found() -> Response<BoxBody<Bytes, Infallible>> {
    json_response(StatusCode::NOT_FOUND, &json!({ "error": "not found" }))
}

fn bad_request(msg: &str) -> Response<BoxBody<Bytes, Infallible>> {
    json_response(StatusCode::BAD_REQUEST, &json!({ "error": msg }))
}

fn flow_json(flow: &Flow) -> Value {
    json!({
        "id": flow.id,
        "timestamp": flow.timestamp.format(&time::format_description::well_known::Rfc3339).unwrap_or_default(),
        "host": flow.host,
        "type": flow.kind.as_str(),
        "request": flow.request.as_ref().map(request_json),
        "response": flow.response.as_ref().map(response_json),
        "duration": flow.duration.map(|d| d.as_millis() as u64),
        "isStreaming": flow.is_streaming,
        "hasRawHttp": flow.has_raw_http(),
    })
}

fn request_json(req: &InterceptedRequest) -> Value {
    json!({
        "method": req.method.as_str(),
        "url": req.uri.to_string(),
        "headers": headers_json(&req.headers),
        "body": String::from_utf8(req.body.to_vec()).ok(),
    })
}

fn response_json(resp: &InterceptedResponse) -> Value {
    json!({
        "status": resp.status,
        "reason": resp.reason,
        "headers": headers_json(&resp.headers),
        "body": String::from_utf8(resp.body.to_vec()).ok(),
    })
}

fn headers_json(headers: &http::HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_string(), json!(v));
        }
    }
    Value::Object(map)
}

fn event_json(event: &SseEvent) -> Value {
    json!({
        "eventId": event.event_id,
        "flowId": event.flow_id,
        "event": event.event,
        "id": event.id,
        "retry": event.retry,
        "data": event.data,
        "timestamp": event.timestamp.format(&time::format_description::well_known::Rfc3339).unwrap_or_default(),
    })
}

/// Drives the dashboard WebSocket: greets with `{type:"init",...}`, then
/// relays Flow Store broadcasts until the client disconnects or its send
/// buffer overflows.
pub async fn run_subscriber<S>(stream: S, flow_store: FlowStore) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    use futures_util::SinkExt;

    let mut ws = tokio_tungstenite::WebSocketStream::from_raw_socket(
        stream,
        tokio_tungstenite::tungstenite::protocol::Role::Server,
        None,
    )
    .await;

    let mut receiver = flow_store.subscribe();

    let flows = flow_store.snapshot().await;
    let mut events_by_flow = serde_json::Map::new();
    for flow in &flows {
        let events = flow_store.events_for(flow.id);
        events_by_flow.insert(
            flow.id.to_string(),
            Value::Array(events.iter().map(event_json).collect()),
        );
    }
    let init = json!({
        "type": "init",
        "flows": flows.iter().map(flow_json).collect::<Vec<_>>(),
        "events": Value::Object(events_by_flow),
    });
    ws.send(Message::Text(init.to_string().into())).await?;

    loop {
        match receiver.recv().await {
            Ok(StoreEvent::FlowCreated(flow)) | Ok(StoreEvent::FlowUpdated(flow)) => {
                let msg = json!({ "type": "flow", "flow": flow_json(&flow) });
                if ws.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            Ok(StoreEvent::EventAppended(event)) => {
                let msg = json!({ "type": "event", "flowId": event.flow_id, "event": event_json(&event) });
                if ws.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            Ok(StoreEvent::Cleared) => {
                let msg = json!({ "type": "clear" });
                if ws.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                crate::flow::lag_warning(n);
                break;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!("dashboard subscriber disconnected");
    flow_store.unsubscribe(receiver);
    Ok(())
}
