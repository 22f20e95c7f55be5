use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use http::HeaderMap;
use once_cell::sync::Lazy;
use snowflake::SnowflakeIdGenerator;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::warn;

static ID_GENERATOR: Lazy<Mutex<SnowflakeIdGenerator>> =
    Lazy::new(|| Mutex::new(SnowflakeIdGenerator::new(1, 1)));

pub async fn next_id() -> i64 {
    ID_GENERATOR.lock().await.generate()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Http,
    Https,
    WebSocket,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Http => "http",
            FlowKind::Https => "https",
            FlowKind::WebSocket => "websocket",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: http::Method,
    pub uri: http::Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One Server-Sent Events (or Bedrock event-stream) event surfaced by the stream
/// parsers. Flat by design: references a flow by id only, never a live handle, so
/// store events stay ordered and cheap to broadcast.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_id: i64,
    pub flow_id: i64,
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
    pub data: String,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct RawHttp {
    pub request: Option<Bytes>,
    pub response: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub id: i64,
    pub timestamp: OffsetDateTime,
    pub host: String,
    pub kind: FlowKind,
    pub request: Option<InterceptedRequest>,
    pub response: Option<InterceptedResponse>,
    pub duration: Option<Duration>,
    pub is_streaming: bool,
    pub raw: RawHttp,
}

impl Flow {
    pub fn has_raw_http(&self) -> bool {
        self.raw.request.is_some() || self.raw.response.is_some()
    }
}

/// Everything the control/API surface pushes to subscribers. Intentionally flat:
/// an event carries a `flow_id`, never a `Flow` handle it could outlive.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    FlowCreated(Flow),
    FlowUpdated(Flow),
    EventAppended(SseEvent),
    Cleared,
}

/// Bounded so a stalled subscriber falls behind and gets disconnected (`RecvError::Lagged`)
/// rather than forcing producers to block or buffer without limit.
const SUBSCRIBER_CAPACITY: usize = 1024;

struct Inner {
    flows: DashMap<i64, Flow>,
    order: RwLock<Vec<i64>>,
    events: DashMap<i64, Vec<SseEvent>>,
    bus: broadcast::Sender<StoreEvent>,
}

#[derive(Clone)]
pub struct FlowStore {
    inner: Arc<Inner>,
}

impl FlowStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                flows: DashMap::new(),
                order: RwLock::new(Vec::new()),
                events: DashMap::new(),
                bus,
            }),
        }
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is the common case between browser connections; that's fine.
        let _ = self.inner.bus.send(event);
    }

    pub async fn create_flow(&self, host: String, kind: FlowKind) -> Flow {
        let id = next_id().await;
        let flow = Flow {
            id,
            timestamp: OffsetDateTime::now_utc(),
            host,
            kind,
            request: None,
            response: None,
            duration: None,
            is_streaming: false,
            raw: RawHttp::default(),
        };
        self.inner.flows.insert(id, flow.clone());
        self.inner.order.write().await.push(id);
        self.publish(StoreEvent::FlowCreated(flow.clone()));
        flow
    }

    pub fn update_flow(&self, id: i64, f: impl FnOnce(&mut Flow)) -> Option<Flow> {
        let mut entry = self.inner.flows.get_mut(&id)?;
        f(&mut entry);
        let flow = entry.clone();
        drop(entry);
        self.publish(StoreEvent::FlowUpdated(flow.clone()));
        Some(flow)
    }

    pub fn append_event(&self, event: SseEvent) {
        self.inner
            .events
            .entry(event.flow_id)
            .or_default()
            .push(event.clone());
        self.publish(StoreEvent::EventAppended(event));
    }

    pub fn set_raw_request(&self, id: i64, bytes: Bytes) {
        self.update_flow(id, |f| f.raw.request = Some(bytes));
    }

    pub fn set_raw_response(&self, id: i64, bytes: Bytes) {
        self.update_flow(id, |f| f.raw.response = Some(bytes));
    }

    pub fn drop_raw(&self, id: i64) {
        self.update_flow(id, |f| f.raw = RawHttp::default());
    }

    pub fn get_flow(&self, id: i64) -> Option<Flow> {
        self.inner.flows.get(&id).map(|f| f.clone())
    }

    pub fn events_for(&self, id: i64) -> Vec<SseEvent> {
        self.inner
            .events
            .get(&id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> Vec<Flow> {
        let order = self.inner.order.read().await;
        order
            .iter()
            .filter_map(|id| self.inner.flows.get(id).map(|f| f.clone()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.bus.subscribe()
    }

    /// There's no explicit unsubscribe handle in `tokio::broadcast`; dropping the
    /// receiver returned by `subscribe` is the unsubscribe.
    pub fn unsubscribe(&self, receiver: broadcast::Receiver<StoreEvent>) {
        drop(receiver);
    }

    pub async fn clear(&self) {
        self.inner.flows.clear();
        self.inner.events.clear();
        self.inner.order.write().await.clear();
        self.publish(StoreEvent::Cleared);
    }

    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            flow_count: self.inner.flows.len(),
            event_count: self.inner.events.iter().map(|e| e.value().len()).sum(),
            subscriber_count: self.inner.bus.receiver_count(),
        }
    }
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub flow_count: usize,
    pub event_count: usize,
    pub subscriber_count: usize,
}

pub fn lag_warning(n: u64) {
    warn!("subscriber lagged by {n} messages, disconnecting");
}
