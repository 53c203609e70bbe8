//! Transport abstraction for streaming HTTP connections.
//!
//! The crate never speaks HTTP itself. A [`Transport`] implementation owns
//! the actual client and surfaces each response as a sequence of lifecycle
//! events on a channel: headers first, then the accumulated body text as it
//! grows, then completion or failure. Health probes use the one-shot
//! [`Transport::get_json`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};

/// HTTP verb for an endpoint. Streams are typically POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// One outbound streaming request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
}

/// Low-level response lifecycle events.
///
/// `Progress` and `Finish` carry the accumulated body text so far, not just
/// the newly arrived chunk; the parser keeps its own cursor into it.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Headers { status: u16 },
    Progress { body: String },
    Finish { body: String },
    Failed { reason: String },
}

/// Handle to one physical connection. Dropping it detaches from the
/// underlying transfer; cancellation is the owner's concern.
pub struct Connection {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a streaming request. Events arrive on the returned connection in
    /// network order.
    async fn connect(&self, request: TransportRequest) -> Result<Connection>;

    /// One-shot GET returning the parsed JSON body. Used for health probes.
    async fn get_json(&self, url: &str) -> Result<Value>;
}

/// Transport fed from pre-scripted event sequences (for testing).
///
/// Each `connect` consumes the next script and replays it on the connection
/// channel. Senders are held so a connection without a terminal event stays
/// open until the stream is closed from our side.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<TransportEvent>>>,
    requests: Mutex<Vec<TransportRequest>>,
    held: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    connects: AtomicUsize,
    health_body: Mutex<Option<Value>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the event sequence for the next connection.
    pub fn script(&self, events: Vec<TransportEvent>) {
        self.scripts.lock().unwrap().push_back(events);
    }

    /// Body returned by `get_json`; unset means the probe fails.
    pub fn set_health_body(&self, body: Value) {
        *self.health_body.lock().unwrap() = Some(body);
    }

    /// Every request seen so far, in connect order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, request: TransportRequest) -> Result<Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let events = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let _ = tx.send(event);
        }
        self.held.lock().unwrap().push(tx);

        Ok(Connection { events: rx })
    }

    async fn get_json(&self, _url: &str) -> Result<Value> {
        self.health_body
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SyncError::Transport("no route to host".to_string()))
    }
}
