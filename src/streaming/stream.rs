//! One physical streaming connection.
//!
//! A [`Stream`] owns a driver task that opens the transport, feeds every
//! lifecycle event through the [`StreamMessageParser`], and replays parsed
//! messages on an outbound channel. Connection loss runs through a single
//! error path: a caller-supplied predicate plus a bounded retry budget
//! decide between reconnecting after a delay and surfacing the error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::{Result, SyncError};
use crate::streaming::frame::{ErrorDescription, Frame};
use crate::streaming::parser::StreamMessageParser;
use crate::transport::{Transport, TransportEvent, TransportRequest};

/// Default number of reconnect attempts before an error is surfaced.
pub const DEFAULT_RECONNECTS_BEFORE_CLOSE: u32 = 3;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Decides, per error, whether the stream should try again.
pub type ReconnectPredicate =
    Arc<dyn Fn(ErrorDescription) -> BoxFuture<'static, bool> + Send + Sync>;

/// Delay before the next reconnect attempt. `Custom` is evaluated fresh on
/// every attempt so callers can add jitter or backoff.
#[derive(Clone)]
pub enum ReconnectDelay {
    Fixed(Duration),
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl ReconnectDelay {
    fn next(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Custom(f) => f(attempt),
        }
    }
}

pub struct StreamConfig {
    pub request: TransportRequest,
    pub reconnects_before_close: u32,
    pub reconnect_delay: ReconnectDelay,
    pub should_reconnect: ReconnectPredicate,
}

impl StreamConfig {
    pub fn new(request: TransportRequest) -> Self {
        Self {
            request,
            reconnects_before_close: DEFAULT_RECONNECTS_BEFORE_CLOSE,
            reconnect_delay: ReconnectDelay::Fixed(DEFAULT_RECONNECT_DELAY),
            should_reconnect: Arc::new(|_| Box::pin(async { true })),
        }
    }

    /// Set the retry budget. Only the magnitude matters.
    pub fn retry_budget(mut self, budget: i32) -> Self {
        self.reconnects_before_close = budget.unsigned_abs();
        self
    }

    pub fn delay(mut self, delay: ReconnectDelay) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn should_reconnect(mut self, predicate: ReconnectPredicate) -> Self {
        self.should_reconnect = predicate;
        self
    }
}

/// What a consumer observes on the stream's outbound channel.
#[derive(Debug)]
pub enum StreamEvent {
    Message(Value),
    Error(ErrorDescription),
    Closed,
}

pub struct Stream {
    close_tx: watch::Sender<bool>,
    restart_tx: watch::Sender<u64>,
    events: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl Stream {
    /// Open the connection and start the driver task.
    pub fn open(transport: Arc<dyn Transport>, config: StreamConfig) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let (restart_tx, restart_rx) = watch::channel(0u64);

        tokio::spawn(drive(transport, config, out_tx, close_rx, restart_rx));

        Self {
            close_tx,
            restart_tx,
            events: Mutex::new(Some(out_rx)),
        }
    }

    /// Take the outbound event channel. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.events.lock().unwrap().take()
    }

    /// Stop the driver. Idempotent; frames already in flight from the
    /// transport are discarded, not delivered.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Drop the current connection and dial again immediately, bypassing the
    /// retry accounting.
    pub fn reconnect(&self) {
        self.restart_tx.send_modify(|gen| *gen += 1);
    }
}

/// Issue a single request and resolve with the first message or error.
/// Never reconnects.
pub async fn single_shot(
    transport: Arc<dyn Transport>,
    request: TransportRequest,
) -> Result<Value> {
    let mut conn = transport.connect(request.clone()).await?;
    let mut parser = StreamMessageParser::new(&request.url, true);

    while let Some(event) = conn.events.recv().await {
        match event {
            TransportEvent::Headers { status } => parser.read_headers(status),
            TransportEvent::Progress { body } => {
                if let Some(frame) = parser.read_progress(&body).into_iter().next() {
                    return frame_result(frame);
                }
            }
            TransportEvent::Finish { body } => {
                return match parser.read_finish(&body) {
                    Some(frame) => frame_result(frame),
                    None => Err(SyncError::Transport(
                        "stream ended without a message".to_string(),
                    )),
                };
            }
            TransportEvent::Failed { reason } => {
                return Err(ErrorDescription::from_transport(&reason).into());
            }
        }
    }
    Err(SyncError::Transport("connection dropped".to_string()))
}

fn frame_result(frame: Frame) -> Result<Value> {
    match frame {
        Frame::Data(value) => Ok(value),
        Frame::Error(err) => Err(err.into()),
    }
}

enum Outcome {
    /// Server ended the stream cleanly.
    Finished,
    /// `close()` was called on our side.
    LocalClose,
    /// `reconnect()` was called; dial again without touching the budget.
    Restart,
    Errored(ErrorDescription),
}

async fn drive(
    transport: Arc<dyn Transport>,
    config: StreamConfig,
    out: mpsc::UnboundedSender<StreamEvent>,
    mut close_rx: watch::Receiver<bool>,
    mut restart_rx: watch::Receiver<u64>,
) {
    let mut attempts: u32 = 0;
    loop {
        let outcome = run_connection(
            &*transport,
            &config,
            &out,
            &mut close_rx,
            &mut restart_rx,
            &mut attempts,
        )
        .await;

        match outcome {
            Outcome::LocalClose => return,
            Outcome::Restart => continue,
            Outcome::Finished => {
                let _ = out.send(StreamEvent::Closed);
                return;
            }
            Outcome::Errored(err) => {
                let retry = (config.should_reconnect)(err.clone()).await;
                if retry && attempts < config.reconnects_before_close {
                    attempts += 1;
                    let delay = config.reconnect_delay.next(attempts);
                    tracing::debug!(
                        attempt = attempts,
                        ?delay,
                        reason = %err.reason,
                        "reconnecting stream"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = close_rx.changed() => return,
                    }
                    continue;
                }
                let _ = out.send(StreamEvent::Error(err));
                return;
            }
        }
    }
}

async fn run_connection(
    transport: &dyn Transport,
    config: &StreamConfig,
    out: &mpsc::UnboundedSender<StreamEvent>,
    close_rx: &mut watch::Receiver<bool>,
    restart_rx: &mut watch::Receiver<u64>,
    attempts: &mut u32,
) -> Outcome {
    let mut conn = match transport.connect(config.request.clone()).await {
        Ok(conn) => conn,
        Err(e) => return Outcome::Errored(ErrorDescription::from_transport(&e.to_string())),
    };
    let mut parser = StreamMessageParser::new(&config.request.url, false);
    // One-shot flag: a second error report for the same connection is noise,
    // not a second reconnect decision.
    let mut reported: Option<ErrorDescription> = None;

    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                tracing::trace!("stream closed locally, discarding late frames");
                return Outcome::LocalClose;
            }
            restart = restart_rx.changed() => {
                if restart.is_err() {
                    return Outcome::LocalClose;
                }
                return Outcome::Restart;
            }
            event = conn.events.recv() => {
                let Some(event) = event else {
                    return Outcome::Errored(reported.take().unwrap_or_else(|| {
                        ErrorDescription::from_transport("connection dropped")
                    }));
                };
                match event {
                    TransportEvent::Headers { status } => parser.read_headers(status),
                    TransportEvent::Progress { body } => {
                        for frame in parser.read_progress(&body) {
                            match frame {
                                Frame::Data(value) => {
                                    *attempts = 0;
                                    let _ = out.send(StreamEvent::Message(value));
                                }
                                Frame::Error(err) => {
                                    if reported.is_none() {
                                        reported = Some(err);
                                    } else {
                                        tracing::trace!(
                                            reason = %err.reason,
                                            "suppressing duplicate error report"
                                        );
                                    }
                                }
                            }
                        }
                        if let Some(err) = reported.take() {
                            return Outcome::Errored(err);
                        }
                    }
                    TransportEvent::Finish { body } => {
                        return match parser.read_finish(&body) {
                            Some(Frame::Data(value)) => {
                                *attempts = 0;
                                let _ = out.send(StreamEvent::Message(value));
                                Outcome::Finished
                            }
                            Some(Frame::Error(err)) => {
                                Outcome::Errored(reported.take().unwrap_or(err))
                            }
                            None => Outcome::Finished,
                        };
                    }
                    TransportEvent::Failed { reason } => {
                        let err = ErrorDescription::from_transport(&reason);
                        return Outcome::Errored(match reported.take() {
                            Some(first) => {
                                tracing::trace!(
                                    reason = %err.reason,
                                    "suppressing duplicate error report"
                                );
                                first
                            }
                            None => err,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpMethod, ScriptedTransport};
    use serde_json::json;

    fn request() -> TransportRequest {
        TransportRequest {
            method: HttpMethod::Post,
            url: "/stream".to_string(),
            body: None,
        }
    }

    fn always(result: bool) -> ReconnectPredicate {
        Arc::new(move |_| Box::pin(async move { result }))
    }

    fn no_delay() -> ReconnectDelay {
        ReconnectDelay::Custom(Arc::new(|_| Duration::ZERO))
    }

    fn failure() -> Vec<TransportEvent> {
        vec![
            TransportEvent::Headers { status: 200 },
            TransportEvent::Failed {
                reason: "connection reset".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn budget_of_three_reconnects_then_surfaces() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..4 {
            transport.script(failure());
        }

        let config = StreamConfig::new(request())
            .retry_budget(3)
            .delay(no_delay())
            .should_reconnect(always(true));
        let stream = Stream::open(transport.clone(), config);
        let mut events = stream.take_events().unwrap();

        match events.recv().await {
            Some(StreamEvent::Error(err)) => assert_eq!(err.reason, "connection reset"),
            other => panic!("expected surfaced error, got {other:?}"),
        }
        assert_eq!(transport.connect_count(), 4);
    }

    #[tokio::test]
    async fn negative_budget_is_normalized() {
        let config = StreamConfig::new(request()).retry_budget(-3);
        assert_eq!(config.reconnects_before_close, 3);
    }

    #[tokio::test]
    async fn valid_message_resets_the_retry_counter() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(failure());
        transport.script(vec![
            TransportEvent::Headers { status: 200 },
            TransportEvent::Progress {
                body: "{\"a/1/x\":1}\n".to_string(),
            },
            TransportEvent::Failed {
                reason: "connection reset".to_string(),
            },
        ]);
        transport.script(failure());

        let config = StreamConfig::new(request())
            .retry_budget(1)
            .delay(no_delay())
            .should_reconnect(always(true));
        let stream = Stream::open(transport.clone(), config);
        let mut events = stream.take_events().unwrap();

        match events.recv().await {
            Some(StreamEvent::Message(value)) => assert_eq!(value, json!({"a/1/x": 1})),
            other => panic!("expected message, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(StreamEvent::Error(_))));
        assert_eq!(transport.connect_count(), 3);
    }

    #[tokio::test]
    async fn predicate_false_surfaces_without_retry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(failure());

        let config = StreamConfig::new(request())
            .delay(no_delay())
            .should_reconnect(always(false));
        let stream = Stream::open(transport.clone(), config);
        let mut events = stream.take_events().unwrap();

        assert!(matches!(events.recv().await, Some(StreamEvent::Error(_))));
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn close_is_quiet_and_idempotent() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(vec![TransportEvent::Headers { status: 200 }]);

        let stream = Stream::open(transport.clone(), StreamConfig::new(request()));
        let mut events = stream.take_events().unwrap();

        stream.close();
        stream.close();

        assert!(events.recv().await.is_none());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn server_finish_with_empty_body_closes_cleanly() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(vec![
            TransportEvent::Headers { status: 200 },
            TransportEvent::Finish {
                body: String::new(),
            },
        ]);

        let stream = Stream::open(transport, StreamConfig::new(request()));
        let mut events = stream.take_events().unwrap();

        assert!(matches!(events.recv().await, Some(StreamEvent::Closed)));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn reconnect_redials_without_spending_budget() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(vec![TransportEvent::Headers { status: 200 }]);
        transport.script(vec![TransportEvent::Headers { status: 200 }]);

        let stream = Stream::open(transport.clone(), StreamConfig::new(request()));
        tokio::task::yield_now().await;
        stream.reconnect();

        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.connect_count() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("second dial");
        stream.close();
    }

    #[tokio::test]
    async fn single_shot_resolves_with_first_message() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(vec![
            TransportEvent::Headers { status: 200 },
            TransportEvent::Finish {
                body: "{\"a/1/x\":1}".to_string(),
            },
        ]);

        let value = single_shot(transport, request()).await.unwrap();
        assert_eq!(value, json!({"a/1/x": 1}));
    }

    #[tokio::test]
    async fn single_shot_rejects_with_first_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(vec![
            TransportEvent::Headers { status: 503 },
            TransportEvent::Progress {
                body: "{\"type\":\"overload\",\"msg\":\"busy\"}\n".to_string(),
            },
        ]);

        match single_shot(transport, request()).await {
            Err(SyncError::Server(msg)) => assert_eq!(msg, "busy"),
            other => panic!("expected server error, got {other:?}"),
        }
    }
}
