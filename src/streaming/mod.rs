//! Streaming connection layer.
//!
//! Turns one long-lived HTTP response into a sequence of parsed messages:
//!
//! ```text
//! +-----------+     +---------------------+     +--------------+
//! | Transport | --> | StreamMessageParser | --> |    Stream    |
//! | (events)  |     | (lines -> frames)   |     | (reconnects) |
//! +-----------+     +---------------------+     +--------------+
//! ```
//!
//! [`StreamService`] adds endpoint resolution and the default retry policy
//! on top; the autoupdate orchestrator multiplexes subscriptions over the
//! streams built here.

pub mod frame;
pub mod parser;
pub mod service;
pub mod stream;

pub use frame::{parse_communication_error, CommunicationError, ErrorDescription, ErrorKind, Frame};
pub use parser::StreamMessageParser;
pub use service::{merge_params, AuthGate, ConnectionStatus, HealthProbe, StreamService};
pub use stream::{
    single_shot, ReconnectDelay, ReconnectPredicate, Stream, StreamConfig, StreamEvent,
    DEFAULT_RECONNECTS_BEFORE_CLOSE, DEFAULT_RECONNECT_DELAY,
};
