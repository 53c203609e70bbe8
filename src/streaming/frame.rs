//! Wire frame classification.
//!
//! Every line of a streamed response body decodes to exactly one [`Frame`]:
//! either a data delta or a classified error. Shape discrimination happens
//! once per frame, here, rather than wherever the payload is consumed.

use serde::Deserialize;
use serde_json::Value;

use crate::error::SyncError;

/// Coarse error class derived from the HTTP status of the carrying stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    Server,
    Unknown,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400..=499 => Self::Client,
            500..=599 => Self::Server,
            _ => Self::Unknown,
        }
    }
}

/// Server-reported error envelope: `{ "type": ..., "msg": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommunicationError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub msg: String,
}

/// A classified stream error, from either a payload frame or the transport.
#[derive(Debug, Clone)]
pub struct ErrorDescription {
    pub kind: ErrorKind,
    pub reason: String,
    pub error: Option<CommunicationError>,
}

impl ErrorDescription {
    pub fn malformed_json() -> Self {
        Self {
            kind: ErrorKind::Unknown,
            reason: "JSON is malformed".to_string(),
            error: None,
        }
    }

    pub fn stream_closed(status: u16) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            reason: "stream closed".to_string(),
            error: None,
        }
    }

    /// Classify a transport-level failure, unwrapping a communication-error
    /// body when the transport handed us one.
    pub fn from_transport(reason: &str) -> Self {
        if let Some(comm) = serde_json::from_str::<Value>(reason)
            .ok()
            .as_ref()
            .and_then(parse_communication_error)
        {
            return Self {
                kind: ErrorKind::Unknown,
                reason: comm.msg.clone(),
                error: Some(comm),
            };
        }
        Self {
            kind: ErrorKind::Unknown,
            reason: reason.to_string(),
            error: None,
        }
    }
}

impl From<ErrorDescription> for SyncError {
    fn from(err: ErrorDescription) -> Self {
        match err.kind {
            ErrorKind::Client => SyncError::Client(err.reason),
            ErrorKind::Server => SyncError::Server(err.reason),
            ErrorKind::Unknown => SyncError::Unknown(err.reason),
        }
    }
}

/// One parsed line of the response body.
#[derive(Debug)]
pub enum Frame {
    Data(Value),
    Error(ErrorDescription),
}

/// Detect a communication-error envelope, single- or double-wrapped.
pub fn parse_communication_error(value: &Value) -> Option<CommunicationError> {
    if let Some(inner) = value.get("error") {
        if let Ok(comm) = serde_json::from_value::<CommunicationError>(inner.clone()) {
            return Some(comm);
        }
    }
    serde_json::from_value(value.clone()).ok()
}
