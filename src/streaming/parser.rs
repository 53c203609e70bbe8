//! Incremental parser for a progressively-arriving response body.
//!
//! Progress events deliver the accumulated body text; the parser keeps a
//! cursor past the last consumed linefeed and emits one [`Frame`] per
//! completed line, however the body was chunked across events.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::streaming::frame::{
    parse_communication_error, ErrorDescription, ErrorKind, Frame,
};

/// URL path segment whose frames are base64+zstd compressed by the server.
const COMPRESSED_PATH: &str = "/system/autoupdate";

pub struct StreamMessageParser {
    status: u16,
    error_status: bool,
    single_action: bool,
    decompress: bool,
    /// Byte offset of the first unconsumed character in the accumulated body.
    consumed: usize,
}

impl StreamMessageParser {
    pub fn new(url: &str, single_action: bool) -> Self {
        let path = url.split('?').next().unwrap_or(url);
        Self {
            status: 0,
            error_status: false,
            single_action,
            decompress: path.contains(COMPRESSED_PATH),
            consumed: 0,
        }
    }

    /// Capture the HTTP status. A status >= 400 turns every subsequent frame
    /// into error content, even before any body text has arrived.
    pub fn read_headers(&mut self, status: u16) {
        self.status = status;
        self.error_status = status >= 400;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Consume newly completed lines of the accumulated body.
    pub fn read_progress(&mut self, body: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(offset) = body[self.consumed.min(body.len())..].find('\n') {
            let line_end = self.consumed + offset;
            let raw = &body[self.consumed..line_end];
            self.consumed = line_end + 1;
            if let Some(frame) = self.parse_frame(raw) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Handle stream completion. In single-action mode the remaining tail is
    /// the one expected message; on a long-lived stream a non-empty tail
    /// means the server went away mid-conversation, and an empty tail is a
    /// plain end-of-stream.
    pub fn read_finish(&mut self, body: &str) -> Option<Frame> {
        let tail = &body[self.consumed.min(body.len())..];
        self.consumed = body.len();

        if tail.trim().is_empty() {
            return None;
        }
        if self.single_action {
            return self.parse_frame(tail);
        }
        Some(Frame::Error(ErrorDescription::stream_closed(self.status)))
    }

    fn parse_frame(&self, raw: &str) -> Option<Frame> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let text = self.decode_payload(raw);
        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => return Some(Frame::Error(ErrorDescription::malformed_json())),
        };

        if let Some(comm) = parse_communication_error(&value) {
            return Some(Frame::Error(ErrorDescription {
                kind: ErrorKind::from_status(self.status),
                reason: comm.msg.clone(),
                error: Some(comm),
            }));
        }

        if self.error_status {
            return Some(Frame::Error(ErrorDescription {
                kind: ErrorKind::from_status(self.status),
                reason: text.into_owned(),
                error: None,
            }));
        }

        Some(Frame::Data(value))
    }

    /// Base64+zstd decode on the compressed path, falling back to the raw
    /// text when the frame turns out to be plain. Older servers respond
    /// uncompressed on the same URL.
    fn decode_payload<'a>(&self, raw: &'a str) -> std::borrow::Cow<'a, str> {
        if !self.decompress {
            return raw.into();
        }
        let decoded = BASE64
            .decode(raw)
            .ok()
            .and_then(|bin| zstd::stream::decode_all(bin.as_slice()).ok())
            .and_then(|out| String::from_utf8(out).ok());
        match decoded {
            Some(text) => text.into(),
            None => {
                tracing::warn!("frame is not base64+zstd, treating as plain text");
                raw.into()
            }
        }
    }
}
