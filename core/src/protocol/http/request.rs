/*
 * request.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an HTTP client library.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! HTTP request: method, URL, headers, body. The body variants declare the
//! properties the engines and the retry policy need: known length,
//! replayability, and duplex (may keep producing bytes after response
//! headers arrive).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::HttpError;
use crate::protocol::http::headers::Headers;
use crate::uri::HttpUrl;

/// Per-call options carried on the request, keyed by caller-chosen type.
/// Values travel with the request through redirects and retries.
#[derive(Clone, Default)]
pub struct Attachments {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Attachments {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Attachments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Attachments({} entries)", self.map.len())
    }
}

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Other(&'static str),
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Other(s) => s,
        }
    }

    /// Idempotent methods may be retried after bytes have been transmitted.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Method::Get | Method::Head | Method::Options | Method::Delete | Method::Trace
        )
    }
}

/// Producer half of a streamed request body.
pub struct BodySender {
    tx: mpsc::Sender<Bytes>,
}

impl BodySender {
    /// Feed one chunk. Blocks when the exchange has not yet consumed earlier
    /// chunks. Returns an error after the exchange has gone away.
    pub async fn send(&self, chunk: Bytes) -> Result<(), HttpError> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| HttpError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "body consumer gone")))
    }
}

/// Consumer half of a streamed request body, owned by the exchange.
pub struct BodyStream {
    rx: mpsc::Receiver<Bytes>,
}

impl BodyStream {
    pub(crate) async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Create the two halves of a streamed body. Dropping the sender ends the
/// body.
pub fn body_channel() -> (BodySender, BodyStream) {
    let (tx, rx) = mpsc::channel(8);
    (BodySender { tx }, BodyStream { rx })
}

/// Request body variants.
pub enum RequestBody {
    /// No body at all.
    Empty,
    /// Fully buffered; replayable for retries.
    Buffered {
        content_type: Option<String>,
        data: Bytes,
    },
    /// One-shot stream; consumed as it is written, never replayable.
    Stream {
        content_type: Option<String>,
        /// Declared length; None selects chunked transfer on HTTP/1.1.
        len: Option<u64>,
        source: BodyStream,
    },
    /// Duplex stream: bytes may keep flowing after response headers are
    /// received. HTTP/2 and upgraded exchanges only.
    Duplex {
        content_type: Option<String>,
        source: BodyStream,
    },
}

impl RequestBody {
    pub fn buffered(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        RequestBody::Buffered {
            content_type: Some(content_type.into()),
            data: data.into(),
        }
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, RequestBody::Empty)
    }

    /// Declared content length, or None when unknown.
    pub fn content_length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Buffered { data, .. } => Some(data.len() as u64),
            RequestBody::Stream { len, .. } => *len,
            RequestBody::Duplex { .. } => None,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            RequestBody::Empty => None,
            RequestBody::Buffered { content_type, .. }
            | RequestBody::Stream { content_type, .. }
            | RequestBody::Duplex { content_type, .. } => content_type.as_deref(),
        }
    }

    /// A body is replayable when a retry can transmit it again from the
    /// start.
    pub fn is_replayable(&self) -> bool {
        matches!(self, RequestBody::Empty | RequestBody::Buffered { .. })
    }

    pub fn is_duplex(&self) -> bool {
        matches!(self, RequestBody::Duplex { .. })
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Buffered { data, .. } => write!(f, "Buffered({} bytes)", data.len()),
            RequestBody::Stream { len, .. } => write!(f, "Stream(len={:?})", len),
            RequestBody::Duplex { .. } => f.write_str("Duplex"),
        }
    }
}

/// A logical request. Header order and duplicates are preserved; the Host
/// header is derived from the URL at send time and must not be set manually.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: HttpUrl,
    pub headers: Headers,
    pub body: RequestBody,
    pub attachments: Attachments,
    /// Set by the WebSocket layer, which owns Sec-WebSocket-Extensions.
    pub(crate) websocket_upgrade: bool,
}

impl Request {
    pub fn new(method: Method, url: HttpUrl) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            body: RequestBody::Empty,
            attachments: Attachments::default(),
            websocket_upgrade: false,
        }
    }

    pub fn get(url: HttpUrl) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// True when this request asks the server to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        self.headers.has_token("Connection", "upgrade")
    }

    /// Validate before any I/O happens.
    pub fn validate(&self) -> Result<(), HttpError> {
        self.headers.validate()?;
        if self.headers.contains("Host") {
            return Err(HttpError::MalformedRequest(
                "Host header is derived from the URL".into(),
            ));
        }
        // The WebSocket layer owns extension negotiation on upgrades.
        if self.is_upgrade() && !self.websocket_upgrade && self.headers.contains("Sec-WebSocket-Extensions") {
            return Err(HttpError::MalformedRequest(
                "Sec-WebSocket-Extensions is managed by the WebSocket layer".into(),
            ));
        }
        Ok(())
    }

    /// Clone everything except the body (bodies that are not replayable
    /// cannot be cloned).
    pub(crate) fn clone_head(&self) -> Request {
        Request {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: RequestBody::Empty,
            attachments: self.attachments.clone(),
            websocket_upgrade: self.websocket_upgrade,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> HttpUrl {
        HttpUrl::parse(s).unwrap()
    }

    #[test]
    fn idempotent_methods() {
        assert!(Method::Get.is_idempotent());
        assert!(Method::Delete.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Patch.is_idempotent());
    }

    #[test]
    fn buffered_body_is_replayable() {
        let b = RequestBody::buffered("text/plain", "hello");
        assert!(b.is_replayable());
        assert_eq!(b.content_length(), Some(5));
    }

    #[test]
    fn stream_body_is_not_replayable() {
        let (_tx, rx) = body_channel();
        let b = RequestBody::Stream {
            content_type: None,
            len: None,
            source: rx,
        };
        assert!(!b.is_replayable());
        assert_eq!(b.content_length(), None);
    }

    #[test]
    fn manual_host_header_rejected() {
        let r = Request::get(url("http://example.com/")).header("Host", "evil");
        assert!(r.validate().is_err());
    }

    #[test]
    fn upgrade_guard_on_extensions_header() {
        let r = Request::get(url("http://example.com/"))
            .header("Connection", "upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Extensions", "permessage-deflate");
        assert!(r.validate().is_err());
    }

    #[test]
    fn upgrade_detection() {
        let r = Request::get(url("http://example.com/")).header("Connection", "Upgrade");
        assert!(r.is_upgrade());
    }

    #[test]
    fn attachments_are_type_keyed() {
        #[derive(Debug, PartialEq)]
        struct TraceId(u64);

        let mut r = Request::get(url("http://example.com/"));
        r.attachments.insert(TraceId(7));
        assert_eq!(r.attachments.get::<TraceId>(), Some(&TraceId(7)));
        assert!(r.attachments.get::<u32>().is_none());

        let head = r.clone_head();
        assert_eq!(head.attachments.get::<TraceId>(), Some(&TraceId(7)));
    }
}
