/*
 * response.rs
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

//! HTTP response with a lazy body. Body chunks are produced by the engine
//! that owns the transport (H1 body driver task or H2 stream forwarder) and
//! pulled on demand here; the transport returns to the pool only once the
//! body is exhausted. Upgraded exchanges carry the raw transport in
//! `socket` instead of a body.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::net::HttpStream;
use crate::protocol::http::connection::HttpVersion;
use crate::protocol::http::headers::Headers;

/// Sender half used by the body-producing engines.
pub(crate) struct BodyTx {
    tx: mpsc::Sender<io::Result<Bytes>>,
    trailers: Arc<Mutex<Option<Headers>>>,
}

impl BodyTx {
    /// Deliver one chunk; blocks while the consumer is behind. Returns false
    /// when the consumer dropped the body.
    pub(crate) async fn data(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    pub(crate) async fn error(&self, e: io::Error) {
        let _ = self.tx.send(Err(e)).await;
    }

    pub(crate) fn set_trailers(&self, trailers: Headers) {
        *self.trailers.lock().unwrap() = Some(trailers);
    }
}

/// Lazy response body. Chunks arrive in transmission order; `None` marks a
/// clean end of body.
pub struct Body {
    rx: Option<mpsc::Receiver<io::Result<Bytes>>>,
    content_length: Option<u64>,
    content_type: Option<String>,
    trailers: Arc<Mutex<Option<Headers>>>,
    buffered: Option<Bytes>,
}

impl Body {
    pub(crate) fn empty() -> Body {
        Body {
            rx: None,
            content_length: Some(0),
            content_type: None,
            trailers: Arc::new(Mutex::new(None)),
            buffered: None,
        }
    }

    /// Body backed by an already-complete byte buffer.
    pub(crate) fn buffered(data: Bytes) -> Body {
        Body {
            rx: None,
            content_length: Some(data.len() as u64),
            content_type: None,
            trailers: Arc::new(Mutex::new(None)),
            buffered: Some(data),
        }
    }

    /// Channel-backed body; the producing engine keeps the sender.
    pub(crate) fn channel(
        content_length: Option<u64>,
        content_type: Option<String>,
    ) -> (BodyTx, Body) {
        let (tx, rx) = mpsc::channel(8);
        let trailers = Arc::new(Mutex::new(None));
        (
            BodyTx {
                tx,
                trailers: trailers.clone(),
            },
            Body {
                rx: Some(rx),
                content_length,
                content_type,
                trailers,
                buffered: None,
            },
        )
    }

    /// Declared Content-Length, when the framing provided one.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Next chunk of the body, or None at the end.
    pub async fn chunk(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(data) = self.buffered.take() {
            if data.is_empty() {
                return Ok(None);
            }
            return Ok(Some(data));
        }
        match &mut self.rx {
            None => Ok(None),
            Some(rx) => match rx.recv().await {
                None => Ok(None),
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(e)) => Err(e),
            },
        }
    }

    /// Drain the remaining body into one buffer.
    pub async fn bytes(mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Drain and decode as UTF-8.
    pub async fn text(self) -> io::Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "response body is not UTF-8"))
    }

    /// Trailers, available once the body has been fully read.
    pub fn trailers(&self) -> Option<Headers> {
        self.trailers.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Body(len={:?})", self.content_length)
    }
}

/// Raw transport yielded by a 101 upgrade. Bytes the exchange had already
/// buffered past the response head are served before new reads hit the
/// socket.
pub struct UpgradedStream {
    stream: HttpStream,
    leftover: Bytes,
}

impl UpgradedStream {
    pub(crate) fn new(stream: HttpStream, leftover: Bytes) -> Self {
        Self { stream, leftover }
    }

    pub(crate) fn into_parts(self) -> (HttpStream, Bytes) {
        (self.stream, self.leftover)
    }
}

impl AsyncRead for UpgradedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            let chunk = self.leftover.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpgradedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A logical response.
pub struct Response {
    pub status: u16,
    pub reason: Option<String>,
    pub protocol: HttpVersion,
    pub headers: Headers,
    pub body: Body,
    /// Raw transport after a 101 upgrade; None otherwise.
    pub socket: Option<UpgradedStream>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("protocol", &self.protocol)
            .field("headers", &self.headers.len())
            .field("upgraded", &self.socket.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_body_yields_no_chunks() {
        let mut b = Body::empty();
        assert!(b.chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn buffered_body_round_trip() {
        let b = Body::buffered(Bytes::from_static(b"hello"));
        assert_eq!(b.bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn channel_body_delivers_in_order() {
        let (tx, mut body) = Body::channel(Some(10), None);
        tokio::spawn(async move {
            assert!(tx.data(Bytes::from_static(b"hello ")).await);
            assert!(tx.data(Bytes::from_static(b"world")).await);
        });
        let mut out = Vec::new();
        while let Some(chunk) = body.chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn channel_body_surfaces_errors() {
        let (tx, mut body) = Body::channel(None, None);
        tokio::spawn(async move {
            tx.error(io::Error::new(io::ErrorKind::UnexpectedEof, "peer died")).await;
        });
        assert!(body.chunk().await.is_err());
    }
}
