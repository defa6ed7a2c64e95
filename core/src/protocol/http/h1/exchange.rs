/*
 * exchange.rs
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

//! One HTTP/1.1 exchange over an exclusive hold of a connection: write the
//! request line, headers and body; parse the response head; then either
//! yield the raw transport (101 upgrade), finish immediately (no body), or
//! drive the body lazily while the caller reads it. The transport returns
//! to the pool only when the response was framed well enough to reuse it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::call::CancelHandle;
use crate::events::EventListener;
use crate::net::HttpStream;
use crate::pool::ConnectionPool;
use crate::protocol::http::connection::{Connection, HttpVersion};
use crate::protocol::http::h1::parser::{H1ResponseSink, ParseState, ResponseParser};
use crate::protocol::http::headers::Headers;
use crate::protocol::http::request::{Request, RequestBody};
use crate::protocol::http::response::BodyTx;

/// Parsed response head.
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Headers,
}

/// How the response body is framed, per the selection rule: no body for
/// 1xx/204/304/HEAD, then chunked, then Content-Length, then read until
/// close (which poisons the connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Chunked,
    Fixed(u64),
    UntilClose,
}

pub fn response_body_kind(head_request: bool, status: u16, headers: &Headers) -> BodyKind {
    if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
        return BodyKind::None;
    }
    if headers.has_token("Transfer-Encoding", "chunked") {
        return BodyKind::Chunked;
    }
    if let Some(cl) = headers.get("Content-Length").and_then(|v| v.trim().parse::<u64>().ok()) {
        return BodyKind::Fixed(cl);
    }
    BodyKind::UntilClose
}

/// Returns the pooled connection (or its corpse) to the pool when an
/// exchange finishes.
pub(crate) struct ExchangeFinisher {
    pub conn: Arc<Connection>,
    pub pool: ConnectionPool,
    pub events: Arc<dyn EventListener>,
}

impl ExchangeFinisher {
    /// Exchange done; `reusable` decides whether the transport goes back
    /// into rotation.
    pub(crate) fn complete(self, stream: HttpStream, reusable: bool) {
        if reusable {
            self.conn.restore_h1_stream(stream);
        } else {
            self.conn.mark_not_reusable();
        }
        self.pool.release(&self.conn);
        self.events.connection_released(self.conn.id());
    }

    /// Exchange failed; the transport is dropped and the connection
    /// evicted.
    pub(crate) fn fail(self) {
        self.conn.mark_not_reusable();
        self.pool.evict(&self.conn);
        self.events.connection_released(self.conn.id());
    }
}

/// One request/response pair. Owns the transport for the duration.
pub struct Http1Exchange {
    stream: HttpStream,
    buf: BytesMut,
    parser: ResponseParser,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Http1Exchange {
    pub fn new(stream: HttpStream, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8192),
            parser: ResponseParser::new(),
            read_timeout,
            write_timeout,
        }
    }

    /// Write request line, headers, and any non-duplex body. Framing
    /// headers are derived from the body: Content-Length when the length
    /// is known, chunked transfer otherwise.
    pub async fn send_request(
        &mut self,
        request: &mut Request,
        events: &dyn EventListener,
    ) -> io::Result<()> {
        events.request_headers_start();
        let head = build_request_head(request);
        self.write_all(head.as_bytes()).await?;
        events.request_headers_end();

        match &mut request.body {
            RequestBody::Empty | RequestBody::Duplex { .. } => {
                self.flush().await?;
            }
            RequestBody::Buffered { data, .. } => {
                events.request_body_start();
                let data = data.clone();
                self.write_all(&data).await?;
                self.flush().await?;
                events.request_body_end(data.len() as u64);
            }
            RequestBody::Stream { len, source, .. } => {
                events.request_body_start();
                let declared = *len;
                let mut written = 0u64;
                if declared.is_some() {
                    while let Some(chunk) = source.next_chunk().await {
                        written += chunk.len() as u64;
                        self.write_all(&chunk).await?;
                    }
                    if Some(written) != declared {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "request body length does not match Content-Length",
                        ));
                    }
                } else {
                    while let Some(chunk) = source.next_chunk().await {
                        if chunk.is_empty() {
                            continue;
                        }
                        written += chunk.len() as u64;
                        let size_line = format!("{:x}\r\n", chunk.len());
                        self.write_all(size_line.as_bytes()).await?;
                        self.write_all(&chunk).await?;
                        self.write_all(b"\r\n").await?;
                    }
                    self.write_all(b"0\r\n\r\n").await?;
                }
                self.flush().await?;
                events.request_body_end(written);
            }
        }
        Ok(())
    }

    /// Read until the response head is complete.
    pub async fn read_response_head(&mut self) -> io::Result<ResponseHead> {
        let mut collector = HeadCollector::default();
        loop {
            self.parser.receive(&mut self.buf, &mut collector)?;
            if self.parser.state() == ParseState::HeadersComplete {
                return Ok(ResponseHead {
                    version: collector.version.unwrap_or(HttpVersion::Http11),
                    status: collector.status,
                    reason: collector.reason,
                    headers: collector.headers,
                });
            }
            let n = self.read_some().await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response head",
                ));
            }
        }
    }

    /// Discard a 100 Continue interim head; the definitive response
    /// follows on the same connection.
    pub fn reset_interim(&mut self) {
        self.parser.reset();
    }

    /// Select the body framing on the parser. Must be called once after
    /// `read_response_head`.
    pub fn begin_body(&mut self, kind: BodyKind) {
        match kind {
            BodyKind::None => self.parser.set_no_body(),
            BodyKind::Chunked => self.parser.set_body_mode(None, true),
            BodyKind::Fixed(n) => self.parser.set_body_mode(Some(n), false),
            BodyKind::UntilClose => self.parser.set_body_mode(None, false),
        }
    }

    /// Hand the raw transport to the caller after a 101. Any bytes read
    /// past the head travel along.
    pub fn into_upgrade(self) -> (HttpStream, Bytes) {
        (self.stream, self.buf.freeze())
    }

    /// Finish an exchange whose response has no body. The connection is
    /// reusable unless the server sent stray bytes past the head.
    pub(crate) fn finish_no_body(self, finisher: ExchangeFinisher) {
        let reusable = self.buf.is_empty();
        finisher.complete(self.stream, reusable);
    }

    /// Drive the remaining body on a background task, feeding chunks into
    /// `tx`. The connection is released when the body ends.
    pub(crate) fn spawn_body_driver(
        mut self,
        tx: BodyTx,
        finisher: ExchangeFinisher,
        cancel: Arc<CancelHandle>,
    ) {
        tokio::spawn(async move {
            let mut trailers = Headers::new();
            let mut total = 0u64;
            loop {
                let mut sink = BodyCollector::default();
                if let Err(e) = self.parser.receive(&mut self.buf, &mut sink) {
                    tx.error(e).await;
                    finisher.fail();
                    return;
                }
                for (name, value) in sink.trailers {
                    trailers.add(name, value);
                }
                for chunk in sink.chunks {
                    total += chunk.len() as u64;
                    if !tx.data(chunk.freeze()).await {
                        // Caller dropped the body mid-read: the rest of the
                        // response was never consumed, so the transport
                        // cannot be reused.
                        finisher.fail();
                        return;
                    }
                }
                if self.parser.state() == ParseState::Complete {
                    if !trailers.is_empty() {
                        tx.set_trailers(trailers);
                    }
                    finisher.events.response_body_end(total);
                    let reusable = self.buf.is_empty();
                    finisher.complete(self.stream, reusable);
                    return;
                }

                let read = tokio::select! {
                    _ = cancel.wait() => {
                        tx.error(io::Error::new(io::ErrorKind::Interrupted, "call canceled"))
                            .await;
                        finisher.fail();
                        return;
                    }
                    r = self.read_some() => r,
                };
                match read {
                    Ok(0) => {
                        let mut sink = BodyCollector::default();
                        match self.parser.finish_on_eof(&mut sink) {
                            Ok(()) => {
                                finisher.events.response_body_end(total);
                                // EOF-terminated bodies can never reuse the
                                // transport.
                                finisher.fail();
                            }
                            Err(e) => {
                                tx.error(e).await;
                                finisher.fail();
                            }
                        }
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tx.error(e).await;
                        finisher.fail();
                        return;
                    }
                }
            }
        });
    }

    async fn read_some(&mut self) -> io::Result<usize> {
        let mut tmp = [0u8; 8192];
        let n = if self.read_timeout.is_zero() {
            self.stream.read(&mut tmp).await?
        } else {
            timeout(self.read_timeout, self.stream.read(&mut tmp))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??
        };
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.write_timeout.is_zero() {
            self.stream.write_all(data).await
        } else {
            timeout(self.write_timeout, self.stream.write_all(data))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }
}

/// Serialize the request line and headers. The Host header derives from
/// the URL; framing headers derive from the body.
fn build_request_head(request: &Request) -> String {
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        request.method.as_str(),
        request.url.path_and_query,
        request.url.authority()
    );
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
        {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if let Some(ct) = request.body.content_type() {
        if !request.headers.contains("Content-Type") {
            head.push_str("Content-Type: ");
            head.push_str(ct);
            head.push_str("\r\n");
        }
    }
    match &request.body {
        RequestBody::Empty | RequestBody::Duplex { .. } => {}
        RequestBody::Buffered { data, .. } => {
            head.push_str(&format!("Content-Length: {}\r\n", data.len()));
        }
        RequestBody::Stream { len, .. } => match len {
            Some(n) => head.push_str(&format!("Content-Length: {}\r\n", n)),
            None => head.push_str("Transfer-Encoding: chunked\r\n"),
        },
    }
    head.push_str("\r\n");
    head
}

#[derive(Default)]
struct HeadCollector {
    version: Option<HttpVersion>,
    status: u16,
    reason: Option<String>,
    headers: Headers,
}

impl H1ResponseSink for HeadCollector {
    fn status(&mut self, version: HttpVersion, code: u16, reason: Option<&str>) {
        self.version = Some(version);
        self.status = code;
        self.reason = reason.filter(|r| !r.is_empty()).map(|r| r.to_string());
    }
    fn header(&mut self, name: &str, value: &str) {
        self.headers.add(name, value);
    }
    fn body_chunk(&mut self, _data: BytesMut) {}
    fn trailer(&mut self, _name: &str, _value: &str) {}
    fn end_body(&mut self) {}
}

#[derive(Default)]
struct BodyCollector {
    chunks: Vec<BytesMut>,
    trailers: Vec<(String, String)>,
}

impl H1ResponseSink for BodyCollector {
    fn status(&mut self, _version: HttpVersion, _code: u16, _reason: Option<&str>) {}
    fn header(&mut self, _name: &str, _value: &str) {}
    fn body_chunk(&mut self, data: BytesMut) {
        self.chunks.push(data);
    }
    fn trailer(&mut self, name: &str, value: &str) {
        self.trailers.push((name.to_string(), value.to_string()));
    }
    fn end_body(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http::request::Method;
    use crate::uri::HttpUrl;

    fn request(method: Method, url: &str) -> Request {
        Request::new(method, HttpUrl::parse(url).unwrap())
    }

    #[test]
    fn head_has_request_line_and_host() {
        let r = request(Method::Get, "http://example.com/a?b=1");
        let head = build_request_head(&r);
        assert!(head.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn host_includes_non_default_port() {
        let r = request(Method::Get, "http://example.com:8080/");
        assert!(build_request_head(&r).contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn buffered_body_gets_content_length() {
        let mut r = request(Method::Post, "http://example.com/");
        r.body = RequestBody::buffered("text/plain", "hello");
        let head = build_request_head(&r);
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
    }

    #[test]
    fn unknown_length_stream_uses_chunked() {
        let (_tx, rx) = crate::protocol::http::request::body_channel();
        let mut r = request(Method::Post, "http://example.com/");
        r.body = RequestBody::Stream {
            content_type: None,
            len: None,
            source: rx,
        };
        assert!(build_request_head(&r).contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn user_framing_headers_are_replaced() {
        let mut r = request(Method::Post, "http://example.com/")
            .header("Content-Length", "99")
            .header("X-Ok", "yes");
        r.body = RequestBody::buffered("text/plain", "hi");
        let head = build_request_head(&r);
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(!head.contains("Content-Length: 99"));
        assert!(head.contains("X-Ok: yes\r\n"));
    }

    #[test]
    fn body_kind_selection_rule() {
        let empty = Headers::new();
        assert_eq!(response_body_kind(true, 200, &empty), BodyKind::None);
        assert_eq!(response_body_kind(false, 204, &empty), BodyKind::None);
        assert_eq!(response_body_kind(false, 304, &empty), BodyKind::None);
        assert_eq!(response_body_kind(false, 101, &empty), BodyKind::None);

        let mut chunked = Headers::new();
        chunked.add("Transfer-Encoding", "chunked");
        // Chunked wins over Content-Length.
        chunked.add("Content-Length", "10");
        assert_eq!(response_body_kind(false, 200, &chunked), BodyKind::Chunked);

        let mut fixed = Headers::new();
        fixed.add("Content-Length", "42");
        assert_eq!(response_body_kind(false, 200, &fixed), BodyKind::Fixed(42));

        assert_eq!(response_body_kind(false, 200, &empty), BodyKind::UntilClose);
    }
}
