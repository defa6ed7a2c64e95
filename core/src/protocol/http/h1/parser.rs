/*
 * parser.rs
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

//! HTTP/1.1 response push parser: status line, headers, body
//! (Content-Length, chunked, or read-until-close), trailers.
//!
//! The status line must carry a well-formed 3-digit code; the one tolerated
//! relaxation is the "ICY 200 OK" shoutcast form, which is treated as
//! HTTP/1.0.

use bytes::Buf;
use bytes::BytesMut;
use std::io;

use crate::protocol::http::connection::HttpVersion;

/// Callback for HTTP/1.1 response events. The exchange implements this and
/// forwards into the response being assembled.
pub trait H1ResponseSink {
    fn status(&mut self, version: HttpVersion, code: u16, reason: Option<&str>);
    fn header(&mut self, name: &str, value: &str);
    fn body_chunk(&mut self, data: BytesMut);
    fn trailer(&mut self, name: &str, value: &str);
    fn end_body(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    StatusLine,
    Headers,
    /// Head is complete; the exchange must choose a body mode via
    /// `set_body_mode` before feeding more bytes.
    HeadersComplete,
    Body,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    /// Response fully parsed; the connection may be reused.
    Complete,
}

/// Push parser for one HTTP/1.1 response. Feed bytes via `receive`; the
/// sink is invoked as complete tokens are parsed. Partial data stays in the
/// buffer.
pub struct ResponseParser {
    state: ParseState,
    /// Content-Length when known (-1 for chunked or read-until-close).
    content_length: i64,
    bytes_received: i64,
    chunk_remaining: i64,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::StatusLine,
            content_length: -1,
            bytes_received: 0,
            chunk_remaining: 0,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ParseState::StatusLine;
        self.content_length = -1;
        self.bytes_received = 0;
        self.chunk_remaining = 0;
    }

    /// True while the body is being read until connection close.
    pub fn reading_until_close(&self) -> bool {
        self.state == ParseState::Body && self.content_length < 0
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        let mut i = 0;
        while i + 1 < buf.len() {
            if buf[i] == b'\r' && buf[i + 1] == b'\n' {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Consume and parse as much as possible from buf, invoking the sink for
    /// each complete token.
    pub fn receive<S: H1ResponseSink>(
        &mut self,
        buf: &mut BytesMut,
        sink: &mut S,
    ) -> Result<(), io::Error> {
        while !buf.is_empty() {
            match self.state {
                ParseState::StatusLine => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    let line = buf.split_to(line_end + 2);
                    let line_str = std::str::from_utf8(&line[..line_end]).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid status line UTF-8")
                    })?;
                    let (version, code, reason) = parse_status_line(line_str)?;
                    sink.status(version, code, reason);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    if line_end == 0 {
                        buf.advance(2);
                        self.state = ParseState::HeadersComplete;
                        return Ok(());
                    }
                    let line = buf.split_to(line_end + 2);
                    let line_str = std::str::from_utf8(&line[..line_end]).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid header UTF-8")
                    })?;
                    if let Some(colon) = line_str.find(':') {
                        let name = line_str[..colon].trim();
                        let value = line_str[colon + 1..].trim();
                        sink.header(name, value);
                    }
                }
                ParseState::HeadersComplete => return Ok(()),
                ParseState::Body => {
                    if self.content_length >= 0 {
                        let remaining = (self.content_length - self.bytes_received) as usize;
                        let to_read = remaining.min(buf.len());
                        if to_read > 0 {
                            let chunk = buf.split_to(to_read);
                            self.bytes_received += to_read as i64;
                            sink.body_chunk(chunk);
                        }
                        if self.bytes_received >= self.content_length {
                            sink.end_body();
                            self.state = ParseState::Complete;
                        }
                    } else {
                        // Read until close: deliver all available. The
                        // exchange signals end-of-body on EOF.
                        if !buf.is_empty() {
                            let chunk = buf.split_to(buf.len());
                            sink.body_chunk(chunk);
                        }
                        return Ok(());
                    }
                }
                ParseState::ChunkSize => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    let line = buf.split_to(line_end + 2);
                    let line_str = std::str::from_utf8(&line[..line_end]).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                    })?;
                    let hex_part = line_str.split(';').next().unwrap_or(line_str).trim();
                    self.chunk_remaining = i64::from_str_radix(hex_part, 16).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                    })?;
                    if self.chunk_remaining == 0 {
                        self.state = ParseState::ChunkTrailer;
                    } else {
                        self.state = ParseState::ChunkData;
                    }
                }
                ParseState::ChunkData => {
                    let to_read = (self.chunk_remaining as usize).min(buf.len());
                    if to_read > 0 {
                        let chunk = buf.split_to(to_read);
                        self.chunk_remaining -= to_read as i64;
                        sink.body_chunk(chunk);
                    }
                    if self.chunk_remaining == 0 {
                        // Trailing CRLF after the chunk payload.
                        if buf.len() >= 2 {
                            buf.advance(2);
                            self.state = ParseState::ChunkSize;
                        } else {
                            return Ok(());
                        }
                    } else {
                        return Ok(());
                    }
                }
                ParseState::ChunkTrailer => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    if line_end == 0 {
                        buf.advance(2);
                        sink.end_body();
                        self.state = ParseState::Complete;
                    } else {
                        let line = buf.split_to(line_end + 2);
                        let line_str = std::str::from_utf8(&line[..line_end]).map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "invalid trailer")
                        })?;
                        if let Some(colon) = line_str.find(':') {
                            let name = line_str[..colon].trim();
                            let value = line_str[colon + 1..].trim();
                            sink.trailer(name, value);
                        }
                    }
                }
                ParseState::Complete => return Ok(()),
            }
        }
        Ok(())
    }

    /// Called by the exchange once the head is parsed (state
    /// HeadersComplete) to select the body framing.
    pub fn set_body_mode(&mut self, content_length: Option<u64>, chunked: bool) {
        if self.state != ParseState::HeadersComplete {
            return;
        }
        if chunked {
            self.content_length = -1;
            self.state = ParseState::ChunkSize;
        } else if let Some(cl) = content_length {
            self.content_length = cl as i64;
            self.bytes_received = 0;
            if cl == 0 {
                self.state = ParseState::Complete;
            } else {
                self.state = ParseState::Body;
            }
        } else {
            self.content_length = -1;
            self.state = ParseState::Body; // read until close
        }
    }

    /// Mark the response complete with no body (1xx/204/304/HEAD).
    pub fn set_no_body(&mut self) {
        if self.state == ParseState::HeadersComplete {
            self.state = ParseState::Complete;
        }
    }

    /// End-of-stream seen by the exchange. Legal only in read-until-close
    /// mode; anywhere else the body was truncated.
    pub fn finish_on_eof<S: H1ResponseSink>(&mut self, sink: &mut S) -> io::Result<()> {
        if self.reading_until_close() {
            sink.end_body();
            self.state = ParseState::Complete;
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of response",
            ))
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `HTTP/1.1 200 OK`, `HTTP/1.0 404`, or the ICY shoutcast variant.
/// A missing or malformed 3-digit code is an error.
fn parse_status_line(line: &str) -> io::Result<(HttpVersion, u16, Option<&str>)> {
    let (version, rest) = if let Some(rest) = line.strip_prefix("HTTP/1.1 ") {
        (HttpVersion::Http11, rest)
    } else if let Some(rest) = line.strip_prefix("HTTP/1.0 ") {
        (HttpVersion::Http10, rest)
    } else if let Some(rest) = line.strip_prefix("ICY ") {
        (HttpVersion::Http10, rest)
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected status line: {}", line),
        ));
    };
    if rest.len() < 3 || !rest.as_bytes()[..3].iter().all(|b| b.is_ascii_digit()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected status line: {}", line),
        ));
    }
    let code: u16 = rest[..3]
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid status code"))?;
    let reason = match rest.as_bytes().get(3) {
        None => None,
        Some(b' ') => Some(&rest[4..]),
        Some(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected status line: {}", line),
            ))
        }
    };
    Ok((version, code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        version: Option<HttpVersion>,
        status: Option<u16>,
        reason: Option<String>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        trailers: Vec<(String, String)>,
        ended: bool,
    }

    impl H1ResponseSink for Collect {
        fn status(&mut self, version: HttpVersion, code: u16, reason: Option<&str>) {
            self.version = Some(version);
            self.status = Some(code);
            self.reason = reason.map(|s| s.to_string());
        }
        fn header(&mut self, name: &str, value: &str) {
            self.headers.push((name.to_string(), value.to_string()));
        }
        fn body_chunk(&mut self, data: BytesMut) {
            self.body.extend_from_slice(&data);
        }
        fn trailer(&mut self, name: &str, value: &str) {
            self.trailers.push((name.to_string(), value.to_string()));
        }
        fn end_body(&mut self) {
            self.ended = true;
        }
    }

    fn feed(parser: &mut ResponseParser, sink: &mut Collect, bytes: &[u8]) {
        let mut buf = BytesMut::from(bytes);
        parser.receive(&mut buf, sink).unwrap();
    }

    #[test]
    fn fixed_length_response() {
        let mut p = ResponseParser::new();
        let mut c = Collect::default();
        feed(&mut p, &mut c, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(p.state(), ParseState::HeadersComplete);
        assert_eq!(c.status, Some(200));
        assert_eq!(c.version, Some(HttpVersion::Http11));
        p.set_body_mode(Some(5), false);
        feed(&mut p, &mut c, b"hello");
        assert_eq!(p.state(), ParseState::Complete);
        assert_eq!(c.body, b"hello");
        assert!(c.ended);
    }

    #[test]
    fn chunked_response_with_trailer() {
        let mut p = ResponseParser::new();
        let mut c = Collect::default();
        feed(
            &mut p,
            &mut c,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        p.set_body_mode(None, true);
        feed(&mut p, &mut c, b"5\r\nhello\r\n6\r\n world\r\n0\r\nX-Sum: 1\r\n\r\n");
        assert_eq!(p.state(), ParseState::Complete);
        assert_eq!(c.body, b"hello world");
        assert_eq!(c.trailers, vec![("X-Sum".to_string(), "1".to_string())]);
    }

    #[test]
    fn chunked_split_across_reads() {
        let mut p = ResponseParser::new();
        let mut c = Collect::default();
        feed(&mut p, &mut c, b"HTTP/1.1 200 OK\r\n\r\n");
        p.set_body_mode(None, true);
        let mut buf = BytesMut::from(&b"5\r\nhel"[..]);
        p.receive(&mut buf, &mut c).unwrap();
        buf.extend_from_slice(b"lo\r\n0\r\n\r\n");
        p.receive(&mut buf, &mut c).unwrap();
        assert_eq!(c.body, b"hello");
        assert_eq!(p.state(), ParseState::Complete);
    }

    #[test]
    fn icy_status_is_http10() {
        let mut p = ResponseParser::new();
        let mut c = Collect::default();
        feed(&mut p, &mut c, b"ICY 200 OK\r\n\r\n");
        assert_eq!(c.version, Some(HttpVersion::Http10));
        assert_eq!(c.status, Some(200));
    }

    #[test]
    fn status_without_reason() {
        let mut p = ResponseParser::new();
        let mut c = Collect::default();
        feed(&mut p, &mut c, b"HTTP/1.1 503\r\n\r\n");
        assert_eq!(c.status, Some(503));
        assert_eq!(c.reason, None);
    }

    #[test]
    fn malformed_status_rejected() {
        for line in [
            &b"HTTP/1.1 20 OK\r\n\r\n"[..],
            &b"HTTP/1.1 2000 OK\r\n\r\n"[..],
            &b"HTTP/1.1 abc OK\r\n\r\n"[..],
            &b"HTP/1.1 200 OK\r\n\r\n"[..],
        ] {
            let mut p = ResponseParser::new();
            let mut c = Collect::default();
            let mut buf = BytesMut::from(line);
            assert!(p.receive(&mut buf, &mut c).is_err(), "accepted {:?}", line);
        }
    }

    #[test]
    fn read_until_close_ends_on_eof() {
        let mut p = ResponseParser::new();
        let mut c = Collect::default();
        feed(&mut p, &mut c, b"HTTP/1.0 200 OK\r\n\r\n");
        p.set_body_mode(None, false);
        feed(&mut p, &mut c, b"some data");
        assert!(p.reading_until_close());
        p.finish_on_eof(&mut c).unwrap();
        assert_eq!(c.body, b"some data");
        assert_eq!(p.state(), ParseState::Complete);
    }

    #[test]
    fn eof_mid_fixed_body_is_error() {
        let mut p = ResponseParser::new();
        let mut c = Collect::default();
        feed(&mut p, &mut c, b"HTTP/1.1 200 OK\r\n\r\n");
        p.set_body_mode(Some(10), false);
        feed(&mut p, &mut c, b"short");
        assert!(p.finish_on_eof(&mut c).is_err());
    }

    #[test]
    fn invalid_chunk_size_rejected() {
        let mut p = ResponseParser::new();
        let mut c = Collect::default();
        feed(&mut p, &mut c, b"HTTP/1.1 200 OK\r\n\r\n");
        p.set_body_mode(None, true);
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(p.receive(&mut buf, &mut c).is_err());
    }
}
