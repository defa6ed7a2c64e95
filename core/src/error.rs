/*
 * error.rs
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

//! Error taxonomy for the call driver. Kinds map onto recovery policies:
//! malformed input is fatal before I/O, connect failures advance the route
//! planner, protocol errors poison the connection, REFUSED_STREAM resets are
//! retryable on a fresh connection when the body can be replayed.
//!
//! Protocol internals (parsers, framers) keep the `io::Error` convention;
//! the driver wraps them at the call boundary.

use std::fmt;
use std::io;

use crate::protocol::http::h2::frame;

/// Which configured deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Read,
    Write,
    Call,
    Ping,
}

impl TimeoutKind {
    fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Read => "read",
            TimeoutKind::Write => "write",
            TimeoutKind::Call => "call",
            TimeoutKind::Ping => "ping",
        }
    }
}

/// Error surfaced by a call. See the module docs for the recovery policy
/// attached to each kind.
#[derive(Debug)]
pub enum HttpError {
    /// Bad URL or invalid header; raised before any I/O.
    MalformedRequest(String),
    /// Name resolution failed for every proxy candidate.
    Dns { host: String, source: io::Error },
    /// TCP or TLS connect failed for a route.
    Connect { addr: String, source: io::Error },
    /// Peer violated the wire protocol; the connection was closed.
    Protocol(String),
    /// Peer violated flow control; the connection was closed with
    /// FLOW_CONTROL_ERROR.
    FlowControl(String),
    /// The peer reset one HTTP/2 stream; the connection remains usable.
    StreamReset { code: u32 },
    /// A configured deadline fired. The call was cancelled; read/write/ping
    /// timeouts also close the connection.
    Timeout(TimeoutKind),
    /// The caller cancelled the call. Not a failure.
    Canceled,
    /// Transport I/O failure, including premature EOF while reading a body.
    Io(io::Error),
}

impl HttpError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        HttpError::Protocol(message.into())
    }

    /// True when the failure may be retried on a new connection, provided the
    /// request body is replayable and no response bytes were observed.
    pub fn retryable_on_new_route(&self) -> bool {
        match self {
            HttpError::Connect { .. } => true,
            HttpError::Dns { .. } => false,
            HttpError::StreamReset { code } => *code == frame::ERROR_REFUSED_STREAM,
            HttpError::Io(e) => e.kind() == io::ErrorKind::ConnectionReset,
            _ => false,
        }
    }

    /// True for cancellation, which callers surface differently from failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HttpError::Canceled)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::MalformedRequest(m) => write!(f, "malformed request: {}", m),
            HttpError::Dns { host, source } => write!(f, "DNS lookup for {} failed: {}", host, source),
            HttpError::Connect { addr, source } => write!(f, "connect to {} failed: {}", addr, source),
            HttpError::Protocol(m) => write!(f, "protocol error: {}", m),
            HttpError::FlowControl(m) => write!(f, "flow control error: {}", m),
            HttpError::StreamReset { code } => {
                write!(f, "stream reset: {}", frame::error_to_string(*code))
            }
            HttpError::Timeout(kind) => write!(f, "{} timeout", kind.as_str()),
            HttpError::Canceled => write!(f, "call canceled"),
            HttpError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HttpError::Dns { source, .. } | HttpError::Connect { source, .. } | HttpError::Io(source) => {
                Some(source)
            }
            _ => None,
        }
    }
}

impl From<io::Error> for HttpError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => HttpError::Timeout(TimeoutKind::Read),
            io::ErrorKind::Interrupted => HttpError::Canceled,
            _ => HttpError::Io(e),
        }
    }
}

pub type HttpResult<T> = Result<T, HttpError>;
