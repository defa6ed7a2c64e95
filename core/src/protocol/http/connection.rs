/*
 * connection.rs
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

//! A pooled transport connection. An HTTP/1.1 connection carries at most one
//! exchange at a time: the exchange takes the stream out and puts it back
//! when the response body has been drained. An HTTP/2 connection is shared;
//! it multiplexes up to the peer's concurrent-stream limit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::net::HttpStream;
use crate::protocol::http::h2::connection::H2Connection;
use crate::route::{Address, Route};

/// Protocol stamped on a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http2 => "HTTP/2",
        }
    }
}

/// Connection-level protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnProtocol {
    H1,
    H2,
}

pub(crate) enum ConnectionKind {
    /// Exclusive stream; None while an exchange holds it.
    H1(Mutex<Option<HttpStream>>),
    H2(Arc<H2Connection>),
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live transport connection plus its pool bookkeeping.
pub struct Connection {
    id: u64,
    address: Address,
    route: Route,
    kind: ConnectionKind,
    idle_since: Mutex<Instant>,
    reusable: AtomicBool,
}

impl Connection {
    pub(crate) fn new_h1(address: Address, route: Route, stream: HttpStream) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            route,
            kind: ConnectionKind::H1(Mutex::new(Some(stream))),
            idle_since: Mutex::new(Instant::now()),
            reusable: AtomicBool::new(true),
        }
    }

    pub(crate) fn new_h2(address: Address, route: Route, h2: Arc<H2Connection>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            route,
            kind: ConnectionKind::H2(h2),
            idle_since: Mutex::new(Instant::now()),
            reusable: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn protocol(&self) -> ConnProtocol {
        match self.kind {
            ConnectionKind::H1(_) => ConnProtocol::H1,
            ConnectionKind::H2(_) => ConnProtocol::H2,
        }
    }

    pub(crate) fn h2(&self) -> Option<&Arc<H2Connection>> {
        match &self.kind {
            ConnectionKind::H2(h2) => Some(h2),
            ConnectionKind::H1(_) => None,
        }
    }

    /// Take the H1 stream for an exclusive exchange. None when another
    /// exchange holds it or this is an H2 connection.
    pub(crate) fn take_h1_stream(&self) -> Option<HttpStream> {
        match &self.kind {
            ConnectionKind::H1(slot) => slot.lock().unwrap().take(),
            ConnectionKind::H2(_) => None,
        }
    }

    /// Return the H1 stream after a completed exchange.
    pub(crate) fn restore_h1_stream(&self, stream: HttpStream) {
        if let ConnectionKind::H1(slot) = &self.kind {
            *slot.lock().unwrap() = Some(stream);
            self.touch();
        }
    }

    /// Streams currently bound to the connection.
    pub fn active_streams(&self) -> usize {
        match &self.kind {
            ConnectionKind::H1(slot) => {
                if slot.lock().unwrap().is_some() {
                    0
                } else {
                    1
                }
            }
            ConnectionKind::H2(h2) => h2.active_streams(),
        }
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self.kind, ConnectionKind::H2(_))
    }

    pub(crate) fn touch(&self) {
        *self.idle_since.lock().unwrap() = Instant::now();
    }

    pub fn idle_duration(&self) -> Duration {
        self.idle_since.lock().unwrap().elapsed()
    }

    pub fn mark_not_reusable(&self) {
        self.reusable.store(false, Ordering::SeqCst);
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::SeqCst)
    }

    /// Eligibility for carrying a new exchange to `address`. H1 connections
    /// must be idle and pass the readable-socket probe; H2 connections must
    /// accept another stream. The probe may consume a byte from a dead
    /// socket, so a false result must lead to eviction.
    pub(crate) fn is_eligible(&self, address: &Address) -> bool {
        if !self.is_reusable() || &self.address != address {
            return false;
        }
        match &self.kind {
            ConnectionKind::H1(slot) => {
                let guard = slot.lock().unwrap();
                match guard.as_ref() {
                    Some(stream) => !stream.probe_unusable_when_idle(),
                    None => false,
                }
            }
            ConnectionKind::H2(h2) => h2.can_accept_new_stream(),
        }
    }

    /// Tear the connection down. Idempotent; in-flight H2 streams fail with
    /// the given message.
    pub(crate) fn close(&self, reason: &str) {
        self.mark_not_reusable();
        match &self.kind {
            ConnectionKind::H1(slot) => {
                // Dropping the stream closes the socket.
                let _ = slot.lock().unwrap().take();
            }
            ConnectionKind::H2(h2) => h2.close_now(reason),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol())
            .field("host", &self.address.host)
            .field("port", &self.address.port)
            .finish()
    }
}
