/*
 * events.rs
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

//! Call lifecycle listener. The driver invokes these hooks in a fixed order
//! for each call:
//!
//! call_start, dns_start/end, connect_start/end,
//! secure_connect_start/end, connection_acquired,
//! request_headers_start/end, [request_body_start/end,]
//! response_headers_start/end, [response_body_start/end,]
//! connection_released, call_end | call_failed.
//!
//! Upgraded exchanges additionally see socket_sink_start/end and
//! socket_source_start/end after the response-header events. Hooks must not
//! block; they run on the calling task.

use std::net::SocketAddr;

use crate::error::HttpError;

/// Observer of one call's progress. All methods default to no-ops so
/// implementations override only what they need.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn call_start(&self, url: &str) {}
    fn dns_start(&self, host: &str) {}
    fn dns_end(&self, host: &str, addresses: &[std::net::IpAddr]) {}
    fn connect_start(&self, addr: SocketAddr) {}
    fn connect_end(&self, addr: SocketAddr) {}
    fn secure_connect_start(&self) {}
    fn secure_connect_end(&self, alpn: Option<&str>) {}
    fn connection_acquired(&self, connection_id: u64) {}
    fn request_headers_start(&self) {}
    fn request_headers_end(&self) {}
    fn request_body_start(&self) {}
    fn request_body_end(&self, bytes: u64) {}
    fn response_headers_start(&self) {}
    fn response_headers_end(&self, status: u16) {}
    fn response_body_start(&self) {}
    fn response_body_end(&self, bytes: u64) {}
    fn socket_sink_start(&self) {}
    fn socket_sink_end(&self) {}
    fn socket_source_start(&self) {}
    fn socket_source_end(&self) {}
    fn connection_released(&self, connection_id: u64) {}
    fn call_end(&self) {}
    fn call_failed(&self, error: &HttpError) {}
}

/// Listener that ignores every event.
pub struct NoopEventListener;

impl EventListener for NoopEventListener {}
