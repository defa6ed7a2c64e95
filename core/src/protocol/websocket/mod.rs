/*
 * mod.rs
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

//! WebSockets (RFC 6455) layered on the HTTP/1.1 upgrade hand-off, with
//! permessage-deflate (RFC 7692). One task owns the sink, another owns the
//! source; the public API posts messages to the outbound queue and the
//! listener receives inbound events.

pub mod client;
pub mod connection;
pub mod deflate;
pub mod frame;
pub mod handler;
pub mod handshake;

pub use connection::WebSocket;
pub use handler::WebSocketListener;
