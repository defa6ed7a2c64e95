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

//! HTTP/2 engine (RFC 7540): our own frame parser and writer, flow-control
//! windows, per-stream state machines, and the connection multiplexer.
//! HPACK lives in the sibling `hpack` module.

pub mod connection;
pub mod flow;
pub mod frame;
pub mod handler;
pub mod parser;
pub mod stream;
pub mod writer;

pub use connection::{H2Connection, H2StreamHandle};
pub use handler::H2FrameHandler;
pub use parser::H2Parser;
pub use stream::{StreamEvent, StreamState};
pub use writer::H2Writer;

/// HTTP/2 connection preface (PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
