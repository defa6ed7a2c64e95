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

//! HTTP engine: request/response model, the HTTP/1.1 exchange with its
//! upgrade hand-off, and the HTTP/2 multiplexer with its own frame parser
//! and HPACK (no external h2 crate). Buffers use the `bytes` crate
//! (BytesMut for parse buffers, Bytes for payload slices).

pub mod headers;
pub mod request;
pub mod response;

pub mod h1;
pub mod h2;
pub mod hpack;

pub mod connection;

pub use connection::{ConnProtocol, Connection, HttpVersion};
pub use headers::Headers;
pub use request::{Attachments, Method, Request, RequestBody};
pub use response::{Body, Response};
