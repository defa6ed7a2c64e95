/*
 * lib.rs
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

//! Staffetta core: the protocol engine that turns a logical request into bytes
//! on a transport connection and a logical response from bytes, sharing
//! transport connections across many concurrent calls.
//!
//! - HTTP/1.1: exchange engine with chunked transfer and the 101 upgrade
//!   hand-off (`protocol::http::h1`).
//! - HTTP/2: frame codec, HPACK, flow control, stream state machines and the
//!   connection multiplexer (`protocol::http::h2`, `protocol::http::hpack`).
//! - WebSockets over the upgrade path, with permessage-deflate
//!   (`protocol::websocket`).
//! - Connection pool and route planner (`pool`, `route`) driven by the call
//!   orchestrator (`call`).

pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod uri;

pub mod protocol;

pub mod call;
pub mod pool;
pub mod route;

pub use call::{Call, CancelHandle, HttpClient};
pub use config::{ClientConfig, Protocol};
pub use error::{HttpError, HttpResult, TimeoutKind};
pub use events::EventListener;
pub use uri::HttpUrl;

pub use protocol::http::request::{Attachments, Method, Request, RequestBody};
pub use protocol::http::response::{Body, Response};
pub use protocol::websocket::{WebSocket, WebSocketListener};
