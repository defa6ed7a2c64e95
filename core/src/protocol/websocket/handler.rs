/*
 * handler.rs
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

//! WebSocket listener trait (push model, aligned with the HTTP event
//! listener). The connection's reader task drives these as events arrive;
//! callbacks must not block.

use crate::error::HttpError;

/// Receiver of WebSocket lifecycle and message events.
#[allow(unused_variables)]
pub trait WebSocketListener: Send {
    /// Handshake succeeded; the socket accepts outgoing messages.
    fn on_open(&mut self) {}

    /// Complete text message (reassembled from fragments, inflated when
    /// compressed). Valid only for the duration of the call.
    fn on_text(&mut self, text: &str) {}

    /// Complete binary message.
    fn on_binary(&mut self, data: &[u8]) {}

    /// Ping received; a pong is sent automatically.
    fn on_ping(&mut self, data: &[u8]) {}

    /// Pong received (for our ping or unsolicited).
    fn on_pong(&mut self, data: &[u8]) {}

    /// The peer started the closing handshake. No further messages follow.
    fn on_closing(&mut self, code: u16, reason: &str) {}

    /// Both close frames have been exchanged; the socket is done.
    fn on_closed(&mut self, code: u16, reason: &str) {}

    /// The socket failed: transport error, protocol violation, ping or
    /// close timeout. Terminal.
    fn on_failure(&mut self, error: &HttpError) {}
}
