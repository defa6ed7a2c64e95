/*
 * stream.rs
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

//! Per-stream state: the RFC 7540 §5.1 lifecycle, the flow-control windows,
//! and the event queue towards the call that owns the stream. The
//! connection keeps entries indexed by stream id; calls hold the id plus a
//! handle, so there are no ownership cycles.

use bytes::Bytes;
use tokio::sync::mpsc;

use super::flow::{RecvWindow, SendWindow};
use super::frame;

/// RFC 7540 stream states. `Idle` exists only notionally for ids not yet
/// allocated; an entry is created in `Open` (or half-closed when the
/// request had no body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Events delivered to the stream's owner, in arrival order.
#[derive(Debug)]
pub enum StreamEvent {
    Headers {
        headers: Vec<(String, String)>,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    Trailers(Vec<(String, String)>),
    /// RST_STREAM from the peer; the connection remains usable.
    Reset { code: u32 },
    /// The stream was above the peer's GOAWAY last-stream-id: it was never
    /// processed and may be replayed on a new connection.
    GoAway,
    /// Connection-level failure; every stream on it gets the same cause.
    Failed(String),
}

/// Connection-side record of one stream.
pub(crate) struct StreamEntry {
    state: StreamState,
    events: mpsc::UnboundedSender<StreamEvent>,
    pub send_window: SendWindow,
    pub recv_window: RecvWindow,
    /// Response HEADERS seen; a later header block is trailers.
    pub headers_received: bool,
    /// Any request DATA transmitted; REFUSED_STREAM stops being retryable
    /// once true.
    pub data_sent: bool,
    /// First error recorded wins; simultaneous closes keep it.
    error_code: Option<u32>,
}

impl StreamEntry {
    pub fn new(
        events: mpsc::UnboundedSender<StreamEvent>,
        send_initial: u32,
        recv_initial: u32,
        local_end: bool,
    ) -> Self {
        Self {
            state: if local_end {
                StreamState::HalfClosedLocal
            } else {
                StreamState::Open
            },
            events,
            send_window: SendWindow::new(send_initial),
            recv_window: RecvWindow::new(recv_initial),
            headers_received: false,
            data_sent: false,
            error_code: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn error_code(&self) -> Option<u32> {
        self.error_code
    }

    /// Queue an event towards the owner. Errors (owner dropped the handle)
    /// are ignored; cleanup happens through cancellation.
    pub fn push_event(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// May we transmit DATA? Sending on a locally closed stream is a
    /// protocol error (STREAM_CLOSED).
    pub fn check_send_data(&self) -> Result<(), u32> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedRemote => Ok(()),
            _ => Err(frame::ERROR_STREAM_CLOSED),
        }
    }

    /// Local endpoint finished sending (END_STREAM flag went out).
    pub fn on_send_end(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// Peer frames are acceptable only before it half-closed its side.
    pub fn check_recv(&self) -> Result<(), u32> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => Ok(()),
            StreamState::HalfClosedRemote | StreamState::Closed => {
                Err(frame::ERROR_STREAM_CLOSED)
            }
            StreamState::Idle => Err(frame::ERROR_PROTOCOL_ERROR),
        }
    }

    /// Peer finished sending (END_STREAM flag arrived).
    pub fn on_recv_end(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// RST_STREAM in either direction. The first recorded error code is
    /// preserved on simultaneous closes.
    pub fn on_reset(&mut self, code: u32) {
        if self.error_code.is_none() {
            self.error_code = Some(code);
        }
        self.state = StreamState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}
