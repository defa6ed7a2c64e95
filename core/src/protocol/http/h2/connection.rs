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

//! HTTP/2 connection multiplexer. One dedicated reader task parses frames
//! and dispatches them; all outbound bytes serialize through a single
//! writer lock. Two locks exist: the writer lock (may be held across
//! transport writes) and the state lock (stream table, settings, windows;
//! never held across I/O). When both are needed, state is taken last.
//!
//! Senders blocked on flow-control credit wait on a notifier that the
//! reader signals for WINDOW_UPDATE and SETTINGS changes.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::error::HttpError;
use crate::net::HttpStream;
use crate::protocol::http::h2::flow::{RecvWindow, SendWindow};
use crate::protocol::http::h2::frame::{self, Http2Settings};
use crate::protocol::http::h2::handler::H2FrameHandler;
use crate::protocol::http::h2::parser::H2Parser;
use crate::protocol::http::h2::stream::{StreamEntry, StreamEvent};
use crate::protocol::http::h2::writer::H2Writer;
use crate::protocol::http::h2::CONNECTION_PREFACE;
use crate::protocol::http::hpack;

/// State guarded by the connection lock.
struct Shared {
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    local_settings: Http2Settings,
    peer_settings: Http2Settings,
    settings_acked: bool,
    conn_send: SendWindow,
    conn_recv: RecvWindow,
    goaway_received: Option<u32>,
    goaway_sent: bool,
    closed: Option<String>,
    /// Highest peer-initiated (even) stream id seen, for our GOAWAY.
    last_peer_stream_id: u32,
    pings_sent: u64,
    pongs_received: u64,
    awaiting_pong_since: Option<Instant>,
    degraded_pings: u64,
}

/// State guarded by the writer lock: the transport sink, the frame buffer
/// and the HPACK encoder (its dynamic table must stay in lockstep with the
/// order header blocks hit the wire).
struct WriteState {
    sink: WriteHalf<HttpStream>,
    frames: H2Writer,
    hpack: hpack::Encoder,
}

pub struct H2Connection {
    shared: Mutex<Shared>,
    write: tokio::sync::Mutex<WriteState>,
    /// Signaled on WINDOW_UPDATE / INITIAL_WINDOW_SIZE changes.
    credit: Notify,
    /// Signaled to make the reader task exit.
    close_requested: Notify,
    ping_interval: Duration,
}

/// Caller's handle to one stream: the id, the connection, and the ordered
/// event queue filled by the reader.
pub struct H2StreamHandle {
    id: u32,
    conn: Arc<H2Connection>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    finished: bool,
}

impl H2Connection {
    /// Establish the client side of an HTTP/2 connection: send the preface
    /// and our SETTINGS, then spawn the reader task, the settings-ack
    /// watchdog, and (when configured) the keep-alive pinger.
    pub async fn start(
        stream: HttpStream,
        ping_interval: Duration,
        settings_timeout: Duration,
    ) -> io::Result<Arc<H2Connection>> {
        let (rd, mut wr) = tokio::io::split(stream);
        let local_settings = Http2Settings::default();

        let mut frames = H2Writer::new();
        frames.write_settings(&local_settings.to_wire())?;
        wr.write_all(CONNECTION_PREFACE).await?;
        wr.write_all(&frames.take_buffer()).await?;
        wr.flush().await?;

        let conn = Arc::new(H2Connection {
            shared: Mutex::new(Shared {
                streams: HashMap::new(),
                next_stream_id: 1,
                local_settings,
                peer_settings: Http2Settings::default(),
                settings_acked: false,
                conn_send: SendWindow::new(Http2Settings::default().initial_window_size),
                conn_recv: RecvWindow::new(local_settings.initial_window_size),
                goaway_received: None,
                goaway_sent: false,
                closed: None,
                last_peer_stream_id: 0,
                pings_sent: 0,
                pongs_received: 0,
                awaiting_pong_since: None,
                degraded_pings: 0,
            }),
            write: tokio::sync::Mutex::new(WriteState {
                sink: wr,
                frames,
                hpack: hpack::Encoder::new(Http2Settings::default().header_table_size as usize),
            }),
            credit: Notify::new(),
            close_requested: Notify::new(),
            ping_interval,
        });

        tokio::spawn(read_loop(conn.clone(), rd));
        tokio::spawn(settings_watchdog(conn.clone(), settings_timeout));
        if !ping_interval.is_zero() {
            tokio::spawn(ping_loop(conn.clone(), ping_interval));
        }
        Ok(conn)
    }

    pub fn active_streams(&self) -> usize {
        self.shared.lock().unwrap().streams.len()
    }

    /// May a new stream be opened here? False once closed, after GOAWAY in
    /// either direction, or at the peer's concurrency limit.
    pub fn can_accept_new_stream(&self) -> bool {
        let s = self.shared.lock().unwrap();
        s.closed.is_none()
            && s.goaway_received.is_none()
            && !s.goaway_sent
            && (s.streams.len() as u32) < s.peer_settings.max_concurrent_streams
    }

    /// Count of keep-alive pongs received (exposed for health reporting).
    pub fn pongs_received(&self) -> u64 {
        self.shared.lock().unwrap().pongs_received
    }

    /// Open a stream: allocate the id, install the table entry and write
    /// the HEADERS frame, all while holding the writer lock so stream ids
    /// hit the wire in allocation order. The state lock is taken last and
    /// released before any I/O.
    pub async fn start_stream(
        self: Arc<Self>,
        headers: Vec<(String, String)>,
        end_stream: bool,
    ) -> Result<H2StreamHandle, HttpError> {
        let mut w = self.write.lock().await;
        let (id, events) = {
            let mut s = self.shared.lock().unwrap();
            if let Some(reason) = &s.closed {
                return Err(HttpError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    reason.clone(),
                )));
            }
            if s.goaway_received.is_some() || s.goaway_sent {
                // The peer will not process new streams; the call driver
                // may replay on a fresh connection.
                return Err(HttpError::StreamReset {
                    code: frame::ERROR_REFUSED_STREAM,
                });
            }
            if s.streams.len() as u32 >= s.peer_settings.max_concurrent_streams {
                return Err(HttpError::StreamReset {
                    code: frame::ERROR_REFUSED_STREAM,
                });
            }
            let id = s.next_stream_id;
            s.next_stream_id += 2;
            let (tx, rx) = mpsc::unbounded_channel();
            let entry = StreamEntry::new(
                tx,
                s.peer_settings.initial_window_size,
                s.local_settings.initial_window_size,
                end_stream,
            );
            s.streams.insert(id, entry);
            (id, rx)
        };

        let max_frame = {
            let s = self.shared.lock().unwrap();
            s.peer_settings.max_frame_size as usize
        };
        let mut block = BytesMut::new();
        w.hpack.encode(&headers, &mut block);
        let flushed = async {
            w.frames.write_headers(id, &block, end_stream, max_frame)?;
            let buf = w.frames.take_buffer();
            w.sink.write_all(&buf).await?;
            w.sink.flush().await
        }
        .await;
        if let Err(e) = flushed {
            self.shared.lock().unwrap().streams.remove(&id);
            return Err(HttpError::Io(e));
        }
        drop(w);

        tracing::trace!(stream = id, end_stream, "opened h2 stream");
        Ok(H2StreamHandle {
            id,
            conn: self,
            events,
            finished: false,
        })
    }

    /// Send request DATA, blocking on flow-control credit. Frames never
    /// exceed min(connection window, stream window, peer max frame size).
    pub async fn send_data(&self, id: u32, data: &[u8], end_stream: bool) -> Result<(), HttpError> {
        if data.is_empty() && !end_stream {
            return Ok(());
        }
        let mut offset = 0usize;
        loop {
            let notified = self.credit.notified();
            enum Grant {
                Write(usize, bool),
                Wait,
            }
            let grant = {
                let mut s = self.shared.lock().unwrap();
                if let Some(reason) = &s.closed {
                    return Err(HttpError::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        reason.clone(),
                    )));
                }
                let max_frame = s.peer_settings.max_frame_size as usize;
                let conn_avail = s.conn_send.available();
                let entry = match s.streams.get_mut(&id) {
                    Some(e) => e,
                    None => {
                        return Err(HttpError::StreamReset {
                            code: frame::ERROR_STREAM_CLOSED,
                        })
                    }
                };
                if let Some(code) = entry.error_code() {
                    return Err(HttpError::StreamReset { code });
                }
                if let Err(code) = entry.check_send_data() {
                    return Err(HttpError::Protocol(format!(
                        "DATA on closed stream: {}",
                        frame::error_to_string(code)
                    )));
                }
                let remaining = data.len() - offset;
                if remaining == 0 {
                    // Bare END_STREAM with an empty DATA frame.
                    entry.on_send_end();
                    let closed = entry.is_closed();
                    if closed {
                        s.streams.remove(&id);
                    }
                    Grant::Write(0, true)
                } else {
                    let n = remaining
                        .min(max_frame)
                        .min(entry.send_window.available())
                        .min(conn_avail);
                    if n == 0 {
                        Grant::Wait
                    } else {
                        entry.send_window.consume(n);
                        entry.data_sent = true;
                        let is_last = end_stream && offset + n == data.len();
                        if is_last {
                            entry.on_send_end();
                            if entry.is_closed() {
                                s.streams.remove(&id);
                            }
                        }
                        s.conn_send.consume(n);
                        Grant::Write(n, is_last)
                    }
                }
            };
            match grant {
                Grant::Wait => {
                    notified.await;
                }
                Grant::Write(n, is_last) => {
                    let chunk = &data[offset..offset + n];
                    self.write_frames(|w| w.frames.write_data(id, chunk, is_last && end_stream))
                        .await
                        .map_err(HttpError::Io)?;
                    offset += n;
                    if offset == data.len() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Send trailers: a final header block with END_STREAM.
    pub async fn send_trailers(
        &self,
        id: u32,
        trailers: Vec<(String, String)>,
    ) -> Result<(), HttpError> {
        let max_frame = {
            let mut s = self.shared.lock().unwrap();
            if let Some(reason) = &s.closed {
                return Err(HttpError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    reason.clone(),
                )));
            }
            match s.streams.get_mut(&id) {
                Some(entry) => {
                    entry.on_send_end();
                    if entry.is_closed() {
                        s.streams.remove(&id);
                    }
                }
                None => {
                    return Err(HttpError::StreamReset {
                        code: frame::ERROR_STREAM_CLOSED,
                    })
                }
            }
            s.peer_settings.max_frame_size as usize
        };
        let mut w = self.write.lock().await;
        let mut block = BytesMut::new();
        w.hpack.encode(&trailers, &mut block);
        w.frames
            .write_headers(id, &block, true, max_frame)
            .map_err(HttpError::Io)?;
        let buf = w.frames.take_buffer();
        w.sink.write_all(&buf).await.map_err(HttpError::Io)?;
        w.sink.flush().await.map_err(HttpError::Io)?;
        Ok(())
    }

    /// Abort one stream. Unblocks writers, removes the table entry and
    /// sends RST_STREAM from a detached task (safe from Drop and from any
    /// thread).
    pub fn cancel_stream(self: Arc<Self>, id: u32, code: u32) {
        let existed = {
            let mut s = self.shared.lock().unwrap();
            if s.closed.is_some() {
                false
            } else {
                s.streams.remove(&id).is_some()
            }
        };
        self.credit.notify_waiters();
        if existed {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = self
                        .write_frames(|w| w.frames.write_rst_stream(id, code))
                        .await;
                });
            }
        }
    }

    /// A stream deadline fired: bump the degraded-ping counter and probe
    /// connection liveness with an out-of-band PING.
    pub fn note_stream_timeout(self: Arc<Self>) {
        let opaque = {
            let mut s = self.shared.lock().unwrap();
            if s.closed.is_some() {
                return;
            }
            s.degraded_pings += 1;
            s.pings_sent += 1;
            if s.awaiting_pong_since.is_none() {
                s.awaiting_pong_since = Some(Instant::now());
            }
            s.pings_sent
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = self.write_frames(|w| w.frames.write_ping(opaque, false)).await;
            });
        }
    }

    /// Graceful shutdown: GOAWAY with the last peer stream id we acted on;
    /// no new local streams afterwards. In-flight streams finish.
    pub async fn shutdown(&self, error_code: u32) -> io::Result<()> {
        let last = {
            let mut s = self.shared.lock().unwrap();
            if s.closed.is_some() || s.goaway_sent {
                return Ok(());
            }
            s.goaway_sent = true;
            s.last_peer_stream_id
        };
        self.write_frames(|w| w.frames.write_goaway(last, error_code, b""))
            .await
    }

    /// Immediate teardown: every stream fails with `reason`, the reader
    /// task exits and the transport is shut down. Idempotent.
    pub fn close_now(&self, reason: &str) {
        self.fail_all(reason);
        self.close_requested.notify_waiters();
    }

    fn fail_all(&self, reason: &str) {
        let mut s = self.shared.lock().unwrap();
        if s.closed.is_some() {
            return;
        }
        tracing::debug!(reason, "h2 connection failed");
        s.closed = Some(reason.to_string());
        for (_, entry) in s.streams.drain() {
            entry.push_event(StreamEvent::Failed(reason.to_string()));
        }
        drop(s);
        self.credit.notify_waiters();
    }

    /// Append frames under the writer lock and flush them to the transport.
    async fn write_frames<F>(&self, build: F) -> io::Result<()>
    where
        F: FnOnce(&mut WriteState) -> io::Result<()>,
    {
        let mut w = self.write.lock().await;
        build(&mut w)?;
        let buf = w.frames.take_buffer();
        w.sink.write_all(&buf).await?;
        w.sink.flush().await
    }
}

impl H2StreamHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connection(&self) -> &Arc<H2Connection> {
        &self.conn
    }

    /// Next stream event, in arrival order. None means the connection went
    /// away without delivering a terminal event.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.events.recv().await;
        match &event {
            Some(StreamEvent::Headers { end_stream: true, .. })
            | Some(StreamEvent::Data { end_stream: true, .. })
            | Some(StreamEvent::Trailers(_))
            | Some(StreamEvent::Reset { .. })
            | Some(StreamEvent::GoAway)
            | Some(StreamEvent::Failed(_))
            | None => self.finished = true,
            _ => {}
        }
        event
    }

    pub async fn send_data(&self, data: &[u8], end_stream: bool) -> Result<(), HttpError> {
        self.conn.send_data(self.id, data, end_stream).await
    }

    pub async fn send_trailers(&self, trailers: Vec<(String, String)>) -> Result<(), HttpError> {
        self.conn.send_trailers(self.id, trailers).await
    }

    /// Cancel the stream (RST_STREAM CANCEL). Idempotent.
    pub fn cancel(&mut self) {
        if !self.finished {
            self.finished = true;
            self.conn.clone().cancel_stream(self.id, frame::ERROR_CANCEL);
        }
    }
}

impl Drop for H2StreamHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.clone().cancel_stream(self.id, frame::ERROR_CANCEL);
        }
    }
}

// ---------------------------------------------------------------------------
// Reader task

/// Accumulates a header block across HEADERS/PUSH_PROMISE + CONTINUATION.
#[derive(Default)]
struct ContinuationState {
    active: bool,
    stream_id: u32,
    end_stream: bool,
    /// Block belongs to a refused push; decode for HPACK state, then drop.
    discard: bool,
    buf: BytesMut,
}

/// Outbound reactions collected during a parse pass; written after the
/// dispatcher returns so HPACK/state callbacks never block on the writer.
#[derive(Default)]
struct FrameActions {
    out: Vec<OutFrame>,
    /// Connection error: (code, message). GOAWAY then teardown.
    close: Option<(u32, String)>,
}

enum OutFrame {
    SettingsAck { peer_header_table_size: Option<u32> },
    Pong(u64),
    WindowUpdate { stream_id: u32, increment: u32 },
    Rst { stream_id: u32, code: u32 },
}

struct Dispatcher<'a> {
    conn: &'a Arc<H2Connection>,
    cont: &'a mut ContinuationState,
    decoder: &'a mut hpack::Decoder,
    actions: &'a mut FrameActions,
}

impl Dispatcher<'_> {
    fn connection_error(&mut self, code: u32, message: impl Into<String>) {
        if self.actions.close.is_none() {
            self.actions.close = Some((code, message.into()));
        }
    }

    /// Decode a complete header block and route it to the stream.
    fn finish_header_block(&mut self) {
        let stream_id = self.cont.stream_id;
        let end_stream = self.cont.end_stream;
        let discard = self.cont.discard;
        let block = self.cont.buf.split();
        self.cont.active = false;

        let mut headers: Vec<(String, String)> = Vec::new();
        let mut cursor: &[u8] = &block;
        if let Err(e) = self.decoder.decode(&mut cursor, &mut headers) {
            self.connection_error(
                frame::ERROR_COMPRESSION_ERROR,
                format!("HPACK decode failed: {}", e),
            );
            return;
        }
        if discard {
            return;
        }

        let mut s = self.conn.shared.lock().unwrap();
        let entry = match s.streams.get_mut(&stream_id) {
            Some(e) => e,
            None => return, // stream already reset locally
        };
        if entry.headers_received {
            entry.push_event(StreamEvent::Trailers(headers));
            entry.on_recv_end();
        } else {
            entry.headers_received = true;
            entry.push_event(StreamEvent::Headers {
                headers,
                end_stream,
            });
            if end_stream {
                entry.on_recv_end();
            }
        }
        if entry.is_closed() {
            s.streams.remove(&stream_id);
        }
    }
}

impl H2FrameHandler for Dispatcher<'_> {
    fn data_frame_received(&mut self, stream_id: u32, end_stream: bool, data: Bytes) {
        if self.cont.active {
            self.connection_error(
                frame::ERROR_PROTOCOL_ERROR,
                "DATA interleaved inside a header block",
            );
            return;
        }
        let mut s = self.conn.shared.lock().unwrap();
        // Connection window pays for every DATA frame, even discarded ones.
        if s.conn_recv.on_data(data.len()).is_err() {
            drop(s);
            self.connection_error(
                frame::ERROR_FLOW_CONTROL_ERROR,
                "connection flow-control window overrun",
            );
            return;
        }
        if let Some(increment) = s.conn_recv.replenish() {
            self.actions.out.push(OutFrame::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }
        let entry = match s.streams.get_mut(&stream_id) {
            Some(e) => e,
            None => return, // finished locally: discard silently
        };
        if entry.check_recv().is_err() {
            self.actions.out.push(OutFrame::Rst {
                stream_id,
                code: frame::ERROR_STREAM_CLOSED,
            });
            return;
        }
        if entry.recv_window.on_data(data.len()).is_err() {
            drop(s);
            self.connection_error(
                frame::ERROR_FLOW_CONTROL_ERROR,
                "stream flow-control window overrun",
            );
            return;
        }
        if !end_stream {
            if let Some(increment) = entry.recv_window.replenish() {
                self.actions.out.push(OutFrame::WindowUpdate {
                    stream_id,
                    increment,
                });
            }
        }
        entry.push_event(StreamEvent::Data { data, end_stream });
        if end_stream {
            entry.on_recv_end();
            if entry.is_closed() {
                s.streams.remove(&stream_id);
            }
        }
    }

    fn headers_frame_received(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        _stream_dependency: u32,
        _exclusive: bool,
        _weight: u8,
        header_block_fragment: Bytes,
    ) {
        if self.cont.active {
            self.connection_error(
                frame::ERROR_PROTOCOL_ERROR,
                "HEADERS interleaved inside a header block",
            );
            return;
        }
        self.cont.active = true;
        self.cont.stream_id = stream_id;
        self.cont.end_stream = end_stream;
        self.cont.discard = false;
        self.cont.buf.clear();
        self.cont.buf.extend_from_slice(&header_block_fragment);
        if end_headers {
            self.finish_header_block();
        }
    }

    fn priority_frame_received(&mut self, _stream_id: u32, _dep: u32, _excl: bool, _weight: u8) {
        // Prioritization hints are accepted and ignored.
    }

    fn rst_stream_frame_received(&mut self, stream_id: u32, error_code: u32) {
        let mut s = self.conn.shared.lock().unwrap();
        if let Some(mut entry) = s.streams.remove(&stream_id) {
            entry.on_reset(error_code);
            entry.push_event(StreamEvent::Reset { code: error_code });
        }
        drop(s);
        self.conn.credit.notify_waiters();
    }

    fn settings_frame_received(&mut self, ack: bool, settings: Vec<(u16, u32)>) {
        if ack {
            self.conn.shared.lock().unwrap().settings_acked = true;
            return;
        }
        let mut s = self.conn.shared.lock().unwrap();
        let mut table_size: Option<u32> = None;
        for (id, value) in settings {
            if id == frame::SETTINGS_HEADER_TABLE_SIZE {
                table_size = Some(value);
            }
            if let Some(old_initial) = s.peer_settings.apply(id, value) {
                let new_initial = s.peer_settings.initial_window_size;
                // Retroactive adjustment of every open stream's write
                // window; may go negative.
                for entry in s.streams.values_mut() {
                    entry.send_window.adjust_initial(old_initial, new_initial);
                }
            }
        }
        drop(s);
        self.conn.credit.notify_waiters();
        self.actions.out.push(OutFrame::SettingsAck {
            peer_header_table_size: table_size,
        });
    }

    fn push_promise_frame_received(
        &mut self,
        stream_id: u32,
        promised_stream_id: u32,
        end_headers: bool,
        header_block_fragment: Bytes,
    ) {
        if self.cont.active {
            self.connection_error(
                frame::ERROR_PROTOCOL_ERROR,
                "PUSH_PROMISE interleaved inside a header block",
            );
            return;
        }
        tracing::trace!(stream = stream_id, promised = promised_stream_id, "refusing server push");
        {
            let mut s = self.conn.shared.lock().unwrap();
            if promised_stream_id > s.last_peer_stream_id {
                s.last_peer_stream_id = promised_stream_id;
            }
        }
        // We announced ENABLE_PUSH=0; still decode the promised headers to
        // keep the HPACK context coherent, then refuse the stream.
        self.cont.active = true;
        self.cont.stream_id = promised_stream_id;
        self.cont.end_stream = false;
        self.cont.discard = true;
        self.cont.buf.clear();
        self.cont.buf.extend_from_slice(&header_block_fragment);
        if end_headers {
            self.finish_header_block();
        }
        self.actions.out.push(OutFrame::Rst {
            stream_id: promised_stream_id,
            code: frame::ERROR_CANCEL,
        });
    }

    fn ping_frame_received(&mut self, ack: bool, opaque_data: u64) {
        if ack {
            let mut s = self.conn.shared.lock().unwrap();
            s.pongs_received += 1;
            s.awaiting_pong_since = None;
        } else {
            self.actions.out.push(OutFrame::Pong(opaque_data));
        }
    }

    fn goaway_frame_received(&mut self, last_stream_id: u32, error_code: u32, debug_data: Bytes) {
        tracing::debug!(
            last_stream_id,
            code = frame::error_to_string(error_code),
            debug = %String::from_utf8_lossy(&debug_data),
            "GOAWAY received"
        );
        let mut s = self.conn.shared.lock().unwrap();
        s.goaway_received = Some(last_stream_id);
        // Streams above the threshold were never processed; they are safe
        // to replay on a new connection.
        let abandoned: Vec<u32> = s
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();
        for id in abandoned {
            if let Some(entry) = s.streams.remove(&id) {
                entry.push_event(StreamEvent::GoAway);
            }
        }
        drop(s);
        self.conn.credit.notify_waiters();
    }

    fn window_update_frame_received(&mut self, stream_id: u32, increment: u32) {
        let mut s = self.conn.shared.lock().unwrap();
        if stream_id == 0 {
            if s.conn_send.add(increment).is_err() {
                drop(s);
                self.connection_error(
                    frame::ERROR_FLOW_CONTROL_ERROR,
                    "connection send window overflow",
                );
                return;
            }
        } else if let Some(entry) = s.streams.get_mut(&stream_id) {
            if entry.send_window.add(increment).is_err() {
                self.actions.out.push(OutFrame::Rst {
                    stream_id,
                    code: frame::ERROR_FLOW_CONTROL_ERROR,
                });
                return;
            }
        }
        drop(s);
        self.conn.credit.notify_waiters();
    }

    fn continuation_frame_received(
        &mut self,
        stream_id: u32,
        end_headers: bool,
        header_block_fragment: Bytes,
    ) {
        if !self.cont.active || self.cont.stream_id != stream_id {
            self.connection_error(
                frame::ERROR_PROTOCOL_ERROR,
                "CONTINUATION outside a header block",
            );
            return;
        }
        self.cont.buf.extend_from_slice(&header_block_fragment);
        if end_headers {
            self.finish_header_block();
        }
    }

    fn frame_error(&mut self, error_code: u32, stream_id: u32, message: String) {
        if stream_id == 0 {
            self.connection_error(error_code, message);
        } else {
            tracing::debug!(stream = stream_id, code = error_code, %message, "bad frame");
            self.actions.out.push(OutFrame::Rst {
                stream_id,
                code: error_code,
            });
        }
    }
}

async fn read_loop(conn: Arc<H2Connection>, mut rd: ReadHalf<HttpStream>) {
    let mut parser = H2Parser::new();
    let mut decoder = {
        let s = conn.shared.lock().unwrap();
        hpack::Decoder::new(s.local_settings.header_table_size as usize)
    };
    let mut cont = ContinuationState::default();
    let mut buf = BytesMut::with_capacity(frame::DEFAULT_MAX_FRAME_SIZE);
    let mut tmp = [0u8; 16384];

    loop {
        let n = tokio::select! {
            _ = conn.close_requested.notified() => break,
            r = rd.read(&mut tmp) => match r {
                Ok(0) => {
                    conn.fail_all("connection closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    conn.fail_all(&format!("read failed: {}", e));
                    break;
                }
            },
        };
        buf.extend_from_slice(&tmp[..n]);

        let mut actions = FrameActions::default();
        {
            let mut dispatcher = Dispatcher {
                conn: &conn,
                cont: &mut cont,
                decoder: &mut decoder,
                actions: &mut actions,
            };
            if let Err(e) = parser.receive(&mut buf, &mut dispatcher) {
                conn.fail_all(&format!("frame parse failed: {}", e));
                break;
            }
        }
        if apply_actions(&conn, actions).await.is_err() {
            break;
        }
    }

    let mut w = conn.write.lock().await;
    let _ = w.sink.shutdown().await;
}

async fn apply_actions(conn: &Arc<H2Connection>, actions: FrameActions) -> Result<(), ()> {
    if !actions.out.is_empty() {
        let result = conn
            .write_frames(|w| {
                for frame_out in &actions.out {
                    match frame_out {
                        OutFrame::SettingsAck {
                            peer_header_table_size,
                        } => {
                            if let Some(size) = peer_header_table_size {
                                w.hpack.set_max_table_size(*size as usize);
                            }
                            w.frames.write_settings_ack()?;
                        }
                        OutFrame::Pong(opaque) => w.frames.write_ping(*opaque, true)?,
                        OutFrame::WindowUpdate {
                            stream_id,
                            increment,
                        } => w.frames.write_window_update(*stream_id, *increment)?,
                        OutFrame::Rst { stream_id, code } => {
                            w.frames.write_rst_stream(*stream_id, *code)?
                        }
                    }
                }
                Ok(())
            })
            .await;
        if result.is_err() {
            conn.fail_all("write failed");
            return Err(());
        }
    }
    if let Some((code, message)) = actions.close {
        let last = {
            let s = conn.shared.lock().unwrap();
            s.last_peer_stream_id
        };
        let _ = conn
            .write_frames(|w| w.frames.write_goaway(last, code, message.as_bytes()))
            .await;
        conn.fail_all(&format!(
            "connection error {}: {}",
            frame::error_to_string(code),
            message
        ));
        return Err(());
    }
    Ok(())
}

/// Fail the connection with SETTINGS_TIMEOUT if the peer never
/// acknowledges our SETTINGS.
async fn settings_watchdog(conn: Arc<H2Connection>, deadline: Duration) {
    tokio::time::sleep(deadline).await;
    let acked = {
        let s = conn.shared.lock().unwrap();
        s.settings_acked || s.closed.is_some()
    };
    if !acked {
        let _ = conn
            .write_frames(|w| {
                w.frames
                    .write_goaway(0, frame::ERROR_SETTINGS_TIMEOUT, b"settings ack timeout")
            })
            .await;
        conn.close_now("SETTINGS ack not received in time");
    }
}

/// Keep-alive pinger. An unacknowledged ping older than the interval marks
/// the connection dead and every stream fails with a ping timeout.
async fn ping_loop(conn: Arc<H2Connection>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let opaque = {
            let mut s = conn.shared.lock().unwrap();
            if s.closed.is_some() {
                return;
            }
            if let Some(since) = s.awaiting_pong_since {
                if since.elapsed() >= interval {
                    drop(s);
                    conn.close_now("ping timeout");
                    return;
                }
            }
            s.pings_sent += 1;
            if s.awaiting_pong_since.is_none() {
                s.awaiting_pong_since = Some(Instant::now());
            }
            s.pings_sent
        };
        if conn
            .write_frames(|w| w.frames.write_ping(opaque, false))
            .await
            .is_err()
        {
            conn.close_now("ping write failed");
            return;
        }
    }
}
