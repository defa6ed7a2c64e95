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

//! WebSocket connection after a successful handshake. One task owns the
//! sink and drains the outbound queue; another owns the source, reassembles
//! messages and drives the listener. Sending is "post to the queue": it
//! returns false once the queue byte cap is reached, and a close drains
//! queued messages before the close frame goes out. Initiating close arms
//! a hard-cancel timer; if the peer never answers, the socket is cancelled
//! and the listener sees on_closing (if pending) plus on_failure.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::call::CancelHandle;
use crate::error::{HttpError, HttpResult};
use crate::net::HttpStream;
use crate::protocol::websocket::deflate::{MessageDeflater, MessageInflater};
use crate::protocol::websocket::frame::{
    encode_frame, is_control, FrameParser, OP_BINARY, OP_CLOSE, OP_CONTINUATION, OP_PING,
    OP_PONG, OP_TEXT,
};
use crate::protocol::websocket::handler::WebSocketListener;
use crate::protocol::websocket::handshake::DeflateConfig;

/// Outbound queue byte cap; `send` returns false above it.
pub const MAX_QUEUE_SIZE: usize = 16 * 1024 * 1024;

/// Largest reassembled message we accept.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Close code reported when the peer's close frame carried none.
const CLOSE_NO_STATUS: u16 = 1005;

enum Outbound {
    Message { opcode: u8, payload: Vec<u8> },
    Pong(Vec<u8>),
    Ping(Vec<u8>),
    Close { code: u16, reason: String },
}

struct WsShared {
    queue_bytes: AtomicUsize,
    enqueued_close: AtomicBool,
    sent_close: AtomicBool,
    received_close: AtomicBool,
    finished: AtomicBool,
    closing_fired: AtomicBool,
    timer_started: AtomicBool,
    pongs_received: AtomicU64,
    awaiting_pong_since: Mutex<Option<Instant>>,
    requested_close: Mutex<Option<(u16, String)>>,
    peer_close: Mutex<Option<(u16, String)>>,
    cancel: CancelHandle,
    listener: Mutex<Box<dyn WebSocketListener + Send>>,
    close_timeout: Duration,
    ping_interval: Duration,
}

impl WsShared {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Terminal failure: cancel both tasks and notify the listener once.
    fn fail(&self, error: HttpError) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(error = %error, "websocket failed");
        self.cancel.cancel();
        self.listener.lock().unwrap().on_failure(&error);
    }

    /// Both close frames exchanged: clean shutdown.
    fn maybe_finish_closed(&self) {
        if !(self.sent_close.load(Ordering::SeqCst) && self.received_close.load(Ordering::SeqCst)) {
            return;
        }
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let (code, reason) = self
            .peer_close
            .lock()
            .unwrap()
            .clone()
            .or_else(|| self.requested_close.lock().unwrap().clone())
            .unwrap_or((CLOSE_NO_STATUS, String::new()));
        self.listener.lock().unwrap().on_closed(code, &reason);
    }
}

/// Public handle. Clones share the same socket.
#[derive(Clone)]
pub struct WebSocket {
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<WsShared>,
}

impl WebSocket {
    /// Wire up the reader/writer tasks over an upgraded transport. Bytes
    /// the HTTP exchange over-read are replayed before the socket is read.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        stream: HttpStream,
        leftover: Bytes,
        listener: Box<dyn WebSocketListener + Send>,
        deflate: Option<DeflateConfig>,
        minimum_deflate_size: usize,
        ping_interval: Duration,
        close_timeout: Duration,
    ) -> WebSocket {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(WsShared {
            queue_bytes: AtomicUsize::new(0),
            enqueued_close: AtomicBool::new(false),
            sent_close: AtomicBool::new(false),
            received_close: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            closing_fired: AtomicBool::new(false),
            timer_started: AtomicBool::new(false),
            pongs_received: AtomicU64::new(0),
            awaiting_pong_since: Mutex::new(None),
            requested_close: Mutex::new(None),
            peer_close: Mutex::new(None),
            cancel: CancelHandle::new(),
            listener: Mutex::new(listener),
            close_timeout,
            ping_interval,
        });

        shared.listener.lock().unwrap().on_open();

        let (rd, wr) = tokio::io::split(stream);
        let deflater = deflate.map(|cfg| MessageDeflater::new(cfg.client_no_context_takeover));
        let inflater = deflate.map(|cfg| MessageInflater::new(cfg.server_no_context_takeover));

        tokio::spawn(writer_task(
            wr,
            outbound_rx,
            shared.clone(),
            deflater,
            minimum_deflate_size,
        ));
        tokio::spawn(reader_task(rd, leftover, shared.clone(), outbound_tx.clone(), inflater));
        if !ping_interval.is_zero() {
            tokio::spawn(ping_task(shared.clone(), outbound_tx.clone()));
        }

        WebSocket {
            outbound: outbound_tx,
            shared,
        }
    }

    /// Queue a text message. False when the socket is closing/failed or the
    /// outbound queue byte cap is exceeded (stop enqueuing until it
    /// drains).
    pub fn send_text(&self, text: &str) -> bool {
        self.enqueue(OP_TEXT, text.as_bytes().to_vec())
    }

    /// Queue a binary message.
    pub fn send_binary(&self, data: &[u8]) -> bool {
        self.enqueue(OP_BINARY, data.to_vec())
    }

    /// Queue an unsolicited ping.
    pub fn send_ping(&self, payload: &[u8]) -> bool {
        if payload.len() > 125 || self.shared.is_finished() {
            return false;
        }
        self.outbound.send(Outbound::Ping(payload.to_vec())).is_ok()
    }

    fn enqueue(&self, opcode: u8, payload: Vec<u8>) -> bool {
        if self.shared.is_finished() || self.shared.enqueued_close.load(Ordering::SeqCst) {
            return false;
        }
        let len = payload.len();
        let prev = self.shared.queue_bytes.fetch_add(len, Ordering::SeqCst);
        if prev + len > MAX_QUEUE_SIZE {
            self.shared.queue_bytes.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        if self.outbound.send(Outbound::Message { opcode, payload }).is_err() {
            self.shared.queue_bytes.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Begin the closing handshake: queued messages drain first, then the
    /// close frame goes out, and the hard-cancel timer arms. Returns false
    /// when a close was already requested. Codes 1000-4999; the reason must
    /// fit in 123 UTF-8 bytes.
    pub fn close(&self, code: u16, reason: &str) -> HttpResult<bool> {
        if !(1000..=4999).contains(&code) {
            return Err(HttpError::MalformedRequest(format!(
                "invalid close code: {}",
                code
            )));
        }
        if reason.len() > 123 {
            return Err(HttpError::MalformedRequest(
                "close reason must fit in 123 bytes".into(),
            ));
        }
        if self.shared.is_finished() || self.shared.enqueued_close.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        *self.shared.requested_close.lock().unwrap() = Some((code, reason.to_string()));
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.arm_hard_cancel_timer();
        Ok(true)
    }

    /// Tear the socket down immediately, discarding queued messages.
    pub fn cancel(&self) {
        self.shared.fail(HttpError::Canceled);
    }

    /// Bytes currently queued for sending.
    pub fn queue_size(&self) -> usize {
        self.shared.queue_bytes.load(Ordering::SeqCst)
    }

    /// Keep-alive pongs received so far.
    pub fn pongs_received(&self) -> u64 {
        self.shared.pongs_received.load(Ordering::SeqCst)
    }

    fn arm_hard_cancel_timer(&self) {
        if self.shared.timer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.close_timeout).await;
            if shared.is_finished() {
                return;
            }
            if !shared.closing_fired.swap(true, Ordering::SeqCst) {
                let (code, reason) = shared
                    .requested_close
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or((CLOSE_NO_STATUS, String::new()));
                shared.listener.lock().unwrap().on_closing(code, &reason);
            }
            shared.fail(HttpError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "close handshake timed out",
            )));
        });
    }
}

async fn writer_task(
    mut wr: WriteHalf<HttpStream>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<WsShared>,
    mut deflater: Option<MessageDeflater>,
    minimum_deflate_size: usize,
) {
    loop {
        let item = tokio::select! {
            _ = shared.cancel.wait() => return,
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        let result = match item {
            Outbound::Message { opcode, payload } => {
                shared.queue_bytes.fetch_sub(payload.len(), Ordering::SeqCst);
                if shared.sent_close.load(Ordering::SeqCst) {
                    continue;
                }
                let (payload, rsv1) = match &mut deflater {
                    Some(d) if payload.len() >= minimum_deflate_size => match d.compress(&payload) {
                        Ok(compressed) => (compressed, true),
                        Err(e) => {
                            shared.fail(HttpError::Io(e));
                            return;
                        }
                    },
                    _ => (payload, false),
                };
                write_frame(&mut wr, opcode, &payload, rsv1).await
            }
            Outbound::Pong(payload) => {
                if shared.sent_close.load(Ordering::SeqCst) {
                    continue;
                }
                write_frame(&mut wr, OP_PONG, &payload, false).await
            }
            Outbound::Ping(payload) => {
                if shared.sent_close.load(Ordering::SeqCst) {
                    continue;
                }
                write_frame(&mut wr, OP_PING, &payload, false).await
            }
            Outbound::Close { code, reason } => {
                if shared.sent_close.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let mut payload = Vec::with_capacity(2 + reason.len());
                payload.extend_from_slice(&code.to_be_bytes());
                payload.extend_from_slice(reason.as_bytes());
                let result = write_frame(&mut wr, OP_CLOSE, &payload, false).await;
                if result.is_ok() {
                    shared.maybe_finish_closed();
                }
                result
            }
        };
        if let Err(e) = result {
            shared.fail(HttpError::Io(e));
            return;
        }
    }
}

async fn write_frame(
    wr: &mut WriteHalf<HttpStream>,
    opcode: u8,
    payload: &[u8],
    rsv1: bool,
) -> io::Result<()> {
    let mut mask_key = [0u8; 4];
    getrandom::getrandom(&mut mask_key)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let mut out = BytesMut::with_capacity(14 + payload.len());
    encode_frame(opcode, payload, &mask_key, rsv1, &mut out)?;
    wr.write_all(&out).await?;
    wr.flush().await
}

async fn reader_task(
    mut rd: ReadHalf<HttpStream>,
    leftover: Bytes,
    shared: Arc<WsShared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    mut inflater: Option<MessageInflater>,
) {
    let mut buf = BytesMut::from(&leftover[..]);
    let mut parser = FrameParser::new();
    // In-flight fragmented message: (opcode, compressed, data).
    let mut message: Option<(u8, bool, BytesMut)> = None;

    loop {
        loop {
            let frame = match parser.next_frame(&mut buf) {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    shared.fail(HttpError::Protocol(e.to_string()));
                    return;
                }
            };
            if is_control(frame.opcode) {
                match frame.opcode {
                    OP_CLOSE => {
                        let (code, reason) = parse_close_payload(&frame.payload);
                        *shared.peer_close.lock().unwrap() = Some((code, reason.clone()));
                        shared.received_close.store(true, Ordering::SeqCst);
                        if !shared.closing_fired.swap(true, Ordering::SeqCst) {
                            shared.listener.lock().unwrap().on_closing(code, &reason);
                        }
                        if !shared.enqueued_close.swap(true, Ordering::SeqCst) {
                            let echo = if code == CLOSE_NO_STATUS { 1000 } else { code };
                            let _ = outbound.send(Outbound::Close {
                                code: echo,
                                reason: String::new(),
                            });
                        }
                        shared.maybe_finish_closed();
                        if shared.is_finished() {
                            return;
                        }
                    }
                    OP_PING => {
                        shared.listener.lock().unwrap().on_ping(&frame.payload);
                        let _ = outbound.send(Outbound::Pong(frame.payload.to_vec()));
                    }
                    OP_PONG => {
                        shared.pongs_received.fetch_add(1, Ordering::SeqCst);
                        *shared.awaiting_pong_since.lock().unwrap() = None;
                        shared.listener.lock().unwrap().on_pong(&frame.payload);
                    }
                    _ => {}
                }
                continue;
            }

            // Data frames: reassemble fragments, control frames may
            // interleave between them.
            match frame.opcode {
                OP_TEXT | OP_BINARY => {
                    if message.is_some() {
                        shared.fail(HttpError::Protocol(
                            "new data frame inside a fragmented message".into(),
                        ));
                        return;
                    }
                    if frame.rsv1 && inflater.is_none() {
                        shared.fail(HttpError::Protocol(
                            "compressed frame without negotiated extension".into(),
                        ));
                        return;
                    }
                    message = Some((frame.opcode, frame.rsv1, frame.payload));
                }
                OP_CONTINUATION => {
                    match &mut message {
                        Some((_, _, data)) => {
                            if data.len() + frame.payload.len() > MAX_MESSAGE_SIZE {
                                shared.fail(HttpError::Protocol("message too large".into()));
                                return;
                            }
                            data.extend_from_slice(&frame.payload);
                        }
                        None => {
                            shared.fail(HttpError::Protocol(
                                "continuation without a started message".into(),
                            ));
                            return;
                        }
                    }
                }
                other => {
                    shared.fail(HttpError::Protocol(format!("unknown opcode: {}", other)));
                    return;
                }
            }
            if frame.fin {
                let (opcode, compressed, data) = message.take().expect("message in flight");
                let payload: Vec<u8> = if compressed {
                    match inflater
                        .as_mut()
                        .expect("checked above")
                        .decompress(&data, MAX_MESSAGE_SIZE)
                    {
                        Ok(p) => p,
                        Err(e) => {
                            shared.fail(HttpError::Protocol(format!("inflate failed: {}", e)));
                            return;
                        }
                    }
                } else {
                    data.to_vec()
                };
                let mut listener = shared.listener.lock().unwrap();
                if opcode == OP_TEXT {
                    match std::str::from_utf8(&payload) {
                        Ok(text) => listener.on_text(text),
                        Err(_) => {
                            drop(listener);
                            shared.fail(HttpError::Protocol(
                                "text message is not valid UTF-8".into(),
                            ));
                            return;
                        }
                    }
                } else {
                    listener.on_binary(&payload);
                }
            }
        }

        let mut tmp = [0u8; 8192];
        let n = tokio::select! {
            _ = shared.cancel.wait() => return,
            r = rd.read(&mut tmp) => match r {
                Ok(n) => n,
                Err(e) => {
                    shared.fail(HttpError::Io(e));
                    return;
                }
            },
        };
        if n == 0 {
            if !shared.is_finished() {
                shared.fail(HttpError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the socket without a close frame",
                )));
            }
            return;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).to_string();
        (code, reason)
    } else {
        (CLOSE_NO_STATUS, String::new())
    }
}

/// Keep-alive pings. An unacknowledged ping older than the interval fails
/// the socket with a timeout carrying the count of successful pongs.
async fn ping_task(shared: Arc<WsShared>, outbound: mpsc::UnboundedSender<Outbound>) {
    let interval = shared.ping_interval;
    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = shared.cancel.wait() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if shared.is_finished() {
            return;
        }
        let overdue = {
            let awaiting = shared.awaiting_pong_since.lock().unwrap();
            matches!(*awaiting, Some(t) if t.elapsed() >= interval)
        };
        if overdue {
            let pongs = shared.pongs_received.load(Ordering::SeqCst);
            shared.fail(HttpError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "sent ping but did not receive pong within {:?} (after {} successful ping/pongs)",
                    interval, pongs
                ),
            )));
            return;
        }
        sent += 1;
        {
            let mut awaiting = shared.awaiting_pong_since.lock().unwrap();
            if awaiting.is_none() {
                *awaiting = Some(Instant::now());
            }
        }
        if outbound.send(Outbound::Ping(sent.to_be_bytes().to_vec())).is_err() {
            return;
        }
    }
}
