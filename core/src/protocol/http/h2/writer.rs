/*
 * writer.rs
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

//! HTTP/2 frame writer: serializes frames into a buffer. The connection's
//! writer lock owns one of these; whoever holds the lock appends frames and
//! then flushes `take_buffer` to the transport.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;

use super::frame::*;

/// Writes HTTP/2 frames into a BytesMut. The caller sends the buffer to the
/// transport.
pub struct H2Writer {
    buf: BytesMut,
}

impl H2Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE + FRAME_HEADER_LENGTH),
        }
    }

    fn write_frame_header(&mut self, length: usize, frame_type: u8, flags: u8, stream_id: u32) {
        self.buf.put_u8((length >> 16) as u8);
        self.buf.put_u8((length >> 8) as u8);
        self.buf.put_u8(length as u8);
        self.buf.put_u8(frame_type);
        self.buf.put_u8(flags);
        self.buf.put_u32(stream_id & 0x7fff_ffff);
    }

    /// Append a DATA frame. The caller is responsible for honoring flow
    /// control and the peer's max frame size.
    pub fn write_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> io::Result<()> {
        if stream_id == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "DATA frame stream_id must be non-zero",
            ));
        }
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.write_frame_header(data.len(), TYPE_DATA, flags, stream_id);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Append a header block as one HEADERS frame, splitting the tail into
    /// CONTINUATION frames when it exceeds `max_frame_size`. The block must
    /// already be HPACK-encoded.
    pub fn write_headers(
        &mut self,
        stream_id: u32,
        header_block: &[u8],
        end_stream: bool,
        max_frame_size: usize,
    ) -> io::Result<()> {
        if stream_id == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "HEADERS frame stream_id must be non-zero",
            ));
        }
        let max = max_frame_size.max(MIN_MAX_FRAME_SIZE);
        let mut flags = 0u8;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        let first_len = header_block.len().min(max);
        let rest = &header_block[first_len..];
        if rest.is_empty() {
            flags |= FLAG_END_HEADERS;
        }
        self.write_frame_header(first_len, TYPE_HEADERS, flags, stream_id);
        self.buf.extend_from_slice(&header_block[..first_len]);

        let mut remaining = rest;
        while !remaining.is_empty() {
            let chunk_len = remaining.len().min(max);
            let flags = if chunk_len == remaining.len() { FLAG_END_HEADERS } else { 0 };
            self.write_frame_header(chunk_len, TYPE_CONTINUATION, flags, stream_id);
            self.buf.extend_from_slice(&remaining[..chunk_len]);
            remaining = &remaining[chunk_len..];
        }
        Ok(())
    }

    pub fn write_rst_stream(&mut self, stream_id: u32, error_code: u32) -> io::Result<()> {
        if stream_id == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "RST_STREAM stream_id must be non-zero",
            ));
        }
        self.write_frame_header(4, TYPE_RST_STREAM, 0, stream_id);
        self.buf.put_u32(error_code);
        Ok(())
    }

    pub fn write_settings(&mut self, settings: &[(u16, u32)]) -> io::Result<()> {
        self.write_frame_header(settings.len() * 6, TYPE_SETTINGS, 0, 0);
        for (id, value) in settings {
            self.buf.put_u16(*id);
            self.buf.put_u32(*value);
        }
        Ok(())
    }

    pub fn write_settings_ack(&mut self) -> io::Result<()> {
        self.write_frame_header(0, TYPE_SETTINGS, FLAG_ACK, 0);
        Ok(())
    }

    pub fn write_ping(&mut self, opaque_data: u64, ack: bool) -> io::Result<()> {
        let flags = if ack { FLAG_ACK } else { 0 };
        self.write_frame_header(8, TYPE_PING, flags, 0);
        self.buf.put_u64(opaque_data);
        Ok(())
    }

    pub fn write_goaway(
        &mut self,
        last_stream_id: u32,
        error_code: u32,
        debug_data: &[u8],
    ) -> io::Result<()> {
        self.write_frame_header(8 + debug_data.len(), TYPE_GOAWAY, 0, 0);
        self.buf.put_u32(last_stream_id & 0x7fff_ffff);
        self.buf.put_u32(error_code);
        self.buf.extend_from_slice(debug_data);
        Ok(())
    }

    /// WINDOW_UPDATE for the connection (stream_id 0) or one stream.
    pub fn write_window_update(&mut self, stream_id: u32, increment: u32) -> io::Result<()> {
        if increment == 0 || increment > 0x7fff_ffff {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "WINDOW_UPDATE increment out of range",
            ));
        }
        self.write_frame_header(4, TYPE_WINDOW_UPDATE, 0, stream_id);
        self.buf.put_u32(increment);
        Ok(())
    }

    /// Take the accumulated frames. The writer stays usable.
    pub fn take_buffer(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for H2Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http::h2::parser::tests::parse_all;

    fn written(f: impl FnOnce(&mut H2Writer)) -> Bytes {
        let mut w = H2Writer::new();
        f(&mut w);
        w.take_buffer()
    }

    #[test]
    fn data_round_trip() {
        let bytes = written(|w| w.write_data(3, b"payload", true).unwrap());
        let h = parse_all(&bytes);
        assert_eq!(h.data.len(), 1);
        let (id, end, data) = &h.data[0];
        assert_eq!(*id, 3);
        assert!(end);
        assert_eq!(data.as_ref(), b"payload");
    }

    #[test]
    fn headers_round_trip() {
        let block = vec![0x82u8, 0x87, 0x84];
        let bytes = written(|w| w.write_headers(5, &block, false, DEFAULT_MAX_FRAME_SIZE).unwrap());
        let h = parse_all(&bytes);
        assert_eq!(h.headers.len(), 1);
        let (id, end_stream, end_headers, got) = &h.headers[0];
        assert_eq!(*id, 5);
        assert!(!end_stream);
        assert!(end_headers);
        assert_eq!(got.as_ref(), &block[..]);
        assert!(h.continuations.is_empty());
    }

    #[test]
    fn large_header_block_splits_into_continuation() {
        let block = vec![0u8; MIN_MAX_FRAME_SIZE * 2 + 100];
        let bytes = written(|w| w.write_headers(1, &block, true, MIN_MAX_FRAME_SIZE).unwrap());
        let h = parse_all(&bytes);
        assert_eq!(h.headers.len(), 1);
        assert!(!h.headers[0].2, "first frame must not carry END_HEADERS");
        assert_eq!(h.continuations.len(), 2);
        assert!(!h.continuations[0].1);
        assert!(h.continuations[1].1, "last continuation carries END_HEADERS");
        let total = h.headers[0].3.len() + h.continuations[0].2.len() + h.continuations[1].2.len();
        assert_eq!(total, block.len());
    }

    #[test]
    fn rst_stream_round_trip() {
        let bytes = written(|w| w.write_rst_stream(7, ERROR_CANCEL).unwrap());
        let h = parse_all(&bytes);
        assert_eq!(h.rst, vec![(7, ERROR_CANCEL)]);
    }

    #[test]
    fn settings_round_trip() {
        let settings = vec![(SETTINGS_INITIAL_WINDOW_SIZE, 16384), (SETTINGS_ENABLE_PUSH, 0)];
        let bytes = written(|w| w.write_settings(&settings).unwrap());
        let h = parse_all(&bytes);
        assert_eq!(h.settings.len(), 1);
        assert!(!h.settings[0].0);
        assert_eq!(h.settings[0].1, settings);
    }

    #[test]
    fn settings_ack_round_trip() {
        let bytes = written(|w| w.write_settings_ack().unwrap());
        let h = parse_all(&bytes);
        assert!(h.settings[0].0);
        assert!(h.settings[0].1.is_empty());
    }

    #[test]
    fn ping_round_trip() {
        let bytes = written(|w| w.write_ping(0xdead_beef_cafe_f00d, false).unwrap());
        let h = parse_all(&bytes);
        assert_eq!(h.pings, vec![(false, 0xdead_beef_cafe_f00d)]);
    }

    #[test]
    fn goaway_round_trip() {
        let bytes = written(|w| w.write_goaway(9, ERROR_NO_ERROR, b"bye").unwrap());
        let h = parse_all(&bytes);
        assert_eq!(h.goaways.len(), 1);
        assert_eq!(h.goaways[0].0, 9);
        assert_eq!(h.goaways[0].2.as_ref(), b"bye");
    }

    #[test]
    fn window_update_round_trip() {
        let bytes = written(|w| w.write_window_update(0, 32768).unwrap());
        let h = parse_all(&bytes);
        assert_eq!(h.window_updates, vec![(0, 32768)]);
    }

    #[test]
    fn window_update_rejects_zero() {
        let mut w = H2Writer::new();
        assert!(w.write_window_update(1, 0).is_err());
    }

    #[test]
    fn zero_stream_id_rejected_for_stream_frames() {
        let mut w = H2Writer::new();
        assert!(w.write_data(0, b"x", false).is_err());
        assert!(w.write_headers(0, b"x", false, DEFAULT_MAX_FRAME_SIZE).is_err());
        assert!(w.write_rst_stream(0, ERROR_CANCEL).is_err());
    }
}
