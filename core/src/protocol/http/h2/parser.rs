/*
 * parser.rs
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

//! HTTP/2 frame push parser: consumes complete frames from a buffer and
//! dispatches them to an H2FrameHandler. The reserved bit of the stream id
//! is masked off; unknown frame types are ignored per RFC 7540 §4.1.

use bytes::{Buf, Bytes, BytesMut};
use std::io;

use super::frame::*;
use super::handler::H2FrameHandler;

/// Push parser for HTTP/2 frames. Feed bytes via `receive`; the handler is
/// invoked for each complete frame. Partial frame data stays in the buffer.
pub struct H2Parser {
    max_frame_size: usize,
}

impl H2Parser {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Raise the acceptable frame size after we advertise a larger
    /// SETTINGS_MAX_FRAME_SIZE. Out-of-range values are clamped.
    pub fn set_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size.clamp(MIN_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE);
    }

    /// Consume as many complete frames as possible from buf.
    pub fn receive<H: H2FrameHandler>(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut H,
    ) -> Result<(), io::Error> {
        while buf.len() >= FRAME_HEADER_LENGTH {
            let length = (buf[0] as usize) << 16 | (buf[1] as usize) << 8 | (buf[2] as usize);
            if length > self.max_frame_size {
                handler.frame_error(
                    ERROR_FRAME_SIZE_ERROR,
                    0,
                    format!("frame size {} exceeds max {}", length, self.max_frame_size),
                );
                return Ok(());
            }
            if buf.len() < FRAME_HEADER_LENGTH + length {
                return Ok(());
            }
            let frame_type = buf[3];
            let flags = buf[4];
            let stream_id = ((buf[5] & 0x7f) as u32) << 24
                | (buf[6] as u32) << 16
                | (buf[7] as u32) << 8
                | (buf[8] as u32);

            buf.advance(FRAME_HEADER_LENGTH);
            let payload = buf.split_to(length).freeze();

            dispatch_frame(frame_type, flags, stream_id, payload, handler)?;
        }
        Ok(())
    }
}

impl Default for H2Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_frame<H: H2FrameHandler>(
    frame_type: u8,
    flags: u8,
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    match frame_type {
        TYPE_DATA => parse_data_frame(flags, stream_id, payload, handler),
        TYPE_HEADERS => parse_headers_frame(flags, stream_id, payload, handler),
        TYPE_PRIORITY => parse_priority_frame(stream_id, payload, handler),
        TYPE_RST_STREAM => parse_rst_stream_frame(stream_id, payload, handler),
        TYPE_SETTINGS => parse_settings_frame(flags, stream_id, payload, handler),
        TYPE_PUSH_PROMISE => parse_push_promise_frame(flags, stream_id, payload, handler),
        TYPE_PING => parse_ping_frame(flags, stream_id, payload, handler),
        TYPE_GOAWAY => parse_goaway_frame(stream_id, payload, handler),
        TYPE_WINDOW_UPDATE => parse_window_update_frame(stream_id, payload, handler),
        TYPE_CONTINUATION => parse_continuation_frame(flags, stream_id, payload, handler),
        _ => Ok(()), // ignore unknown frame types
    }
}

fn parse_data_frame<H: H2FrameHandler>(
    flags: u8,
    stream_id: u32,
    mut payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id == 0 {
        handler.frame_error(ERROR_PROTOCOL_ERROR, 0, "DATA frame with stream ID 0".into());
        return Ok(());
    }
    let end_stream = (flags & FLAG_END_STREAM) != 0;
    let data = if (flags & FLAG_PADDED) != 0 {
        if payload.is_empty() {
            handler.frame_error(
                ERROR_PROTOCOL_ERROR,
                stream_id,
                "DATA frame PADDED but no pad length".into(),
            );
            return Ok(());
        }
        let pad_len = payload.get_u8() as usize;
        if payload.len() < pad_len {
            handler.frame_error(
                ERROR_PROTOCOL_ERROR,
                stream_id,
                "DATA frame padding exceeds payload".into(),
            );
            return Ok(());
        }
        payload.split_to(payload.len() - pad_len)
    } else {
        payload
    };
    handler.data_frame_received(stream_id, end_stream, data);
    Ok(())
}

fn parse_headers_frame<H: H2FrameHandler>(
    flags: u8,
    stream_id: u32,
    mut payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id == 0 {
        handler.frame_error(ERROR_PROTOCOL_ERROR, 0, "HEADERS frame with stream ID 0".into());
        return Ok(());
    }
    let end_stream = (flags & FLAG_END_STREAM) != 0;
    let end_headers = (flags & FLAG_END_HEADERS) != 0;
    let priority = (flags & FLAG_PRIORITY) != 0;
    let padded = (flags & FLAG_PADDED) != 0;

    let pad_len = if padded {
        if payload.is_empty() {
            handler.frame_error(
                ERROR_PROTOCOL_ERROR,
                stream_id,
                "HEADERS frame PADDED but no pad length".into(),
            );
            return Ok(());
        }
        payload.get_u8() as usize
    } else {
        0
    };

    let (stream_dependency, exclusive, weight) = if priority {
        if payload.len() < 5 {
            handler.frame_error(
                ERROR_FRAME_SIZE_ERROR,
                stream_id,
                "HEADERS frame with PRIORITY too short".into(),
            );
            return Ok(());
        }
        let b0 = payload.get_u8();
        let exclusive = (b0 & 0x80) != 0;
        let stream_dependency = (b0 as u32 & 0x7f) << 24
            | (payload.get_u8() as u32) << 16
            | (payload.get_u8() as u32) << 8
            | (payload.get_u8() as u32);
        let weight = payload.get_u8().saturating_add(1);
        (stream_dependency, exclusive, weight)
    } else {
        (0u32, false, 16u8)
    };

    if payload.len() < pad_len {
        handler.frame_error(
            ERROR_PROTOCOL_ERROR,
            stream_id,
            "HEADERS frame padding exceeds payload".into(),
        );
        return Ok(());
    }
    let header_block = payload.split_to(payload.len() - pad_len);
    handler.headers_frame_received(
        stream_id,
        end_stream,
        end_headers,
        stream_dependency,
        exclusive,
        weight,
        header_block,
    );
    Ok(())
}

fn parse_priority_frame<H: H2FrameHandler>(
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id == 0 {
        handler.frame_error(ERROR_PROTOCOL_ERROR, 0, "PRIORITY frame with stream ID 0".into());
        return Ok(());
    }
    if payload.len() != 5 {
        handler.frame_error(
            ERROR_FRAME_SIZE_ERROR,
            stream_id,
            "PRIORITY frame must be 5 bytes".into(),
        );
        return Ok(());
    }
    let mut p = payload;
    let b0 = p.get_u8();
    let exclusive = (b0 & 0x80) != 0;
    let stream_dependency = (b0 as u32 & 0x7f) << 24
        | (p.get_u8() as u32) << 16
        | (p.get_u8() as u32) << 8
        | (p.get_u8() as u32);
    let weight = p.get_u8().saturating_add(1);
    handler.priority_frame_received(stream_id, stream_dependency, exclusive, weight);
    Ok(())
}

fn parse_rst_stream_frame<H: H2FrameHandler>(
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id == 0 {
        handler.frame_error(ERROR_PROTOCOL_ERROR, 0, "RST_STREAM frame with stream ID 0".into());
        return Ok(());
    }
    if payload.len() != 4 {
        handler.frame_error(
            ERROR_FRAME_SIZE_ERROR,
            stream_id,
            "RST_STREAM frame must be 4 bytes".into(),
        );
        return Ok(());
    }
    let mut p = payload;
    let error_code = p.get_u32();
    handler.rst_stream_frame_received(stream_id, error_code);
    Ok(())
}

fn parse_settings_frame<H: H2FrameHandler>(
    flags: u8,
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id != 0 {
        handler.frame_error(
            ERROR_PROTOCOL_ERROR,
            stream_id,
            "SETTINGS frame with non-zero stream ID".into(),
        );
        return Ok(());
    }
    let ack = (flags & FLAG_ACK) != 0;
    if ack && !payload.is_empty() {
        handler.frame_error(
            ERROR_FRAME_SIZE_ERROR,
            0,
            "SETTINGS ACK frame must be empty".into(),
        );
        return Ok(());
    }
    if payload.len() % 6 != 0 {
        handler.frame_error(
            ERROR_FRAME_SIZE_ERROR,
            0,
            "SETTINGS frame size must be multiple of 6".into(),
        );
        return Ok(());
    }
    let mut settings = Vec::with_capacity(payload.len() / 6);
    let mut p = payload;
    while p.len() >= 6 {
        let id = p.get_u16();
        let value = p.get_u32();
        settings.push((id, value));
    }
    handler.settings_frame_received(ack, settings);
    Ok(())
}

fn parse_push_promise_frame<H: H2FrameHandler>(
    flags: u8,
    stream_id: u32,
    mut payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id == 0 {
        handler.frame_error(
            ERROR_PROTOCOL_ERROR,
            0,
            "PUSH_PROMISE frame with stream ID 0".into(),
        );
        return Ok(());
    }
    let end_headers = (flags & FLAG_END_HEADERS) != 0;
    let pad_len = if (flags & FLAG_PADDED) != 0 {
        if payload.is_empty() {
            handler.frame_error(
                ERROR_PROTOCOL_ERROR,
                stream_id,
                "PUSH_PROMISE frame PADDED but no pad length".into(),
            );
            return Ok(());
        }
        payload.get_u8() as usize
    } else {
        0
    };
    if payload.len() < 4 + pad_len {
        handler.frame_error(
            ERROR_FRAME_SIZE_ERROR,
            stream_id,
            "PUSH_PROMISE frame too short".into(),
        );
        return Ok(());
    }
    let promised_stream_id = ((payload.get_u8() & 0x7f) as u32) << 24
        | (payload.get_u8() as u32) << 16
        | (payload.get_u8() as u32) << 8
        | (payload.get_u8() as u32);
    let header_block = payload.split_to(payload.len() - pad_len);
    handler.push_promise_frame_received(stream_id, promised_stream_id, end_headers, header_block);
    Ok(())
}

fn parse_ping_frame<H: H2FrameHandler>(
    flags: u8,
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id != 0 {
        handler.frame_error(
            ERROR_PROTOCOL_ERROR,
            stream_id,
            "PING frame with non-zero stream ID".into(),
        );
        return Ok(());
    }
    if payload.len() != 8 {
        handler.frame_error(ERROR_FRAME_SIZE_ERROR, 0, "PING frame must be 8 bytes".into());
        return Ok(());
    }
    let ack = (flags & FLAG_ACK) != 0;
    let mut p = payload;
    let opaque = p.get_u64();
    handler.ping_frame_received(ack, opaque);
    Ok(())
}

fn parse_goaway_frame<H: H2FrameHandler>(
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id != 0 {
        handler.frame_error(
            ERROR_PROTOCOL_ERROR,
            stream_id,
            "GOAWAY frame with non-zero stream ID".into(),
        );
        return Ok(());
    }
    if payload.len() < 8 {
        handler.frame_error(
            ERROR_FRAME_SIZE_ERROR,
            0,
            "GOAWAY frame must be at least 8 bytes".into(),
        );
        return Ok(());
    }
    let mut p = payload;
    let last_stream_id = ((p.get_u8() & 0x7f) as u32) << 24
        | (p.get_u8() as u32) << 16
        | (p.get_u8() as u32) << 8
        | (p.get_u8() as u32);
    let error_code = p.get_u32();
    handler.goaway_frame_received(last_stream_id, error_code, p);
    Ok(())
}

fn parse_window_update_frame<H: H2FrameHandler>(
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if payload.len() != 4 {
        handler.frame_error(
            ERROR_FRAME_SIZE_ERROR,
            stream_id,
            "WINDOW_UPDATE frame must be 4 bytes".into(),
        );
        return Ok(());
    }
    let mut p = payload;
    let increment = p.get_u32() & 0x7fff_ffff;
    if increment == 0 {
        handler.frame_error(
            ERROR_PROTOCOL_ERROR,
            stream_id,
            "WINDOW_UPDATE increment must be non-zero".into(),
        );
        return Ok(());
    }
    handler.window_update_frame_received(stream_id, increment);
    Ok(())
}

fn parse_continuation_frame<H: H2FrameHandler>(
    flags: u8,
    stream_id: u32,
    payload: Bytes,
    handler: &mut H,
) -> Result<(), io::Error> {
    if stream_id == 0 {
        handler.frame_error(
            ERROR_PROTOCOL_ERROR,
            0,
            "CONTINUATION frame with stream ID 0".into(),
        );
        return Ok(());
    }
    let end_headers = (flags & FLAG_END_HEADERS) != 0;
    handler.continuation_frame_received(stream_id, end_headers, payload);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every callback for assertions; shared with the writer tests.
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub data: Vec<(u32, bool, Bytes)>,
        pub headers: Vec<(u32, bool, bool, Bytes)>,
        pub rst: Vec<(u32, u32)>,
        pub settings: Vec<(bool, Vec<(u16, u32)>)>,
        pub pings: Vec<(bool, u64)>,
        pub goaways: Vec<(u32, u32, Bytes)>,
        pub window_updates: Vec<(u32, u32)>,
        pub continuations: Vec<(u32, bool, Bytes)>,
        pub push_promises: Vec<(u32, u32)>,
        pub priorities: Vec<(u32, u32)>,
        pub errors: Vec<(u32, u32, String)>,
    }

    impl H2FrameHandler for RecordingHandler {
        fn data_frame_received(&mut self, stream_id: u32, end_stream: bool, data: Bytes) {
            self.data.push((stream_id, end_stream, data));
        }
        fn headers_frame_received(
            &mut self,
            stream_id: u32,
            end_stream: bool,
            end_headers: bool,
            _dep: u32,
            _excl: bool,
            _weight: u8,
            block: Bytes,
        ) {
            self.headers.push((stream_id, end_stream, end_headers, block));
        }
        fn priority_frame_received(&mut self, stream_id: u32, dep: u32, _excl: bool, _weight: u8) {
            self.priorities.push((stream_id, dep));
        }
        fn rst_stream_frame_received(&mut self, stream_id: u32, error_code: u32) {
            self.rst.push((stream_id, error_code));
        }
        fn settings_frame_received(&mut self, ack: bool, settings: Vec<(u16, u32)>) {
            self.settings.push((ack, settings));
        }
        fn push_promise_frame_received(
            &mut self,
            stream_id: u32,
            promised: u32,
            _end_headers: bool,
            _block: Bytes,
        ) {
            self.push_promises.push((stream_id, promised));
        }
        fn ping_frame_received(&mut self, ack: bool, opaque: u64) {
            self.pings.push((ack, opaque));
        }
        fn goaway_frame_received(&mut self, last: u32, code: u32, debug: Bytes) {
            self.goaways.push((last, code, debug));
        }
        fn window_update_frame_received(&mut self, stream_id: u32, increment: u32) {
            self.window_updates.push((stream_id, increment));
        }
        fn continuation_frame_received(&mut self, stream_id: u32, end_headers: bool, block: Bytes) {
            self.continuations.push((stream_id, end_headers, block));
        }
        fn frame_error(&mut self, error_code: u32, stream_id: u32, message: String) {
            self.errors.push((error_code, stream_id, message));
        }
    }

    pub(crate) fn parse_all(bytes: &[u8]) -> RecordingHandler {
        let mut parser = H2Parser::new();
        let mut handler = RecordingHandler::default();
        let mut buf = BytesMut::from(bytes);
        parser.receive(&mut buf, &mut handler).unwrap();
        handler
    }

    #[test]
    fn unknown_frame_type_ignored() {
        // Type 0x0b, length 3, stream 1.
        let h = parse_all(&[0, 0, 3, 0x0b, 0, 0, 0, 0, 1, 0xde, 0xad, 0xbe]);
        assert!(h.errors.is_empty());
        assert!(h.data.is_empty());
    }

    #[test]
    fn reserved_bit_in_stream_id_masked() {
        // DATA, stream id with reserved bit set: 0x80000001 -> 1.
        let h = parse_all(&[0, 0, 1, 0, 0, 0x80, 0, 0, 1, b'x']);
        assert_eq!(h.data.len(), 1);
        assert_eq!(h.data[0].0, 1);
    }

    #[test]
    fn data_on_stream_zero_is_error() {
        let h = parse_all(&[0, 0, 1, 0, 0, 0, 0, 0, 0, b'x']);
        assert_eq!(h.errors.len(), 1);
        assert_eq!(h.errors[0].0, ERROR_PROTOCOL_ERROR);
    }

    #[test]
    fn padded_data_strips_padding() {
        // PADDED flag, pad length 2, payload "ab" + 2 pad bytes.
        let h = parse_all(&[0, 0, 5, 0, FLAG_PADDED, 0, 0, 0, 1, 2, b'a', b'b', 0, 0]);
        assert_eq!(h.data[0].2.as_ref(), b"ab");
    }

    #[test]
    fn data_padding_overflow_is_error() {
        let h = parse_all(&[0, 0, 2, 0, FLAG_PADDED, 0, 0, 0, 1, 9, b'a']);
        assert_eq!(h.errors.len(), 1);
    }

    #[test]
    fn window_update_zero_increment_is_error() {
        let h = parse_all(&[0, 0, 4, TYPE_WINDOW_UPDATE, 0, 0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(h.errors.len(), 1);
        assert_eq!(h.errors[0].0, ERROR_PROTOCOL_ERROR);
    }

    #[test]
    fn ping_wrong_length_is_error() {
        let h = parse_all(&[0, 0, 4, TYPE_PING, 0, 0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(h.errors.len(), 1);
        assert_eq!(h.errors[0].0, ERROR_FRAME_SIZE_ERROR);
    }

    #[test]
    fn settings_on_nonzero_stream_is_error() {
        let h = parse_all(&[0, 0, 0, TYPE_SETTINGS, 0, 0, 0, 0, 1]);
        assert_eq!(h.errors.len(), 1);
    }

    #[test]
    fn settings_bad_multiple_is_error() {
        let h = parse_all(&[0, 0, 5, TYPE_SETTINGS, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(h.errors.len(), 1);
        assert_eq!(h.errors[0].0, ERROR_FRAME_SIZE_ERROR);
    }

    #[test]
    fn oversized_frame_is_error() {
        // Declared length 20000 > default max 16384.
        let mut header = vec![0u8; 9];
        header[0] = 0;
        header[1] = 0x4e;
        header[2] = 0x20;
        header[3] = TYPE_DATA;
        header[8] = 1;
        let mut parser = H2Parser::new();
        let mut handler = RecordingHandler::default();
        let mut buf = BytesMut::from(&header[..]);
        parser.receive(&mut buf, &mut handler).unwrap();
        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.errors[0].0, ERROR_FRAME_SIZE_ERROR);
    }

    #[test]
    fn partial_frame_left_in_buffer() {
        let mut parser = H2Parser::new();
        let mut handler = RecordingHandler::default();
        let mut buf = BytesMut::from(&[0u8, 0, 5, 0, 0, 0, 0, 0, 1, b'a'][..]);
        parser.receive(&mut buf, &mut handler).unwrap();
        assert!(handler.data.is_empty());
        assert_eq!(buf.len(), 10);
        buf.extend_from_slice(b"bcde");
        parser.receive(&mut buf, &mut handler).unwrap();
        assert_eq!(handler.data[0].2.as_ref(), b"abcde");
    }
}
