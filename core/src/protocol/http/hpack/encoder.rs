/*
 * encoder.rs
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

//! HPACK encoder (RFC 7541) with a dynamic table bounded by the peer's
//! SETTINGS_HEADER_TABLE_SIZE. Exact matches use indexed representation;
//! name matches use a literal with name index; everything else is a literal
//! with incremental indexing so repeated headers on the same connection
//! compress. Sensitive headers are emitted never-indexed.

use bytes::BufMut;
use std::collections::VecDeque;

use super::huffman;
use super::static_table::STATIC_TABLE;

/// Headers whose values must not enter compression contexts.
fn is_sensitive(name: &str) -> bool {
    name.eq_ignore_ascii_case("authorization")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("cookie")
        || name.eq_ignore_ascii_case("set-cookie")
}

/// HPACK encoder. One per connection; the dynamic table state must stay in
/// lockstep with the frames actually written, so the connection encodes
/// under its writer lock.
pub struct Encoder {
    dynamic_table: VecDeque<(String, String)>,
    max_size: usize,
    /// Pending table-size update to announce at the start of the next block.
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            dynamic_table: VecDeque::new(),
            max_size,
            pending_size_update: None,
        }
    }

    /// Adopt the peer's announced table bound. Takes effect at the start of
    /// the next header block, as a dynamic table size update.
    pub fn set_max_table_size(&mut self, size: usize) {
        if size != self.max_size {
            self.pending_size_update = Some(size);
            self.max_size = size;
            self.evict_to(size);
        }
    }

    /// Encode one header list into `out`.
    pub fn encode(&mut self, headers: &[(String, String)], out: &mut impl BufMut) {
        if let Some(size) = self.pending_size_update.take() {
            encode_integer(size as u64, 5, 0x20, out);
        }
        for (name, value) in headers {
            self.encode_one(name, value, out);
        }
    }

    fn encode_one(&mut self, name: &str, value: &str, out: &mut impl BufMut) {
        if is_sensitive(name) {
            // Never-indexed literal (prefix 0001).
            match self.find_name(name) {
                Some(idx) => encode_integer(idx as u64, 4, 0x10, out),
                None => {
                    out.put_u8(0x10);
                    encode_string(name.as_bytes(), out);
                }
            }
            encode_string(value.as_bytes(), out);
            return;
        }
        if let Some(idx) = self.find_exact(name, value) {
            encode_integer(idx as u64, 7, 0x80, out);
            return;
        }
        // Literal with incremental indexing.
        match self.find_name(name) {
            Some(idx) => encode_integer(idx as u64, 6, 0x40, out),
            None => {
                out.put_u8(0x40);
                encode_string(name.as_bytes(), out);
            }
        }
        encode_string(value.as_bytes(), out);
        self.add_to_dynamic(name.to_string(), value.to_string());
    }

    fn find_exact(&self, name: &str, value: &str) -> Option<usize> {
        if let Some(i) = STATIC_TABLE
            .iter()
            .position(|&(n, v)| n == name && v == Some(value))
        {
            return Some(i);
        }
        self.dynamic_table
            .iter()
            .position(|(n, v)| n == name && v == value)
            .map(|i| STATIC_TABLE.len() + i)
    }

    fn find_name(&self, name: &str) -> Option<usize> {
        if let Some(i) = STATIC_TABLE.iter().position(|&(n, _)| n == name) {
            return Some(i);
        }
        self.dynamic_table
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| STATIC_TABLE.len() + i)
    }

    fn add_to_dynamic(&mut self, name: String, value: String) {
        let entry_size = name.len() + value.len() + 32;
        while self.dynamic_size() + entry_size > self.max_size && !self.dynamic_table.is_empty() {
            self.dynamic_table.pop_back();
        }
        if self.dynamic_size() + entry_size <= self.max_size {
            self.dynamic_table.push_front((name, value));
        }
    }

    fn dynamic_size(&self) -> usize {
        self.dynamic_table
            .iter()
            .map(|(n, v)| n.len() + v.len() + 32)
            .sum()
    }

    fn evict_to(&mut self, max: usize) {
        while self.dynamic_size() > max && !self.dynamic_table.is_empty() {
            self.dynamic_table.pop_back();
        }
    }
}

/// Encode a string with Huffman when it saves space, plain otherwise.
fn encode_string(s: &[u8], out: &mut impl BufMut) {
    let huff_len = huffman::encoded_length(s);
    if huff_len < s.len() {
        let encoded = huffman::encode(s);
        encode_integer(encoded.len() as u64, 7, 0x80, out);
        out.put_slice(&encoded);
    } else {
        encode_integer(s.len() as u64, 7, 0x00, out);
        out.put_slice(s);
    }
}

fn encode_integer(mut value: u64, nbits: u8, prefix: u8, out: &mut impl BufMut) {
    let max_prefix = (1u64 << nbits) - 1;
    if value < max_prefix {
        out.put_u8(prefix | value as u8);
        return;
    }
    out.put_u8(prefix | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.put_u8(0x80 | (value % 128) as u8);
        value /= 128;
    }
    out.put_u8(value as u8);
}

#[cfg(test)]
pub(crate) fn encode_integer_for_tests(value: u64, nbits: u8, prefix: u8, out: &mut impl BufMut) {
    encode_integer(value, nbits, prefix, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http::hpack::Decoder;

    fn pairs(h: &[(&str, &str)]) -> Vec<(String, String)> {
        h.iter().map(|&(n, v)| (n.to_string(), v.to_string())).collect()
    }

    fn roundtrip_with(encoder: &mut Encoder, decoder: &mut Decoder, input: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut buf = bytes::BytesMut::new();
        encoder.encode(&pairs(input), &mut buf);
        let mut out = Vec::new();
        let mut cursor = &buf[..];
        decoder.decode(&mut cursor, &mut out).unwrap();
        out
    }

    fn roundtrip(input: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut e = Encoder::new(4096);
        let mut d = Decoder::new(4096);
        roundtrip_with(&mut e, &mut d, input)
    }

    #[test]
    fn roundtrip_get_request() {
        let input = [
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/"),
        ];
        assert_eq!(roundtrip(&input), pairs(&input));
    }

    #[test]
    fn roundtrip_post_with_custom_headers() {
        let input = [
            (":method", "POST"),
            (":scheme", "https"),
            (":authority", "api.example.com"),
            (":path", "/v1/submit"),
            ("content-type", "application/json"),
            ("x-request-id", "01J9ZX2B7Q"),
        ];
        assert_eq!(roundtrip(&input), pairs(&input));
    }

    #[test]
    fn static_exact_match_is_single_byte() {
        let mut e = Encoder::new(4096);
        let mut buf = bytes::BytesMut::new();
        e.encode(&pairs(&[(":method", "GET")]), &mut buf);
        assert_eq!(&buf[..], &[0x82]);
    }

    #[test]
    fn repeated_header_uses_dynamic_table() {
        let mut e = Encoder::new(4096);
        let mut d = Decoder::new(4096);
        let input = [("x-custom", "abcdefghij")];
        let first = {
            let mut buf = bytes::BytesMut::new();
            e.encode(&pairs(&input), &mut buf);
            let mut out = Vec::new();
            let mut cursor = &buf[..];
            d.decode(&mut cursor, &mut out).unwrap();
            assert_eq!(out, pairs(&input));
            buf.len()
        };
        let second = {
            let mut buf = bytes::BytesMut::new();
            e.encode(&pairs(&input), &mut buf);
            let mut out = Vec::new();
            let mut cursor = &buf[..];
            d.decode(&mut cursor, &mut out).unwrap();
            assert_eq!(out, pairs(&input));
            buf.len()
        };
        assert!(second < first, "second block should hit the dynamic table");
    }

    #[test]
    fn sensitive_headers_never_enter_dynamic_table() {
        let mut e = Encoder::new(4096);
        let mut d = Decoder::new(4096);
        let input = [("authorization", "Bearer secret-token")];
        let a = {
            let mut buf = bytes::BytesMut::new();
            e.encode(&pairs(&input), &mut buf);
            buf.len()
        };
        let mut buf = bytes::BytesMut::new();
        e.encode(&pairs(&input), &mut buf);
        assert_eq!(buf.len(), a, "no dynamic-table hit for sensitive header");
        let mut out = Vec::new();
        let mut cursor = &buf[..];
        d.decode(&mut cursor, &mut out).unwrap();
        assert_eq!(out, pairs(&input));
    }

    #[test]
    fn table_size_update_announced_after_settings_change() {
        let mut e = Encoder::new(4096);
        let mut d = Decoder::new(4096);
        // First block establishes an entry; then the peer shrinks the table.
        let _ = roundtrip_with(&mut e, &mut d, &[("x-a", "1")]);
        e.set_max_table_size(64);
        d.set_header_table_size(4096); // our receive bound is unchanged
        let out = roundtrip_with(&mut e, &mut d, &[("x-b", "2")]);
        assert_eq!(out, pairs(&[("x-b", "2")]));
    }

    #[test]
    fn small_table_still_round_trips() {
        let mut e = Encoder::new(0);
        let mut d = Decoder::new(4096);
        let input = [("x-long-header-name", "with a reasonably long value here")];
        // Encoder announces table size 0 via pending update on first block.
        e.pending_size_update = Some(0);
        let out = roundtrip_with(&mut e, &mut d, &input);
        assert_eq!(out, pairs(&input));
    }

    #[test]
    fn integer_encoding_boundaries() {
        let mut buf = bytes::BytesMut::new();
        encode_integer(10, 7, 0x00, &mut buf);
        assert_eq!(buf[0], 10);
        buf.clear();
        encode_integer(127, 7, 0x00, &mut buf);
        assert_eq!(&buf[..], &[0x7f, 0x00]);
        buf.clear();
        encode_integer(300, 7, 0x00, &mut buf);
        assert_eq!(&buf[..], &[0x7f, 173]);
    }
}
