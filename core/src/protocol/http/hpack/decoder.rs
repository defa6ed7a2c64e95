/*
 * decoder.rs
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

//! HPACK decoder (RFC 7541). Decodes header blocks into (name, value)
//! pairs: indexed fields, literals with or without indexing, dynamic table
//! size updates, Huffman-encoded strings. The dynamic table is bounded by
//! the size we announced in SETTINGS_HEADER_TABLE_SIZE.

use bytes::Buf;
use std::collections::VecDeque;
use std::io;

use super::huffman;
use super::static_table::{STATIC_TABLE, STATIC_TABLE_SIZE};

/// Decoded header (name, value).
#[derive(Debug, Clone)]
struct TableEntry {
    name: String,
    value: String,
}

/// Callback for each decoded header.
pub trait HeaderSink {
    fn header(&mut self, name: &str, value: &str);
}

impl HeaderSink for Vec<(String, String)> {
    fn header(&mut self, name: &str, value: &str) {
        self.push((name.to_string(), value.to_string()));
    }
}

/// HPACK decoder with a dynamic table.
pub struct Decoder {
    /// Upper bound from our SETTINGS_HEADER_TABLE_SIZE.
    header_table_size: usize,
    /// Current bound, lowered by table size updates in the block.
    max_size: usize,
    dynamic_table: VecDeque<TableEntry>,
}

impl Decoder {
    pub fn new(header_table_size: usize) -> Self {
        Self {
            header_table_size,
            max_size: header_table_size,
            dynamic_table: VecDeque::new(),
        }
    }

    /// Announce a new table bound (we sent SETTINGS_HEADER_TABLE_SIZE).
    pub fn set_header_table_size(&mut self, size: usize) {
        self.header_table_size = size;
        if self.max_size > size {
            self.max_size = size;
            self.evict_to(size);
        }
    }

    /// Decode a complete header block, calling the sink for each header.
    pub fn decode<B: Buf, S: HeaderSink>(&mut self, buf: &mut B, sink: &mut S) -> io::Result<()> {
        while buf.has_remaining() {
            let b = buf.get_u8();
            if (b & 0x80) != 0 {
                // Indexed header field (7-bit index)
                let index = decode_integer(buf, b, 7)?;
                if index == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "HPACK indexed header index 0",
                    ));
                }
                let (name, value) = self.get_indexed(index)?;
                sink.header(&name, &value);
            } else if (b & 0x40) != 0 {
                // Literal with incremental indexing (6-bit index)
                let (name, value) = self.get_literal(buf, b, 6)?;
                self.add_to_dynamic(name.clone(), value.clone());
                sink.header(&name, &value);
            } else if (b & 0x20) != 0 {
                // Dynamic table size update (5-bit)
                let max_size = decode_integer(buf, b, 5)? as usize;
                if max_size > self.header_table_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "HPACK dynamic table size exceeds SETTINGS bound",
                    ));
                }
                self.evict_to(max_size);
                self.max_size = max_size;
            } else {
                // Literal without indexing (4-bit), or never-indexed
                let (name, value) = self.get_literal(buf, b, 4)?;
                sink.header(&name, &value);
            }
        }
        Ok(())
    }

    fn get_indexed(&self, index: u64) -> io::Result<(String, String)> {
        if index < STATIC_TABLE_SIZE as u64 {
            let (name, value) = STATIC_TABLE[index as usize];
            Ok((name.to_string(), value.unwrap_or("").to_string()))
        } else {
            let idx = (index - STATIC_TABLE_SIZE as u64) as usize;
            match self.dynamic_table.get(idx) {
                Some(e) => Ok((e.name.clone(), e.value.clone())),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "HPACK index out of range",
                )),
            }
        }
    }

    fn get_literal<B: Buf>(&self, buf: &mut B, opcode: u8, nbits: u8) -> io::Result<(String, String)> {
        let index = decode_integer(buf, opcode, nbits)?;
        let name = if index == 0 {
            decode_string(buf)?
        } else {
            self.get_indexed(index)?.0
        };
        let value = decode_string(buf)?;
        Ok((name, value))
    }

    fn add_to_dynamic(&mut self, name: String, value: String) {
        let entry_size = name.len() + value.len() + 32;
        while self.dynamic_size() + entry_size > self.max_size && !self.dynamic_table.is_empty() {
            self.dynamic_table.pop_back();
        }
        if self.dynamic_size() + entry_size <= self.max_size {
            self.dynamic_table.push_front(TableEntry { name, value });
        }
    }

    fn dynamic_size(&self) -> usize {
        self.dynamic_table
            .iter()
            .map(|e| e.name.len() + e.value.len() + 32)
            .sum()
    }

    fn evict_to(&mut self, max: usize) {
        while self.dynamic_size() > max && !self.dynamic_table.is_empty() {
            self.dynamic_table.pop_back();
        }
    }
}

fn decode_integer<B: Buf>(buf: &mut B, opcode: u8, nbits: u8) -> io::Result<u64> {
    let nmask = (1u64 << nbits) - 1;
    let mut value = (opcode & (nmask as u8)) as u64;
    if value < nmask {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "HPACK integer truncated",
            ));
        }
        let b = buf.get_u8();
        value += ((b & 0x7f) as u64) << shift;
        if (b & 0x80) == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HPACK integer too large",
            ));
        }
    }
    Ok(value)
}

fn decode_string<B: Buf>(buf: &mut B) -> io::Result<String> {
    if !buf.has_remaining() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "HPACK string length",
        ));
    }
    let b = buf.get_u8();
    let huffman = (b & 0x80) != 0;
    let len = decode_integer(buf, b, 7)? as usize;
    if buf.remaining() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "HPACK string truncated",
        ));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    if huffman {
        let decoded = huffman::decode(&bytes)?;
        return String::from_utf8(decoded).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "HPACK Huffman string not UTF-8")
        });
    }
    String::from_utf8(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "HPACK string not UTF-8"))
}
