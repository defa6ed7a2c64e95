/*
 * deflate.rs
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

//! permessage-deflate message transforms (RFC 7692 §7). Raw DEFLATE with
//! the `00 00 FF FF` tail stripped on compress and restored on decompress.
//! With context takeover (the default) the dictionary persists across
//! messages; `no_context_takeover` resets it after each message.

use std::io;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Compresses outgoing messages.
pub struct MessageDeflater {
    inner: Compress,
    reset_context: bool,
}

impl MessageDeflater {
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            inner: Compress::new(Compression::default(), false),
            reset_context: no_context_takeover,
        }
    }

    pub fn compress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);
        let mut pos = 0usize;
        while pos < input.len() {
            output.reserve(4096);
            let before = self.inner.total_in();
            self.inner
                .compress_vec(&input[pos..], &mut output, FlushCompress::None)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            pos += (self.inner.total_in() - before) as usize;
        }
        while !output.ends_with(&DEFLATE_TAIL) {
            output.reserve(4096);
            self.inner
                .compress_vec(&[], &mut output, FlushCompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        output.truncate(output.len() - DEFLATE_TAIL.len());
        if self.reset_context {
            self.inner.reset();
        }
        Ok(output)
    }
}

/// Decompresses incoming messages.
pub struct MessageInflater {
    inner: Decompress,
    reset_context: bool,
}

impl MessageInflater {
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            inner: Decompress::new(false),
            reset_context: no_context_takeover,
        }
    }

    /// Inflate one complete message payload. `max_size` bounds the output
    /// against decompression bombs.
    pub fn decompress(&mut self, input: &[u8], max_size: usize) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(input.len() + DEFLATE_TAIL.len());
        data.extend_from_slice(input);
        data.extend_from_slice(&DEFLATE_TAIL);

        let mut output = Vec::with_capacity(input.len() * 2 + 64);
        let mut pos = 0usize;
        while pos < data.len() {
            output.reserve(8192);
            let before = self.inner.total_in();
            let status = self
                .inner
                .decompress_vec(&data[pos..], &mut output, FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (self.inner.total_in() - before) as usize;
            pos += consumed;
            if output.len() > max_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "decompressed message too large",
                ));
            }
            if status == Status::StreamEnd || (consumed == 0 && pos >= data.len()) {
                break;
            }
        }
        if self.reset_context {
            self.inner.reset(false);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 16 * 1024 * 1024;

    #[test]
    fn roundtrip_simple() {
        let mut deflater = MessageDeflater::new(false);
        let mut inflater = MessageInflater::new(false);
        let message = b"Hello compression, hello compression, hello compression";
        let compressed = deflater.compress(message).unwrap();
        assert!(compressed.len() < message.len());
        assert!(!compressed.ends_with(&DEFLATE_TAIL));
        let restored = inflater.decompress(&compressed, LIMIT).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn context_takeover_improves_second_message() {
        let mut deflater = MessageDeflater::new(false);
        let mut inflater = MessageInflater::new(false);
        let message = vec![b'z'; 4096];
        let first = deflater.compress(&message).unwrap();
        let second = deflater.compress(&message).unwrap();
        assert!(second.len() <= first.len());
        assert_eq!(inflater.decompress(&first, LIMIT).unwrap(), message);
        assert_eq!(inflater.decompress(&second, LIMIT).unwrap(), message);
    }

    #[test]
    fn no_context_takeover_resets_between_messages() {
        let mut deflater = MessageDeflater::new(true);
        let mut inflater = MessageInflater::new(true);
        for _ in 0..3 {
            let compressed = deflater.compress(b"repeated message body").unwrap();
            let restored = inflater.decompress(&compressed, LIMIT).unwrap();
            assert_eq!(restored, b"repeated message body");
        }
    }

    #[test]
    fn empty_message_roundtrip() {
        let mut deflater = MessageDeflater::new(false);
        let mut inflater = MessageInflater::new(false);
        let compressed = deflater.compress(b"").unwrap();
        assert_eq!(inflater.decompress(&compressed, LIMIT).unwrap(), b"");
    }

    #[test]
    fn size_limit_enforced() {
        let mut deflater = MessageDeflater::new(false);
        let mut inflater = MessageInflater::new(false);
        let message = vec![0u8; 100_000];
        let compressed = deflater.compress(&message).unwrap();
        assert!(inflater.decompress(&compressed, 1024).is_err());
    }
}
