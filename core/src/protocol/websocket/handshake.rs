/*
 * handshake.rs
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

//! WebSocket opening handshake (RFC 6455 §4): key/accept-token material
//! and Sec-WebSocket-Extensions negotiation for permessage-deflate
//! (RFC 7692 §7).

use std::io;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Magic GUID for Sec-WebSocket-Accept (RFC 6455 §4.2.2).
const WS_ACCEPT_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Random 16-byte nonce, base64-encoded for Sec-WebSocket-Key.
pub fn generate_key() -> io::Result<String> {
    let mut raw = [0u8; 16];
    getrandom::getrandom(&mut raw)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(BASE64.encode(raw))
}

/// Expected Sec-WebSocket-Accept for the key we sent:
/// base64(sha1(key || MAGIC)).
pub fn expected_accept(key_base64: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(key_base64.as_bytes());
    hasher.update(WS_ACCEPT_MAGIC);
    BASE64.encode(hasher.finalize())
}

/// Verify the server's Sec-WebSocket-Accept header.
pub fn verify_accept(accept_header: Option<&str>, key_base64: &str) -> io::Result<()> {
    let expected = expected_accept(key_base64);
    match accept_header {
        Some(h) if h.trim() == expected => Ok(()),
        Some(_) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Sec-WebSocket-Accept mismatch",
        )),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing Sec-WebSocket-Accept",
        )),
    }
}

/// Negotiated permessage-deflate parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateConfig {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
}

/// Value we offer in Sec-WebSocket-Extensions. We never advertise
/// client_max_window_bits, so a response carrying it is rejected.
pub fn offered_extensions() -> &'static str {
    "permessage-deflate"
}

/// Parse the server's Sec-WebSocket-Extensions response. None means no
/// compression; unknown extensions, unknown parameters, any
/// client_max_window_bits, or server_max_window_bits outside [8, 15] are
/// protocol errors.
pub fn negotiate_extensions(
    response_value: Option<&str>,
    offered: bool,
) -> io::Result<Option<DeflateConfig>> {
    let value = match response_value {
        None => return Ok(None),
        Some(v) if v.trim().is_empty() => return Ok(None),
        Some(v) => v,
    };
    if !offered {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "server negotiated an extension we did not offer",
        ));
    }
    let mut config: Option<DeflateConfig> = None;
    for extension in value.split(',') {
        let mut parts = extension.split(';');
        let name = parts.next().unwrap_or("").trim();
        if !name.eq_ignore_ascii_case("permessage-deflate") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected extension: {}", name),
            ));
        }
        if config.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "permessage-deflate negotiated twice",
            ));
        }
        let mut cfg = DeflateConfig::default();
        for param in parts {
            let param = param.trim();
            let (key, val) = match param.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim().trim_matches('"'))),
                None => (param, None),
            };
            if key.eq_ignore_ascii_case("client_no_context_takeover") {
                cfg.client_no_context_takeover = true;
            } else if key.eq_ignore_ascii_case("server_no_context_takeover") {
                cfg.server_no_context_takeover = true;
            } else if key.eq_ignore_ascii_case("server_max_window_bits") {
                let bits = val
                    .and_then(|v| v.parse::<u8>().ok())
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "bad server_max_window_bits")
                    })?;
                if !(8..=15).contains(&bits) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "server_max_window_bits out of range",
                    ));
                }
                cfg.server_max_window_bits = Some(bits);
            } else if key.eq_ignore_ascii_case("client_max_window_bits") {
                // We never advertise it, so the server must not select it.
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "server selected client_max_window_bits",
                ));
            } else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown permessage-deflate parameter: {}", key),
                ));
            }
        }
        config = Some(cfg);
    }
    Ok(config)
}
