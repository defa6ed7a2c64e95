/*
 * config.rs
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

//! Client configuration: deadlines, pool sizing, protocol preference and the
//! WebSocket tunables. A zero duration disables the corresponding deadline.

use std::time::Duration;

use crate::error::HttpError;

/// Application protocol negotiated over ALPN (or assumed for cleartext).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http11,
    H2,
}

impl Protocol {
    pub fn as_alpn(&self) -> &'static [u8] {
        match self {
            Protocol::Http11 => b"http/1.1",
            Protocol::H2 => b"h2",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http11 => "http/1.1",
            Protocol::H2 => "h2",
        }
    }
}

/// Configuration shared by every call made through one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP connect plus TLS handshake deadline. Zero disables.
    pub connect_timeout: Duration,
    /// Deadline for each read from the transport. Zero disables.
    pub read_timeout: Duration,
    /// Deadline for each write to the transport. Zero disables.
    pub write_timeout: Duration,
    /// Deadline for the entire call including follow-ups. Zero disables.
    pub call_timeout: Duration,
    /// Keep-alive ping cadence for HTTP/2 connections and WebSockets.
    /// Zero disables pings.
    pub ping_interval: Duration,
    /// Follow 3xx responses carrying a Location header.
    pub follow_redirects: bool,
    /// Follow redirects that switch between http and https.
    pub follow_ssl_redirects: bool,
    /// Retry another route after a connect failure.
    pub retry_on_connection_failure: bool,
    /// Hard cap on followed redirects per call.
    pub max_redirects: u32,
    /// Idle connections kept in the pool before LRU eviction.
    pub max_idle_connections: usize,
    /// Idle lifetime before a pooled connection is closed.
    pub keep_alive_duration: Duration,
    /// Simultaneous in-flight connects per address.
    pub max_connects_per_address: usize,
    /// Ordered protocol preference offered over ALPN.
    pub protocols: Vec<Protocol>,
    /// Deadline for the peer to acknowledge our SETTINGS frame.
    pub settings_timeout: Duration,
    /// WebSocket messages at least this large are compressed when
    /// permessage-deflate was negotiated.
    pub minimum_deflate_size: usize,
    /// Offer permessage-deflate during the WebSocket handshake.
    pub websocket_compression: bool,
    /// Grace period for the peer to answer a WebSocket close before the
    /// socket is cancelled.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            call_timeout: Duration::ZERO,
            ping_interval: Duration::ZERO,
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            max_redirects: 20,
            max_idle_connections: 5,
            keep_alive_duration: Duration::from_secs(5 * 60),
            max_connects_per_address: 2,
            protocols: vec![Protocol::H2, Protocol::Http11],
            settings_timeout: Duration::from_secs(10),
            minimum_deflate_size: 1024,
            websocket_compression: true,
            close_timeout: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Validate the protocol preference list: non-empty, no duplicates, and
    /// containing http/1.1 unless it is exactly `[h2]` (prior knowledge over
    /// TLS).
    pub fn validate(&self) -> Result<(), HttpError> {
        if self.protocols.is_empty() {
            return Err(HttpError::MalformedRequest("protocols must not be empty".into()));
        }
        for (i, p) in self.protocols.iter().enumerate() {
            if self.protocols[..i].contains(p) {
                return Err(HttpError::MalformedRequest(format!(
                    "duplicate protocol {}",
                    p.as_str()
                )));
            }
        }
        if !self.protocols.contains(&Protocol::Http11) && self.protocols != [Protocol::H2] {
            return Err(HttpError::MalformedRequest(
                "protocols must contain http/1.1 unless exactly [h2]".into(),
            ));
        }
        Ok(())
    }

    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        self.protocols.iter().map(|p| p.as_alpn().to_vec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn h2_only_is_valid() {
        let mut cfg = ClientConfig::default();
        cfg.protocols = vec![Protocol::H2];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_protocols_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.protocols = vec![];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_protocols_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.protocols = vec![Protocol::Http11, Protocol::Http11];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn alpn_order_follows_preference() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.alpn_protocols(), vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
