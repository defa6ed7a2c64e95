/*
 * uri.rs
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

//! URL record consumed by the engine: scheme, canonical host, port, and the
//! percent-encoded path+query. Full URL canonicalization (IDNA, public
//! suffixes) happens upstream; hosts arrive here already in their wire form
//! (punycoded where needed). Fragments are ignored. ws/wss map to http/https
//! before routing.

use std::fmt;

use crate::error::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// An absolute http(s) URL reduced to what routing and framing need.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path plus optional `?query`, always starting with `/`.
    pub path_and_query: String,
}

impl HttpUrl {
    /// Parse an absolute URL. Accepts http, https, ws and wss; the WebSocket
    /// schemes are mapped to their HTTP equivalents. IPv6 literal hosts keep
    /// their brackets out of `host`.
    pub fn parse(url: &str) -> Result<HttpUrl, HttpError> {
        let (scheme, rest) = if let Some(r) = url.strip_prefix("https://") {
            (Scheme::Https, r)
        } else if let Some(r) = url.strip_prefix("http://") {
            (Scheme::Http, r)
        } else if let Some(r) = url.strip_prefix("wss://") {
            (Scheme::Https, r)
        } else if let Some(r) = url.strip_prefix("ws://") {
            (Scheme::Http, r)
        } else {
            return Err(HttpError::MalformedRequest(format!(
                "unsupported URL scheme: {}",
                url
            )));
        };

        // Drop the fragment, split authority from path+query.
        let rest = match rest.find('#') {
            Some(i) => &rest[..i],
            None => rest,
        };
        let (authority, path_and_query) = match rest.find(|c| c == '/' || c == '?') {
            Some(i) if rest.as_bytes()[i] == b'/' => (&rest[..i], rest[i..].to_string()),
            Some(i) => (&rest[..i], format!("/{}", &rest[i..])),
            None => (rest, "/".to_string()),
        };

        // Host and optional port; IPv6 literals are bracketed.
        let (host, port) = if let Some(after) = authority.strip_prefix('[') {
            let end = after.find(']').ok_or_else(|| {
                HttpError::MalformedRequest("unterminated IPv6 bracket".into())
            })?;
            let host = &after[..end];
            let port = match after[end + 1..].strip_prefix(':') {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| HttpError::MalformedRequest("invalid port".into()))?,
                None => scheme.default_port(),
            };
            (host, port)
        } else {
            match authority.rfind(':') {
                Some(i) => {
                    let port = authority[i + 1..]
                        .parse::<u16>()
                        .map_err(|_| HttpError::MalformedRequest("invalid port".into()))?;
                    (&authority[..i], port)
                }
                None => (authority, scheme.default_port()),
            }
        };

        if host.is_empty() {
            return Err(HttpError::MalformedRequest("URL has no host".into()));
        }
        if !host_is_wire_safe(host) {
            return Err(HttpError::MalformedRequest(format!(
                "host is not in canonical wire form: {}",
                host
            )));
        }

        Ok(HttpUrl {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            path_and_query,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Value of the Host header / :authority pseudo-header: the canonical
    /// host, with the port appended when it is not the scheme default.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Resolve a Location header against this URL. Absolute locations parse
    /// directly; relative ones keep scheme/host/port.
    pub fn resolve_location(&self, location: &str) -> Result<HttpUrl, HttpError> {
        if location.starts_with("http://")
            || location.starts_with("https://")
            || location.starts_with("ws://")
            || location.starts_with("wss://")
        {
            return HttpUrl::parse(location);
        }
        let path_and_query = if location.starts_with('/') {
            location.to_string()
        } else {
            // Relative to the current path's directory.
            let base = match self.path_and_query.rfind('/') {
                Some(i) => &self.path_and_query[..=i],
                None => "/",
            };
            format!("{}{}", base, location)
        };
        Ok(HttpUrl {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
            path_and_query,
        })
    }

    pub fn same_host_and_port(&self, other: &HttpUrl) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme.as_str(), self.authority(), self.path_and_query)
    }
}

/// Hosts must arrive canonical: ASCII, lowercase-able, no whitespace or
/// control characters. Non-ASCII hosts (pre-IDNA) are refused here.
fn host_is_wire_safe(host: &str) -> bool {
    host.bytes().all(|b| b.is_ascii_graphic() && b != b'/' && b != b'@')
}
