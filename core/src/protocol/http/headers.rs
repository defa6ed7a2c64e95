/*
 * headers.rs
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

//! Ordered header multimap. Insertion order and duplicates are preserved;
//! lookup is case-insensitive; display keeps the original case. Names must
//! be ASCII tokens, values must not contain control characters other than
//! tab.

use crate::error::HttpError;

#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        }
    }

    /// Append a header, keeping any existing entries with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every entry with this name by a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value for the name, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when any value for `name` equals `token` case-insensitively,
    /// treating the value as a comma-separated token list.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate every entry for use on the wire.
    pub fn validate(&self) -> Result<(), HttpError> {
        for (name, value) in &self.entries {
            validate_name(name)?;
            validate_value(name, value)?;
        }
        Ok(())
    }
}

/// Header names are ASCII tokens per RFC 7230.
pub fn validate_name(name: &str) -> Result<(), HttpError> {
    if name.is_empty() {
        return Err(HttpError::MalformedRequest("empty header name".into()));
    }
    for b in name.bytes() {
        let ok = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                    | b'_' | b'`' | b'|' | b'~'
            );
        if !ok {
            return Err(HttpError::MalformedRequest(format!(
                "invalid character in header name: {:?}",
                name
            )));
        }
    }
    Ok(())
}

/// Values may contain tab and space but no other control characters, and
/// never CR or LF (header injection).
pub fn validate_value(name: &str, value: &str) -> Result<(), HttpError> {
    for b in value.bytes() {
        if (b < 0x20 && b != b'\t') || b == 0x7f {
            return Err(HttpError::MalformedRequest(format!(
                "invalid character in value of header {}",
                name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.add("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let mut h = Headers::new();
        h.add("Set-Cookie", "a=1");
        h.add("Set-Cookie", "b=2");
        let all: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(all, vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_all() {
        let mut h = Headers::new();
        h.add("X", "1");
        h.add("x", "2");
        h.set("X", "3");
        assert_eq!(h.get_all("x").count(), 1);
        assert_eq!(h.get("x"), Some("3"));
    }

    #[test]
    fn token_list_matching() {
        let mut h = Headers::new();
        h.add("Connection", "keep-alive, Upgrade");
        assert!(h.has_token("connection", "upgrade"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn crlf_in_value_rejected() {
        assert!(validate_value("x", "a\r\nEvil: yes").is_err());
        assert!(validate_value("x", "tab\tok").is_ok());
    }

    #[test]
    fn non_token_name_rejected() {
        assert!(validate_name("Good-Name").is_ok());
        assert!(validate_name("bad name").is_err());
        assert!(validate_name("bad:name").is_err());
        assert!(validate_name("").is_err());
    }
}
