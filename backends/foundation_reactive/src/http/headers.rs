//! Ordered, case-insensitive HTTP header collection.
//!
//! WHY: Requests and responses need a header map that keeps insertion order
//! (so the wire form is predictable) while matching names without regard to
//! case, and that can carry repeated names such as `Set-Cookie`.
//!
//! WHAT: `HttpHeaders`, a small multi-map over `(name, value)` pairs, plus the
//! header names the client engine reads or writes.

use core::fmt;

/// Well-known header names used by the engine.
pub mod names {
    pub const HOST: &str = "Host";
    pub const ACCEPT: &str = "Accept";
    pub const CONNECTION: &str = "Connection";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const COOKIE: &str = "Cookie";
    pub const LOCATION: &str = "Location";
    pub const SET_COOKIE: &str = "Set-Cookie";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    pub const UPGRADE: &str = "Upgrade";
    pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
    pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
    pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
    pub const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value, keeping any existing values for the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value stored under `name` with a single value.
    ///
    /// The replacement keeps the position of the first existing entry so
    /// rewriting `Host` does not move it to the end of the head.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => {
                self.entries[index] = (name.clone(), value);
                let mut seen_first = false;
                self.entries.retain(|(key, _)| {
                    if !key.eq_ignore_ascii_case(&name) {
                        return true;
                    }
                    let keep = !seen_first;
                    seen_first = true;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Removes every value stored under `name`, returning whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// True when any comma separated token of `name` equals `token`, ignoring case.
    #[must_use]
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for HttpHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

/// A header name must be a non-empty RFC 9110 token.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// Header values may not carry line breaks or other control bytes except tab.
#[must_use]
pub fn is_valid_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}
