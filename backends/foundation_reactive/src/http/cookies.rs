//! Client side cookie handling.
//!
//! WHY: Requests carry cookies in a single `Cookie` header while responses
//! deliver them one per `Set-Cookie` line with attributes the client only
//! needs to read.
//!
//! WHAT: `Cookie` (strict client encoding) and `Cookies`, the name keyed view
//! parsed out of response headers.

use std::collections::BTreeMap;

use super::headers::{names, HttpHeaders};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Names must be tokens and values cookie-octets (RFC 6265 section 4.1.1),
    /// optionally wrapped in one pair of double quotes.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !super::headers::is_valid_name(&self.name) {
            return false;
        }
        let value = self
            .value
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .unwrap_or(&self.value);
        value.bytes().all(|b| {
            matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
        })
    }

    /// The `name=value` pair a client sends back; attributes are never echoed.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}={}", self.name, self.value)
    }

    /// Parses one `Set-Cookie` header value, returning `None` when it has no `name=value` pair.
    #[must_use]
    pub fn parse_set_cookie(line: &str) -> Option<Self> {
        let mut parts = line.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim());
        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((key, val)) => (key.trim(), Some(val.trim())),
                None => (attribute.trim(), None),
            };
            match (key.to_ascii_lowercase().as_str(), val) {
                ("domain", Some(val)) => cookie.domain = Some(val.to_string()),
                ("path", Some(val)) => cookie.path = Some(val.to_string()),
                ("max-age", Some(val)) => cookie.max_age = val.parse().ok(),
                ("secure", _) => cookie.secure = true,
                ("httponly", _) => cookie.http_only = true,
                _ => {}
            }
        }
        Some(cookie)
    }
}

/// Cookies delivered by a response, grouped by name in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cookies(BTreeMap<String, Vec<Cookie>>);

impl Cookies {
    #[must_use]
    pub fn from_headers(headers: &HttpHeaders) -> Self {
        let mut grouped: BTreeMap<String, Vec<Cookie>> = BTreeMap::new();
        for line in headers.get_all(names::SET_COOKIE) {
            match Cookie::parse_set_cookie(line) {
                Some(cookie) => grouped.entry(cookie.name.clone()).or_default().push(cookie),
                None => tracing::debug!("Ignoring malformed Set-Cookie line: {line:?}"),
            }
        }
        Self(grouped)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[Cookie]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
