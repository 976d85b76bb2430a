//! Request targets and the redirect trail.

use core::fmt;
use std::sync::Arc;

use url::Url;

use super::HttpClientError;

/// Most redirects followed for one logical request.
pub const MAX_REDIRECTS: usize = 50;

/// Where one attempt connects to and what it asks for.
///
/// Immutable within an attempt; the redirect bridge swaps in a new target
/// between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    url: Url,
}

impl Target {
    /// Parses an absolute `http`, `https`, `ws` or `wss` URL.
    ///
    /// # Errors
    ///
    /// `InvalidUrl` for unparsable input, other schemes or a missing host.
    pub fn parse(input: &str) -> Result<Self, HttpClientError> {
        let url = Url::parse(input).map_err(|err| HttpClientError::InvalidUrl(format!("{input}: {err}")))?;
        Self::from_url(url)
    }

    /// # Errors
    ///
    /// `InvalidUrl` for schemes other than http(s)/ws(s) or a missing host.
    pub fn from_url(url: Url) -> Result<Self, HttpClientError> {
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(HttpClientError::InvalidUrl(format!(
                "unsupported scheme {:?} in {url}",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(HttpClientError::InvalidUrl(format!("missing host in {url}")));
        }
        Ok(Self { url })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self.url.scheme(), "https" | "wss")
    }

    #[must_use]
    pub fn is_websocket(&self) -> bool {
        matches!(self.url.scheme(), "ws" | "wss")
    }

    /// Host without brackets for IPv6 literals, ready for dialling.
    #[must_use]
    pub fn host(&self) -> &str {
        let host = self.url.host_str().unwrap_or_default();
        host.strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(host)
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    /// Path plus query, the form used on the request line.
    #[must_use]
    pub fn request_uri(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_string(),
        }
    }

    /// Value for the `Host` header: the port is included only when it is not the scheme default.
    #[must_use]
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Resolves a `Location` value, absolute or relative, against this target.
    ///
    /// # Errors
    ///
    /// `InvalidLocation` when the value cannot be resolved to a supported URL.
    pub fn resolve(&self, location: &str) -> Result<Self, HttpClientError> {
        let joined = self
            .url
            .join(location.trim())
            .map_err(|err| HttpClientError::InvalidLocation(format!("{location}: {err}")))?;
        Self::from_url(joined).map_err(|err| HttpClientError::InvalidLocation(err.to_string()))
    }

    /// The websocket form of this target (`http` becomes `ws`, `https` becomes `wss`).
    ///
    /// # Errors
    ///
    /// `InvalidUrl` if the scheme cannot be switched.
    pub fn to_websocket(&self) -> Result<Self, HttpClientError> {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        let mut url = self.url.clone();
        url.set_scheme(scheme)
            .map_err(|()| HttpClientError::InvalidUrl(format!("cannot use {scheme} for {}", self.url)))?;
        Ok(Self { url })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// The URIs visited before the current one, oldest first.
///
/// Cloning is cheap and a clone never observes later appends: appending
/// produces a new history.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedirectHistory(Arc<[String]>);

impl RedirectHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_appended(&self, uri: impl Into<String>) -> Self {
        let mut entries = self.0.to_vec();
        entries.push(uri.into());
        Self(entries.into())
    }

    /// Whether another redirect may be followed from here.
    #[must_use]
    pub fn can_follow(&self) -> bool {
        self.0.len() < MAX_REDIRECTS
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.0.to_vec()
    }
}
