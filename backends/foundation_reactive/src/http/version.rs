use core::fmt;

/// The protocol versions the engine speaks.
///
/// Anything other than HTTP/1.0 and HTTP/1.1 is rejected at parse time so a
/// response line such as `HTTP/2.0 200 OK` surfaces as an unsupported
/// version instead of being half understood.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    Http10,
    #[default]
    Http11,
}

impl HttpVersion {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_one_dot_zero_and_one_dot_one() {
        assert_eq!(HttpVersion::parse("HTTP/1.0"), Some(HttpVersion::Http10));
        assert_eq!(HttpVersion::parse("HTTP/1.1"), Some(HttpVersion::Http11));
        assert_eq!(HttpVersion::parse("HTTP/2.0"), None);
        assert_eq!(HttpVersion::parse("SPDY/3"), None);
    }
}
