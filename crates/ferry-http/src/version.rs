use std::fmt;

use crate::ParseError;

/// Numeric suffix of an `HTTP/X.Y` protocol token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_10: Self = Self { major: 1, minor: 0 };
    pub const HTTP_11: Self = Self { major: 1, minor: 1 };

    pub fn parse(token: &str) -> Result<Self, ParseError> {
        let suffix = token
            .strip_prefix("HTTP/")
            .ok_or(ParseError::InvalidHttpVersion)?;
        let (major, minor) = suffix
            .split_once('.')
            .ok_or(ParseError::InvalidHttpVersion)?;
        let major = major
            .parse::<u8>()
            .map_err(|_| ParseError::InvalidHttpVersion)?;
        let minor = minor
            .parse::<u8>()
            .map_err(|_| ParseError::InvalidHttpVersion)?;
        Ok(Self { major, minor })
    }

    /// HTTP/1.1 and later default to persistent connections.
    pub fn persistent_by_default(self) -> bool {
        self >= Self::HTTP_11
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}
