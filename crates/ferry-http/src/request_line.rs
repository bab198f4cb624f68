use crate::{HttpVersion, ParseError};

/// First line of a request: method, target URI, protocol version, plus the
/// exact text that was read off the wire. Mutating any field regenerates the
/// text view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: String,
    uri: String,
    version: HttpVersion,
    text: String,
}

impl RequestLine {
    /// Splits on runs of whitespace and requires exactly three tokens.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut tokens = line.split_ascii_whitespace();
        let method = tokens.next().ok_or(ParseError::MalformedRequestLine)?;
        let uri = tokens.next().ok_or(ParseError::MalformedRequestLine)?;
        let version_token = tokens.next().ok_or(ParseError::MalformedRequestLine)?;
        if tokens.next().is_some() {
            return Err(ParseError::MalformedRequestLine);
        }
        let version = HttpVersion::parse(version_token)?;
        Ok(Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version,
            text: line.to_string(),
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn set_method(&mut self, method: &str) {
        self.method = method.to_string();
        self.rebuild_text();
    }

    pub fn set_uri(&mut self, uri: &str) {
        self.uri = uri.to_string();
        self.rebuild_text();
    }

    pub fn set_version(&mut self, version: HttpVersion) {
        self.version = version;
        self.rebuild_text();
    }

    fn rebuild_text(&mut self) {
        self.text = format!("{} {} {}", self.method, self.uri, self.version);
    }
}
