use crate::{HttpVersion, ParseError};

/// First line of a response. The reason phrase may be empty; the status code
/// is three digits with the leading digit in 1..=5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: HttpVersion,
    code: u16,
    reason: String,
    text: String,
}

impl StatusLine {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut tokens = line.split_ascii_whitespace();
        let version_token = tokens.next().ok_or(ParseError::MalformedStatusLine)?;
        let status_token = tokens.next().ok_or(ParseError::MalformedStatusLine)?;
        let reason = tokens.collect::<Vec<_>>().join(" ");

        let version = HttpVersion::parse(version_token)?;
        let code = parse_status_code(status_token)?;
        Ok(Self {
            version,
            code,
            reason,
            text: line.to_string(),
        })
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 1xx, 204 and 304 responses never carry a message body.
    pub fn bodyless(&self) -> bool {
        (100..200).contains(&self.code) || self.code == 204 || self.code == 304
    }

    pub fn set_code(&mut self, code: u16, reason: &str) {
        self.code = code;
        self.reason = reason.to_string();
        self.rebuild_text();
    }

    pub fn set_version(&mut self, version: HttpVersion) {
        self.version = version;
        self.rebuild_text();
    }

    fn rebuild_text(&mut self) {
        if self.reason.is_empty() {
            self.text = format!("{} {}", self.version, self.code);
        } else {
            self.text = format!("{} {} {}", self.version, self.code, self.reason);
        }
    }
}

fn parse_status_code(token: &str) -> Result<u16, ParseError> {
    if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidStatusCode);
    }
    let code = token.parse::<u16>().map_err(|_| ParseError::InvalidStatusCode)?;
    if !(100..=599).contains(&code) {
        return Err(ParseError::InvalidStatusCode);
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::StatusLine;
    use crate::{HttpVersion, ParseError};

    #[test]
    fn parses_status_line_with_reason() {
        let line = StatusLine::parse("HTTP/1.1 200 OK").expect("must parse");
        assert_eq!(line.version(), HttpVersion::HTTP_11);
        assert_eq!(line.code(), 200);
        assert_eq!(line.reason(), "OK");
        assert_eq!(line.text(), "HTTP/1.1 200 OK");
    }

    #[test]
    fn reason_phrase_may_be_empty() {
        let line = StatusLine::parse("HTTP/1.0 204").expect("must parse");
        assert_eq!(line.code(), 204);
        assert_eq!(line.reason(), "");
    }

    #[test]
    fn multi_word_reason_is_preserved() {
        let line = StatusLine::parse("HTTP/1.1 404 Not Found").expect("must parse");
        assert_eq!(line.reason(), "Not Found");
    }

    #[test]
    fn rejects_out_of_range_and_non_digit_codes() {
        assert_eq!(
            StatusLine::parse("HTTP/1.1 99 Low").expect_err("must fail"),
            ParseError::InvalidStatusCode
        );
        assert_eq!(
            StatusLine::parse("HTTP/1.1 666 Evil").expect_err("must fail"),
            ParseError::InvalidStatusCode
        );
        assert_eq!(
            StatusLine::parse("HTTP/1.1 2x0 Huh").expect_err("must fail"),
            ParseError::InvalidStatusCode
        );
    }

    #[test]
    fn bodyless_statuses_are_classified() {
        for code in ["100", "101", "204", "304"] {
            let line =
                StatusLine::parse(&format!("HTTP/1.1 {code} X")).expect("must parse");
            assert!(line.bodyless(), "{code} should be bodyless");
        }
        assert!(!StatusLine::parse("HTTP/1.1 200 OK")
            .expect("must parse")
            .bodyless());
    }

    #[test]
    fn mutation_regenerates_text_view() {
        let mut line = StatusLine::parse("HTTP/1.1 200 OK").expect("must parse");
        line.set_code(502, "Bad Gateway");
        assert_eq!(line.text(), "HTTP/1.1 502 Bad Gateway");
    }
}
