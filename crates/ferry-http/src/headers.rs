use crate::ParseError;

/// Header names whose values are comma-separated token lists compared
/// case-insensitively; their values are lower-cased at parse time.
const TOKEN_LIST_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "transfer-encoding",
    "content-encoding",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderEntry {
    /// Original spelling, used when serializing back to the wire.
    name: String,
    lower: String,
    value: String,
}

/// Order-preserving header block.
///
/// The entry list is the single source of truth: duplicate header lines stay
/// as separate entries so that re-serializing an unmodified block reproduces
/// the input (with newlines normalized to CRLF). Typed lookups merge
/// duplicates on demand; the wire form is cached and invalidated on mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    entries: Vec<HeaderEntry>,
    serialized: Option<String>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the lines of one header block (without the terminating blank
    /// line). A line with no colon is a protocol error.
    pub fn parse<L: AsRef<str>>(lines: &[L]) -> Result<Self, ParseError> {
        let mut entries = Vec::with_capacity(lines.len());
        for line in lines {
            let line = line.as_ref();
            let (name, value) = line
                .split_once(':')
                .ok_or(ParseError::HeaderMissingColon)?;
            let name = name.trim();
            let lower = name.to_ascii_lowercase();
            let mut value = value.trim().to_string();
            if TOKEN_LIST_HEADERS.contains(&lower.as_str()) {
                value.make_ascii_lowercase();
            }
            entries.push(HeaderEntry {
                name: name.to_string(),
                lower,
                value,
            });
        }
        Ok(Self {
            entries,
            serialized: None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merged value for `name`: duplicates are joined with `,`, except
    /// `Content-Length` where the last occurrence wins.
    pub fn get(&self, name: &str) -> Option<String> {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" {
            return self
                .entries
                .iter()
                .rev()
                .find(|entry| entry.lower == lower)
                .map(|entry| entry.value.clone());
        }
        let mut merged: Option<String> = None;
        for entry in &self.entries {
            if entry.lower != lower {
                continue;
            }
            match merged.as_mut() {
                Some(existing) => {
                    existing.push(',');
                    existing.push_str(&entry.value);
                }
                None => merged = Some(entry.value.clone()),
            }
        }
        merged
    }

    pub fn contains(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.entries.iter().any(|entry| entry.lower == lower)
    }

    /// Sets `name` to `value`. An existing header is updated in place
    /// (keeping its position; later duplicates are dropped); an absent one is
    /// appended at the end. `None` removes the header entirely.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        self.serialized = None;
        let lower = name.to_ascii_lowercase();
        match value {
            None => self.entries.retain(|entry| entry.lower != lower),
            Some(value) => {
                let Some(first) = self
                    .entries
                    .iter()
                    .position(|entry| entry.lower == lower)
                else {
                    self.entries.push(HeaderEntry {
                        name: name.to_string(),
                        lower,
                        value: value.to_string(),
                    });
                    return;
                };
                self.entries[first].value = value.to_string();
                let mut index = first + 1;
                while index < self.entries.len() {
                    if self.entries[index].lower == lower {
                        self.entries.remove(index);
                    } else {
                        index += 1;
                    }
                }
            }
        }
    }

    /// Wire form: one `name: value` line per entry, each terminated by CRLF.
    /// Cached until the next mutation.
    pub fn serialized(&mut self) -> &str {
        if self.serialized.is_none() {
            self.serialized = Some(self.render());
        }
        self.serialized.as_deref().unwrap_or("")
    }

    /// Uncached render, for callers holding only a shared borrow.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.name);
            out.push_str(": ");
            out.push_str(&entry.value);
            out.push_str("\r\n");
        }
        out
    }

    pub fn token_list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|value| {
                value
                    .split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .filter(|token| !token.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.token_list(name).iter().any(|t| t == token)
    }

    pub fn connection_tokens(&self) -> Vec<String> {
        self.token_list("connection")
    }

    pub fn proxy_connection_tokens(&self) -> Vec<String> {
        self.token_list("proxy-connection")
    }

    pub fn transfer_encoding_tokens(&self) -> Vec<String> {
        self.token_list("transfer-encoding")
    }

    pub fn content_length(&self) -> Result<Option<u64>, ParseError> {
        match self.get("content-length") {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ParseError::InvalidContentLength),
        }
    }

    pub fn content_encoding(&self) -> Option<String> {
        self.get("content-encoding")
    }

    pub fn host(&self) -> Option<String> {
        self.get("host")
    }

    pub fn referer(&self) -> Option<String> {
        self.get("referer")
    }

    pub fn cache_control(&self) -> Option<String> {
        self.get("cache-control")
    }

    pub fn expires(&self) -> Option<String> {
        self.get("expires")
    }

    pub fn pragma(&self) -> Option<String> {
        self.get("pragma")
    }
}
