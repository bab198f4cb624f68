use std::io::Read;

use flate2::read::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder};
use flate2::Compression;

/// Response-body codings the proxy can materialize for rewriting hooks. The
/// default pipeline never touches these; they exist for extensions that
/// buffer a body, transform it, and re-emit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    /// Raw DEFLATE stream, no zlib wrapper.
    Deflate,
}

#[derive(Debug, thiserror::Error)]
pub enum CodingError {
    #[error("unsupported content encoding '{0}'")]
    Unsupported(String),
    #[error("content coding failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ContentCoding {
    /// Maps a `Content-Encoding` value. An absent or empty value means
    /// identity; anything outside gzip/deflate/identity is unsupported.
    pub fn from_label(label: &str) -> Result<Self, CodingError> {
        match label.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            other => Err(CodingError::Unsupported(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    pub fn decode(self, input: &[u8]) -> Result<Vec<u8>, CodingError> {
        let mut out = Vec::with_capacity(input.len());
        match self {
            Self::Identity => out.extend_from_slice(input),
            Self::Gzip => {
                GzDecoder::new(input).read_to_end(&mut out)?;
            }
            Self::Deflate => {
                DeflateDecoder::new(input).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }

    pub fn encode(self, input: &[u8]) -> Result<Vec<u8>, CodingError> {
        let mut out = Vec::with_capacity(input.len());
        match self {
            Self::Identity => out.extend_from_slice(input),
            Self::Gzip => {
                GzEncoder::new(input, Compression::default()).read_to_end(&mut out)?;
            }
            Self::Deflate => {
                DeflateEncoder::new(input, Compression::default()).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }
}
