use thiserror::Error;

/// Failure taxonomy of the proxy core. Any of these aborts the current
/// request; the engine closes the upstream socket and drops client
/// persistence before handing the error back to the host.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Premature close or short write on either side, including upstream
    /// connect failures after every address has been tried.
    #[error("connection broken: {0}")]
    IoBroken(String),
    /// Structurally invalid HTTP traffic.
    #[error("malformed HTTP traffic: {0}")]
    Protocol(String),
    /// Extension or pipeline misuse.
    #[error("handler misuse: {0}")]
    Runtime(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn broken(detail: impl Into<String>) -> Self {
        Self::IoBroken(detail.into())
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }

    pub fn runtime(detail: impl Into<String>) -> Self {
        Self::Runtime(detail.into())
    }

    /// True for transport-level failures, as opposed to protocol or misuse
    /// errors. The pipeline treats these as a benign close when they occur
    /// before any byte of a request was read.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::IoBroken(_) | Self::Io(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::IoBroken(_) => "io_broken",
            Self::Protocol(_) => "http_protocol_broken",
            Self::Runtime(_) => "runtime_error",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<ferry_http::ParseError> for ProxyError {
    fn from(error: ferry_http::ParseError) -> Self {
        Self::Protocol(error.to_string())
    }
}

impl From<ferry_http::CodingError> for ProxyError {
    fn from(error: ferry_http::CodingError) -> Self {
        Self::Runtime(error.to_string())
    }
}
