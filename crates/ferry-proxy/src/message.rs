use ferry_http::{HeaderBlock, RequestLine, StatusLine};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::ProxyError;
use crate::socket::FramedSocket;

/// A parsed request head: the mutable unit hooks operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub line: RequestLine,
    pub headers: HeaderBlock,
}

/// A parsed response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub line: StatusLine,
    pub headers: HeaderBlock,
}

impl HttpRequest {
    /// Builds the head from an already-read request line plus the header
    /// block that follows on the socket.
    pub async fn read_after_request_line<S>(
        socket: &mut FramedSocket<S>,
        request_line: &str,
        max_head_bytes: usize,
    ) -> Result<Self, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let line = RequestLine::parse(request_line)?;
        let headers = read_header_block(socket, max_head_bytes, request_line.len()).await?;
        Ok(Self { line, headers })
    }

    /// Replaces the request target. When the new URI carries an authority,
    /// the `Host` header is updated to match.
    pub fn change_uri(&mut self, new_uri: &str) -> Result<(), ProxyError> {
        let parsed = new_uri.parse::<http::Uri>().map_err(|_| {
            ProxyError::runtime(format!("change_uri called with an unparseable URI '{new_uri}'"))
        })?;
        if let Some(authority) = parsed.authority() {
            self.headers.set("Host", Some(authority.as_str()));
        }
        self.line.set_uri(new_uri);
        Ok(())
    }

    /// Writes request line, headers in their original order, and the
    /// terminating blank line.
    pub async fn write_head<S>(&mut self, socket: &mut FramedSocket<S>) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        socket.write_line(self.line.text()).await?;
        socket.write_bytes(self.headers.serialized().as_bytes()).await?;
        socket.write_bytes(b"\r\n").await?;
        Ok(())
    }
}

impl HttpResponse {
    /// Reads a status line (discarding empty leading lines) and the header
    /// block that follows.
    pub async fn read_from<S>(
        socket: &mut FramedSocket<S>,
        max_head_bytes: usize,
    ) -> Result<Self, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let status_line = loop {
            let line = socket.read_line().await?;
            if !line.is_empty() {
                break line;
            }
        };
        let line = StatusLine::parse(&status_line)?;
        let headers = read_header_block(socket, max_head_bytes, status_line.len()).await?;
        Ok(Self { line, headers })
    }

    pub async fn write_head<S>(&mut self, socket: &mut FramedSocket<S>) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        socket.write_line(self.line.text()).await?;
        socket.write_bytes(self.headers.serialized().as_bytes()).await?;
        socket.write_bytes(b"\r\n").await?;
        Ok(())
    }
}

async fn read_header_block<S>(
    socket: &mut FramedSocket<S>,
    max_head_bytes: usize,
    mut consumed: usize,
) -> Result<HeaderBlock, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let line = socket.read_line().await?;
        consumed += line.len() + 2;
        if consumed > max_head_bytes {
            return Err(ProxyError::protocol(
                "message head exceeded the configured size limit",
            ));
        }
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    Ok(HeaderBlock::parse(&lines)?)
}
