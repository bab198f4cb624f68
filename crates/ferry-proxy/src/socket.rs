use std::ops::Range;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::ProxyError;

pub const RECV_BUFFER_LEN: usize = 8 * 1024;

/// Receives decoded body fragments when a hook diverts a response body away
/// from the client socket.
pub trait PacketSink: Send {
    fn on_packet(&mut self, data: &[u8]) -> Result<(), ProxyError>;
}

/// One side of the proxy: a stream plus an 8 KiB receive buffer shared by
/// line reads and binary reads.
///
/// A line read pulls bytes into the buffer opportunistically; whatever it did
/// not consume is recorded in `pending` and handed to the next binary read
/// before the kernel is entered again. Losing that range would lose body
/// bytes, so every bounded tunnel maintains it as well.
pub struct FramedSocket<S> {
    stream: S,
    buf: Box<[u8]>,
    pending: Option<Range<usize>>,
    keep_alive: bool,
    dead: bool,
}

impl FramedSocket<TcpStream> {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self::new(stream)
    }
}

impl<S> FramedSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: vec![0_u8; RECV_BUFFER_LEN].into_boxed_slice(),
            pending: None,
            keep_alive: false,
            dead: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|range| !range.is_empty())
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Removes and returns any bytes a previous line read left behind.
    pub(crate) fn take_pending(&mut self) -> Option<Vec<u8>> {
        let range = self.pending.take()?;
        if range.is_empty() {
            return None;
        }
        Some(self.buf[range].to_vec())
    }

    /// First `len` bytes of the receive buffer, valid right after a
    /// `read_binary` that returned `len`.
    pub(crate) fn filled(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    /// Reads one line, accepting both `LF` and `CRLF` endings; a stray `CR`
    /// in the middle of a line is preserved. Unconsumed buffer bytes become
    /// the pending range for the next binary read. Closing the connection
    /// mid-line is `IoBroken`.
    pub async fn read_line(&mut self) -> Result<String, ProxyError> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let range = match self.pending.take() {
                Some(range) if !range.is_empty() => range,
                _ => {
                    let read = self.stream.read(&mut self.buf).await?;
                    if read == 0 {
                        self.dead = true;
                        return Err(ProxyError::broken(
                            "connection closed while reading a line",
                        ));
                    }
                    0..read
                }
            };
            let window = &self.buf[range.clone()];
            match window.iter().position(|&byte| byte == b'\n') {
                Some(newline) => {
                    line.extend_from_slice(&window[..newline]);
                    let rest = range.start + newline + 1..range.end;
                    if !rest.is_empty() {
                        self.pending = Some(rest);
                    }
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return String::from_utf8(line).map_err(|_| {
                        ProxyError::protocol("line was not valid UTF-8")
                    });
                }
                None => line.extend_from_slice(window),
            }
        }
    }

    /// Makes bytes available at the front of the buffer and returns how
    /// many. Pending leftovers are moved to the front (the ranges may
    /// overlap) and returned without touching the kernel; otherwise a fresh
    /// read is issued. Returns 0 exactly when the peer closed.
    pub async fn read_binary(&mut self) -> Result<usize, ProxyError> {
        if let Some(range) = self.pending.take() {
            if !range.is_empty() {
                let len = range.len();
                self.buf.copy_within(range, 0);
                return Ok(len);
            }
        }
        let read = self.stream.read(&mut self.buf).await?;
        if read == 0 {
            self.dead = true;
        }
        Ok(read)
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), ProxyError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ProxyError> {
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.dead = true;
        let _ = self.stream.shutdown().await;
    }

    /// Forwards everything until the peer closes. Read failures on the
    /// source count as a close; write failures propagate. Returns the byte
    /// count sent.
    pub async fn tunnel_until_close<D>(
        &mut self,
        dest: &mut FramedSocket<D>,
    ) -> Result<u64, ProxyError>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let mut total = 0_u64;
        loop {
            let read = match self.read_binary().await {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            dest.write_bytes(&self.buf[..read]).await?;
            total += read as u64;
        }
        Ok(total)
    }

    /// Forwards exactly `len` bytes. When the buffer holds more than asked
    /// for, the excess becomes the pending range. A close before `len`
    /// bytes arrived is `IoBroken`.
    pub async fn tunnel_n<D>(
        &mut self,
        dest: &mut FramedSocket<D>,
        len: u64,
    ) -> Result<u64, ProxyError>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let mut remaining = len;
        while remaining > 0 {
            let read = self.read_binary().await?;
            if read == 0 {
                return Err(ProxyError::broken(
                    "connection closed before the framed body completed",
                ));
            }
            let take = remaining.min(read as u64) as usize;
            dest.write_bytes(&self.buf[..take]).await?;
            if take < read {
                self.pending = Some(take..read);
            }
            remaining -= take as u64;
        }
        Ok(len)
    }

    pub async fn tunnel_until_close_to_sink(
        &mut self,
        sink: &mut dyn PacketSink,
    ) -> Result<u64, ProxyError> {
        let mut total = 0_u64;
        loop {
            let read = match self.read_binary().await {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            sink.on_packet(&self.buf[..read])?;
            total += read as u64;
        }
        Ok(total)
    }

    pub async fn tunnel_n_to_sink(
        &mut self,
        sink: &mut dyn PacketSink,
        len: u64,
    ) -> Result<u64, ProxyError> {
        let mut remaining = len;
        while remaining > 0 {
            let read = self.read_binary().await?;
            if read == 0 {
                return Err(ProxyError::broken(
                    "connection closed before the framed body completed",
                ));
            }
            let take = remaining.min(read as u64) as usize;
            sink.on_packet(&self.buf[..take])?;
            if take < read {
                self.pending = Some(take..read);
            }
            remaining -= take as u64;
        }
        Ok(len)
    }

    /// Relays one chunked body. Chunk-size lines (extensions included) and
    /// trailer lines are forwarded verbatim; returns the decoded byte count.
    pub async fn tunnel_chunked<D>(
        &mut self,
        dest: &mut FramedSocket<D>,
    ) -> Result<u64, ProxyError>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let mut total = 0_u64;
        loop {
            let size_line = self.read_line().await?;
            if size_line.is_empty() {
                return Err(ProxyError::protocol("empty chunk size line"));
            }
            let size = parse_chunk_size(&size_line)?;
            dest.write_line(&size_line).await?;
            if size == 0 {
                loop {
                    let trailer = self.read_line().await?;
                    dest.write_line(&trailer).await?;
                    if trailer.is_empty() {
                        return Ok(total);
                    }
                }
            }
            total += self.tunnel_n(dest, size).await?;
            let terminator = self.read_line().await?;
            dest.write_line(&terminator).await?;
        }
    }

    /// Chunked relay into a packet sink: only the decoded chunk data is
    /// delivered; size lines, terminators and trailers are consumed.
    pub async fn tunnel_chunked_to_sink(
        &mut self,
        sink: &mut dyn PacketSink,
    ) -> Result<u64, ProxyError> {
        let mut total = 0_u64;
        loop {
            let size_line = self.read_line().await?;
            if size_line.is_empty() {
                return Err(ProxyError::protocol("empty chunk size line"));
            }
            let size = parse_chunk_size(&size_line)?;
            if size == 0 {
                loop {
                    let trailer = self.read_line().await?;
                    if trailer.is_empty() {
                        return Ok(total);
                    }
                }
            }
            total += self.tunnel_n_to_sink(sink, size).await?;
            let _terminator = self.read_line().await?;
        }
    }

    /// Minimal canned error response: HTTP/1.0, `Connection: close`, a tiny
    /// HTML body with exact `Content-Length`.
    pub async fn send_http_error(&mut self, code: u16) -> Result<(), ProxyError> {
        let reason = canned_reason(code);
        let body = format!("<html>\n <body>\n  <h1>{code} {reason}</h1>\n </body>\n</html>");
        let head = format!(
            "HTTP/1.0 {code} {reason}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(body.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

pub(crate) fn parse_chunk_size(line: &str) -> Result<u64, ProxyError> {
    let digits = line
        .split(|c: char| c == ';' || c == ' ' || c == '\t')
        .next()
        .unwrap_or(line)
        .trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| ProxyError::protocol(format!("unparseable chunk size line '{line}'")))
}

pub(crate) fn canned_reason(code: u16) -> &'static str {
    match code {
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        501 => "Not Implemented",
        _ => "Proxy Error",
    }
}
