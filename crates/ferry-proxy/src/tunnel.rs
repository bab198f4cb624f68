use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::ProxyError;
use crate::socket::{FramedSocket, RECV_BUFFER_LEN};

/// Opaque bidirectional byte pump for an established CONNECT exchange.
///
/// Buffered leftovers on either socket are flushed to the opposite side
/// first, then both directions are driven from one `select!` loop. The pump
/// ends as soon as either side closes; read failures count as a close, write
/// failures propagate. Returns `(client_bytes, server_bytes)`.
pub(crate) async fn pump<C, U>(
    client: &mut FramedSocket<C>,
    upstream: &mut FramedSocket<U>,
) -> Result<(u64, u64), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut from_client = 0_u64;
    let mut from_server = 0_u64;

    if let Some(bytes) = client.take_pending() {
        upstream.write_bytes(&bytes).await?;
        from_client += bytes.len() as u64;
    }
    if let Some(bytes) = upstream.take_pending() {
        client.write_bytes(&bytes).await?;
        from_server += bytes.len() as u64;
    }

    let client_stream = client.stream_mut();
    let upstream_stream = upstream.stream_mut();
    let mut client_buf = [0_u8; RECV_BUFFER_LEN];
    let mut server_buf = [0_u8; RECV_BUFFER_LEN];

    loop {
        tokio::select! {
            result = client_stream.read(&mut client_buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        let _ = upstream_stream.shutdown().await;
                        break;
                    }
                    Ok(read) => {
                        upstream_stream.write_all(&client_buf[..read]).await?;
                        from_client += read as u64;
                    }
                }
            }
            result = upstream_stream.read(&mut server_buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        let _ = client_stream.shutdown().await;
                        break;
                    }
                    Ok(read) => {
                        client_stream.write_all(&server_buf[..read]).await?;
                        from_server += read as u64;
                    }
                }
            }
        }
    }

    Ok((from_client, from_server))
}

#[cfg(test)]
mod tests {
    use super::pump;
    use crate::socket::FramedSocket;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pumps_both_directions_until_one_side_closes() {
        let (client_near, mut client_far) = duplex(64 * 1024);
        let (upstream_near, mut upstream_far) = duplex(64 * 1024);
        let mut client = FramedSocket::new(client_near);
        let mut upstream = FramedSocket::new(upstream_near);

        let driver = tokio::spawn(async move {
            client_far.write_all(b"ping").await.expect("client write");
            let mut reply = [0_u8; 4];
            client_far.read_exact(&mut reply).await.expect("client read");
            assert_eq!(&reply, b"pong");
            client_far.shutdown().await.expect("client close");
            client_far
        });
        let echo = tokio::spawn(async move {
            let mut seen = [0_u8; 4];
            upstream_far.read_exact(&mut seen).await.expect("upstream read");
            assert_eq!(&seen, b"ping");
            upstream_far.write_all(b"pong").await.expect("upstream write");
            upstream_far
        });

        let (from_client, from_server) =
            pump(&mut client, &mut upstream).await.expect("pump");
        assert_eq!(from_client, 4);
        assert_eq!(from_server, 4);

        driver.await.expect("driver");
        echo.await.expect("echo");
    }

    #[tokio::test]
    async fn pending_client_bytes_are_flushed_into_the_tunnel() {
        let (client_near, mut client_far) = duplex(64 * 1024);
        let (upstream_near, mut upstream_far) = duplex(64 * 1024);
        let mut client = FramedSocket::new(client_near);
        let mut upstream = FramedSocket::new(upstream_near);

        // A line read that over-reads leaves the tail pending.
        client_far
            .write_all(b"CONNECT-ish line\r\nEARLY")
            .await
            .expect("seed");
        assert_eq!(
            client.read_line().await.expect("line"),
            "CONNECT-ish line"
        );
        assert!(client.has_pending());
        client_far.shutdown().await.expect("close client");

        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            upstream_far.read_to_end(&mut out).await.expect("drain");
            out
        });

        let (from_client, _) = pump(&mut client, &mut upstream).await.expect("pump");
        assert_eq!(from_client, 5);
        drop(upstream);
        assert_eq!(collector.await.expect("collector"), b"EARLY");
    }
}
