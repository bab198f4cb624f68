use std::net::{IpAddr, Ipv6Addr};

use tokio::net::{lookup_host, TcpStream};

use crate::errors::ProxyError;
use crate::socket::FramedSocket;

/// Owns at most one proxy-server socket and reuses it while consecutive
/// requests keep targeting the same `(host, port)`.
pub struct UpstreamConnection {
    socket: Option<FramedSocket<TcpStream>>,
    bound: Option<(String, u16)>,
}

impl Default for UpstreamConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamConnection {
    pub fn new() -> Self {
        Self {
            socket: None,
            bound: None,
        }
    }

    pub fn bound(&self) -> Option<(&str, u16)> {
        self.bound.as_ref().map(|(host, port)| (host.as_str(), *port))
    }

    /// Connects to `(host, port)`, or reuses the existing socket when it is
    /// still bound there and alive. Returns whether the socket was reused.
    ///
    /// Address resolution yields a candidate list tried in order. A connect
    /// failure on the IPv6 loopback is skipped without recording it, so a
    /// host that only listens on 127.0.0.1 still resolves quietly; any other
    /// failure is remembered and the first one is reported if no address
    /// works.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<bool, ProxyError> {
        if let (Some(socket), Some((bound_host, bound_port))) = (&self.socket, &self.bound) {
            if bound_host == host && *bound_port == port && !socket.is_dead() {
                return Ok(true);
            }
        }
        self.close().await;

        let addrs = lookup_host((host, port)).await.map_err(|error| {
            ProxyError::broken(format!("resolving {host}:{port} failed: {error}"))
        })?;

        let mut first_error: Option<std::io::Error> = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    self.socket = Some(FramedSocket::from_tcp(stream));
                    self.bound = Some((host.to_string(), port));
                    return Ok(false);
                }
                Err(error) => {
                    if addr.ip() == IpAddr::V6(Ipv6Addr::LOCALHOST) {
                        continue;
                    }
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        Err(match first_error {
            Some(error) => {
                ProxyError::broken(format!("connect to {host}:{port} failed: {error}"))
            }
            None => ProxyError::broken(format!("no reachable address for {host}:{port}")),
        })
    }

    /// The live proxy-server socket; calling this without a prior connect is
    /// a pipeline-ordering bug.
    pub fn socket(&mut self) -> Result<&mut FramedSocket<TcpStream>, ProxyError> {
        self.socket
            .as_mut()
            .ok_or_else(|| ProxyError::runtime("no upstream connection is established"))
    }

    pub fn is_connected(&self) -> bool {
        self.socket.as_ref().is_some_and(|socket| !socket.is_dead())
    }

    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown().await;
        }
        self.bound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::UpstreamConnection;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_and_reuses_same_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let accept_task = tokio::spawn(async move {
            let mut accepted = 0_usize;
            while accepted < 1 {
                let _ = listener.accept().await.expect("accept");
                accepted += 1;
            }
            listener
        });

        let mut upstream = UpstreamConnection::new();
        let reused = upstream.connect("127.0.0.1", port).await.expect("connect");
        assert!(!reused);
        assert!(upstream.is_connected());
        assert_eq!(upstream.bound(), Some(("127.0.0.1", port)));

        let reused = upstream.connect("127.0.0.1", port).await.expect("reuse");
        assert!(reused, "same destination must reuse the socket");

        let listener = accept_task.await.expect("accept task");
        drop(listener);
    }

    #[tokio::test]
    async fn destination_change_replaces_the_socket() {
        let first = TcpListener::bind("127.0.0.1:0").await.expect("bind first");
        let second = TcpListener::bind("127.0.0.1:0").await.expect("bind second");
        let first_port = first.local_addr().expect("addr").port();
        let second_port = second.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let _first_conn = first.accept().await.expect("accept first");
            let _second_conn = second.accept().await.expect("accept second");
        });

        let mut upstream = UpstreamConnection::new();
        upstream
            .connect("127.0.0.1", first_port)
            .await
            .expect("first connect");
        let reused = upstream
            .connect("127.0.0.1", second_port)
            .await
            .expect("second connect");
        assert!(!reused, "destination change must open a fresh socket");
        assert_eq!(upstream.bound(), Some(("127.0.0.1", second_port)));
    }

    #[tokio::test]
    async fn failed_connect_reports_io_broken() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let mut upstream = UpstreamConnection::new();
        let error = upstream
            .connect("127.0.0.1", port)
            .await
            .expect_err("must fail");
        assert!(matches!(error, crate::errors::ProxyError::IoBroken(_)));
        assert!(!upstream.is_connected());
    }
}
