use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::errors::ProxyError;

/// Which loopback interface the acceptor binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenFamily {
    V4Loopback,
    V6Loopback,
}

impl Default for ListenFamily {
    fn default() -> Self {
        Self::V4Loopback
    }
}

/// An upstream relay proxy all requests are forwarded to. When set, request
/// URIs stay in absolute form so the relay sees the full target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_family: ListenFamily,
    pub listen_port: u16,
    pub relay: Option<RelayEndpoint>,
    /// Cap on one message head (request/status line plus headers).
    pub max_http_head_bytes: usize,
    /// How often the registry sweeper evicts finished connection entries.
    pub sweep_interval_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_family: ListenFamily::default(),
            listen_port: 8080,
            relay: None,
            max_http_head_bytes: 64 * 1024,
            sweep_interval_secs: 300,
        }
    }
}

impl ProxyConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = match self.listen_family {
            ListenFamily::V4Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ListenFamily::V6Loopback => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, self.listen_port)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.max_http_head_bytes == 0 {
            return Err(ProxyError::runtime(
                "max_http_head_bytes must be greater than zero",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ProxyError::runtime(
                "sweep_interval_secs must be greater than zero",
            ));
        }
        if let Some(relay) = &self.relay {
            if relay.host.trim().is_empty() {
                return Err(ProxyError::runtime("relay host must not be empty"));
            }
            if relay.port == 0 {
                return Err(ProxyError::runtime("relay port must be greater than zero"));
            }
        }
        Ok(())
    }
}
