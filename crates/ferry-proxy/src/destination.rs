use crate::errors::ProxyError;
use crate::message::HttpRequest;

/// Origin `(host, port)` a request resolves to, independent of whether the
/// bytes will actually travel through a relay proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

/// Derives the destination from the request line and headers.
///
/// Absolute-form targets are rewritten to origin form unless a relay proxy
/// is configured (the relay needs the full URI). `CONNECT` targets are plain
/// authorities; `*` and origin-form targets fall back to the `Host` header.
pub fn resolve_destination(
    request: &mut HttpRequest,
    relay_configured: bool,
) -> Result<Destination, ProxyError> {
    let connect = request.line.is_connect();
    let default_port = if connect { 443 } else { 80 };
    let target = request.line.uri().to_string();

    if connect {
        let (host, port) = parse_authority(&target, default_port)?;
        return Ok(Destination { host, port });
    }

    if target == "*" {
        return destination_from_host_header(request, default_port);
    }

    if let Some(scheme_end) = target.find("://") {
        let scheme = &target[..scheme_end];
        let default_port = match scheme {
            "http" => 80,
            "https" => 443,
            other => {
                return Err(ProxyError::protocol(format!(
                    "unsupported scheme '{other}' in request target"
                )))
            }
        };
        let rest = &target[scheme_end + 3..];
        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };
        let (host, port) = parse_authority(authority, default_port)?;
        if !relay_configured {
            request.line.set_uri(path);
        }
        return Ok(Destination { host, port });
    }

    destination_from_host_header(request, default_port)
}

fn destination_from_host_header(
    request: &HttpRequest,
    default_port: u16,
) -> Result<Destination, ProxyError> {
    let host_header = request.headers.host().ok_or_else(|| {
        ProxyError::protocol("request target carries no authority and no Host header is present")
    })?;
    let (host, port) = parse_authority(&host_header, default_port)?;
    Ok(Destination { host, port })
}

/// Accepts `host`, `host:`, `host:port` and the bracketed IPv6 forms.
fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(ProxyError::protocol("empty authority in request target"));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let closing = rest
            .find(']')
            .ok_or_else(|| ProxyError::protocol("unterminated IPv6 authority"))?;
        let host = &rest[..closing];
        if host.is_empty() {
            return Err(ProxyError::protocol("empty IPv6 authority"));
        }
        let suffix = &rest[closing + 1..];
        let port = match suffix.strip_prefix(':') {
            None | Some("") => default_port,
            Some(port_text) => parse_port(port_text)?,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, "")) if !host.contains(':') => Ok((host.to_string(), default_port)),
        Some((host, port_text)) if !host.contains(':') => {
            Ok((host.to_string(), parse_port(port_text)?))
        }
        // No colon, or an unbracketed IPv6 literal: the whole token is the host.
        _ => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(text: &str) -> Result<u16, ProxyError> {
    text.parse::<u16>()
        .map_err(|_| ProxyError::protocol(format!("invalid port '{text}' in authority")))
}
