use crate::support::{SetupError, SetupResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

/// Transport selector carried in an address string prefix.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// A resolved socket endpoint.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Endpoint {
    V4 { addr: [u8; 4], port: u16 },
    V6 { addr: [u8; 16], port: u16, scope: u32 },
}

impl Endpoint {
    #[inline]
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::V4 { port, .. } => *port,
            Endpoint::V6 { port, .. } => *port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => Endpoint::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Endpoint::V6 {
                addr: v6.ip().octets(),
                port: v6.port(),
                scope: v6.scope_id(),
            },
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        match ep {
            Endpoint::V4 { addr, port } => {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(addr), port))
            }
            Endpoint::V6 { addr, port, scope } => {
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(addr), port, 0, scope))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", SocketAddr::from(*self))
    }
}

/// A parsed `[proto://]host:port` address string.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct ParsedAddr {
    pub proto: Proto,
    pub sa: SocketAddr,
    /// Whether the address string carried an explicit host part. `connect`
    /// requires one, `bind` defaults to the wildcard.
    pub explicit_host: bool,
}

/// Parses an address of the form `[proto://]host:port`, resolving named
/// hosts with a blocking lookup. `host` may be omitted (wildcard bind) and
/// port `0` asks the OS to choose.
pub fn parse_address(spec: &str) -> SetupResult<(Proto, SocketAddr)> {
    let parsed = parse(spec)?;
    Ok((parsed.proto, parsed.sa))
}

pub(crate) fn parse(spec: &str) -> SetupResult<ParsedAddr> {
    let (proto, rest) = if let Some(rest) = strip_prefix(spec, "tcp://") {
        (Proto::Tcp, rest)
    } else if let Some(rest) = strip_prefix(spec, "udp://") {
        (Proto::Udp, rest)
    } else {
        (Proto::Tcp, spec)
    };

    if rest.is_empty() {
        return Err(SetupError::BadAddress(spec.to_string()));
    }

    // Bare decimal port means "bind all interfaces".
    if rest.bytes().all(|b| b.is_ascii_digit()) {
        let port = rest
            .parse::<u16>()
            .map_err(|_| SetupError::BadAddress(spec.to_string()))?;
        return Ok(ParsedAddr {
            proto,
            sa: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            explicit_host: false,
        });
    }

    let (host, port) = split_host_port(rest).ok_or_else(|| SetupError::BadAddress(spec.to_string()))?;

    if host.is_empty() {
        return Ok(ParsedAddr {
            proto,
            sa: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            explicit_host: false,
        });
    }

    // Numeric literals bypass the resolver.
    if let Ok(sa) = rest.parse::<SocketAddr>() {
        return Ok(ParsedAddr {
            proto,
            sa,
            explicit_host: true,
        });
    }

    let sa = resolve(host, port)?;

    Ok(ParsedAddr {
        proto,
        sa,
        explicit_host: true,
    })
}

/// Blocking name resolution. A single synchronous lookup; the first address
/// returned by the system resolver wins.
pub fn resolve(host: &str, port: u16) -> SetupResult<SocketAddr> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| SetupError::Resolve(host.to_string()))?;

    addrs.next().ok_or_else(|| SetupError::Resolve(host.to_string()))
}

/// Splits `host:port`, handling bracketed IPv6 literals.
fn split_host_port(rest: &str) -> Option<(&str, u16)> {
    let idx = rest.rfind(':')?;
    let (host, port) = (&rest[..idx], &rest[idx + 1..]);
    let port = port.parse::<u16>().ok()?;

    // `[::1]:80` keeps the brackets off the host part.
    let host = if host.starts_with('[') && host.ends_with(']') {
        &host[1..host.len() - 1]
    } else if host.contains(':') {
        // Unbracketed colons mean the rfind split an IPv6 literal apart.
        return None;
    } else {
        host
    };

    Some((host, port))
}

fn strip_prefix<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.starts_with(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
