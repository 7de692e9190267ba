//! Textual IPv4 addresses and synchronous name resolution
//!
//! Channels address their peers with a plain `ip` string and a port, the
//! same shape that `parse_ipport` produces from `"<ipv4>:<port>"` text.

use crate::channel::ChannelType;
use crate::error::{Error, Result};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// Shortest host text that can hold a dotted quad (`"0.0.0.0"`)
const MIN_HOST_LEN: usize = 7;

/// IPv4 address and port of a channel endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannAddr {
    pub ip: String,
    pub port: u16,
}

impl ChannAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Parsed socket address; fails when `ip` is not a dotted quad
    pub fn to_socket_addr(&self) -> Result<SocketAddrV4> {
        let ip: Ipv4Addr = self
            .ip
            .parse()
            .map_err(|_| Error::AddrParse(self.to_string()))?;
        Ok(SocketAddrV4::new(ip, self.port))
    }
}

impl From<SocketAddrV4> for ChannAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self { ip: addr.ip().to_string(), port: addr.port() }
    }
}

impl fmt::Display for ChannAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parses `"<ipv4>:<port>"`
///
/// A host part shorter than a dotted quad (for instance `":8090"`) is read
/// as the wildcard `0.0.0.0`, which keeps `":port"` usable for listeners.
/// Any other host must be a valid IPv4 address, and the port must be a
/// decimal `u16`.
///
/// ```rust
/// use horizon_mnet::parse_ipport;
///
/// let addr = parse_ipport("127.0.0.1:8090").unwrap();
/// assert_eq!((addr.ip.as_str(), addr.port), ("127.0.0.1", 8090));
/// assert!(parse_ipport("bad-input").is_err());
/// ```
pub fn parse_ipport(text: &str) -> Result<ChannAddr> {
    let bad = || Error::AddrParse(text.to_string());
    let (host, port) = text.split_once(':').ok_or_else(bad)?;
    let port: u16 = port.trim().parse().map_err(|_| bad())?;
    if host.len() < MIN_HOST_LEN {
        return Ok(ChannAddr::new(Ipv4Addr::UNSPECIFIED.to_string(), port));
    }
    let ip: Ipv4Addr = host.parse().map_err(|_| bad())?;
    Ok(ChannAddr::new(ip.to_string(), port))
}

/// Blocking host name lookup
///
/// Returns the first non-wildcard IPv4 address for `host`. `ctype` is
/// accepted for parity with the channel the address is meant for; name
/// lookup does not depend on it.
pub fn resolve(host: &str, port: u16, ctype: ChannelType) -> Result<ChannAddr> {
    let found = (host, port)
        .to_socket_addrs()
        .map_err(|e| {
            log::debug!("resolve {} for {:?} failed: {}", host, ctype, e);
            Error::Resolve(host.to_string())
        })?
        .find_map(|sa| match sa {
            SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Some(v4),
            _ => None,
        });
    match found {
        Some(v4) => Ok(ChannAddr::new(v4.ip().to_string(), port)),
        None => Err(Error::Resolve(host.to_string())),
    }
}
