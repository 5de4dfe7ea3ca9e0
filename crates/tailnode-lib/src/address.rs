//! Network addresses for node-backed listeners
//!
//! Hosts hand listeners an address of the form `<scheme>/<node>:<ports>`,
//! e.g. `tailscale/web:80`, `tailscale+tls/:8000-8003` or
//! `tailscale/udp/web:443`. The host part names the node; the port part may
//! be a range, with an offset picking one port.

use std::fmt;
use tailnode_config::validate_node_name;
use thiserror::Error;

pub const PLAIN_SCHEME: &str = "tailscale";
pub const TLS_SCHEME: &str = "tailscale+tls";
pub const UDP_SCHEME: &str = "tailscale/udp";

/// Node used when an address leaves the host part empty
pub const DEFAULT_NODE_NAME: &str = "tailnode";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown network scheme: {0}")]
    UnknownScheme(String),

    #[error("invalid node name {0:?}")]
    InvalidNodeName(String),

    #[error("missing port in address: {0}")]
    MissingPort(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("port range {start}-{end} ends before it starts")]
    InvertedRange { start: u16, end: u16 },

    #[error("port offset {offset} out of range for {count} port(s)")]
    OffsetOutOfRange { offset: u32, count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Plain,
    Tls,
    /// Datagram sockets on the node's mesh address
    Udp,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Result<Self, AddressError> {
        match scheme {
            PLAIN_SCHEME => Ok(Self::Plain),
            TLS_SCHEME => Ok(Self::Tls),
            UDP_SCHEME => Ok(Self::Udp),
            other => Err(AddressError::UnknownScheme(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => PLAIN_SCHEME,
            Self::Tls => TLS_SCHEME,
            Self::Udp => UDP_SCHEME,
        }
    }

    pub fn all() -> [Scheme; 3] {
        [Self::Plain, Self::Tls, Self::Udp]
    }

    pub fn is_packet(&self) -> bool {
        matches!(self, Self::Udp)
    }

    /// Scheme HTTP/3 listeners use in place of this one
    pub fn http3_scheme(&self) -> Option<Scheme> {
        match self {
            Self::Plain | Self::Udp => Some(Self::Udp),
            Self::Tls => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub scheme: Scheme,
    /// Node name; never empty
    pub node: String,
    pub start_port: u16,
    pub end_port: u16,
}

impl NetworkAddress {
    /// Parse `<scheme>/<node>:<port>[-<port>]`
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        // Longest scheme first: `tailscale/udp/` also starts with `tailscale/`
        let found = [Scheme::Udp, Scheme::Tls, Scheme::Plain]
            .into_iter()
            .find_map(|scheme| {
                address
                    .strip_prefix(scheme.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .map(|rest| (scheme, rest))
            });

        let Some((scheme, rest)) = found else {
            let scheme = address.split_once('/').map(|(s, _)| s).unwrap_or_default();
            return Err(AddressError::UnknownScheme(scheme.to_string()));
        };
        let (host, ports) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
        Self::from_parts(scheme, host, ports)
    }

    /// Build an address from the pieces a host has already split apart
    pub fn from_parts(scheme: Scheme, host: &str, port_range: &str) -> Result<Self, AddressError> {
        if port_range.is_empty() {
            return Err(AddressError::MissingPort(host.to_string()));
        }

        let (start, end) = match port_range.split_once('-') {
            Some((start, end)) => (parse_port(start)?, parse_port(end)?),
            None => {
                let port = parse_port(port_range)?;
                (port, port)
            }
        };
        if end < start {
            return Err(AddressError::InvertedRange { start, end });
        }

        let node = if host.is_empty() {
            DEFAULT_NODE_NAME.to_string()
        } else {
            host.to_string()
        };
        validate_node_name(&node).map_err(|_| AddressError::InvalidNodeName(node.clone()))?;

        Ok(Self {
            scheme,
            node,
            start_port: start,
            end_port: end,
        })
    }

    pub fn port_count(&self) -> u32 {
        u32::from(self.end_port - self.start_port) + 1
    }

    /// Port `offset` positions into the range
    pub fn port_at(&self, offset: u32) -> Result<u16, AddressError> {
        let count = self.port_count();
        if offset >= count {
            return Err(AddressError::OffsetOutOfRange { offset, count });
        }
        u16::try_from(u32::from(self.start_port) + offset)
            .map_err(|_| AddressError::OffsetOutOfRange { offset, count })
    }

    /// Address handed to the node runtime, e.g. `:8001`
    pub fn listen_addr(&self, offset: u32) -> Result<String, AddressError> {
        Ok(format!(":{}", self.port_at(offset)?))
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.scheme, self.node, self.start_port)?;
        if self.end_port != self.start_port {
            write!(f, "-{}", self.end_port)?;
        }
        Ok(())
    }
}

fn parse_port(port: &str) -> Result<u16, AddressError> {
    port.trim()
        .parse()
        .map_err(|_| AddressError::InvalidPort(port.to_string()))
}
