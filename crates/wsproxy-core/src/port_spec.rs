//! Forwarding targets: `PROTOCOL:PORT` specs and the whitelist they are
//! checked against.
//!
//! The textual form is the one clients send as their handshake message and
//! the one accepted on the server command line, e.g. `TCP:22`.

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a forwarding target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// The exact (case-sensitive) tag used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(protocol, port)` pair identifying a forwarding target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec {
    protocol: Protocol,
    port: u16,
}

impl PortSpec {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(Protocol::Tcp, port)
    }

    pub fn udp(port: u16) -> Self {
        Self::new(Protocol::Udp, port)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for PortSpec {
    type Err = ProxyError;

    /// Split on the first `:`. The protocol must be exactly `TCP` or `UDP`
    /// and the remainder must parse as a port number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, port) = s
            .split_once(':')
            .ok_or_else(|| ProxyError::InvalidPortSpec(format!("missing ':' in {s:?}")))?;

        let protocol = match protocol {
            "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            other => {
                return Err(ProxyError::InvalidPortSpec(format!(
                    "invalid protocol {other:?}"
                )))
            }
        };

        let port = port
            .parse::<u16>()
            .map_err(|e| ProxyError::InvalidPortSpec(format!("invalid port {port:?}: {e}")))?;

        Ok(Self { protocol, port })
    }
}

impl TryFrom<String> for PortSpec {
    type Error = ProxyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)
    }
}

/// The fixed set of targets a server forwards to.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    specs: HashSet<PortSpec>,
}

impl Whitelist {
    pub fn new(specs: impl IntoIterator<Item = PortSpec>) -> Self {
        Self {
            specs: specs.into_iter().collect(),
        }
    }

    /// Parse every entry, failing on the first malformed one.
    pub fn parse<I, S>(entries: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let specs = entries
            .into_iter()
            .map(|e| e.as_ref().parse::<PortSpec>())
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(Self { specs })
    }

    /// Exact-match membership.
    pub fn contains(&self, spec: &PortSpec) -> bool {
        self.specs.contains(spec)
    }

    pub fn insert(&mut self, spec: PortSpec) -> bool {
        self.specs.insert(spec)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortSpec> {
        self.specs.iter()
    }
}

impl FromIterator<PortSpec> for Whitelist {
    fn from_iter<T: IntoIterator<Item = PortSpec>>(iter: T) -> Self {
        Self::new(iter)
    }
}
