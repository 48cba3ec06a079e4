//! Handshake status codes.
//!
//! The server answers the client's `PROTOCOL:PORT` message with exactly one
//! of these as a text message.

use crate::error::ProxyError;
use std::fmt;
use std::str::FromStr;

/// Reply to the handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Target connected; the connection is now in relay mode.
    Success,
    /// Malformed or non-whitelisted spec; no connect was attempted.
    InvalidPort,
    /// Whitelisted, but the local service could not be reached.
    ServiceUnavailable,
}

impl HandshakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeStatus::Success => "SUCCESS",
            HandshakeStatus::InvalidPort => "INVALID_PORT",
            HandshakeStatus::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandshakeStatus {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(HandshakeStatus::Success),
            "INVALID_PORT" => Ok(HandshakeStatus::InvalidPort),
            "SERVICE_UNAVAILABLE" => Ok(HandshakeStatus::ServiceUnavailable),
            other => Err(ProxyError::Handshake(format!(
                "unexpected status {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_strings() {
        assert_eq!(HandshakeStatus::Success.as_str(), "SUCCESS");
        assert_eq!(HandshakeStatus::InvalidPort.as_str(), "INVALID_PORT");
        assert_eq!(
            HandshakeStatus::ServiceUnavailable.as_str(),
            "SERVICE_UNAVAILABLE"
        );
    }

    #[test]
    fn test_unknown_status_is_handshake_error() {
        assert!(matches!(
            "success".parse::<HandshakeStatus>(),
            Err(ProxyError::Handshake(_))
        ));
        assert!("".parse::<HandshakeStatus>().is_err());
    }
}
