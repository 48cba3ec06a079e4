use thiserror::Error;

/// Errors produced by the wsproxy handshake and relay layers.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid port spec: {0}")]
    InvalidPortSpec(String),

    #[error("port spec not whitelisted: {0}")]
    NotWhitelisted(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {target} timed out after {secs}s")]
    ConnectTimeout { target: String, secs: u64 },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("tunnel already started")]
    AlreadyStarted,

    #[error("tunnel not started")]
    NotStarted,

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Whether the error is a target-side failure reported as
    /// `SERVICE_UNAVAILABLE` during the handshake.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ProxyError::Connect { .. }
                | ProxyError::ConnectTimeout { .. }
                | ProxyError::UnsupportedProtocol(_)
                | ProxyError::ServiceUnavailable(_)
        )
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        let refused = ProxyError::Connect {
            target: "localhost:22".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_unavailable());
        assert!(ProxyError::UnsupportedProtocol("UDP:53".into()).is_unavailable());
        assert!(!ProxyError::InvalidPortSpec("x".into()).is_unavailable());
        assert!(!ProxyError::TunnelClosed.is_unavailable());
    }

    #[test]
    fn test_connect_error_message_names_target() {
        let err = ProxyError::ConnectTimeout {
            target: "localhost:2222".into(),
            secs: 10,
        };
        assert_eq!(err.to_string(), "connect to localhost:2222 timed out after 10s");
    }
}
