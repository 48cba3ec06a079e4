//! Server configuration: TOML file + CLI overrides.

use crate::tunnel::TunnelSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wsproxy_core::{PortSpec, Protocol, ProxyError, ProxyResult, Whitelist};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub forward: Vec<PortSpec>,
    pub cert: Option<String>,
    pub key: Option<String>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            forward: Vec::new(),
            cert: None,
            key: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_target_host")]
    pub target_host: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_eof_flush_timeout")]
    pub eof_flush_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            target_host: default_target_host(),
            queue_capacity: default_queue_capacity(),
            read_chunk_size: default_read_chunk_size(),
            connect_timeout_secs: default_connect_timeout(),
            eof_flush_timeout_secs: default_eof_flush_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/".to_string()
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_target_host() -> String {
    "localhost".to_string()
}
fn default_queue_capacity() -> usize {
    wsproxy_core::DEFAULT_QUEUE_CAPACITY
}
fn default_read_chunk_size() -> usize {
    wsproxy_core::DEFAULT_READ_CHUNK_SIZE
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_eof_flush_timeout() -> u64 {
    2
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_max_message_size() -> usize {
    1_048_576
}

/// Values given on the command line. `None` / empty means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub forward: Vec<PortSpec>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// The single WebSocket route.
    pub path: String,
    pub whitelist: Whitelist,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub shutdown_grace: Duration,
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
    pub tunnel: Arc<TunnelSettings>,
}

impl ServerConfig {
    /// Load config from a TOML file (if present), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> ProxyResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Merge a parsed config file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> ProxyResult<Self> {
        let ConfigFile { server, tunnel } = file;

        let cert = cli.cert.or(server.cert);
        let key = cli.key.or(server.key);
        if cert.is_some() != key.is_some() {
            return Err(ProxyError::Other(
                "TLS needs both a certificate and a key file".into(),
            ));
        }

        let whitelist: Whitelist = server.forward.into_iter().chain(cli.forward).collect();
        if whitelist.is_empty() {
            return Err(ProxyError::Other(
                "no forward ports configured (expected PROTOCOL:PORT, e.g. TCP:22)".into(),
            ));
        }
        for spec in whitelist.iter().filter(|s| s.protocol() == Protocol::Udp) {
            warn!(spec = %spec, "UDP forwarding is not supported; sessions for it will be refused");
        }

        if !server.path.starts_with('/') {
            return Err(ProxyError::Other(format!(
                "route path must start with '/': {:?}",
                server.path
            )));
        }

        Ok(Self {
            bind: cli.bind.unwrap_or(server.bind),
            port: cli.port.unwrap_or(server.port),
            path: server.path,
            whitelist,
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            shutdown_grace: Duration::from_secs(server.shutdown_grace_secs),
            handshake_timeout: Duration::from_secs(tunnel.handshake_timeout_secs),
            max_message_size: tunnel.max_message_size,
            tunnel: Arc::new(TunnelSettings {
                target_host: tunnel.target_host,
                queue_capacity: tunnel.queue_capacity.max(1),
                read_chunk_size: tunnel.read_chunk_size.max(1),
                connect_timeout: Duration::from_secs(tunnel.connect_timeout_secs),
                eof_flush_timeout: Duration::from_secs(tunnel.eof_flush_timeout_secs),
                ..TunnelSettings::default()
            }),
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_path.is_some()
    }
}

fn parse_config(content: &str) -> ProxyResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| ProxyError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_with_cli_forward() {
        let cfg = ServerConfig::resolve(
            ConfigFile::default(),
            CliOverrides {
                forward: vec![PortSpec::tcp(22)],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.path, "/");
        assert!(cfg.whitelist.contains(&PortSpec::tcp(22)));
        assert!(!cfg.tls_enabled());
        assert_eq!(cfg.tunnel.queue_capacity, 4096);
        assert_eq!(cfg.tunnel.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_file_values_and_cli_overrides() {
        let file = parse_config(
            r#"
            [server]
            bind = "0.0.0.0"
            port = 9000
            path = "/tunnel"
            forward = ["TCP:22", "TCP:5900"]

            [tunnel]
            target_host = "127.0.0.1"
            queue_capacity = 64
            connect_timeout_secs = 3
            eof_flush_timeout_secs = 7
            "#,
        )
        .unwrap();

        let cfg = ServerConfig::resolve(
            file,
            CliOverrides {
                port: Some(9443),
                forward: vec![PortSpec::tcp(80)],
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.port, 9443);
        assert_eq!(cfg.path, "/tunnel");
        assert_eq!(cfg.whitelist.len(), 3);
        assert!(cfg.whitelist.contains(&PortSpec::tcp(5900)));
        assert!(cfg.whitelist.contains(&PortSpec::tcp(80)));
        assert_eq!(cfg.tunnel.target_host, "127.0.0.1");
        assert_eq!(cfg.tunnel.queue_capacity, 64);
        assert_eq!(cfg.tunnel.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.tunnel.eof_flush_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_bad_forward_entry_in_file_is_rejected() {
        assert!(parse_config("[server]\nforward = [\"tcp:22\"]\n").is_err());
    }

    #[test]
    fn test_empty_whitelist_is_rejected() {
        assert!(ServerConfig::resolve(ConfigFile::default(), CliOverrides::default()).is_err());
    }

    #[test]
    fn test_tls_requires_both_files() {
        let result = ServerConfig::resolve(
            ConfigFile::default(),
            CliOverrides {
                cert: Some("cert.pem".into()),
                forward: vec![PortSpec::tcp(22)],
                ..Default::default()
            },
        );
        assert!(result.is_err());

        let cfg = ServerConfig::resolve(
            ConfigFile::default(),
            CliOverrides {
                cert: Some("cert.pem".into()),
                key: Some("key.pem".into()),
                forward: vec![PortSpec::tcp(22)],
                ..Default::default()
            },
        )
        .unwrap();
        assert!(cfg.tls_enabled());
        assert_eq!(cfg.key_path.as_deref(), Some(Path::new("key.pem")));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/wsproxy/config.toml")),
            CliOverrides {
                forward: vec![PortSpec::tcp(22)],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
    }
}
