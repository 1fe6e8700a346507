//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local endpoint configuration
    pub client: Option<ClientConfig>,
    /// Remote endpoint configuration
    pub server: Option<ServerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Local endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote endpoint host name or IP
    pub server: String,
    /// Remote endpoint port
    pub server_port: u16,
    /// Shared password; every key derives from it
    pub password: String,
    /// Bulk cipher: aes-256-gcm or chacha20-poly1305
    #[serde(default = "default_method")]
    pub method: String,
    /// SOCKS5 listen port; the HTTP proxy listens 1000 above it
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Listen on all interfaces instead of loopback only
    #[serde(default)]
    pub bind_all: bool,
    /// Dial and idle-read timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Plain TCP to the remote instead of TLS
    #[serde(default)]
    pub disable_tls: bool,
    /// Refuse IPv6 targets
    #[serde(default)]
    pub disable_ipv6: bool,
    /// QUIC transport variant (not compiled in; accepted for compatibility)
    #[serde(default)]
    pub enable_quic: bool,
    /// Hosts relayed directly, bypassing the tunnel; suffix-matched
    #[serde(default)]
    pub direct_hosts: Vec<String>,
    /// SOCKS5 username/password authentication when both are set
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    /// SNI override for the TLS wrap; defaults to `server`
    #[serde(default)]
    pub tls_sni: Option<String>,
    /// Skip target validation; only for tests and fully trusted setups
    #[serde(default)]
    pub disable_validate: bool,
}

impl ClientConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.server_port)
    }

    pub fn socks_addr(&self) -> String {
        format!("{}:{}", self.bind_host(), self.local_port)
    }

    pub fn http_proxy_addr(&self) -> String {
        format!("{}:{}", self.bind_host(), self.http_proxy_port())
    }

    pub fn http_proxy_port(&self) -> u16 {
        self.local_port + 1000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn sni(&self) -> String {
        self.tls_sni.clone().unwrap_or_else(|| self.server.clone())
    }

    pub fn socks_auth(&self) -> Option<(String, String)> {
        match (&self.auth_username, &self.auth_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    fn bind_host(&self) -> &'static str {
        if self.bind_all {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.server.is_empty() {
            return Err(crate::Error::Config("server must not be empty".into()));
        }
        if self.password.is_empty() {
            return Err(crate::Error::Config("password must not be empty".into()));
        }
        crate::crypto::Method::from_name(&self.method)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        if self.local_port.checked_add(1000).is_none() {
            return Err(crate::Error::Config(
                "local_port too high for the HTTP proxy offset".into(),
            ));
        }
        Ok(())
    }
}

/// Remote endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen port
    pub server_port: u16,
    /// Shared password; must match the local endpoint
    pub password: String,
    /// Default bulk cipher when a client leaves it unspecified
    #[serde(default = "default_method")]
    pub method: String,
    /// Dial, idle-read, and keepalive timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// TLS certificate chain (PEM); self-signed when absent
    #[serde(default)]
    pub tls_cert: Option<String>,
    /// TLS private key (PEM)
    #[serde(default)]
    pub tls_key: Option<String>,
    /// Host name baked into the self-signed certificate
    #[serde(default)]
    pub tls_host: Option<String>,
    /// Accept plain TCP instead of TLS
    #[serde(default)]
    pub disable_tls: bool,
    /// QUIC transport variant (not compiled in; accepted for compatibility)
    #[serde(default)]
    pub enable_quic: bool,
    /// Skip target validation; only for tests and fully trusted setups
    #[serde(default)]
    pub disable_validate: bool,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.server_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.password.is_empty() {
            return Err(crate::Error::Config("password must not be empty".into()));
        }
        crate::crypto::Method::from_name(&self.method)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn default_method() -> String {
    "aes-256-gcm".to_string()
}

fn default_local_port() -> u16 {
    1080
}

fn default_timeout() -> u64 {
    60
}
