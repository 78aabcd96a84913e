//! Configuration models for the service framework.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! A process configuration declares one root listener (the `server`
//! section), any number of additional listeners, ACME account settings and
//! logging preferences. Every field has a default so that a minimal config
//! file, or none at all, still produces a runnable server on the default
//! port.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Port every server falls back to when the configuration does not name one.
pub const DEFAULT_PORT: u16 = 9009;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Top-level process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// The root listener. Routes registered directly on the server land here.
    pub server: PortConfig,
    /// Additional listeners beyond the root one.
    pub listeners: Vec<PortConfig>,
    /// ACME account settings shared by every TLS listener.
    pub acme: AcmeSettings,
    pub logging: LoggingConfig,
}

/// Declarative record for a single listening port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Static file roots probed in declaration order by the catch-all route.
    pub locations: Vec<PathBuf>,
    /// Page served with a 404 status to browsers when no route and no
    /// static file matches.
    #[serde(rename = "page404")]
    pub page_404: Option<PathBuf>,
    pub ssl: SslConfig,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            locations: Vec::new(),
            page_404: None,
            ssl: SslConfig::default(),
        }
    }
}

impl PortConfig {
    /// A bare config for the given port with TLS disabled and no static roots.
    pub fn for_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn ssl_enabled(&self) -> bool {
        self.ssl.enabled
    }
}

/// TLS settings for one port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    /// Hostnames to provision certificates for. Entries that are not
    /// domain-shaped are ignored at registration time.
    pub hosts: Vec<String>,
}

/// ACME account settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeSettings {
    /// Contact e-mail registered with the ACME account, if any.
    pub contact: Option<String>,
    /// Use the production directory. Staging issues untrusted certificates
    /// but has far higher rate limits.
    #[serde(default = "default_true")]
    pub production: bool,
    /// Custom ACME directory URL, overriding the Let's Encrypt endpoints.
    pub directory: Option<String>,
    /// Where issued certificates and the account key are cached.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            contact: None,
            production: true,
            directory: None,
            cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` for human-readable console output, `json` for structured logs.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
