//! Service configuration.

use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the sync service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Path of the primary-store SQLite database.
    pub primary_db: PathBuf,
    /// Path of the durable sync-state database.
    pub state_db: PathBuf,
    /// Path of the table mapping catalog (TOML).
    pub mapping_file: PathBuf,
    /// Base URL of the portal row API.
    pub portal_url: String,
    /// API key sent to the portal row API.
    pub portal_api_key: String,
    /// Shared secret for webhook signatures.
    pub webhook_secret: Option<String>,
    /// Accept webhooks without a signature.
    pub allow_unsigned_webhooks: bool,
    /// Interval between background reconciler sweeps.
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Creates a configuration with defaults for everything but the address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            primary_db: PathBuf::from("clinic.db"),
            state_db: PathBuf::from("sync-state.db"),
            mapping_file: PathBuf::from("mappings.toml"),
            portal_url: String::new(),
            portal_api_key: String::new(),
            webhook_secret: None,
            allow_unsigned_webhooks: false,
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Sets the portal endpoint and API key.
    pub fn with_portal(mut self, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.portal_url = url.into();
        self.portal_api_key = api_key.into();
        self
    }

    /// Sets the webhook signing secret.
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    /// Sets the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&text)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Ok(file.into_config())
    }

    /// Checks for configuration holes only detectable at startup.
    pub fn validate(&self) -> ServerResult<()> {
        if self.portal_url.is_empty() {
            return Err(ServerError::Config("portal.url is required".into()));
        }
        if self.webhook_secret.is_none() && !self.allow_unsigned_webhooks {
            return Err(ServerError::Config(
                "portal.webhook_secret is required unless allow_unsigned_webhooks is set".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8787)))
    }
}

/// On-disk layout of the configuration file.
#[derive(Deserialize)]
struct ConfigFile {
    bind_addr: Option<SocketAddr>,
    primary_db: PathBuf,
    state_db: PathBuf,
    mapping_file: PathBuf,
    sweep_interval_secs: Option<u64>,
    portal: PortalSection,
}

#[derive(Deserialize)]
struct PortalSection {
    url: String,
    api_key: String,
    webhook_secret: Option<String>,
    #[serde(default)]
    allow_unsigned_webhooks: bool,
}

impl ConfigFile {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            bind_addr: self.bind_addr.unwrap_or(defaults.bind_addr),
            primary_db: self.primary_db,
            state_db: self.state_db,
            mapping_file: self.mapping_file,
            portal_url: self.portal.url,
            portal_api_key: self.portal.api_key,
            webhook_secret: self.portal.webhook_secret,
            allow_unsigned_webhooks: self.portal.allow_unsigned_webhooks,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.unwrap_or(60)),
        }
    }
}
