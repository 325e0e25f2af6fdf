//! Configuration structures for the captive portal engine

use crate::controller::rules::AppId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How pre-authorization traffic to third parties reaches the portal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectMode {
    /// The controller rewrites each packet and emits it itself
    ControllerRewrite,
    /// Short-lived rules make the switch rewrite the flow
    FlowRule,
}

/// Captive portal engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Application id stamped on every rule
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Redirect strategy
    #[serde(default = "default_redirect_mode")]
    pub redirect_mode: RedirectMode,
    /// Whether return-direction connection rules also match the user's MAC
    #[serde(default)]
    pub match_eth_dst: bool,
    /// Priority of connection rules
    #[serde(default = "default_connection_priority")]
    pub connection_priority: u16,
    /// Priority of redirect rules; must exceed the connection priority
    #[serde(default = "default_redirect_priority")]
    pub redirect_priority: u16,
    /// Idle timeout of flow-based redirect rules, in seconds
    #[serde(default = "default_redirect_timeout")]
    pub redirect_timeout_secs: u16,
    /// Number of concurrent packet classification workers
    #[serde(default = "default_packet_workers")]
    pub packet_workers: usize,
    /// Service catalog settings
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Service catalog long-poll settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Blocking-query wait, in seconds; catalogs cap this near 60
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    /// Back-off after a failed catalog request, in seconds
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
}

fn default_app_id() -> String {
    "org.captive.portal".to_string()
}

fn default_redirect_mode() -> RedirectMode {
    RedirectMode::ControllerRewrite
}

fn default_connection_priority() -> u16 {
    40000
}

fn default_redirect_priority() -> u16 {
    45000
}

fn default_redirect_timeout() -> u16 {
    10
}

fn default_packet_workers() -> usize {
    4
}

fn default_wait_secs() -> u64 {
    50
}

fn default_retry_secs() -> u64 {
    5
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_wait_secs(),
            retry_secs: default_retry_secs(),
        }
    }
}

impl CatalogConfig {
    /// Blocking-query wait
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    /// Back-off after failures
    pub fn retry(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            redirect_mode: default_redirect_mode(),
            match_eth_dst: false,
            connection_priority: default_connection_priority(),
            redirect_priority: default_redirect_priority(),
            redirect_timeout_secs: default_redirect_timeout(),
            packet_workers: default_packet_workers(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl PortalConfig {
    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use async_fs::File;
        use futures::io::AsyncReadExt;

        let mut file = File::open(path.as_ref()).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        // YAML by extension, JSON otherwise
        let config: Self = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(Error::Config("app_id cannot be empty".to_string()));
        }
        if self.packet_workers == 0 {
            return Err(Error::Config("packet_workers must be at least 1".to_string()));
        }
        if self.redirect_priority <= self.connection_priority {
            return Err(Error::Config(format!(
                "redirect_priority {} must be above connection_priority {}",
                self.redirect_priority, self.connection_priority
            )));
        }
        if self.redirect_timeout_secs == 0 {
            return Err(Error::Config("redirect_timeout_secs cannot be 0".to_string()));
        }
        if self.catalog.wait_secs == 0 || self.catalog.wait_secs >= 60 {
            return Err(Error::Config(format!(
                "catalog wait of {}s must be between 1 and 59 seconds",
                self.catalog.wait_secs
            )));
        }
        Ok(())
    }

    /// Application id as a rule owner
    pub fn app(&self) -> AppId {
        AppId::new(self.app_id.clone())
    }
}
