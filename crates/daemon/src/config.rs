// RelayForge Daemon - Configuration
// Handles daemon configuration (SSH listener, trust store, admin API).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Get the runtime directory for daemon state (sockets, PID file).
pub fn runtime_dir() -> Result<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))
}

/// Daemon configuration: the Tunnel Server's SSH listener, the heartbeat and
/// deadline tunables from spec.md §6, the trust store location, and the
/// read-only admin HTTP surface (SPEC_FULL.md §10.5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Address the Tunnel Server's SSH listener binds to.
    #[serde(default = "default_ssh_listen_address")]
    pub ssh_listen_address: String,

    /// Path to the server's own SSH host key (identity presented to remote
    /// agents during the key exchange).
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,

    /// Heartbeat period in seconds. `GetStatus` reports offline once
    /// `now - last_active > 2 * heartbeat_period`.
    #[serde(default = "default_heartbeat_period_secs")]
    pub heartbeat_period_secs: u64,

    /// Default deadline (seconds) applied to outbound dial/channel
    /// operations via the `setDeadline`/`resetDeadline` refcount discipline.
    #[serde(default = "default_server_timeout_secs")]
    pub server_timeout_secs: u64,

    /// Directory of per-authority-domain trust files (SPEC_FULL.md §10.6).
    #[serde(default = "default_trust_store_path")]
    pub trust_store_path: PathBuf,

    /// Bind address for the read-only admin HTTP surface.
    #[serde(default = "default_admin_bind_address")]
    pub admin_bind_address: String,

    /// Require a bearer token on the admin HTTP surface.
    #[serde(default = "default_require_auth")]
    pub admin_require_auth: bool,

    /// Path to the admin API's authentication token file.
    #[serde(default = "default_admin_token_path")]
    pub admin_token_path: PathBuf,

    /// Enable group access to the runtime directory and any local socket.
    /// When true, sets permissions to 0770/0660 instead of 0700/0600.
    #[serde(default = "default_group_access")]
    pub group_access: bool,
}

fn default_ssh_listen_address() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_host_key_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relayforge")
        .join("host_key")
}

fn default_heartbeat_period_secs() -> u64 {
    30
}

fn default_server_timeout_secs() -> u64 {
    15
}

fn default_trust_store_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relayforge")
        .join("trust_store")
}

fn default_admin_bind_address() -> String {
    "127.0.0.1:7443".to_string()
}

fn default_require_auth() -> bool {
    true
}

fn default_admin_token_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relayforge")
        .join("admin.token")
}

fn default_group_access() -> bool {
    false
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ssh_listen_address: default_ssh_listen_address(),
            host_key_path: default_host_key_path(),
            heartbeat_period_secs: default_heartbeat_period_secs(),
            server_timeout_secs: default_server_timeout_secs(),
            trust_store_path: default_trust_store_path(),
            admin_bind_address: default_admin_bind_address(),
            admin_require_auth: default_require_auth(),
            admin_token_path: default_admin_token_path(),
            group_access: default_group_access(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration.
    pub fn validate(&self) -> Result<()> {
        let is_loopback = self.admin_bind_address.starts_with("127.")
            || self.admin_bind_address.starts_with("localhost:")
            || self.admin_bind_address == "localhost";

        if !is_loopback && !self.admin_require_auth {
            anyhow::bail!(
                "Security violation: admin_bind_address {} is not loopback-only, \
                 but admin_require_auth is false.\n\
                 \n\
                 To fix this:\n\
                 1. Set admin_require_auth = true, OR\n\
                 2. Bind the admin surface to 127.0.0.1 or localhost.",
                self.admin_bind_address
            );
        }

        if self.heartbeat_period_secs == 0 {
            anyhow::bail!("heartbeat_period_secs must be greater than 0");
        }

        Ok(())
    }

    /// Load daemon configuration from file, writing defaults if none exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to file.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(&config_path, contents).context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("relayforge").join("daemon.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_loopback_admin_without_auth_ok() {
        let config = DaemonConfig {
            admin_bind_address: "127.0.0.1:7443".to_string(),
            admin_require_auth: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_non_loopback_admin_without_auth_rejected() {
        let config = DaemonConfig {
            admin_bind_address: "0.0.0.0:7443".to_string(),
            admin_require_auth: false,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Security violation"));
    }

    #[test]
    fn validate_non_loopback_admin_with_auth_ok() {
        let config = DaemonConfig {
            admin_bind_address: "0.0.0.0:7443".to_string(),
            admin_require_auth: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_zero_heartbeat_rejected() {
        let config = DaemonConfig {
            heartbeat_period_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_require_auth_is_true() {
        let config = DaemonConfig::default();
        assert!(config.admin_require_auth);
    }
}
