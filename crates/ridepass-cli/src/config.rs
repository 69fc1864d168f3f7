//! CLI configuration.
//!
//! Stored at `~/.config/ridepass/config.json`. Every field has a default, so
//! a missing or partial file is fine. A few settings can be overridden from
//! the environment (or a `.env` file):
//!
//! - `RIDEPASS_BASE_URL`: use the HTTP provider against this server
//! - `RIDEPASS_STORE`: `memory`, `file`, `encrypted` or `keyring`
//! - `RIDEPASS_SECRET`: token signing secret
//! - `RIDEPASS_PASSPHRASE`: passphrase for the encrypted store (never saved)

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use ridepass_core::RefreshPolicyKind;

/// Application name used for config/data directory paths
const APP_NAME: &str = "ridepass";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Secret the mock provider signs with when none is configured.
pub const DEV_TOKEN_SECRET: &str = "ridepass-dev-secret";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EXPIRY_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process provider with seeded demo accounts.
    #[default]
    Mock,
    Http,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
    Encrypted,
    Keyring,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" => Ok(StoreBackend::File),
            "encrypted" => Ok(StoreBackend::Encrypted),
            "keyring" => Ok(StoreBackend::Keyring),
            other => bail!("Unknown store backend '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderKind,
    pub base_url: Option<String>,
    pub store: StoreBackend,
    pub refresh_policy: RefreshPolicyKind,
    /// Signing secret shared with the server. Enables local verification.
    pub token_secret: Option<String>,
    pub request_timeout_secs: u64,
    pub expiry_leeway_secs: i64,
    /// Write a daily rolling log here in addition to stderr.
    pub log_dir: Option<PathBuf>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: None,
            store: StoreBackend::default(),
            refresh_policy: RefreshPolicyKind::default(),
            token_secret: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            expiry_leeway_secs: DEFAULT_EXPIRY_LEEWAY_SECS,
            log_dir: None,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Where the file-backed stores keep their tokens.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn token_secret(&self) -> &str {
        self.token_secret.as_deref().unwrap_or(DEV_TOKEN_SECRET)
    }

    pub fn passphrase() -> Option<String> {
        std::env::var("RIDEPASS_PASSPHRASE").ok().filter(|p| !p.is_empty())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("RIDEPASS_BASE_URL").filter(|u| !u.is_empty()) {
            self.provider = ProviderKind::Http;
            self.base_url = Some(url);
        }
        if let Some(store) = lookup("RIDEPASS_STORE") {
            self.store = store.parse().context("Invalid RIDEPASS_STORE")?;
        }
        if let Some(secret) = lookup("RIDEPASS_SECRET").filter(|s| !s.is_empty()) {
            self.token_secret = Some(secret);
        }
        Ok(())
    }
}
