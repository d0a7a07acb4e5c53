//! TOML monitor configuration: clients to watch and production tuning.
//!
//! ```toml
//! retrieve_interval_secs = 60
//! ppd_calculation = "last-three-frames"
//! bonus_calculation = "download-time"
//!
//! [[clients]]
//! name = "rig"
//! server = "192.168.1.10"
//! password = "secret"
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use uuid::Uuid;

use crate::production::{BonusCalculation, PpdCalculation};
use crate::protein::DEFAULT_API_URL;

/// Default port of the FAH v7 command server.
pub const DEFAULT_PORT: u16 = 36330;

/// First and last characters exclude space and dot; the middle allows both.
static CLIENT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9+=\-_$&^\[\]][a-zA-Z0-9+=\-_$&^\[\] .]+[a-zA-Z0-9+=\-_$&^\[\]]$").unwrap()
});

// ── TOML Configuration Structs ──────────────────────────────────

/// Top-level monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval")]
    pub retrieve_interval_secs: u64,
    #[serde(default = "default_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_overdue_factor")]
    pub heartbeat_overdue_factor: u32,
    #[serde(default = "default_max_log_gap")]
    pub max_log_gap: usize,
    #[serde(default)]
    pub ppd_calculation: PpdCalculation,
    #[serde(default)]
    pub bonus_calculation: BonusCalculation,
    #[serde(default)]
    pub decimal_places: u32,
    pub benchmark_cache: Option<PathBuf>,
    pub metrics_file: Option<PathBuf>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// URL or file path of the protein list. Defaults to the API summary.
    pub protein_source: Option<String>,
    #[serde(default = "default_true")]
    pub project_details: bool,
    #[serde(default)]
    pub clients: Vec<ClientSettings>,
}

/// One `[[clients]]` entry. Only connection-relevant fields; changing any of
/// them means closing and reopening the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    pub name: String,
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub disabled: bool,
    pub guid: Option<Uuid>,
}

impl ClientSettings {
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        ClientSettings {
            name: name.into(),
            server: server.into(),
            port,
            password: String::new(),
            disabled: false,
            guid: None,
        }
    }

    /// `server:port`, the client half of every slot identity.
    pub fn client_path(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

fn default_interval() -> u64 {
    60
}

fn default_overdue_factor() -> u32 {
    3
}

fn default_max_log_gap() -> usize {
    crate::store::DEFAULT_MAX_LOG_GAP
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            retrieve_interval_secs: default_interval(),
            heartbeat_interval_secs: default_interval(),
            heartbeat_overdue_factor: default_overdue_factor(),
            max_log_gap: default_max_log_gap(),
            ppd_calculation: PpdCalculation::default(),
            bonus_calculation: BonusCalculation::default(),
            decimal_places: 0,
            benchmark_cache: None,
            metrics_file: None,
            api_url: default_api_url(),
            protein_source: None,
            project_details: true,
            clients: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn retrieve_interval(&self) -> Duration {
        Duration::from_secs(self.retrieve_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn protein_source(&self) -> String {
        self.protein_source
            .clone()
            .unwrap_or_else(|| format!("{}/project/summary", self.api_url.trim_end_matches('/')))
    }

    pub fn enabled_clients(&self) -> impl Iterator<Item = &ClientSettings> {
        self.clients.iter().filter(|c| !c.disabled)
    }
}

// ── TOML Parsing ────────────────────────────────────────────────

/// Parse a monitor configuration from a TOML string.
pub fn parse_toml(content: &str) -> Result<MonitorConfig> {
    let config: MonitorConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a monitor configuration from a TOML file path.
pub fn parse_toml_file(path: &Path) -> Result<MonitorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_toml(&content).with_context(|| format!("invalid config {}", path.display()))
}

pub fn is_valid_client_name(name: &str) -> bool {
    CLIENT_NAME.is_match(name)
}

fn validate_config(config: &MonitorConfig) -> Result<()> {
    if config.retrieve_interval_secs == 0 {
        anyhow::bail!("retrieve_interval_secs must be greater than zero");
    }
    if config.heartbeat_interval_secs == 0 {
        anyhow::bail!("heartbeat_interval_secs must be greater than zero");
    }
    if config.heartbeat_overdue_factor == 0 {
        anyhow::bail!("heartbeat_overdue_factor must be greater than zero");
    }

    let mut names = HashSet::new();
    for client in &config.clients {
        if !is_valid_client_name(&client.name) {
            anyhow::bail!("invalid client name '{}'", client.name);
        }
        if !names.insert(client.name.as_str()) {
            anyhow::bail!("duplicate client name '{}'", client.name);
        }
        if client.server.trim().is_empty() {
            anyhow::bail!("client '{}' has no server", client.name);
        }
        if client.port == 0 || client.port == u16::MAX {
            anyhow::bail!("client '{}' has invalid port {}", client.name, client.port);
        }
    }
    Ok(())
}
