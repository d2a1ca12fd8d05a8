use crate::providers::openai::DEFAULT_BASE_URL;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted collection interval
pub const MAX_SCRAPE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

fn default_listen_address() -> String {
    ":9185".to_string()
}

fn default_scrape_interval() -> String {
    "60s".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_grace() -> String {
    "10s".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            scrape_interval: default_scrape_interval(),
            log_level: default_log_level(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: Option<OpenAiConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

fn default_true() -> bool {
    true
}

fn default_openai_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            org_id: None,
            base_url: default_openai_base_url(),
        }
    }
}

/// Values taken from the environment or command line, applied over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_address: Option<String>,
    pub scrape_interval: Option<String>,
    pub log_level: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_org_id: Option<String>,
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("robotheus")
            .join("config.toml")
    }

    /// Load an explicit file (which must exist) or the default path (which may not).
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::config_path();
                if !path.exists() {
                    return Ok(Config::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(addr) = overrides.listen_address {
            self.general.listen_address = addr;
        }
        if let Some(interval) = overrides.scrape_interval {
            self.general.scrape_interval = interval;
        }
        if let Some(level) = overrides.log_level {
            self.general.log_level = level;
        }

        let key = overrides.openai_api_key.filter(|k| !k.trim().is_empty());
        let org = overrides.openai_org_id.filter(|o| !o.trim().is_empty());
        if key.is_some() || org.is_some() {
            let openai = self.providers.openai.get_or_insert_with(OpenAiConfig::default);
            if let Some(key) = key {
                openai.api_key = key;
            }
            if org.is_some() {
                openai.org_id = org;
            }
        }
    }

    /// Enabled OpenAI settings with a usable key
    pub fn openai(&self) -> Option<&OpenAiConfig> {
        self.providers
            .openai
            .as_ref()
            .filter(|c| c.enabled && !c.api_key.trim().is_empty())
    }

    pub fn scrape_interval(&self) -> Result<Duration> {
        let interval = parse_duration(&self.general.scrape_interval)
            .context("Invalid scrape interval")?;
        if interval.is_zero() {
            bail!("Scrape interval must be greater than zero");
        }
        if interval > MAX_SCRAPE_INTERVAL {
            bail!(
                "Scrape interval {} exceeds the maximum of {}s",
                self.general.scrape_interval,
                MAX_SCRAPE_INTERVAL.as_secs()
            );
        }
        Ok(interval)
    }

    pub fn shutdown_grace(&self) -> Result<Duration> {
        parse_duration(&self.general.shutdown_grace).context("Invalid shutdown grace period")
    }

    pub fn listen_address(&self) -> Result<SocketAddr> {
        parse_listen_address(&self.general.listen_address)
    }

    /// Copy safe to print: secrets replaced
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if let Some(openai) = config.providers.openai.as_mut() {
            if !openai.api_key.is_empty() {
                openai.api_key = "<redacted>".to_string();
            }
        }
        config
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse `"90"`, `"90s"`, `"5m"`, `"1h"`; a bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| anyhow!("'{}' is not a duration like 60s, 5m or 1h", value))?;

    let secs = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" | "" => Some(amount),
        "m" => amount.checked_mul(60),
        "h" => amount.checked_mul(3600),
        other => bail!("Unknown duration unit '{}' in '{}'", other, value),
    };
    match secs {
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => bail!("Duration '{}' is too large", value),
    }
}

/// Parse `":9185"` (all interfaces) or `"host:port"`.
pub fn parse_listen_address(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.to_socket_addrs()
        .with_context(|| format!("Invalid listen address '{}'", addr))?
        .next()
        .ok_or_else(|| anyhow!("Listen address '{}' did not resolve", addr))
}
