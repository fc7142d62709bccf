use crate::report::{MIN_DESCRIPTION_CHARS, MIN_TITLE_CHARS};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: Remote,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub connectivity: Connectivity,
    #[serde(default)]
    pub capture: Capture,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        cfg.validate()
            .with_context(|| format!("validating config: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.base_url.trim().is_empty() {
            bail!("remote.base_url must not be empty");
        }
        if self.remote.collection.trim().is_empty() {
            bail!("remote.collection must not be empty");
        }
        if self.remote.timeout_ms == 0 {
            bail!("remote.timeout_ms must be > 0");
        }
        if self.connectivity.probe_interval_ms == 0 {
            bail!("connectivity.probe_interval_ms must be > 0");
        }
        if self.capture.min_title_chars < MIN_TITLE_CHARS {
            bail!("capture.min_title_chars must be >= {MIN_TITLE_CHARS}");
        }
        if self.capture.min_description_chars < MIN_DESCRIPTION_CHARS {
            bail!("capture.min_description_chars must be >= {MIN_DESCRIPTION_CHARS}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    pub base_url: String,
    pub collection: String,
    /// Appended to every resource path; `.json` for realtime-database style trees.
    pub path_suffix: String,
    pub timeout_ms: u64,
    pub user_agent: String,
}
impl Default for Remote {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".into(),
            collection: "complaints".into(),
            path_suffix: "".into(),
            timeout_ms: 10_000,
            user_agent: concat!("complaint-relay/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}
impl Remote {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub path: String,
    pub fsync: bool,
}
impl Default for Queue {
    fn default() -> Self {
        Self {
            path: ".complaint-relay/queue.json".into(),
            fsync: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connectivity {
    pub probe_url: String,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub drain_on_start: bool,
}
impl Default for Connectivity {
    fn default() -> Self {
        Self {
            probe_url: "".into(),
            probe_interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            drain_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub min_title_chars: usize,
    pub min_description_chars: usize,
}
impl Default for Capture {
    fn default() -> Self {
        Self {
            min_title_chars: 3,
            min_description_chars: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Fallback author reference; empty means anonymous.
    pub author: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
