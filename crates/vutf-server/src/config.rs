//! Server configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use vutf_core::CoreConfig;

/// Default listen address when neither file nor environment sets one
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// HTTP listener settings (`[server]` table)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_addr: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

/// Server configuration
///
/// Layout of `config.toml`:
/// ```toml
/// [server]
/// listen_addr = "127.0.0.1:8080"
///
/// [store]
/// store_dir = "/var/lib/violentutf/stores"
/// salt = "..."
///
/// [pool]
/// ttl_secs = 1800
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    #[serde(flatten)]
    pub core: CoreConfig,
    /// File the config was read from, if any
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// `~/.violentutf`
    pub fn base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".violentutf")
    }

    /// Load from `path` (or `~/.violentutf/config.toml`), then apply
    /// environment overrides. A missing file means defaults.
    ///
    /// A relative `store_dir` (including the default when the file omits
    /// it) is taken relative to the directory holding the config file.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(|| Self::base_dir().join("config.toml"));

        let mut config = if path.exists() {
            let mut config = Self::from_file(&path)?;
            if config.core.store.store_dir.is_relative() {
                let root = path.parent().unwrap_or_else(|| Path::new("."));
                config.core.store.store_dir = root.join(&config.core.store.store_dir);
            }
            config.config_path = Some(path);
            config
        } else {
            let mut config = Self::default();
            config.core.store.store_dir = Self::base_dir().join("stores");
            config
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.core.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `VUTF_*` overrides from `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("VUTF_STORE_DIR") {
            self.core.store.store_dir = PathBuf::from(dir);
        }
        if let Some(salt) = lookup("VUTF_SALT") {
            self.core.store.salt = salt;
        }
        if let Some(url) = lookup("VUTF_GATEWAY_URL") {
            self.core.gateway.base_url = url;
        }
        if let Some(addr) = lookup("VUTF_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
    }
}
