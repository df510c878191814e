// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::routes::{normalize_domain, Backend};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Current config file version. Increment when making breaking changes.
const CONFIG_VERSION: u32 = 1;

/// Top-level domain every proxied name lives under.
pub const DOMAIN_SUFFIX: &str = ".blast";

pub const CA_CERT_FILE: &str = "blast-ca.crt";
pub const CA_KEY_FILE: &str = "blast-ca.key";

/// Expand a short name (`api`) into the served domain (`api.blast`).
pub fn full_domain(prefix: &str) -> String {
    let prefix = prefix.trim().to_ascii_lowercase();
    if prefix.ends_with(DOMAIN_SUFFIX) {
        prefix
    } else {
        format!("{}{}", prefix, DOMAIN_SUFFIX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub listen: ListenConfig,
    /// Active mappings keyed by domain prefix.
    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyMapping>,
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

/// Where the HTTPS listener binds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_https_port")]
    pub port: u16,
    /// Client connections served at once; more are closed on accept.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_https_port(),
            max_connections: default_max_connections(),
        }
    }
}

impl ListenConfig {
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid listen address {}: {}", self.bind, e)))
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_https_port() -> u16 {
    443
}

fn default_max_connections() -> usize {
    crate::proxy::MAX_CONNECTIONS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyMapping {
    pub domain_prefix: String,
    pub local_port: String,
    pub full_domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            listen: ListenConfig::default(),
            proxies: BTreeMap::new(),
        }
    }
}

/// On-disk locations for everything blast persists.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub config: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self> {
        Ok(Self::with_base(Self::base_dir()?))
    }

    /// Paths rooted at an explicit directory (tests, `BLAST_ROOT`).
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            ca_cert: base.join(CA_CERT_FILE),
            ca_key: base.join(CA_KEY_FILE),
            config: base.join("config.toml"),
            base,
        }
    }

    fn base_dir() -> Result<PathBuf> {
        if let Ok(custom_root) = std::env::var("BLAST_ROOT") {
            let path = PathBuf::from(&custom_root);
            if !path.is_absolute() {
                return Err(Error::Config(format!(
                    "BLAST_ROOT must be an absolute path, got: {}",
                    custom_root
                )));
            }
            return Ok(path);
        }

        // Under sudo, keep using the invoking user's store so the root stays the same.
        #[cfg(unix)]
        if let Ok(sudo_user) = std::env::var("SUDO_USER") {
            if sudo_user
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            {
                let user_home = PathBuf::from("/home").join(&sudo_user);
                if user_home.is_dir() {
                    return Ok(user_home.join(".local").join("share").join("blast"));
                }
            }
        }

        if let Some(proj_dirs) = ProjectDirs::from("", "", "blast") {
            Ok(proj_dirs.data_dir().to_path_buf())
        } else if let Some(base_dirs) = BaseDirs::new() {
            Ok(base_dirs.home_dir().join(".blast"))
        } else {
            Err(Error::Config(
                "Could not determine home directory. Set BLAST_ROOT to choose a location.".into(),
            ))
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        crate::fs::ensure_dir(&self.base)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.base.join("daemon.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.base.join("daemon.log")
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(Error::ReadFile {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.config_version > CONFIG_VERSION {
            warn!(
                version = self.config_version,
                supported = CONFIG_VERSION,
                "config.toml is newer than this build; unknown settings are ignored"
            );
        }

        if self.listen.port == 0 {
            return Err(Error::Config("listen.port cannot be 0".into()));
        }
        if self.listen.max_connections == 0 {
            return Err(Error::Config("listen.max_connections cannot be 0".into()));
        }

        for (prefix, mapping) in &self.proxies {
            if mapping.domain_prefix != *prefix {
                return Err(Error::Config(format!(
                    "proxies.{} has mismatched domain_prefix '{}'",
                    prefix, mapping.domain_prefix
                )));
            }
            if mapping.full_domain != full_domain(prefix) {
                return Err(Error::Config(format!(
                    "proxies.{} must serve '{}', found '{}'",
                    prefix,
                    full_domain(prefix),
                    mapping.full_domain
                )));
            }
            Backend::parse(&mapping.local_port)?;
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            crate::fs::ensure_dir(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        crate::fs::atomic_write(path, content.as_bytes())
    }

    /// Record a mapping, replacing any existing one for the same prefix.
    pub fn add_proxy(&mut self, prefix: &str, port: &str) -> Result<&ProxyMapping> {
        let domain = normalize_domain(&full_domain(prefix))?;
        let prefix = domain
            .strip_suffix(DOMAIN_SUFFIX)
            .unwrap_or(&domain)
            .to_string();
        Backend::parse(port)?;

        let mapping = ProxyMapping {
            domain_prefix: prefix.clone(),
            local_port: port.trim().to_string(),
            full_domain: domain,
        };
        self.proxies.insert(prefix.clone(), mapping);
        Ok(&self.proxies[&prefix])
    }

    pub fn remove_proxy(&mut self, prefix: &str) -> Option<ProxyMapping> {
        let key = full_domain(prefix);
        let key = key.strip_suffix(DOMAIN_SUFFIX).unwrap_or(&key);
        self.proxies.remove(key)
    }

    pub fn get_proxy(&self, prefix: &str) -> Option<&ProxyMapping> {
        let key = full_domain(prefix);
        self.proxies.get(key.strip_suffix(DOMAIN_SUFFIX).unwrap_or(&key))
    }

    /// All mappings, ordered by prefix.
    pub fn list_proxies(&self) -> Vec<&ProxyMapping> {
        self.proxies.values().collect()
    }
}
