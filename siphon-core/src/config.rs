use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};

pub const DEFAULT_CONCURRENCY: usize = 3;

/// Top-level configuration for the download core.
///
/// Every field has a default so that a missing or partially written file
/// never prevents the dispatcher from starting; see [`load_or_default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiphonConfig {
    pub limits: LimitsSection,
    pub paths: PathsSection,
    pub proxy: ProxySection,
    pub download: DownloadSection,
    pub scrape: ScrapeSection,
    pub sites: Vec<SiteSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_concurrent_downloads: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_CONCURRENCY as u32,
        }
    }
}

impl LimitsSection {
    /// Effective admission-gate capacity. Zero or unset falls back to the
    /// default rather than disabling downloads entirely.
    pub fn capacity(&self) -> usize {
        if self.max_concurrent_downloads >= 1 {
            self.max_concurrent_downloads as usize
        } else {
            DEFAULT_CONCURRENCY
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub download_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads/pending"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub enabled: bool,
    pub socks_addr: String,
    /// Command invoked to request a fresh egress circuit, e.g.
    /// `["systemctl", "restart", "tor"]`. Optional; rebuild requests are
    /// silently dropped without it.
    pub rebuild_command: Vec<String>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: true,
            socks_addr: "socks5://127.0.0.1:9050".to_string(),
            rebuild_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    pub tool: String,
    pub max_attempts: u32,
    pub retry_delay_seconds: u64,
    pub metadata_timeout_seconds: u64,
    pub connections: u32,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            tool: "yt-dlp".to_string(),
            max_attempts: 3,
            retry_delay_seconds: 2,
            metadata_timeout_seconds: 60,
            connections: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeSection {
    pub max_attempts: u32,
    pub sniff_timeout_seconds: u64,
    /// Pattern matched against outgoing browser requests to capture the
    /// direct media URL.
    pub media_pattern: String,
    pub chromium_path: Option<String>,
    pub user_agent: String,
}

impl Default for ScrapeSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            sniff_timeout_seconds: 35,
            media_pattern: r"\.(mp4|m4v|webm)(\?|$)".to_string(),
            chromium_path: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

/// One site-specific fallback strategy entry. Patterns are evaluated in
/// declaration order, first match wins; unmatched URLs get the generic
/// sniffing strategy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiteSection {
    pub pattern: String,
    pub referer: Option<String>,
    pub session_cookie: Option<String>,
    pub session_value: Option<String>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> ConfigResult<SiphonConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

/// Loads the configuration, treating a missing or unparseable file as
/// "use defaults". The core must never fail to start because an operator
/// fat-fingered the config.
pub fn load_or_default<P: AsRef<Path>>(path: P) -> SiphonConfig {
    match load_config(&path) {
        Ok(config) => config,
        Err(ConfigError::Io { source, path }) => {
            debug!(path = %path.display(), error = %source, "config not readable, using defaults");
            SiphonConfig::default()
        }
        Err(ConfigError::Parse { source, path }) => {
            warn!(path = %path.display(), error = %source, "config unparseable, using defaults");
            SiphonConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn full_config_parses() {
        let raw = r#"
[limits]
max_concurrent_downloads = 8

[paths]
download_dir = "/srv/pending"

[proxy]
enabled = true
socks_addr = "socks5://127.0.0.1:9150"
rebuild_command = ["systemctl", "restart", "tor"]

[download]
tool = "yt-dlp"
max_attempts = 2
retry_delay_seconds = 1

[scrape]
max_attempts = 4
sniff_timeout_seconds = 30

[[sites]]
pattern = "clips.example.net"
referer = "https://clips.example.net"
session_cookie = "SESSID"
session_value = "abc123"
"#;
        let config: SiphonConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.limits.capacity(), 8);
        assert_eq!(config.paths.download_dir, PathBuf::from("/srv/pending"));
        assert_eq!(config.proxy.rebuild_command.len(), 3);
        assert_eq!(config.download.max_attempts, 2);
        assert_eq!(config.sites.len(), 1);
        assert_eq!(config.sites[0].pattern, "clips.example.net");
    }

    #[test]
    fn empty_config_gets_defaults() {
        let config: SiphonConfig = toml::from_str("").unwrap();
        assert_eq!(config.limits.capacity(), DEFAULT_CONCURRENCY);
        assert_eq!(config.download.tool, "yt-dlp");
        assert_eq!(config.scrape.max_attempts, 5);
        assert!(config.proxy.enabled);
        assert!(config.sites.is_empty());
    }

    #[test]
    fn zero_concurrency_falls_back_to_default() {
        let config: SiphonConfig =
            toml::from_str("[limits]\nmax_concurrent_downloads = 0\n").unwrap();
        assert_eq!(config.limits.capacity(), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn unparseable_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"limits = not toml at all [").unwrap();
        let config = load_or_default(file.path());
        assert_eq!(config.limits.capacity(), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(dir.path().join("nope.toml"));
        assert_eq!(config.limits.capacity(), DEFAULT_CONCURRENCY);
    }
}
