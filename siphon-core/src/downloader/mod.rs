use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SiphonConfig;
use crate::error::DownloadResult;
use crate::job::DownloadJob;
use crate::proxy::CircuitControl;

pub mod http;
pub mod scrape;
pub mod ytdlp;

pub use http::HttpStreamer;
pub use scrape::{SiteProfile, SniffingScraper};
pub use ytdlp::YtDlpDownloader;

/// One extraction backend. Implementations own the full transfer for a
/// job: they produce a playable file under `dest_dir` and must remove
/// their own partial artifacts on any failure, including cancellation.
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Backend name for logs and status lines.
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        dest_dir: &Path,
        url: &str,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> DownloadResult<PathBuf>;
}

/// Fallback backend routing: substring patterns evaluated in registration
/// order, with a generic sniffing backend for everything else.
pub struct BackendTable {
    entries: Vec<(String, Arc<dyn MediaDownloader>)>,
    generic: Arc<dyn MediaDownloader>,
}

impl BackendTable {
    pub fn new(generic: Arc<dyn MediaDownloader>) -> Self {
        Self {
            entries: Vec::new(),
            generic,
        }
    }

    pub fn register(&mut self, pattern: impl Into<String>, backend: Arc<dyn MediaDownloader>) {
        self.entries.push((pattern.into(), backend));
    }

    /// First registered pattern contained in the URL wins.
    pub fn select(&self, url: &str) -> Arc<dyn MediaDownloader> {
        for (pattern, backend) in &self.entries {
            if url.contains(pattern.as_str()) {
                return Arc::clone(backend);
            }
        }
        Arc::clone(&self.generic)
    }

    /// Builds the routing table described by the `[[sites]]` config
    /// entries: one tailored sniffing scraper per site, plus the generic
    /// scraper as the unmatched-URL fallback.
    pub fn standard(
        config: &SiphonConfig,
        egress: Arc<dyn CircuitControl>,
    ) -> DownloadResult<Self> {
        let generic = SniffingScraper::new(&config.scrape, SiteProfile::default(), egress.clone())?;
        let mut table = Self::new(Arc::new(generic));
        for site in &config.sites {
            if site.pattern.is_empty() {
                continue;
            }
            let profile = SiteProfile::from_site(site);
            let scraper = SniffingScraper::new(&config.scrape, profile, egress.clone())?;
            table.register(site.pattern.clone(), Arc::new(scraper));
        }
        Ok(table)
    }
}
