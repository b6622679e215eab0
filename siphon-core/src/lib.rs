pub mod assets;
pub mod config;
pub mod downloader;
pub mod error;
pub mod job;
pub mod manager;
pub mod metadata;
pub mod proxy;

pub use assets::{AssetSink, NullAssetSink};
pub use config::{load_config, load_or_default, SiphonConfig, DEFAULT_CONCURRENCY};
pub use downloader::{
    BackendTable, HttpStreamer, MediaDownloader, SiteProfile, SniffingScraper, YtDlpDownloader,
};
pub use error::{ConfigError, ConfigResult, DownloadError, DownloadResult};
pub use job::{DownloadJob, JobOutcome, JobSnapshot};
pub use manager::{DownloadManager, DownloadManagerBuilder};
pub use metadata::MetadataPrefetcher;
pub use proxy::{CircuitControl, DirectEgress, TorCircuit};
