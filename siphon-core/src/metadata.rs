use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DownloadSection;
use crate::downloader::http::sanitize_file_name;
use crate::job::DownloadJob;
use crate::proxy::CircuitControl;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    title: Option<String>,
    thumbnail: Option<String>,
}

/// Best-effort title and thumbnail probe that runs before the transfer.
///
/// Every failure mode is swallowed: a job whose metadata probe times out
/// or errors proceeds to download with a URL-derived name instead.
pub struct MetadataPrefetcher {
    tool: String,
    timeout: Duration,
    egress: Arc<dyn CircuitControl>,
}

impl MetadataPrefetcher {
    pub fn new(config: &DownloadSection, egress: Arc<dyn CircuitControl>) -> Self {
        Self {
            tool: config.tool.clone(),
            timeout: Duration::from_secs(config.metadata_timeout_seconds),
            egress,
        }
    }

    /// Probes `job.url()` and fills in the job's filename and thumbnail.
    /// Returns early and silently when cancelled.
    pub async fn prefetch(&self, job: &DownloadJob, cancel: &CancellationToken) {
        job.set_status("Fetching metadata...");
        match self.probe(job.url(), cancel).await {
            Some(probe) => {
                if let Some(title) = probe.title.filter(|title| !title.trim().is_empty()) {
                    job.set_filename(sanitize_file_name(&title));
                }
                if let Some(thumbnail) = probe.thumbnail {
                    job.set_thumbnail_url(thumbnail);
                }
            }
            None => {
                debug!(url = %job.url(), "metadata probe yielded nothing, deriving name from URL");
            }
        }
        if job.filename().is_none() {
            job.set_filename(slug_title(job.url()));
        }
    }

    async fn probe(&self, url: &str, cancel: &CancellationToken) -> Option<ProbeOutput> {
        let mut command = Command::new(&self.tool);
        command
            .arg("--dump-json")
            .arg("--skip-download")
            .arg("--no-warnings");
        if let Some(socks) = self.egress.socks_url() {
            command.arg("--proxy").arg(socks);
        }
        command
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(tool = %self.tool, error = %err, "metadata probe could not start");
                return None;
            }
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => return None,
            output = timeout(self.timeout, child.wait_with_output()) => match output {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => {
                    warn!(url, error = %err, "metadata probe failed");
                    return None;
                }
                Err(_) => {
                    warn!(url, timeout = ?self.timeout, "metadata probe timed out");
                    return None;
                }
            },
        };

        if !output.status.success() {
            debug!(url, code = ?output.status.code(), "metadata probe exited non-zero");
            return None;
        }
        match serde_json::from_slice::<ProbeOutput>(&output.stdout) {
            Ok(probe) => Some(probe),
            Err(err) => {
                warn!(url, error = %err, "metadata probe output unparseable");
                None
            }
        }
    }
}

/// URL-derived fallback name: last non-empty path segment, or the host
/// for pathless URLs, sanitized.
pub fn slug_title(raw: &str) -> String {
    let segment = url::Url::parse(raw)
        .ok()
        .and_then(|parsed| {
            let last = parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(String::from));
            last.or_else(|| parsed.host_str().map(String::from))
        })
        .unwrap_or_default();
    let spaced = segment.replace(['-', '_', '.'], " ");
    sanitize_file_name(&spaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_title_uses_last_path_segment() {
        assert_eq!(
            slug_title("https://example.com/watch/great-new-clip"),
            "great new clip"
        );
        assert_eq!(
            slug_title("https://example.com/v/clip_one/?t=10"),
            "clip one"
        );
    }

    #[test]
    fn slug_title_survives_pathless_urls() {
        assert_eq!(slug_title("https://example.com"), "example com");
        assert_eq!(slug_title(""), "Video_Download");
    }

    #[test]
    fn probe_output_parses_ytdlp_json() {
        let raw = r#"{"title": "A Clip", "thumbnail": "https://cdn.example.com/t.jpg", "id": "x1"}"#;
        let probe: ProbeOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(probe.title.as_deref(), Some("A Clip"));
        assert_eq!(
            probe.thumbnail.as_deref(),
            Some("https://cdn.example.com/t.jpg")
        );
    }

    #[tokio::test]
    async fn prefetch_falls_back_to_url_slug_when_tool_is_missing() {
        let config = DownloadSection {
            tool: "definitely-not-a-real-tool".to_string(),
            metadata_timeout_seconds: 1,
            ..DownloadSection::default()
        };
        let prefetcher = MetadataPrefetcher::new(&config, Arc::new(crate::proxy::DirectEgress));
        let job = DownloadJob::new("https://example.com/watch/fallback-name");
        prefetcher.prefetch(&job, &CancellationToken::new()).await;
        assert_eq!(job.filename().as_deref(), Some("fallback name"));
    }
}
