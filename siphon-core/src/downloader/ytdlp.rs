use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DownloadSection;
use crate::error::{DownloadError, DownloadResult};
use crate::job::DownloadJob;
use crate::proxy::CircuitControl;

use super::MediaDownloader;

/// Primary extraction backend driving an external `yt-dlp` process and
/// mirroring its `--newline` progress stream into the job fields.
pub struct YtDlpDownloader {
    tool: String,
    connections: u32,
    egress: Arc<dyn CircuitControl>,
    progress_re: Regex,
    speed_re: Regex,
}

impl YtDlpDownloader {
    pub fn new(config: &DownloadSection, egress: Arc<dyn CircuitControl>) -> Self {
        Self {
            tool: config.tool.clone(),
            connections: config.connections.max(1),
            egress,
            progress_re: Regex::new(r"\[download\]\s+(\d+\.?\d*)%").expect("valid regex"),
            speed_re: Regex::new(r"at\s+(\d+\.?\d*\w+/s)").expect("valid regex"),
        }
    }

    fn parse_progress(&self, line: &str) -> (Option<f64>, Option<String>) {
        let progress = self
            .progress_re
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());
        let speed = self
            .speed_re
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        (progress, speed)
    }

    /// Locates the file the process left behind. The output template is
    /// title-based, so the probe-derived filename is checked first and a
    /// newest-mp4 scan covers titles that only the extractor knew.
    async fn resolve_output(&self, dest_dir: &Path, job: &DownloadJob) -> DownloadResult<PathBuf> {
        let stem = job.filename();
        if let Some(name) = &stem {
            let candidate = dest_dir.join(format!("{name}.mp4"));
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        latest_mp4(dest_dir, stem.as_deref())
            .await?
            .ok_or_else(|| DownloadError::NoMedia("extractor produced no mp4 file".to_string()))
    }
}

#[async_trait]
impl MediaDownloader for YtDlpDownloader {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn fetch(
        &self,
        dest_dir: &Path,
        url: &str,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> DownloadResult<PathBuf> {
        let mut command = Command::new(&self.tool);
        if let Some(socks) = self.egress.socks_url() {
            command.arg("--proxy").arg(socks);
        }
        let template = match job.filename() {
            Some(name) => format!("{}/{name}.%(ext)s", dest_dir.display()),
            None => format!("{}/%(title)s.%(ext)s", dest_dir.display()),
        };
        command
            .arg("-N")
            .arg(self.connections.to_string())
            .arg("-f")
            .arg("bv*+ba/b")
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--newline")
            .arg("-o")
            .arg(template)
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| DownloadError::io(dest_dir, source))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Backend("yt-dlp stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(DownloadError::Cancelled);
                }
                line = lines.next_line() => {
                    line.map_err(|source| DownloadError::io(dest_dir, source))?
                }
            };
            let Some(line) = line else { break };
            let (progress, speed) = self.parse_progress(&line);
            if let Some(progress) = progress {
                job.set_progress(progress);
                job.set_status("Downloading");
            }
            if let Some(speed) = speed {
                job.set_speed(speed);
            }
            debug!(target: "siphon::ytdlp", line = %line);
        }

        let status = child
            .wait()
            .await
            .map_err(|source| DownloadError::io(dest_dir, source))?;
        if !status.success() {
            warn!(url, code = ?status.code(), "yt-dlp exited non-zero");
            return Err(DownloadError::Process {
                tool: self.tool.clone(),
                code: status.code(),
            });
        }

        let output = self.resolve_output(dest_dir, job).await?;
        info!(url, path = %output.display(), "extractor download complete");
        Ok(output)
    }
}

/// Most recently modified `.mp4` directly under `dir`, restricted to
/// names containing `stem` when one is known. The restriction keeps a
/// concurrently finishing job's file from being claimed by this one.
async fn latest_mp4(dir: &Path, stem: Option<&str>) -> DownloadResult<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|source| DownloadError::io(dir, source))?;
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| DownloadError::io(dir, source))?
    {
        let path = entry.path();
        let is_mp4 = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("mp4"))
            .unwrap_or(false);
        if !is_mp4 {
            continue;
        }
        if let Some(stem) = stem {
            let matches_stem = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.contains(stem))
                .unwrap_or(false);
            if !matches_stem {
                continue;
            }
        }
        let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if newest
            .as_ref()
            .map(|(when, _)| modified > *when)
            .unwrap_or(true)
        {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::DirectEgress;

    fn downloader() -> YtDlpDownloader {
        YtDlpDownloader::new(&DownloadSection::default(), Arc::new(DirectEgress))
    }

    #[test]
    fn parses_progress_and_speed_lines() {
        let dl = downloader();
        let (progress, speed) =
            dl.parse_progress("[download]  42.3% of 120.00MiB at 3.21MiB/s ETA 00:21");
        assert_eq!(progress, Some(42.3));
        assert_eq!(speed.as_deref(), Some("3.21MiB/s"));
    }

    #[test]
    fn ignores_unrelated_lines() {
        let dl = downloader();
        let (progress, speed) = dl.parse_progress("[info] extracting video metadata");
        assert!(progress.is_none());
        assert!(speed.is_none());
    }

    #[test]
    fn parses_integral_percentages() {
        let dl = downloader();
        let (progress, _) = dl.parse_progress("[download] 100% of 5.00MiB in 00:02");
        assert_eq!(progress, Some(100.0));
    }

    #[tokio::test]
    async fn latest_mp4_picks_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.mp4"), b"a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(dir.path().join("new.mp4"), b"b").unwrap();
        std::fs::write(dir.path().join("skip.txt"), b"c").unwrap();

        let found = latest_mp4(dir.path(), None).await.unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "new.mp4");
    }

    #[tokio::test]
    async fn latest_mp4_ignores_other_jobs_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("My Clip.mp4"), b"a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        // Newer, but belongs to a different download.
        std::fs::write(dir.path().join("Other Job.mp4"), b"b").unwrap();

        let found = latest_mp4(dir.path(), Some("My Clip")).await.unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "My Clip.mp4");
        assert!(latest_mp4(dir.path(), Some("Missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn latest_mp4_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_mp4(dir.path(), None).await.unwrap().is_none());
    }
}
