use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use regex::Regex;
use reqwest::header::REFERER;
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::job::DownloadJob;

/// Job fields are refreshed once per this many bytes written.
const PROGRESS_STRIDE: u64 = 512 * 1024;

const MAX_STEM_LEN: usize = 220;

/// Strips trailing duration/quality noise that sites append to titles,
/// e.g. "Some Clip 12min" or "Some Clip 720p30fps HD".
pub fn clean_title(raw: &str) -> String {
    let minutes = Regex::new(r"(?i)\s*\d+min.*$").expect("valid regex");
    let quality = Regex::new(r"(?i)\s*\d+p\d+fps.*$").expect("valid regex");
    let cleaned = minutes.replace(raw, "");
    quality.replace(&cleaned, "").into_owned()
}

/// Reduces a scraped title to a safe ASCII file stem. Empty results fall
/// back to a fixed stem so a pathological title never produces a hidden
/// or empty filename.
pub fn sanitize_file_name(raw: &str) -> String {
    let ascii: String = raw.chars().filter(char::is_ascii).collect();
    let keep = Regex::new(r"[^a-zA-Z0-9 _-]").expect("valid regex");
    let collapsed = Regex::new(r"\s+").expect("valid regex");
    let cleaned = keep.replace_all(&ascii, "");
    let mut stem = collapsed.replace_all(&cleaned, " ").trim().to_string();
    if stem.len() > MAX_STEM_LEN {
        stem.truncate(MAX_STEM_LEN);
        stem = stem.trim_end().to_string();
    }
    if stem.is_empty() {
        "Video_Download".to_string()
    } else {
        stem
    }
}

/// Final destination for a sanitized stem, with a timestamp uniqueness
/// suffix when the name is already taken by a final or in-progress file.
pub fn unique_destination(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{extension}"));
    let part = dir.join(format!("{stem}.{extension}.part"));
    if candidate.exists() || part.exists() {
        dir.join(format!(
            "{stem}_{}.{extension}",
            Utc::now().timestamp_millis()
        ))
    } else {
        candidate
    }
}

/// Proxy-aware HTTP streaming shared by every scraping strategy.
pub struct HttpStreamer {
    client: Client,
}

impl HttpStreamer {
    pub fn new(proxy: Option<&str>, user_agent: &str) -> DownloadResult<Self> {
        let mut builder = Client::builder().user_agent(user_agent.to_string());
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Streams `url` to `dest`, writing through a `.part` sibling and
    /// renaming into place only once the body is fully consumed; the
    /// final path never holds a truncated file. The temp file is removed
    /// on every error path, including cancellation.
    pub async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        referer: Option<&str>,
        attempt: u32,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        let mut temp = PathBuf::from(format!("{}.part", dest.display()));
        if temp.exists() {
            temp = PathBuf::from(format!(
                "{}_{}.part",
                dest.display(),
                Utc::now().timestamp_millis()
            ));
        }

        let result = self
            .stream_inner(url, dest, &temp, referer, attempt, job, cancel)
            .await;
        if result.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_inner(
        &self,
        url: &str,
        dest: &Path,
        temp: &Path,
        referer: Option<&str>,
        attempt: u32,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Network(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = fs::File::create(temp)
            .await
            .map_err(|source| DownloadError::io(temp, source))?;

        let started = Instant::now();
        let mut written: u64 = 0;
        let mut last_stride: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let data = chunk?;
            file.write_all(&data)
                .await
                .map_err(|source| DownloadError::io(temp, source))?;
            written += data.len() as u64;

            let stride = written / PROGRESS_STRIDE;
            if stride > last_stride {
                last_stride = stride;
                self.report_progress(job, attempt, written, total, &started);
            }
        }
        file.flush()
            .await
            .map_err(|source| DownloadError::io(temp, source))?;
        drop(file);

        if dest.exists() {
            let _ = fs::remove_file(dest).await;
        }
        fs::rename(temp, dest)
            .await
            .map_err(|source| DownloadError::io(dest, source))?;
        debug!(path = %dest.display(), bytes = written, "streamed download complete");
        Ok(())
    }

    fn report_progress(
        &self,
        job: &DownloadJob,
        attempt: u32,
        written: u64,
        total: Option<u64>,
        started: &Instant,
    ) {
        let seconds = started.elapsed().as_secs_f64().max(0.001);
        let rate_mb = written as f64 / seconds / 1024.0 / 1024.0;
        job.set_speed(format!("{rate_mb:.1} MB/s"));
        let prefix = if attempt > 1 {
            format!("[Retry {attempt}] ")
        } else {
            String::new()
        };
        match total {
            Some(total) if total > 0 => {
                job.set_progress(written as f64 / total as f64 * 100.0);
                job.set_status(format!("{prefix}Downloading"));
            }
            _ => {
                job.pulse_progress();
                let mb = written as f64 / 1024.0 / 1024.0;
                job.set_status(format!("{prefix}Downloading... {mb:.1} MB"));
            }
        }
    }
}

/// Where the mp4 remux of `input` should land. Goes through the same
/// collision policy as the streaming path, so an existing final file
/// with the same stem is never overwritten.
fn conversion_target(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("Video_Download");
    let dir = input.parent().unwrap_or_else(|| Path::new("."));
    unique_destination(dir, stem, "mp4")
}

/// Remuxes a non-mp4 capture into an mp4 container with ffmpeg, deleting
/// the original on success. Non-zero exit is a recoverable failure.
pub async fn convert_to_mp4(
    input: &Path,
    job: &DownloadJob,
    cancel: &CancellationToken,
) -> DownloadResult<PathBuf> {
    if input
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false)
    {
        return Ok(input.to_path_buf());
    }
    let output = conversion_target(input);
    job.set_status("Converting to MP4...");

    let mut child = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-c:v")
        .arg("libx264")
        .arg("-c:a")
        .arg("aac")
        .arg("-movflags")
        .arg("+faststart")
        .arg(&output)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DownloadError::io(input, source))?;

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = fs::remove_file(&output).await;
            return Err(DownloadError::Cancelled);
        }
        status = child.wait() => status.map_err(|source| DownloadError::io(input, source))?,
    };

    if status.success() {
        if let Err(err) = fs::remove_file(input).await {
            warn!(path = %input.display(), error = %err, "failed to remove pre-conversion file");
        }
        Ok(output)
    } else {
        let _ = fs::remove_file(&output).await;
        Err(DownloadError::Process {
            tool: "ffmpeg".to_string(),
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_title_strips_duration_and_quality_suffixes() {
        assert_eq!(clean_title("Great Clip 12min HD"), "Great Clip");
        assert_eq!(clean_title("Great Clip 720p30fps something"), "Great Clip");
        assert_eq!(clean_title("Plain Title"), "Plain Title");
    }

    #[test]
    fn sanitize_keeps_safe_characters_only() {
        assert_eq!(
            sanitize_file_name("Some: Video! (2024) \u{1F600}"),
            "Some Video 2024"
        );
        assert_eq!(sanitize_file_name("a   b\t\tc"), "a b c");
    }

    #[test]
    fn sanitize_falls_back_on_empty_result() {
        assert_eq!(sanitize_file_name("!!!***"), "Video_Download");
        assert_eq!(sanitize_file_name(""), "Video_Download");
    }

    #[test]
    fn sanitize_truncates_very_long_titles() {
        let long = "x".repeat(400);
        assert_eq!(sanitize_file_name(&long).len(), 220);
    }

    #[test]
    fn unique_destination_appends_suffix_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_destination(dir.path(), "My Video", "mp4");
        assert_eq!(first, dir.path().join("My Video.mp4"));

        std::fs::write(&first, b"taken").unwrap();
        let second = unique_destination(dir.path(), "My Video", "mp4");
        assert_ne!(first, second);
        let name = second.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("My Video_"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn conversion_target_never_clobbers_existing_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Clip.webm");
        assert_eq!(conversion_target(&input), dir.path().join("Clip.mp4"));

        std::fs::write(dir.path().join("Clip.mp4"), b"earlier download").unwrap();
        let target = conversion_target(&input);
        assert_ne!(target, dir.path().join("Clip.mp4"));
        let name = target.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("Clip_"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn unique_destination_avoids_existing_part_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Clip.mp4.part"), b"half").unwrap();
        let dest = unique_destination(dir.path(), "Clip", "mp4");
        assert_ne!(dest, dir.path().join("Clip.mp4"));
    }
}
