use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, ErrorReason, SetCookiesParams};
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ScrapeSection, SiteSection};
use crate::error::{DownloadError, DownloadResult};
use crate::job::DownloadJob;
use crate::proxy::CircuitControl;

use super::http::{clean_title, convert_to_mp4, sanitize_file_name, unique_destination};
use super::{HttpStreamer, MediaDownloader};

/// Tags player-looking clickable elements and reports them back, so the
/// best quality candidate can be picked and clicked from Rust.
const TRIGGER_SCAN_SCRIPT: &str = r#"
(() => {
    const found = [];
    const nodes = document.querySelectorAll(
        'video, button, a, [class*="play" i], [class*="quality" i], [data-quality]'
    );
    let index = 0;
    for (const node of nodes) {
        const text = (node.innerText || node.getAttribute('data-quality') || '').trim();
        const rect = node.getBoundingClientRect();
        if (rect.width < 4 || rect.height < 4) continue;
        node.setAttribute('data-trigger-index', String(index));
        found.push({ index, text: text.slice(0, 80), tag: node.tagName.toLowerCase() });
        index += 1;
    }
    return JSON.stringify(found);
})()
"#;

#[derive(Debug, Deserialize)]
struct TriggerCandidate {
    index: u32,
    text: String,
    tag: String,
}

/// Per-site tuning for the sniffing strategy. The default profile carries
/// no referer and no session cookie and works as the generic fallback.
#[derive(Debug, Clone, Default)]
pub struct SiteProfile {
    pub referer: Option<String>,
    pub session_cookie: Option<(String, String)>,
}

impl SiteProfile {
    pub fn from_site(site: &SiteSection) -> Self {
        let session_cookie = match (&site.session_cookie, &site.session_value) {
            (Some(name), Some(value)) => Some((name.clone(), value.clone())),
            _ => None,
        };
        Self {
            referer: site.referer.clone(),
            session_cookie,
        }
    }
}

/// Fallback backend: drives a headless Chromium visit, intercepts the
/// page's own media request, aborts it, and re-downloads the captured URL
/// directly through the proxy.
pub struct SniffingScraper {
    max_attempts: u32,
    sniff_timeout: Duration,
    media_re: Regex,
    chromium_path: Option<String>,
    user_agent: String,
    profile: SiteProfile,
    egress: Arc<dyn CircuitControl>,
    streamer: HttpStreamer,
}

impl SniffingScraper {
    pub fn new(
        config: &ScrapeSection,
        profile: SiteProfile,
        egress: Arc<dyn CircuitControl>,
    ) -> DownloadResult<Self> {
        let media_re = Regex::new(&config.media_pattern)
            .map_err(|err| DownloadError::Backend(format!("bad media pattern: {err}")))?;
        let streamer = HttpStreamer::new(egress.socks_url().as_deref(), &config.user_agent)?;
        Ok(Self {
            max_attempts: config.max_attempts.max(1),
            sniff_timeout: Duration::from_secs(config.sniff_timeout_seconds),
            media_re,
            chromium_path: config.chromium_path.clone(),
            user_agent: config.user_agent.clone(),
            profile,
            egress,
            streamer,
        })
    }

    async fn attempt(
        &self,
        dest_dir: &Path,
        url: &str,
        attempt: u32,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> DownloadResult<PathBuf> {
        job.set_status(format!(
            "Scraping page (attempt {attempt}/{})...",
            self.max_attempts
        ));
        let (media_url, title) = self.sniff(url, cancel).await?;
        info!(url, media = %media_url, "sniffed direct media url");

        // Page title beats the probe-derived name, which beats the fixed
        // fallback stem inside sanitize_file_name.
        let base = title.or_else(|| job.filename()).unwrap_or_default();
        let stem = sanitize_file_name(&clean_title(&base));
        job.set_filename(stem.clone());
        let extension = self.infer_extension(&media_url);
        let dest = unique_destination(dest_dir, &stem, &extension);

        let result = self
            .streamer
            .stream_to_file(
                &media_url,
                &dest,
                self.profile.referer.as_deref(),
                attempt,
                job,
                cancel,
            )
            .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&dest).await;
            return Err(err);
        }

        if extension.eq_ignore_ascii_case("mp4") {
            return Ok(dest);
        }
        match convert_to_mp4(&dest, job, cancel).await {
            Ok(converted) => Ok(converted),
            Err(err) => {
                let _ = fs::remove_file(&dest).await;
                Err(err)
            }
        }
    }

    /// One full browser visit. The browser always gets closed, even when
    /// sniffing fails or the job is cancelled mid-visit.
    async fn sniff(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> DownloadResult<(String, Option<String>)> {
        let chromium_config = self.build_chromium_config()?;
        let (mut browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| DownloadError::Browser(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            outcome = self.drive(&browser, url) => outcome,
        };

        if let Err(err) = browser.close().await {
            debug!(error = %err, "browser close failed");
        }
        let _ = browser.wait().await;
        handler_task.abort();
        outcome
    }

    async fn drive(&self, browser: &Browser, url: &str) -> DownloadResult<(String, Option<String>)> {
        let page = browser.new_page("about:blank").await?;

        page.execute(
            EnableParams::builder()
                .pattern(
                    RequestPattern::builder()
                        .url_pattern("*")
                        .request_stage(RequestStage::Request)
                        .build(),
                )
                .build(),
        )
        .await?;

        let (tx, mut rx) = oneshot::channel::<String>();
        let mut paused_events = page.event_listener::<EventRequestPaused>().await?;
        let interceptor_page = page.clone();
        let media_re = self.media_re.clone();
        let interceptor = tokio::spawn(async move {
            let mut tx = Some(tx);
            while let Some(event) = paused_events.next().await {
                let request_url = event.request.url.clone();
                let is_media = media_re.is_match(&request_url);
                if is_media {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(request_url);
                    }
                    // The page must not download the stream itself.
                    let _ = interceptor_page
                        .execute(FailRequestParams::new(
                            event.request_id.clone(),
                            ErrorReason::Aborted,
                        ))
                        .await;
                } else {
                    let _ = interceptor_page
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await;
                }
            }
        });

        let result = self.drive_page(&page, url, &mut rx).await;
        interceptor.abort();
        result
    }

    async fn drive_page(
        &self,
        page: &Page,
        url: &str,
        rx: &mut oneshot::Receiver<String>,
    ) -> DownloadResult<(String, Option<String>)> {
        if let Some((name, value)) = &self.profile.session_cookie {
            let cookie = CookieParam::builder()
                .name(name.clone())
                .value(value.clone())
                .url(url.to_string())
                .build()
                .map_err(DownloadError::Browser)?;
            page.execute(SetCookiesParams::new(vec![cookie])).await?;
        }

        page.goto(url).await?;
        let _ = page.wait_for_navigation().await;

        let title = page
            .evaluate("document.title")
            .await?
            .into_value::<String>()
            .ok()
            .filter(|title| !title.trim().is_empty());

        // Some players start the stream on load without any interaction.
        if let Ok(Ok(media_url)) = timeout(Duration::from_secs(2), &mut *rx).await {
            return Ok((media_url, title));
        }

        let raw = page
            .evaluate(TRIGGER_SCAN_SCRIPT)
            .await?
            .into_value::<String>()
            .map_err(|err| DownloadError::Browser(err.to_string()))?;
        let candidates: Vec<TriggerCandidate> = serde_json::from_str(&raw)
            .map_err(|err| DownloadError::Browser(format!("trigger scan unparseable: {err}")))?;

        if let Some(index) = pick_trigger(&candidates) {
            debug!(index, "clicking playback trigger");
            let click = format!(
                "document.querySelector('[data-trigger-index=\"{index}\"]')?.click()"
            );
            let _ = page.evaluate(click.as_str()).await;
        }

        match timeout(self.sniff_timeout, rx).await {
            Ok(Ok(media_url)) => Ok((media_url, title)),
            _ => Err(DownloadError::Timeout("media request sniff".to_string())),
        }
    }

    fn build_chromium_config(&self) -> DownloadResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .no_sandbox()
            .request_timeout(Duration::from_secs(60));
        if let Some(path) = &self.chromium_path {
            builder = builder.chrome_executable(path);
        }
        let mut args = vec![
            format!("--user-agent={}", self.user_agent),
            "--mute-audio".to_string(),
            "--autoplay-policy=no-user-gesture-required".to_string(),
        ];
        if let Some(socks) = self.egress.socks_url() {
            args.push(format!("--proxy-server={socks}"));
        }
        builder
            .args(args)
            .build()
            .map_err(DownloadError::Browser)
    }

    fn infer_extension(&self, media_url: &str) -> String {
        self.media_re
            .captures(media_url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_else(|| "mp4".to_string())
    }
}

#[async_trait]
impl MediaDownloader for SniffingScraper {
    fn name(&self) -> &str {
        "sniffing-scraper"
    }

    async fn fetch(
        &self,
        dest_dir: &Path,
        url: &str,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> DownloadResult<PathBuf> {
        let mut last_error = DownloadError::Backend("scraper made no attempts".to_string());
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            match self.attempt(dest_dir, url, attempt, job, cancel).await {
                Ok(path) => return Ok(path),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(url, attempt, error = %err, "scrape attempt failed");
                    if matches!(
                        err,
                        DownloadError::Network(_) | DownloadError::Timeout(_)
                    ) {
                        self.egress.request_rebuild().await;
                    }
                    last_error = err;
                }
            }
            if attempt < self.max_attempts {
                let jitter = rand::thread_rng().gen_range(0..1000);
                let backoff =
                    Duration::from_secs(2 * attempt as u64) + Duration::from_millis(jitter);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    _ = sleep(backoff) => {}
                }
            }
        }
        Err(last_error)
    }
}

/// Highest advertised quality wins; anything mentioning "play" is the
/// runner-up, then the first visible candidate.
fn pick_trigger(candidates: &[TriggerCandidate]) -> Option<u32> {
    let quality_re = Regex::new(r"(\d{3,4})p").expect("valid regex");
    let best_quality = candidates
        .iter()
        .filter_map(|candidate| {
            quality_re
                .captures(&candidate.text)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .map(|quality| (quality, candidate.index))
        })
        .max_by_key(|(quality, _)| *quality);
    if let Some((_, index)) = best_quality {
        return Some(index);
    }
    candidates
        .iter()
        .find(|candidate| {
            candidate.tag == "video" || candidate.text.to_lowercase().contains("play")
        })
        .map(|candidate| candidate.index)
        .or_else(|| candidates.first().map(|candidate| candidate.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::DirectEgress;

    fn scraper() -> SniffingScraper {
        SniffingScraper::new(
            &ScrapeSection::default(),
            SiteProfile::default(),
            Arc::new(DirectEgress),
        )
        .unwrap()
    }

    fn candidate(index: u32, text: &str, tag: &str) -> TriggerCandidate {
        TriggerCandidate {
            index,
            text: text.to_string(),
            tag: tag.to_string(),
        }
    }

    #[test]
    fn picks_highest_quality_candidate() {
        let candidates = vec![
            candidate(0, "Play", "button"),
            candidate(1, "480p", "a"),
            candidate(2, "1080p HD", "a"),
            candidate(3, "720p", "a"),
        ];
        assert_eq!(pick_trigger(&candidates), Some(2));
    }

    #[test]
    fn falls_back_to_play_button_without_quality_labels() {
        let candidates = vec![
            candidate(0, "Share", "button"),
            candidate(1, "Play video", "button"),
        ];
        assert_eq!(pick_trigger(&candidates), Some(1));
    }

    #[test]
    fn empty_candidate_list_yields_none() {
        assert_eq!(pick_trigger(&[]), None);
    }

    #[test]
    fn infers_extension_from_sniffed_url() {
        let scraper = scraper();
        assert_eq!(
            scraper.infer_extension("https://cdn.example.com/v/clip.webm?token=1"),
            "webm"
        );
        assert_eq!(
            scraper.infer_extension("https://cdn.example.com/v/clip.mp4"),
            "mp4"
        );
        assert_eq!(scraper.infer_extension("https://cdn.example.com/v"), "mp4");
    }

    #[test]
    fn site_profile_requires_both_cookie_fields() {
        let full = SiteProfile::from_site(&SiteSection {
            pattern: "clips.example.net".into(),
            referer: Some("https://clips.example.net".into()),
            session_cookie: Some("SESSID".into()),
            session_value: Some("abc".into()),
        });
        assert_eq!(
            full.session_cookie,
            Some(("SESSID".to_string(), "abc".to_string()))
        );

        let partial = SiteProfile::from_site(&SiteSection {
            pattern: "clips.example.net".into(),
            session_cookie: Some("SESSID".into()),
            ..SiteSection::default()
        });
        assert!(partial.session_cookie.is_none());
    }
}
