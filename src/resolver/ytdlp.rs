use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{first_url, human_size, QualityCeiling, Resolver};
use crate::error::PipelineError;
use crate::models::{Platform, VideoFormat, VideoInfo};

static HTTP_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"HTTP Error (\d{3})").unwrap());

/// Resolver backed by a local `yt-dlp` binary.
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
}

/// Subset of the `--dump-json` document we care about.
#[derive(Deserialize, Debug)]
struct RawVideo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration_string: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Deserialize, Debug)]
struct RawFormat {
    ext: Option<String>,
    height: Option<u32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

impl RawFormat {
    /// Entries with `none` for both codecs are storyboards and manifests.
    fn has_stream(&self) -> bool {
        self.vcodec.as_deref() != Some("none") || self.acodec.as_deref() != Some("none")
    }
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// Runs yt-dlp and returns its stdout, classifying every failure mode.
    async fn execute(&self, args: &[&str]) -> Result<String, PipelineError> {
        tracing::debug!("Running {} {}", self.binary, args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::ToolMissing(format!(
                    "'{}' was not found on this system",
                    self.binary
                )),
                _ => PipelineError::Extractor(format!("failed to start {}: {}", self.binary, e)),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                PipelineError::Timeout(format!("yt-dlp did not finish within {:?}", self.timeout))
            })?
            .map_err(|e| PipelineError::Extractor(format!("yt-dlp process failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!("yt-dlp failed: {}", stderr);
            return Err(classify_stderr(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn video_info(&self, url: &str, platform: Platform) -> Result<VideoInfo, PipelineError> {
        let stdout = self.execute(&["--dump-json", "--no-playlist", url]).await?;
        let info = parse_video_info(&stdout, url, platform)?;
        tracing::info!(
            "Successfully fetched {} formats for '{}'",
            info.formats.len(),
            info.title.as_deref().unwrap_or(url)
        );
        Ok(info)
    }

    async fn download_url(
        &self,
        url: &str,
        format: &str,
        quality: &str,
    ) -> Result<String, PipelineError> {
        let expression = QualityCeiling::parse(quality)?.format_expression();
        tracing::debug!(%format, %quality, "Resolving with selector {}", expression);
        let stdout = self
            .execute(&["--format", &expression, "--get-url", url])
            .await?;
        first_url(&stdout)
    }
}

/// Normalizes `--dump-json` output into a [`VideoInfo`].
fn parse_video_info(stdout: &str, url: &str, platform: Platform) -> Result<VideoInfo, PipelineError> {
    let body = stdout.trim();
    if body.is_empty() {
        return Err(PipelineError::Parse("yt-dlp produced no output".to_string()));
    }
    let raw: RawVideo = serde_json::from_str(body)
        .map_err(|e| PipelineError::Parse(format!("Invalid JSON: {}", e)))?;

    let formats = raw
        .formats
        .iter()
        .filter(|f| f.has_stream())
        .map(|f| VideoFormat {
            quality: f
                .height
                .map_or_else(|| "audio".to_string(), |h| format!("{h}p")),
            format: f.ext.clone().unwrap_or_default(),
            size: f
                .filesize
                .or(f.filesize_approx)
                .filter(|bytes| *bytes > 0.0)
                .map(|bytes| human_size(bytes as u64)),
        })
        .collect();

    Ok(VideoInfo {
        platform,
        url: url.to_string(),
        title: raw.title,
        thumbnail: raw.thumbnail,
        duration: raw
            .duration_string
            .or_else(|| raw.duration.map(format_duration)),
        formats,
    })
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Maps yt-dlp's stderr onto the failure taxonomy.
fn classify_stderr(stderr: &str) -> PipelineError {
    let message = if stderr.is_empty() {
        "yt-dlp command failed".to_string()
    } else {
        stderr.to_string()
    };

    if let Some(status) = HTTP_ERROR
        .captures(stderr)
        .and_then(|caps| caps[1].parse::<u16>().ok())
    {
        return PipelineError::from_status(status, message);
    }
    if stderr.contains("Unsupported URL") {
        return PipelineError::UnsupportedPlatform(message);
    }
    if stderr.contains("timed out") {
        return PipelineError::Timeout(message);
    }
    PipelineError::Extractor(message)
}
