//! Metadata and direct-URL resolution backends.
//!
//! Two interchangeable strategies sit behind [`Resolver`]: the local
//! `yt-dlp` process and a managed HTTP API. Neither retries on its own; the
//! pipeline wraps every call in the shared [`crate::retry::RetryExecutor`].

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::config::{ExtractorConfig, ResolverBackend};
use crate::error::PipelineError;
use crate::models::{Platform, VideoInfo};

pub mod api;
pub mod ytdlp;

pub use api::ApiResolver;
pub use ytdlp::YtDlpResolver;

static HEIGHT_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i)(\d{2,4})p$").unwrap());

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    /// Fetches and normalizes metadata for `url`.
    async fn video_info(&self, url: &str, platform: Platform) -> Result<VideoInfo, PipelineError>;

    /// Resolves one format/quality selection to a direct download URL.
    async fn download_url(
        &self,
        url: &str,
        format: &str,
        quality: &str,
    ) -> Result<String, PipelineError>;
}

/// Builds the backend selected in the config file.
pub fn build_resolver(config: &ExtractorConfig, default_retry_after_secs: u64) -> Arc<dyn Resolver> {
    match config.backend {
        ResolverBackend::Ytdlp => Arc::new(YtDlpResolver::new(
            config.ytdlp_path.clone(),
            config.timeout_secs,
        )),
        ResolverBackend::Api => Arc::new(ApiResolver::new(
            config.api.clone(),
            default_retry_after_secs,
        )),
    }
}

/// A parsed quality label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityCeiling {
    Height(u32),
    AudioOnly,
}

impl QualityCeiling {
    pub fn parse(quality: &str) -> Result<Self, PipelineError> {
        let label = quality.trim();
        if label.eq_ignore_ascii_case("audio") {
            return Ok(Self::AudioOnly);
        }
        if label.eq_ignore_ascii_case("4k") {
            return Ok(Self::Height(2160));
        }
        if label.eq_ignore_ascii_case("8k") {
            return Ok(Self::Height(4320));
        }
        HEIGHT_LABEL
            .captures(label)
            .and_then(|caps| caps[1].parse().ok())
            .map(Self::Height)
            .ok_or_else(|| PipelineError::InvalidInput(format!("Unknown quality '{quality}'")))
    }

    /// yt-dlp format selector: best split streams under the ceiling, falling
    /// back to the best combined stream under it.
    pub fn format_expression(&self) -> String {
        match self {
            Self::Height(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
            Self::AudioOnly => "bestaudio/best".to_string(),
        }
    }
}

/// Rounds a byte count to a one-decimal megabyte label, e.g. `"12.3 MB"`.
pub fn human_size(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / 1024.0 / 1024.0)
}

/// Takes the first URL out of resolver output, trimming stray whitespace.
pub(crate) fn first_url(output: &str) -> Result<String, PipelineError> {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());
    let url = lines
        .next()
        .ok_or_else(|| PipelineError::Parse("extractor returned no download URL".to_string()))?;
    let extra = lines.count();
    if extra > 0 {
        tracing::warn!(
            extra,
            "Resolver returned separate video and audio streams; only the first is downloaded"
        );
    }
    Ok(url.to_string())
}
