//! The acquisition pipeline: detect, describe, gate, resolve, stream.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::connectivity::Connectivity;
use crate::downloader::{ProgressFn, StreamedDownloader};
use crate::entitlement::EntitlementGate;
use crate::error::PipelineError;
use crate::models::{Identity, Platform, VideoFormat, VideoInfo};
use crate::platform::detect_platform;
use crate::resolver::Resolver;
use crate::retry::RetryExecutor;

/// Everything needed to fetch one format of one video.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub url: String,
    pub format: Option<VideoFormat>,
    pub platform: Option<Platform>,
}

pub struct DownloadPipeline {
    resolver: Arc<dyn Resolver>,
    retry: RetryExecutor,
    gate: EntitlementGate,
    downloader: StreamedDownloader,
    connectivity: Arc<dyn Connectivity>,
    download: DownloadConfig,
}

impl DownloadPipeline {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        retry: RetryExecutor,
        gate: EntitlementGate,
        downloader: StreamedDownloader,
        connectivity: Arc<dyn Connectivity>,
        download: DownloadConfig,
    ) -> Self {
        Self {
            resolver,
            retry,
            gate,
            downloader,
            connectivity,
            download,
        }
    }

    /// Detects the platform and fetches normalized metadata.
    pub async fn video_info(&self, url: &str) -> Result<VideoInfo, PipelineError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(PipelineError::InvalidInput("URL is required".to_string()));
        }
        let platform = detect_platform(url).ok_or_else(|| {
            PipelineError::UnsupportedPlatform(
                "Please provide a valid URL from YouTube, Instagram, TikTok, or Twitter."
                    .to_string(),
            )
        })?;

        let resolver = self.resolver.as_ref();
        tracing::info!(%platform, backend = resolver.name(), "Fetching video info for {}", url);
        self.retry
            .run("Fetching video info", move || resolver.video_info(url, platform))
            .await
    }

    /// Resolves a format selection to a direct download URL.
    pub async fn download_url(
        &self,
        url: &str,
        format: &str,
        quality: &str,
    ) -> Result<String, PipelineError> {
        let (url, format, quality) = (url.trim(), format.trim(), quality.trim());
        if url.is_empty() || format.is_empty() || quality.is_empty() {
            return Err(PipelineError::InvalidInput(
                "URL, format and quality are required".to_string(),
            ));
        }
        if detect_platform(url).is_none() {
            return Err(PipelineError::UnsupportedPlatform(url.to_string()));
        }

        let resolver = self.resolver.as_ref();
        self.retry
            .run("Resolving download URL", move || {
                resolver.download_url(url, format, quality)
            })
            .await
    }

    /// Gate, resolve and stream one download, retrying the whole sequence
    /// with linear backoff.
    ///
    /// The quota is charged only once the body is fully assembled.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        identity: &Identity,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<Bytes, PipelineError> {
        if !self.connectivity.is_online() {
            return Err(PipelineError::Offline);
        }
        let (format, _platform) = match (&request.format, request.platform) {
            (Some(format), Some(platform)) if !request.url.trim().is_empty() => (format, platform),
            _ => {
                return Err(PipelineError::InvalidInput(
                    "Missing required parameters".to_string(),
                ))
            }
        };

        let max_attempts = self.download.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt_download(request, format, identity, on_progress).await {
                Ok(body) => return Ok(body),
                Err(err) => err,
            };

            if !self.connectivity.is_online() {
                return Err(match err {
                    PipelineError::Interrupted { .. } => err,
                    _ => PipelineError::Offline,
                });
            }
            if err.is_fatal() {
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(PipelineError::Exhausted {
                    operation: "Download".to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = Duration::from_millis(self.download.linear_backoff_ms * u64::from(attempt));
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "Download attempt failed: {}", err);
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_download(
        &self,
        request: &DownloadRequest,
        format: &VideoFormat,
        identity: &Identity,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<Bytes, PipelineError> {
        self.gate.check(identity, &format.quality).await?;
        let direct = self
            .download_url(&request.url, &format.format, &format.quality)
            .await?;
        let body = self.downloader.fetch(&direct, on_progress).await?;
        self.gate.record(identity).await?;
        Ok(body)
    }
}
