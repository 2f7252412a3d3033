use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};

use crate::connectivity::Connectivity;
use crate::error::PipelineError;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, PipelineError>> + Send>>;

/// Progress callback, called with the fraction downloaded so far.
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// An opened response: status, advertised length and a chunked body.
pub struct FetchResponse {
    pub status: u16,
    pub reason: String,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Opens a streaming GET for a resolved URL.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<FetchResponse, PipelineError>;
}

pub struct HttpByteSource {
    client: Client,
}

impl HttpByteSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ByteSource for HttpByteSource {
    async fn open(&self, url: &str) -> Result<FetchResponse, PipelineError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        Ok(FetchResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("unknown status").to_string(),
            content_length: response.content_length(),
            body: Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(PipelineError::from))),
        })
    }
}

/// Pulls a resolved URL into memory chunk by chunk.
pub struct StreamedDownloader {
    source: Arc<dyn ByteSource>,
    connectivity: Arc<dyn Connectivity>,
}

impl StreamedDownloader {
    pub fn new(source: Arc<dyn ByteSource>, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            source,
            connectivity,
        }
    }

    /// Downloads `url` fully, reporting `downloaded / total` after every chunk
    /// when the server advertised a length.
    ///
    /// Losing connectivity between chunks aborts with
    /// [`PipelineError::Interrupted`].
    pub async fn fetch(
        &self,
        url: &str,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<Bytes, PipelineError> {
        if !self.connectivity.is_online() {
            return Err(PipelineError::Offline);
        }

        let mut response = self.source.open(url).await?;
        if !(200..300).contains(&response.status) {
            return Err(PipelineError::from_status(
                response.status,
                format!("Download failed: {}", response.reason),
            ));
        }

        let total = response.content_length.filter(|len| *len > 0);
        let mut buffer = BytesMut::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        let mut downloaded: u64 = 0;

        loop {
            if !self.connectivity.is_online() {
                tracing::warn!(downloaded, "Connectivity lost mid-download");
                return Err(PipelineError::Interrupted {
                    bytes_downloaded: downloaded,
                });
            }

            let Some(chunk) = response.body.next().await else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(_) if !self.connectivity.is_online() => {
                    return Err(PipelineError::Interrupted {
                        bytes_downloaded: downloaded,
                    })
                }
                Err(e) => return Err(e),
            };
            downloaded += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            if let (Some(report), Some(total)) = (on_progress, total) {
                report(downloaded as f64 / total as f64);
            }
        }

        tracing::info!(bytes = downloaded, "Download assembled");
        Ok(buffer.freeze())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Serves canned chunked bodies keyed by URL.
    #[derive(Default)]
    pub struct FakeSource {
        bodies: Mutex<HashMap<String, (u16, Option<u64>, Vec<&'static [u8]>)>>,
    }

    impl FakeSource {
        pub fn with_body(self, url: &str, chunks: Vec<&'static [u8]>) -> Self {
            let total = chunks.iter().map(|c| c.len() as u64).sum();
            self.bodies
                .lock()
                .insert(url.to_string(), (200, Some(total), chunks));
            self
        }

        pub fn with_response(
            self,
            url: &str,
            status: u16,
            content_length: Option<u64>,
            chunks: Vec<&'static [u8]>,
        ) -> Self {
            self.bodies
                .lock()
                .insert(url.to_string(), (status, content_length, chunks));
            self
        }
    }

    #[async_trait]
    impl ByteSource for FakeSource {
        async fn open(&self, url: &str) -> Result<FetchResponse, PipelineError> {
            let (status, content_length, chunks) = self
                .bodies
                .lock()
                .get(url)
                .cloned()
                .ok_or_else(|| PipelineError::Network(format!("no route to {url}")))?;
            let items: Vec<Result<Bytes, PipelineError>> = chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect();
            Ok(FetchResponse {
                status,
                reason: "test".to_string(),
                content_length,
                body: Box::pin(tokio_stream::iter(items)),
            })
        }
    }
}
