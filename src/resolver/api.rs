use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use super::{first_url, Resolver};
use crate::config::ApiConfig;
use crate::error::PipelineError;
use crate::models::{Platform, VideoFormat, VideoInfo};

/// Resolver backed by a managed third-party extraction API.
pub struct ApiResolver {
    client: Client,
    config: ApiConfig,
    default_retry_after: Duration,
}

#[derive(Deserialize, Debug)]
struct ApiVideo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    formats: Vec<VideoFormat>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiDownload {
    download_url: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ApiErrorBody {
    message: Option<String>,
}

impl ApiResolver {
    pub fn new(config: ApiConfig, default_retry_after_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            client,
            config,
            default_retry_after: Duration::from_secs(default_retry_after_secs),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, PipelineError> {
        let endpoint = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let request_id = Uuid::new_v4().to_string();
        tracing::debug!(%endpoint, %request_id, "Calling resolution API");

        let response = self
            .client
            .get(&endpoint)
            .query(params)
            .header(header::ACCEPT, "application/json")
            .header("X-RapidAPI-Key", &self.config.api_key)
            .header("X-RapidAPI-Host", &self.config.api_host)
            .header("X-Request-ID", request_id)
            .send()
            .await?;

        let response = self.check_status(response).await?;
        response.json::<T>().await.map_err(|e| {
            PipelineError::Parse(format!("unexpected response from {}: {}", endpoint, e))
        })
    }

    async fn check_status(&self, response: Response) -> Result<Response, PipelineError> {
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .unwrap_or(self.default_retry_after);
            return Err(PipelineError::RateLimited {
                retry_after: Some(retry_after),
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::Upstream {
                status: status.as_u16(),
                message: "Video not found or has been removed.".to_string(),
            });
        }

        let body: ApiErrorBody = response.json().await.unwrap_or_default();
        let message = body
            .message
            .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));
        Err(PipelineError::from_status(status.as_u16(), message))
    }
}

#[async_trait]
impl Resolver for ApiResolver {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn video_info(&self, url: &str, platform: Platform) -> Result<VideoInfo, PipelineError> {
        let video: ApiVideo = self
            .request(
                &self.config.info_path,
                &[("url", url), ("platform", platform.as_str())],
            )
            .await?;

        Ok(VideoInfo {
            platform,
            url: url.to_string(),
            title: video.title,
            thumbnail: video.thumbnail,
            duration: video.duration,
            formats: video.formats,
        })
    }

    async fn download_url(
        &self,
        url: &str,
        format: &str,
        quality: &str,
    ) -> Result<String, PipelineError> {
        let download: ApiDownload = self
            .request(
                &self.config.download_path,
                &[("videoId", url), ("format", format), ("quality", quality)],
            )
            .await?;

        match download.download_url {
            Some(resolved) => first_url(&resolved),
            None => Err(PipelineError::Parse("Invalid download URL received".to_string())),
        }
    }
}

/// Parses a delta-seconds `Retry-After` value.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn resolver(base_url: String) -> ApiResolver {
        ApiResolver::new(
            ApiConfig {
                base_url,
                api_key: "secret".into(),
                api_host: "api.test".into(),
                timeout_secs: 5,
                ..ApiConfig::default()
            },
            5,
        )
    }

    #[test]
    fn retry_after_header_is_parsed_as_seconds() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn info_is_fetched_with_auth_headers() {
        let router = Router::new().route(
            "/api/info",
            get(|headers: HeaderMap, Query(q): Query<HashMap<String, String>>| async move {
                let authorized = headers.get("x-rapidapi-key").map(|v| v == "secret") == Some(true)
                    && headers.contains_key("x-request-id");
                if !authorized || q.get("platform").map(String::as_str) != Some("youtube") {
                    return AxumStatus::UNAUTHORIZED.into_response();
                }
                Json(json!({
                    "title": "Clip",
                    "url": "https://cdn.example/should-not-leak",
                    "formats": [
                        {"quality": "720p", "format": "mp4"},
                        {"quality": "480p", "format": "mp4", "size": "4.2 MB"}
                    ]
                }))
                .into_response()
            }),
        );
        let base = serve(router).await;

        let info = resolver(base)
            .video_info("https://youtu.be/abc123", Platform::Youtube)
            .await
            .unwrap();

        assert_eq!(info.url, "https://youtu.be/abc123");
        assert_eq!(info.title.as_deref(), Some("Clip"));
        assert_eq!(info.formats.len(), 2);
        assert_eq!(info.formats[1].size.as_deref(), Some("4.2 MB"));
    }

    #[tokio::test]
    async fn download_url_is_trimmed() {
        let router = Router::new().route(
            "/api/download",
            get(|| async { Json(json!({ "downloadUrl": "  https://cdn.example/v.mp4\n" })) }),
        );
        let base = serve(router).await;

        let url = resolver(base)
            .download_url("https://youtu.be/abc123", "mp4", "720p")
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example/v.mp4");
    }

    #[tokio::test]
    async fn missing_download_url_is_a_parse_error() {
        let router = Router::new().route("/api/download", get(|| async { Json(json!({})) }));
        let base = serve(router).await;

        let err = resolver(base)
            .download_url("https://youtu.be/abc123", "mp4", "720p")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid extractor output: Invalid download URL received");
    }

    #[tokio::test]
    async fn too_many_requests_carries_retry_after() {
        let router = Router::new().route(
            "/api/info",
            get(|| async { (AxumStatus::TOO_MANY_REQUESTS, [("retry-after", "3")], "slow down") }),
        );
        let base = serve(router).await;

        let err = resolver(base)
            .video_info("https://youtu.be/abc123", Platform::Youtube)
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn not_found_and_server_errors_are_classified() {
        let router = Router::new()
            .route("/api/info", get(|| async { AxumStatus::NOT_FOUND }))
            .route(
                "/api/download",
                get(|| async {
                    (AxumStatus::BAD_GATEWAY, Json(json!({ "message": "upstream down" })))
                }),
            );
        let base = serve(router).await;
        let resolver = resolver(base);

        let not_found = resolver
            .video_info("https://youtu.be/gone", Platform::Youtube)
            .await
            .unwrap_err();
        assert!(not_found.is_fatal());
        assert_eq!(not_found.to_string(), "Video not found or has been removed.");

        let bad_gateway = resolver
            .download_url("https://youtu.be/abc123", "mp4", "720p")
            .await
            .unwrap_err();
        assert!(bad_gateway.is_transient());
        assert_eq!(bad_gateway.to_string(), "Service error (502): upstream down");
    }
}
