use serde::{Deserialize, Serialize};
use std::fmt;

// === Domain Models ===

/// The closed set of platforms the extractor is trusted with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Instagram,
    Tiktok,
    Twitter,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Twitter => "twitter",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized metadata for one video.
///
/// `url` is always the URL the caller submitted; resolved download URLs are
/// never stored here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub platform: Platform,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default)]
    pub formats: Vec<VideoFormat>,
}

/// A selectable format: quality tier ("720p", "audio") plus container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub quality: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl VideoFormat {
    pub fn new(quality: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            quality: quality.into(),
            format: format.into(),
            size: None,
        }
    }
}

/// Per-identity usage, recomputed on every request.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadStats {
    pub downloads_today: u32,
    pub is_premium: bool,
}

/// Who is asking for a download.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Anonymous,
    User(String),
}

impl Identity {
    pub fn from_option(user: Option<String>) -> Self {
        match user {
            Some(id) if !id.trim().is_empty() => Identity::User(id.trim().to_string()),
            _ => Identity::Anonymous,
        }
    }
}

// === API Request/Response Models ===

/// The query parameters for a `GET /info` request.
#[derive(Deserialize, Debug)]
pub struct InfoQuery {
    pub url: Option<String>,
}

/// The query parameters for a `GET /download` request.
#[derive(Deserialize, Debug)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
}

/// The response for a resolved download.
#[derive(Serialize, Deserialize, Debug)]
pub struct DownloadUrlResponse {
    pub url: String,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
}
