use anyhow::{anyhow, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::retry::RetryPolicy;

/// The structure of our configuration file (config.toml)
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub download_directory: String,
    pub server: ServerConfig,
    pub extractor: ExtractorConfig,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
    pub rate_limit: RateLimitConfig,
    pub entitlements: EntitlementConfig,
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        // Use the 'directories' crate to find the user's download directory.
        let default_dir = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|p| p.to_string_lossy().to_string()))
            .unwrap_or_else(|| "downloads".to_string());

        Config {
            download_directory: default_dir,
            server: ServerConfig::default(),
            extractor: ExtractorConfig::default(),
            retry: RetryConfig::default(),
            download: DownloadConfig::default(),
            rate_limit: RateLimitConfig::default(),
            entitlements: EntitlementConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin. Any origin is accepted when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            client_url: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolverBackend {
    #[default]
    Ytdlp,
    Api,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExtractorConfig {
    pub backend: ResolverBackend,
    pub ytdlp_path: String,
    pub timeout_secs: u64,
    pub api: ApiConfig,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            backend: ResolverBackend::Ytdlp,
            ytdlp_path: "yt-dlp".to_string(),
            timeout_secs: 30,
            api: ApiConfig::default(),
        }
    }
}

/// Settings for the managed third-party resolution API.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_host: String,
    pub info_path: String,
    pub download_path: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://all-media-downloader1.p.rapidapi.com".to_string(),
            api_key: String::new(),
            api_host: "all-media-downloader1.p.rapidapi.com".to_string(),
            info_path: "/api/info".to_string(),
            download_path: "/api/download".to_string(),
            timeout_secs: 15,
        }
    }
}

/// Backoff policy shared by both resolution backends.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub default_retry_after_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 1000,
            factor: 2.0,
            max_delay_ms: 10_000,
            default_retry_after_secs: 5,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            factor: self.factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Outer download loop around resolve + stream.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_attempts: u32,
    pub linear_backoff_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            linear_backoff_ms: 2000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub download_max_requests: usize,
    pub download_window_secs: u64,
    pub global_max_requests: usize,
    pub global_window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            download_max_requests: 10,
            download_window_secs: 60 * 60,
            global_max_requests: 100,
            global_window_secs: 15 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EntitlementConfig {
    /// When false every caller is treated as an unlimited premium user.
    pub enabled: bool,
    pub daily_limit: u32,
    pub free_qualities: Vec<String>,
    pub premium_qualities: Vec<String>,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_limit: 3,
            free_qualities: vec!["480p".into(), "720p".into()],
            premium_qualities: vec!["480p".into(), "720p".into(), "1080p".into(), "4k".into()],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub tick_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 5,
            tick_secs: 5,
        }
    }
}

pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "VidGrab", "VidGrab-Agent")
        .ok_or_else(|| anyhow!("Could not find a valid home directory to store config"))
}

/// Returns the cross-platform path to the configuration file, creating the directory if needed.
async fn get_config_path() -> Result<PathBuf> {
    let project_dirs = project_dirs()?;
    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir).await?;
    Ok(config_dir.join("config.toml"))
}

/// Loads the configuration from the file, or creates a default one if it doesn't exist.
pub async fn load_config() -> Result<Config> {
    let config_path = get_config_path().await?;

    if !config_path.exists() {
        tracing::info!(
            "No config file found. Creating a default one at: {}",
            config_path.display()
        );
        let default_config = Config::default();
        save_config(&default_config).await?;
        return Ok(default_config);
    }

    let config_content = fs::read_to_string(&config_path).await?;
    parse_config(&config_content)
        .map_err(|e| anyhow!("Failed to parse config file at {}: {}", config_path.display(), e))
}

fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Saves the provided configuration object to the file.
pub async fn save_config(config: &Config) -> Result<()> {
    let config_path = get_config_path().await?;
    let toml_string = toml::to_string_pretty(config)?;
    fs::write(config_path, toml_string).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = parse_config(
            r#"
            download_directory = "/tmp/videos"

            [server]
            port = 8080

            [entitlements]
            daily_limit = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.download_directory, "/tmp/videos");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.entitlements.daily_limit, 5);
        assert_eq!(config.entitlements.free_qualities, vec!["480p", "720p"]);
        assert_eq!(config.extractor.backend, ResolverBackend::Ytdlp);
        assert_eq!(config.rate_limit.download_max_requests, 10);
    }

    #[test]
    fn backend_is_selected_by_name() {
        let config = parse_config("[extractor]\nbackend = \"api\"\n").unwrap();
        assert_eq!(config.extractor.backend, ResolverBackend::Api);
        assert_eq!(config.extractor.api.info_path, "/api/info");
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed = parse_config(&rendered).unwrap();
        assert_eq!(parsed.retry.max_attempts, 4);
        assert_eq!(parsed.queue.retry_delay_secs, 5);
    }

    #[test]
    fn retry_policy_never_has_zero_attempts() {
        let retry = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(retry.policy().max_attempts, 1);
    }
}
