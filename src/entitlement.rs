//! Daily quota and quality-tier enforcement.
//!
//! The gate reads [`DownloadStats`] fresh for every request and records a
//! download only after its bytes are fully assembled. Reading and recording
//! are separate store calls, so two downloads racing past the check on the
//! same day can both succeed; each store's increment itself is atomic, so no
//! completed download is ever lost or double counted.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::EntitlementConfig;
use crate::error::PipelineError;
use crate::models::{DownloadStats, Identity};

/// Backend holding per-user premium flags and date-keyed download counts.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn stats(&self, user_id: &str, day: NaiveDate) -> Result<DownloadStats, PipelineError>;

    /// Upsert: creates the `(user, day)` row with 1 or adds one to it.
    /// Returns the new count.
    async fn record_download(&self, user_id: &str, day: NaiveDate) -> Result<u32, PipelineError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct UserRecord {
    #[serde(default)]
    is_premium: bool,
    #[serde(default)]
    downloads: HashMap<NaiveDate, u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct Ledger {
    #[serde(default)]
    users: HashMap<String, UserRecord>,
}

impl Ledger {
    fn stats(&self, user_id: &str, day: NaiveDate) -> DownloadStats {
        self.users
            .get(user_id)
            .map(|record| DownloadStats {
                downloads_today: record.downloads.get(&day).copied().unwrap_or(0),
                is_premium: record.is_premium,
            })
            .unwrap_or_default()
    }

    fn increment(&mut self, user_id: &str, day: NaiveDate) -> u32 {
        let count = self
            .users
            .entry(user_id.to_string())
            .or_default()
            .downloads
            .entry(day)
            .or_insert(0);
        *count += 1;
        *count
    }

    fn set_premium(&mut self, user_id: &str, premium: bool) {
        self.users.entry(user_id.to_string()).or_default().is_premium = premium;
    }
}

/// Process-local store; used by the server and in tests.
#[derive(Default)]
pub struct InMemoryEntitlementStore {
    ledger: parking_lot::Mutex<Ledger>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_premium(&self, user_id: &str, premium: bool) {
        self.ledger.lock().set_premium(user_id, premium);
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn stats(&self, user_id: &str, day: NaiveDate) -> Result<DownloadStats, PipelineError> {
        Ok(self.ledger.lock().stats(user_id, day))
    }

    async fn record_download(&self, user_id: &str, day: NaiveDate) -> Result<u32, PipelineError> {
        Ok(self.ledger.lock().increment(user_id, day))
    }
}

/// JSON ledger on disk, shared by successive CLI runs.
pub struct JsonFileEntitlementStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileEntitlementStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Ledger, PipelineError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Ledger::default()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                PipelineError::Backend(format!("corrupt ledger {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Ledger::default()),
            Err(e) => Err(PipelineError::Backend(e.to_string())),
        }
    }

    async fn save(&self, ledger: &Ledger) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Backend(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(ledger)
            .map_err(|e| PipelineError::Backend(e.to_string()))?;
        // Write-then-rename so a crash never leaves a truncated ledger.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| PipelineError::Backend(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PipelineError::Backend(e.to_string()))
    }

    pub async fn set_premium(&self, user_id: &str, premium: bool) -> Result<(), PipelineError> {
        let _guard = self.lock.lock().await;
        let mut ledger = self.load().await?;
        ledger.set_premium(user_id, premium);
        self.save(&ledger).await
    }
}

#[async_trait]
impl EntitlementStore for JsonFileEntitlementStore {
    async fn stats(&self, user_id: &str, day: NaiveDate) -> Result<DownloadStats, PipelineError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.stats(user_id, day))
    }

    async fn record_download(&self, user_id: &str, day: NaiveDate) -> Result<u32, PipelineError> {
        let _guard = self.lock.lock().await;
        let mut ledger = self.load().await?;
        let count = ledger.increment(user_id, day);
        self.save(&ledger).await?;
        Ok(count)
    }
}

/// Decides whether an identity may download a given quality right now.
pub struct EntitlementGate {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    config: EntitlementConfig,
}

impl EntitlementGate {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        clock: Arc<dyn Clock>,
        config: EntitlementConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub async fn stats(&self, identity: &Identity) -> Result<DownloadStats, PipelineError> {
        if !self.config.enabled {
            return Ok(DownloadStats {
                downloads_today: 0,
                is_premium: true,
            });
        }
        match identity {
            Identity::Anonymous => Ok(DownloadStats::default()),
            Identity::User(id) => self.store.stats(id, self.clock.today()).await,
        }
    }

    /// Rejects the request when the quota is spent or the tier is too low.
    pub async fn check(
        &self,
        identity: &Identity,
        quality: &str,
    ) -> Result<DownloadStats, PipelineError> {
        let stats = self.stats(identity).await?;

        if !self.config.enabled {
            return Ok(stats);
        }
        if !stats.is_premium && stats.downloads_today >= self.config.daily_limit {
            tracing::info!(?identity, downloads = stats.downloads_today, "Daily quota reached");
            return Err(PipelineError::QuotaExceeded {
                limit: self.config.daily_limit,
            });
        }

        let allowed = if stats.is_premium {
            &self.config.premium_qualities
        } else {
            &self.config.free_qualities
        };
        if !allowed.iter().any(|q| q.eq_ignore_ascii_case(quality)) {
            return Err(PipelineError::TierRestricted {
                quality: quality.to_string(),
            });
        }
        Ok(stats)
    }

    /// Counts one completed download against today's quota.
    pub async fn record(&self, identity: &Identity) -> Result<(), PipelineError> {
        if !self.config.enabled {
            return Ok(());
        }
        if let Identity::User(id) = identity {
            let count = self.store.record_download(id, self.clock.today()).await?;
            tracing::debug!(user = %id, count, "Recorded download");
        }
        Ok(())
    }
}
