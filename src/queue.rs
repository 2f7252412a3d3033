//! Best-effort retry area for downloads that failed transiently.
//!
//! Items live only in process memory; a restart drops them. Losing
//! connectivity ends the current pass and holds the remaining items.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::error::PipelineError;
use crate::models::{Identity, Platform, VideoFormat};

#[derive(Debug, Clone)]
pub struct QueuedDownload {
    pub url: String,
    pub format: VideoFormat,
    pub platform: Platform,
    pub identity: Identity,
    pub retries: u32,
    pub last_attempt: Instant,
}

/// Performs one queued download attempt.
#[async_trait]
pub trait DownloadRunner: Send + Sync {
    async fn run(&self, item: &QueuedDownload) -> Result<(), PipelineError>;
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
}

pub struct DownloadQueue {
    items: Mutex<Vec<QueuedDownload>>,
    // Items taken out by a running pass and not yet settled.
    in_flight: AtomicUsize,
    runner: Arc<dyn DownloadRunner>,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn Connectivity>,
    max_retries: u32,
    retry_delay: Duration,
}

impl DownloadQueue {
    pub fn new(
        runner: Arc<dyn DownloadRunner>,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn Connectivity>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            runner,
            clock,
            connectivity,
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        }
    }

    /// Enqueues a failed download and runs a drain pass.
    pub async fn add(
        &self,
        url: String,
        format: VideoFormat,
        platform: Platform,
        identity: Identity,
    ) -> DrainReport {
        tracing::info!(%url, quality = %format.quality, "Queued download for retry");
        self.items.lock().push(QueuedDownload {
            url,
            format,
            platform,
            identity,
            retries: 0,
            last_attempt: self.clock.now(),
        });
        self.process_queue().await
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Queued items plus those currently being attempted.
    pub fn pending(&self) -> usize {
        let items = self.items.lock();
        items.len() + self.in_flight.load(Ordering::SeqCst)
    }

    /// Time until the next queued item becomes eligible, if any are queued.
    pub fn next_due(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.items
            .lock()
            .iter()
            .map(|item| (item.last_attempt + self.retry_delay).saturating_duration_since(now))
            .min()
    }

    /// Attempts every item whose retry delay has elapsed, one after another.
    ///
    /// Items are taken out of the queue while they run, so a concurrent pass
    /// never attempts the same item twice.
    pub async fn process_queue(&self) -> DrainReport {
        if !self.connectivity.is_online() {
            return DrainReport::default();
        }
        let now = self.clock.now();
        let eligible: Vec<QueuedDownload> = {
            let mut items = self.items.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = items
                .drain(..)
                .partition(|item| now.saturating_duration_since(item.last_attempt) >= self.retry_delay);
            *items = waiting;
            self.in_flight.fetch_add(ready.len(), Ordering::SeqCst);
            ready
        };

        let mut report = DrainReport::default();
        let mut eligible = eligible.into_iter();
        while let Some(mut item) = eligible.next() {
            if !self.connectivity.is_online() {
                let held: Vec<_> = std::iter::once(item).chain(eligible.by_ref()).collect();
                tracing::info!(held = held.len(), "Offline, holding queued downloads");
                let count = held.len();
                self.items.lock().extend(held);
                self.in_flight.fetch_sub(count, Ordering::SeqCst);
                break;
            }

            match self.runner.run(&item).await {
                Ok(()) => {
                    tracing::info!(url = %item.url, "Queued download completed");
                    report.succeeded += 1;
                }
                // Offline is fatal to one attempt, not to the queued work.
                Err(err) if err.is_fatal() && !matches!(err, PipelineError::Offline) => {
                    tracing::warn!(url = %item.url, reason = err.reason(), "Dropping queued download: {}", err);
                    report.dropped += 1;
                }
                Err(err) => {
                    item.retries += 1;
                    item.last_attempt = self.clock.now();
                    if item.retries >= self.max_retries {
                        tracing::warn!(url = %item.url, retries = item.retries, "Giving up on queued download: {}", err);
                        report.dropped += 1;
                    } else {
                        tracing::debug!(url = %item.url, retries = item.retries, "Queued download failed again: {}", err);
                        self.items.lock().push(item);
                        report.requeued += 1;
                    }
                }
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        report
    }

    /// Drains the queue every `interval` for the life of the process.
    pub fn spawn_worker(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            loop {
                ticker.tick().await;
                if queue.is_empty() {
                    continue;
                }
                let report = queue.process_queue().await;
                if report != DrainReport::default() {
                    tracing::debug!(?report, "Queue tick");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connectivity::{AlwaysOnline, ConnectivityFlag};
    use std::collections::HashMap;

    /// Fails each URL a scripted number of times, then succeeds.
    #[derive(Default)]
    struct FlakyRunner {
        failures: Mutex<HashMap<String, u32>>,
        attempts: Mutex<Vec<String>>,
        fatal: bool,
        offline: bool,
    }

    impl FlakyRunner {
        fn failing(url: &str, times: u32) -> Self {
            let runner = Self::default();
            runner.failures.lock().insert(url.to_string(), times);
            runner
        }
    }

    #[async_trait]
    impl DownloadRunner for FlakyRunner {
        async fn run(&self, item: &QueuedDownload) -> Result<(), PipelineError> {
            self.attempts.lock().push(item.url.clone());
            let mut failures = self.failures.lock();
            match failures.get_mut(&item.url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    if self.fatal {
                        Err(PipelineError::QuotaExceeded { limit: 3 })
                    } else if self.offline {
                        Err(PipelineError::Offline)
                    } else {
                        Err(PipelineError::Network("flaky".into()))
                    }
                }
                _ => Ok(()),
            }
        }
    }

    fn queue(runner: Arc<FlakyRunner>, clock: Arc<ManualClock>) -> DownloadQueue {
        DownloadQueue::new(runner, clock, Arc::new(AlwaysOnline), &QueueConfig::default())
    }

    async fn add(queue: &DownloadQueue, url: &str) -> DrainReport {
        queue
            .add(
                url.to_string(),
                VideoFormat::new("720p", "mp4"),
                Platform::Youtube,
                Identity::Anonymous,
            )
            .await
    }

    #[tokio::test]
    async fn new_items_wait_for_the_retry_delay() {
        let runner = Arc::new(FlakyRunner::default());
        let clock = Arc::new(ManualClock::new());
        let queue = queue(runner.clone(), clock.clone());

        let report = add(&queue, "https://youtu.be/a").await;
        assert_eq!(report, DrainReport::default());
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.next_due(), Some(Duration::from_secs(5)));

        clock.advance(Duration::from_secs(5));
        let report = queue.process_queue().await;
        assert_eq!(report.succeeded, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn one_pass_drains_every_eligible_item() {
        let runner = Arc::new(FlakyRunner::default());
        let clock = Arc::new(ManualClock::new());
        let queue = queue(runner.clone(), clock.clone());

        add(&queue, "https://youtu.be/a").await;
        add(&queue, "https://youtu.be/b").await;
        clock.advance(Duration::from_secs(3));
        add(&queue, "https://youtu.be/c").await;
        clock.advance(Duration::from_secs(2));

        let report = queue.process_queue().await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(queue.pending(), 1);
        assert_eq!(
            *runner.attempts.lock(),
            vec!["https://youtu.be/a".to_string(), "https://youtu.be/b".to_string()]
        );
    }

    #[tokio::test]
    async fn items_are_dropped_after_max_retries() {
        let runner = Arc::new(FlakyRunner::failing("https://youtu.be/a", 10));
        let clock = Arc::new(ManualClock::new());
        let queue = queue(runner.clone(), clock.clone());

        add(&queue, "https://youtu.be/a").await;
        let mut requeued = 0;
        let mut dropped = 0;
        for _ in 0..5 {
            clock.advance(Duration::from_secs(5));
            let report = queue.process_queue().await;
            requeued += report.requeued;
            dropped += report.dropped;
        }

        assert_eq!(runner.attempts.lock().len(), 3);
        assert_eq!(requeued, 2);
        assert_eq!(dropped, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failed_items_wait_again_before_the_next_attempt() {
        let runner = Arc::new(FlakyRunner::failing("https://youtu.be/a", 1));
        let clock = Arc::new(ManualClock::new());
        let queue = queue(runner.clone(), clock.clone());

        add(&queue, "https://youtu.be/a").await;
        clock.advance(Duration::from_secs(5));
        assert_eq!(queue.process_queue().await.requeued, 1);
        assert_eq!(queue.process_queue().await, DrainReport::default());

        clock.advance(Duration::from_secs(5));
        assert_eq!(queue.process_queue().await.succeeded, 1);
    }

    #[tokio::test]
    async fn fatal_failures_are_dropped_immediately() {
        let runner = Arc::new(FlakyRunner {
            fatal: true,
            ..FlakyRunner::failing("https://youtu.be/a", 1)
        });
        let clock = Arc::new(ManualClock::new());
        let queue = queue(runner, clock.clone());

        add(&queue, "https://youtu.be/a").await;
        clock.advance(Duration::from_secs(5));
        assert_eq!(queue.process_queue().await.dropped, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn offline_passes_hold_every_item() {
        let runner = Arc::new(FlakyRunner::default());
        let clock = Arc::new(ManualClock::new());
        let flag = ConnectivityFlag::new(false);
        let queue = DownloadQueue::new(
            runner.clone(),
            clock.clone(),
            Arc::new(flag.clone()),
            &QueueConfig::default(),
        );

        add(&queue, "https://youtu.be/a").await;
        add(&queue, "https://youtu.be/b").await;
        clock.advance(Duration::from_secs(5));

        assert_eq!(queue.process_queue().await, DrainReport::default());
        assert_eq!(queue.pending(), 2);
        assert!(runner.attempts.lock().is_empty());

        flag.set_online(true);
        assert_eq!(queue.process_queue().await.succeeded, 2);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn offline_failures_are_requeued_not_dropped() {
        let runner = Arc::new(FlakyRunner {
            offline: true,
            ..FlakyRunner::failing("https://youtu.be/a", 1)
        });
        let clock = Arc::new(ManualClock::new());
        let queue = queue(runner.clone(), clock.clone());

        add(&queue, "https://youtu.be/a").await;
        clock.advance(Duration::from_secs(5));
        let report = queue.process_queue().await;
        assert_eq!(report.requeued, 1);
        assert_eq!(report.dropped, 0);
        assert_eq!(queue.pending(), 1);

        clock.advance(Duration::from_secs(5));
        assert_eq!(queue.process_queue().await.succeeded, 1);
        assert_eq!(runner.attempts.lock().len(), 2);
    }
}
