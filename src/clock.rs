use chrono::{NaiveDate, Utc};
use std::time::Instant;

/// Time source shared by the rate limiter, queue and entitlement gate.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// The current UTC calendar day, used to key daily quotas.
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[cfg(test)]
pub use manual::ManualClock;
