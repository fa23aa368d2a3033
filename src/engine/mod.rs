//! Feed polling and change detection.
//!
//! [`Scheduler`] drives everything: each cycle it fetches the head of every
//! followed feed, runs it through [`classify`], decodes new posts and hands
//! them to the [`Subscriber`]s kept in the [`Registry`].

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;

mod decoder;
mod detector;
mod dispatcher;
mod post;
mod registry;
mod scheduler;
#[cfg(test)]
pub(crate) mod testing;

pub use decoder::{decode, fetch_and_decode, unescape};
pub use detector::{classify, Classification, Decision, Watermark};
pub use dispatcher::{dispatch, DispatchOutcome};
pub use post::{type_code, Post, PostKind};
pub use registry::{IdentityState, Registry, Subscriber};
pub use scheduler::{CycleReport, Scheduler, StateNotifier};

/// Random delay bounds, in milliseconds. Deserializes from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "(u64, u64)")]
pub struct DelayRange {
    min_ms: u64,
    max_ms: u64,
}

impl DelayRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub const fn zero() -> Self {
        Self {
            min_ms: 0,
            max_ms: 0,
        }
    }

    pub fn sample(&self) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

impl From<(u64, u64)> for DelayRange {
    fn from((min_ms, max_ms): (u64, u64)) -> Self {
        Self::new(min_ms, max_ms)
    }
}

/// Pacing of the poller.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Wait before each feed request.
    pub fetch_jitter: DelayRange,
    /// Wait between two subscriber callbacks.
    pub dispatch_delay: DelayRange,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            fetch_jitter: DelayRange::new(10, 50),
            dispatch_delay: DelayRange::new(1000, 2000),
        }
    }
}

/// Receiving half of the stop signal. Dropping the sender counts as a stop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);

        (tx, Self { rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the stop signal is raised.
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep unless stopped first. Returns `false` when stopped.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_triggered();
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }

    /// Run `fut` unless stopped first.
    pub async fn guard<F: std::future::Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.triggered() => None,
            out = fut => Some(out),
        }
    }
}
