use std::sync::Arc;

use futures::future::join_all;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::sources::FeedSource;

use super::{
    decoder::decode,
    detector::{Decision, Watermark},
    dispatcher::dispatch,
    registry::{IdentityState, Registry},
    PollConfig, Shutdown,
};

/// Receives every change of recorded state, so it can be persisted.
pub trait StateNotifier: Send + Sync {
    fn notify(&self, state: &IdentityState);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Identities whose feed was fetched successfully.
    pub polled: usize,
    /// Identities skipped because of an upstream or decoding failure.
    pub failed: usize,
    pub delivered: usize,
    pub corrected: usize,
}

enum Polled {
    Done(Decision),
    /// Upstream or decoding failure, retried next cycle.
    Skipped,
    Stopped,
}

pub struct Scheduler {
    registry: Arc<Registry>,
    source: Arc<dyn FeedSource>,
    notifier: Arc<dyn StateNotifier>,
    config: PollConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        source: Arc<dyn FeedSource>,
        notifier: Arc<dyn StateNotifier>,
        config: PollConfig,
    ) -> Self {
        Self {
            registry,
            source,
            notifier,
            config,
        }
    }

    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Poll at a fixed interval until `shutdown` fires. A cycle always runs
    /// to completion (or to the stop signal) before the next tick is taken,
    /// ticks missed meanwhile are not caught up.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.interval, "poller started");
        loop {
            if shutdown.guard(ticker.tick()).await.is_none() {
                break;
            }

            let report = self.poll_cycle(&mut shutdown).await;
            debug!(?report, "poll cycle finished");

            if shutdown.is_triggered() {
                break;
            }
        }
        info!("poller stopped");
    }

    /// One pass over every identity that has subscribers.
    pub async fn poll_cycle(&self, shutdown: &mut Shutdown) -> CycleReport {
        let mut report = CycleReport::default();

        for uid in self.registry.active_identities() {
            match self.poll_identity(&uid, shutdown).await {
                Polled::Done(decision) => {
                    report.polled += 1;
                    match decision {
                        Decision::Deliver => report.delivered += 1,
                        Decision::AnomalyCorrected => report.corrected += 1,
                        Decision::NoChange => {}
                    }
                }
                Polled::Skipped => report.failed += 1,
                Polled::Stopped => break,
            }
        }

        report
    }

    async fn poll_identity(&self, uid: &str, shutdown: &mut Shutdown) -> Polled {
        if !shutdown.sleep(self.config.fetch_jitter.sample()).await {
            return Polled::Stopped;
        }

        let card = match shutdown.guard(self.source.fetch_latest(uid)).await {
            Some(Ok(card)) => card,
            Some(Err(e)) => {
                warn!(uid, "fetching feed failed: {e}");
                return Polled::Skipped;
            }
            None => return Polled::Stopped,
        };

        let fetched = Watermark::new(card.id(), card.timestamp());
        let Some((classification, state)) = self.registry.observe(uid, card.author(), &fetched)
        else {
            // unsubscribed and dropped while the request was in flight
            return Polled::Done(Decision::NoChange);
        };

        let decision = classification.decision;
        if decision.changes_state() {
            self.notifier.notify(&state);
        }
        match decision {
            Decision::NoChange => return Polled::Done(decision),
            Decision::AnomalyCorrected => {
                warn!(
                    uid,
                    post_id = %fetched.post_id,
                    timestamp = fetched.timestamp,
                    recorded = state.watermark.timestamp,
                    "feed head is not newer than recorded, bookkeeping corrected"
                );
                return Polled::Done(decision);
            }
            Decision::Deliver => {}
        }

        info!(uid, post_id = %fetched.post_id, name = %state.display_name, "new post");
        // state already advanced: a post that never decodes must not block
        // detection of the ones after it
        let post = match shutdown.guard(decode(card, self.source.as_ref())).await {
            Some(Ok(post)) => post,
            Some(Err(e)) => {
                error!(uid, post_id = %fetched.post_id, "dropping post: {e}");
                return Polled::Skipped;
            }
            None => return Polled::Stopped,
        };

        let subscribers = self.registry.subscribers(uid);
        let outcome = dispatch(
            uid,
            &subscribers,
            &post,
            self.config.dispatch_delay,
            shutdown,
        )
        .await;
        debug!(uid, ?outcome, "post dispatched");

        Polled::Done(decision)
    }

    /// Record the current head of every followed feed as seen without
    /// delivering anything. Returns how many identities were updated.
    pub async fn populate(&self) -> usize {
        let uids = self.registry.active_identities();
        let jobs = uids.iter().map(|uid| self.source.fetch_latest(uid));

        let mut updated = 0;
        for (uid, res) in uids.iter().zip(join_all(jobs).await) {
            let card = match res {
                Ok(card) => card,
                Err(e) => {
                    warn!(uid = %uid, "fetching feed failed: {e}");
                    continue;
                }
            };

            let fetched = Watermark::new(card.id(), card.timestamp());
            if let Some((c, state)) = self.registry.observe(uid, card.author(), &fetched) {
                if c.decision.changes_state() {
                    self.notifier.notify(&state);
                    updated += 1;
                }
            }
        }

        updated
    }
}
