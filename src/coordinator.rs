//! Retry sequences fired once the countdown reaches zero.
//!
//! One task per tracked item. A task never has more than one request in
//! flight, and consecutive requests are spaced at least `retry_interval`
//! apart measured from issue time. Teardown interrupts the waits between
//! attempts; a request already sent is allowed to complete.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::shutdown::Shutdown;
use crate::tracker::{Outcome, OutcomeStatus, OutcomeTracker, TrackedItem};
use crate::traits::{AttemptReply, RegistrationTransport};

/// How one item's sequence ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSummary {
    pub item: TrackedItem,
    pub attempts: u32,
    pub outcome: Outcome,
    /// Ran out of attempts without a terminal outcome.
    pub exhausted: bool,
    /// Stopped by teardown.
    pub cancelled: bool,
}

/// Statuses the server hands back that are worth another try.
pub fn is_retryable(status: OutcomeStatus) -> bool {
    matches!(status, OutcomeStatus::Pending | OutcomeStatus::Debounce)
}

/// Turns one attempt into the outcome to record and whether to stop.
/// A failed exchange is a transient error; an `error` reported by the
/// server is final.
fn classify(reply: anyhow::Result<AttemptReply>) -> (Outcome, bool) {
    match reply {
        Ok(outcome) => {
            let terminal = !is_retryable(outcome.status);
            (outcome, terminal)
        }
        Err(e) => (Outcome::new(OutcomeStatus::Error, e.to_string()), false),
    }
}

pub struct AttemptCoordinator<T> {
    transport: Arc<T>,
    tracker: Arc<RwLock<OutcomeTracker>>,
}

impl<T> AttemptCoordinator<T>
where
    T: RegistrationTransport + 'static,
{
    pub fn new(transport: Arc<T>, tracker: Arc<RwLock<OutcomeTracker>>) -> Self {
        AttemptCoordinator { transport, tracker }
    }

    /// Drive every item to a terminal outcome, exhaustion, or teardown.
    /// Summaries come back in the order the items were given.
    pub async fn run(
        &self,
        items: Vec<TrackedItem>,
        config: &SessionConfig,
        shutdown: Shutdown,
    ) -> Vec<ItemSummary> {
        let config = config.clamped();
        let interval = config.retry_interval();
        info!(
            "[ATTEMPT] Firing {} item(s): max {} attempts, {:.1}s apart",
            items.len(),
            config.max_attempts,
            interval.as_secs_f64()
        );

        let mut set = JoinSet::new();
        for (idx, item) in items.iter().enumerate() {
            let sequence = ItemSequence {
                transport: self.transport.clone(),
                tracker: self.tracker.clone(),
                item: item.clone(),
                max_attempts: config.max_attempts,
                interval,
            };
            let shutdown = shutdown.clone();
            set.spawn(async move { (idx, sequence.drive(shutdown).await) });
        }

        let mut slots: Vec<Option<ItemSummary>> = vec![None; items.len()];
        let mut failure = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, summary)) => slots[idx] = Some(summary),
                Err(e) => {
                    error!("[ATTEMPT] Item task failed: {}", e);
                    failure = Some(e.to_string());
                }
            }
        }

        // A task that died takes its index with it; every empty slot is one of those
        items
            .into_iter()
            .zip(slots)
            .map(|(item, slot)| match slot {
                Some(summary) => summary,
                None => self.lost(item, failure.as_deref().unwrap_or("task failed")),
            })
            .collect()
    }

    fn lost(&self, item: TrackedItem, reason: &str) -> ItemSummary {
        let outcome = Outcome::new(OutcomeStatus::Error, format!("internal failure: {}", reason));
        if let Ok(mut tracker) = self.tracker.write() {
            tracker.upsert(&item.code, outcome.clone());
        }
        ItemSummary {
            item,
            attempts: 0,
            outcome,
            exhausted: false,
            cancelled: false,
        }
    }
}

struct ItemSequence<T> {
    transport: Arc<T>,
    tracker: Arc<RwLock<OutcomeTracker>>,
    item: TrackedItem,
    max_attempts: u32,
    interval: Duration,
}

impl<T: RegistrationTransport> ItemSequence<T> {
    async fn drive(self, mut shutdown: Shutdown) -> ItemSummary {
        let mut attempts = 0;
        let mut outcome = Outcome::pending();
        let mut last_issue: Option<Instant> = None;

        while attempts < self.max_attempts {
            if let Some(prev) = last_issue {
                tokio::select! {
                    _ = tokio::time::sleep_until(prev + self.interval) => {}
                    _ = shutdown.cancelled() => {
                        return self.summary(attempts, outcome, false, true);
                    }
                }
            }
            if shutdown.is_fired() {
                return self.summary(attempts, outcome, false, true);
            }

            last_issue = Some(Instant::now());
            attempts += 1;
            let (result, terminal) = classify(self.transport.attempt(&self.item).await);

            if let Ok(mut tracker) = self.tracker.write() {
                tracker.upsert(&self.item.code, result.clone());
            }
            outcome = result;

            if terminal {
                info!(
                    "[ATTEMPT] {} settled on attempt {}: {} {}",
                    self.item, attempts, outcome.status, outcome.message
                );
                return self.summary(attempts, outcome, false, false);
            }
            if outcome.status == OutcomeStatus::Error {
                warn!(
                    "[ATTEMPT] {} attempt {}/{} failed: {}",
                    self.item, attempts, self.max_attempts, outcome.message
                );
            } else {
                debug!(
                    "[ATTEMPT] {} attempt {}/{}: {}",
                    self.item, attempts, self.max_attempts, outcome.status
                );
            }
        }

        info!(
            "[ATTEMPT] {} exhausted {} attempts, last {}",
            self.item, attempts, outcome.status
        );
        self.summary(attempts, outcome, true, false)
    }

    fn summary(&self, attempts: u32, outcome: Outcome, exhausted: bool, cancelled: bool) -> ItemSummary {
        if cancelled {
            info!("[ATTEMPT] {} cancelled after {} attempt(s)", self.item, attempts);
        }
        ItemSummary {
            item: self.item.clone(),
            attempts,
            outcome,
            exhausted,
            cancelled,
        }
    }
}
