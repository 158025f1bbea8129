//! Delivery worker - drains the event store to the backend
//!
//! Runs off the fusion lane. Each round flushes the overflow buffer, then
//! walks pending records in store priority order and uploads every record
//! whose backoff gate is open. A round is triggered by the poll interval,
//! by an enqueue, or by the earliest backoff expiry, whichever comes first.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::backend::{Backend, BackendError};
use crate::io::store::{EventStore, FailOutcome, StoredRecord};
use crate::services::auth::{AuthError, AuthSession};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why the worker returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    /// Credentials rejected; restarting will not help
    LockedOut,
}

/// Per-record backoff: `min(base * 2^attempt_count, max)`, saturating
pub fn backoff_delay(attempt_count: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt_count)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Counts from one pass over the pending records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Skipped because their backoff gate is still closed
    pub deferred: usize,
    /// Time until the earliest deferred record becomes eligible
    pub next_due: Option<Duration>,
}

enum Attempt {
    Delivered,
    Failed(FailOutcome),
}

#[derive(Clone)]
pub struct DeliveryWorker {
    store: Arc<EventStore>,
    auth: Arc<AuthSession>,
    backend: Arc<dyn Backend>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    max_auth_retries: u32,
    health_check_backlog: usize,
}

impl DeliveryWorker {
    pub fn new(
        config: &Config,
        store: Arc<EventStore>,
        auth: Arc<AuthSession>,
        backend: Arc<dyn Backend>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            auth,
            backend,
            metrics,
            shutdown,
            poll_interval: config.poll_interval(),
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            max_auth_retries: config.max_auth_retries(),
            health_check_backlog: config.health_check_backlog(),
        }
    }

    /// Run until shutdown or lockout
    pub async fn run(mut self) -> WorkerExit {
        let released = self.store.release_claims();
        info!(
            pending = %self.store.pending_len(),
            released_claims = %released,
            poll_interval_ms = %self.poll_interval.as_millis(),
            "delivery_worker_started"
        );

        let exit = loop {
            if self.is_shutting_down() {
                break WorkerExit::Shutdown;
            }

            let wait = match self.run_round().await {
                Ok(round) => {
                    if round.delivered + round.failed > 0 {
                        debug!(
                            delivered = %round.delivered,
                            failed = %round.failed,
                            dead_lettered = %round.dead_lettered,
                            deferred = %round.deferred,
                            "delivery_round_complete"
                        );
                    }
                    round.next_due.map_or(self.poll_interval, |due| due.min(self.poll_interval))
                }
                Err(_) => break WorkerExit::LockedOut,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.store.wait_for_enqueue() => {}
                changed = self.shutdown.changed() => {
                    // Sender gone means the process is exiting
                    if changed.is_err() {
                        break WorkerExit::Shutdown;
                    }
                }
            }
        };

        self.store.release_claims();
        info!(exit = ?exit, pending = %self.store.pending_len(), "delivery_worker_stopped");
        exit
    }

    /// One pass over the pending records; only a lockout is returned as an error
    pub async fn run_round(&self) -> Result<RoundSummary, AuthError> {
        let mut round = RoundSummary::default();
        self.store.flush_overflow();

        let records = self.store.list_pending();
        if records.is_empty() {
            return Ok(round);
        }

        if records.len() > self.health_check_backlog && !self.backend_healthy().await? {
            round.next_due = Some(self.poll_interval);
            return Ok(round);
        }

        let now = Utc::now();
        for record in records {
            if self.is_shutting_down() {
                break;
            }

            if let Some(remaining) = self.backoff_remaining(&record, now) {
                round.deferred += 1;
                round.next_due = Some(round.next_due.map_or(remaining, |d| d.min(remaining)));
                continue;
            }

            let Some(record) = self.store.claim(record.id()) else {
                continue;
            };

            match self.deliver(record).await? {
                Attempt::Delivered => round.delivered += 1,
                Attempt::Failed(FailOutcome::DeadLettered) => {
                    round.failed += 1;
                    round.dead_lettered += 1;
                }
                Attempt::Failed(FailOutcome::Retry { attempt_count }) => {
                    round.failed += 1;
                    let delay = backoff_delay(attempt_count, self.backoff_base, self.backoff_max);
                    round.next_due = Some(round.next_due.map_or(delay, |d| d.min(delay)));
                }
            }
        }

        Ok(round)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Remaining backoff for a previously attempted record, None if eligible now
    fn backoff_remaining(&self, record: &StoredRecord, now: DateTime<Utc>) -> Option<Duration> {
        let last = record.last_attempt_at?;
        let delay = backoff_delay(record.attempt_count, self.backoff_base, self.backoff_max);
        let elapsed = (now - last).to_std().unwrap_or_default();
        delay.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Liveness probe before draining a large backlog
    async fn backend_healthy(&self) -> Result<bool, AuthError> {
        let token = match self.auth.access_token().await {
            Ok(token) => token,
            Err(AuthError::LockedOut) => return Err(AuthError::LockedOut),
            Err(e) => {
                warn!(error = %e, "health_probe_no_token");
                return Ok(false);
            }
        };
        match self.backend.health(&token).await {
            Ok(()) => Ok(true),
            Err(e) => {
                if e.is_auth() {
                    self.auth.invalidate(&token).await;
                }
                warn!(
                    error = %e,
                    backlog = %self.store.pending_len(),
                    "backend_unhealthy_skipping_round"
                );
                Ok(false)
            }
        }
    }

    /// Upload one claimed record, retrying on auth rejection without
    /// spending the record's attempt budget
    async fn deliver(&self, mut record: StoredRecord) -> Result<Attempt, AuthError> {
        let id = record.id();
        let started = Instant::now();
        let mut auth_retries = 0u32;

        loop {
            let token = match self.auth.access_token().await {
                Ok(token) => token,
                Err(AuthError::LockedOut) => return Err(AuthError::LockedOut),
                Err(AuthError::Unavailable(e)) => {
                    return Ok(self.fail(&record, &format!("auth unavailable: {}", e)));
                }
            };

            match self.upload(&mut record, &token).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_delivered(id) {
                        warn!(event_id = %id, error = %e, "mark_delivered_failed");
                    }
                    self.metrics.record_upload_delivered(started.elapsed().as_millis() as u64);
                    return Ok(Attempt::Delivered);
                }
                Err(e) if e.is_auth() => {
                    self.auth.invalidate(&token).await;
                    self.metrics.record_auth_retry();
                    if auth_retries >= self.max_auth_retries {
                        return Ok(self.fail(
                            &record,
                            &format!("{} after {} auth retries", e, auth_retries),
                        ));
                    }
                    auth_retries += 1;
                    info!(event_id = %id, auth_retry = %auth_retries, "upload_unauthorized_retrying");
                }
                Err(e) => return Ok(self.fail(&record, &e.to_string())),
            }
        }
    }

    /// Metadata first, then the image; metadata is not re-posted once accepted
    async fn upload(&self, record: &mut StoredRecord, token: &str) -> Result<(), BackendError> {
        let id = record.id();

        if !record.metadata_delivered {
            self.backend.upload_event(token, &record.event).await?;
            record.metadata_delivered = true;
            if let Err(e) = self.store.mark_metadata_delivered(id) {
                warn!(event_id = %id, error = %e, "metadata_flag_persist_failed");
            }
            debug!(event_id = %id, "event_metadata_uploaded");
        }

        let Some(path) = record.event.image_ref.as_ref() else {
            return Ok(());
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let len = bytes.len();
                self.backend.upload_image(token, id, Bytes::from(bytes)).await?;
                debug!(event_id = %id, bytes = %len, "event_image_uploaded");
            }
            Err(e) => {
                // The image is secondary evidence; the event is still delivered
                warn!(event_id = %id, path = %path.display(), error = %e, "event_image_unavailable");
            }
        }
        Ok(())
    }

    fn fail(&self, record: &StoredRecord, reason: &str) -> Attempt {
        let id = record.id();
        self.metrics.record_upload_failure();
        match self.store.mark_failed(id, reason) {
            Ok(FailOutcome::Retry { attempt_count }) => {
                let retry_in = backoff_delay(attempt_count, self.backoff_base, self.backoff_max);
                warn!(
                    event_id = %id,
                    attempt = %attempt_count,
                    retry_in_ms = %retry_in.as_millis(),
                    reason = %reason,
                    "delivery_attempt_failed"
                );
                Attempt::Failed(FailOutcome::Retry { attempt_count })
            }
            Ok(FailOutcome::DeadLettered) => Attempt::Failed(FailOutcome::DeadLettered),
            Err(e) => {
                warn!(event_id = %id, error = %e, "mark_failed_error");
                Attempt::Failed(FailOutcome::Retry { attempt_count: record.attempt_count + 1 })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(1000);
    const MAX: Duration = Duration::from_millis(300_000);

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0, BASE, MAX), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1, BASE, MAX), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3, BASE, MAX), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        assert_eq!(backoff_delay(9, BASE, MAX), MAX);
        assert_eq!(backoff_delay(31, BASE, MAX), MAX);
        // 2^40 overflows u32; must saturate rather than wrap
        assert_eq!(backoff_delay(40, BASE, MAX), MAX);
        assert_eq!(backoff_delay(u32::MAX, BASE, MAX), MAX);
    }

    #[test]
    fn test_backoff_sequence_non_decreasing() {
        let delays: Vec<Duration> = (1..=12).map(|n| backoff_delay(n, BASE, MAX)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= MAX));
        assert_eq!(*delays.last().unwrap(), MAX);
    }

    #[test]
    fn test_zero_base_means_no_wait() {
        assert_eq!(backoff_delay(5, Duration::ZERO, MAX), Duration::ZERO);
    }
}
