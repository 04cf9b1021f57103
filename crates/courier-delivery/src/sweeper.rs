//! Periodic retry of failed deliveries.
//!
//! Every sweep selects pending records whose `next_retry_at` has passed,
//! claims each one by bumping its attempt number and moving `next_retry_at`
//! to a claim expiry past the HTTP timeout, re-sends the stored payload and
//! records the outcome with the same retry policy the dispatcher uses. An
//! attempt whose outcome was never written becomes due again at the claim
//! expiry. A record the policy no longer allows another attempt for is
//! closed as failed without one.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, DeliveryId, DeliveryUpdate, Webhook, WebhookDelivery, WebhookPayload};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::DeliveryClient,
    dispatch::{claim_expiry, record_outcome, AttemptOutcome},
    error::{DeliveryError, Result},
    retry::{RetryDecision, RetryPolicy},
    storage::WebhookStore,
};

/// Retry scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Maximum records retried per sweep.
    pub batch_size: usize,
    /// Attempt ceiling, shared with the dispatcher.
    pub max_attempts: i32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: crate::DEFAULT_SWEEP_INTERVAL,
            batch_size: crate::DEFAULT_SWEEP_BATCH_SIZE,
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records returned by the due query.
    pub selected: usize,
    /// Retries that succeeded.
    pub delivered: usize,
    /// Retries that failed and got a new retry time.
    pub rescheduled: usize,
    /// Records closed as failed because no attempt remained.
    pub exhausted: usize,
    /// Records closed or left alone without an HTTP attempt.
    pub skipped: usize,
    /// Retries whose outcome could not be written.
    pub unrecorded: usize,
}

enum RetryOutcome {
    Attempted(AttemptOutcome),
    Exhausted,
    Skipped,
}

/// Background worker that retries due deliveries.
pub struct RetryScheduler {
    store: Arc<dyn WebhookStore>,
    client: Arc<DeliveryClient>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl RetryScheduler {
    /// Creates a retry scheduler.
    pub fn new(
        store: Arc<dyn WebhookStore>,
        client: Arc<DeliveryClient>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self { store, client, clock, config }
    }

    /// Sweeps on every interval tick until `cancellation_token` fires.
    ///
    /// A failed sweep is logged and the next tick tries again.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            interval_seconds = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "retry scheduler starting"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancellation_token.cancelled() => break,
                _ = interval.tick() => {},
            }

            match self.run_once().await {
                Ok(report) if report.selected > 0 => {
                    info!(
                        selected = report.selected,
                        delivered = report.delivered,
                        rescheduled = report.rescheduled,
                        exhausted = report.exhausted,
                        skipped = report.skipped,
                        "retry sweep completed"
                    );
                },
                Ok(_) => debug!("retry sweep found no due deliveries"),
                Err(e) => error!(error = %e, "retry sweep failed"),
            }
        }

        info!("retry scheduler stopped");
    }

    /// Runs a single sweep.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if due deliveries cannot be
    /// listed. Failures on individual records are logged and counted.
    pub async fn run_once(&self) -> Result<SweepReport> {
        // Records at the ceiling are only pending after a lost outcome write,
        // they are selected so they can be closed.
        let due = self
            .store
            .get_pending_webhook_deliveries(
                self.config.batch_size,
                self.config.max_attempts.saturating_add(1),
            )
            .await
            .map_err(|e| DeliveryError::store(format!("failed to list due deliveries: {e}")))?;

        let mut report = SweepReport { selected: due.len(), ..SweepReport::default() };

        for delivery in due {
            match self.retry_delivery(delivery).await {
                RetryOutcome::Attempted(AttemptOutcome::Delivered) => report.delivered += 1,
                RetryOutcome::Attempted(AttemptOutcome::RetryScheduled { .. }) => {
                    report.rescheduled += 1;
                },
                RetryOutcome::Attempted(AttemptOutcome::Failed { .. })
                | RetryOutcome::Exhausted => report.exhausted += 1,
                RetryOutcome::Attempted(AttemptOutcome::Unrecorded { .. }) => {
                    report.unrecorded += 1;
                },
                RetryOutcome::Skipped => report.skipped += 1,
            }
        }

        Ok(report)
    }

    async fn retry_delivery(&self, delivery: WebhookDelivery) -> RetryOutcome {
        let delivery_id = delivery.id;

        let webhook = match self.store.get_webhook_by_id(delivery.webhook_id).await {
            Ok(Some(webhook)) if webhook.is_deliverable() => webhook,
            Ok(found) => {
                let reason = if found.is_some_and(|w| !w.is_deleted()) {
                    "webhook is not active"
                } else {
                    "webhook was deleted"
                };
                info!(%delivery_id, webhook_id = %delivery.webhook_id, reason, "closing delivery");
                self.close(delivery_id, reason).await;
                return RetryOutcome::Skipped;
            },
            Err(e) => {
                warn!(%delivery_id, error = %e, "failed to load webhook, retry deferred");
                return RetryOutcome::Skipped;
            },
        };

        let policy = RetryPolicy::for_webhook(&webhook, self.config.max_attempts);
        if let RetryDecision::GiveUp { reason } =
            policy.decide(delivery.attempt_number, self.clock.now())
        {
            return self.exhaust(&webhook, delivery_id, delivery.attempt_number, &reason).await;
        }

        let body = match WebhookPayload::from_value(delivery.payload).and_then(|p| p.to_bytes()) {
            Ok(body) => body,
            Err(e) => {
                error!(%delivery_id, error = %e, "stored payload is unreadable");
                self.close(delivery_id, &format!("unreadable payload snapshot: {e}")).await;
                return RetryOutcome::Skipped;
            },
        };

        let expires_at = claim_expiry(&self.client, self.clock.now());
        let attempt_number = match self
            .store
            .increment_delivery_attempt(delivery_id, Some(expires_at))
            .await
        {
            Ok(attempt_number) => attempt_number,
            Err(e) => {
                warn!(%delivery_id, error = %e, "failed to claim delivery for retry");
                return RetryOutcome::Skipped;
            },
        };

        debug!(%delivery_id, webhook_id = %webhook.id, attempt_number, "retrying delivery");

        let response = self.client.deliver(&webhook.url, &webhook.secret, &body).await;
        let outcome = record_outcome(
            self.store.as_ref(),
            &webhook,
            delivery_id,
            attempt_number,
            &response,
            self.clock.now(),
            self.config.max_attempts,
        )
        .await;

        RetryOutcome::Attempted(outcome)
    }

    /// Closes a record whose attempts are used up and counts the failure.
    async fn exhaust(
        &self,
        webhook: &Webhook,
        delivery_id: DeliveryId,
        attempt_number: i32,
        reason: &str,
    ) -> RetryOutcome {
        if let Err(e) = self
            .store
            .update_webhook_delivery_status(delivery_id, DeliveryUpdate::abandoned(reason))
            .await
        {
            error!(%delivery_id, error = %e, "failed to close exhausted delivery");
            return RetryOutcome::Skipped;
        }

        warn!(
            %delivery_id,
            webhook_id = %webhook.id,
            attempt_number,
            reason,
            "closing delivery without further attempts"
        );
        if let Err(e) = self.store.increment_webhook_failed(webhook.id).await {
            error!(webhook_id = %webhook.id, error = %e, "failed to increment failure counter");
        }
        RetryOutcome::Exhausted
    }

    async fn close(&self, delivery_id: DeliveryId, reason: &str) {
        if let Err(e) = self
            .store
            .update_webhook_delivery_status(delivery_id, DeliveryUpdate::abandoned(reason))
            .await
        {
            error!(%delivery_id, error = %e, "failed to close delivery");
        }
    }
}
