//! Event fan-out to matching webhooks.
//!
//! For every event the dispatcher enumerates the account's webhooks, keeps
//! the deliverable and subscribed ones, and runs each through the same
//! single-webhook path: persist a pending record, post the signed payload,
//! record the outcome per the webhook's retry policy. Sibling webhooks are
//! isolated from each other's failures.
//!
//! A record is written with `next_retry_at` set to a claim expiry past the
//! HTTP timeout. If the outcome write is lost, the retry scheduler picks the
//! record up once that time has passed.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    models::TEST_EVENT_TYPE, AccountId, CampaignId, Clock, DeliveryId, DeliveryStatus,
    DeliveryUpdate, Event, EventEnvelope, Webhook, WebhookDelivery, WebhookId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryResponse},
    error::{DeliveryError, Result},
    retry::{RetryDecision, RetryPolicy},
    storage::WebhookStore,
};

/// Dispatch configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Ceiling applied to every webhook's `max_retries`.
    pub max_attempts: i32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { max_attempts: crate::DEFAULT_MAX_ATTEMPTS }
    }
}

/// What happened to a delivery after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Subscriber answered 2xx.
    Delivered,
    /// Attempt failed, the retry scheduler picks it up later.
    RetryScheduled {
        /// Earliest time of the next attempt
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempt failed and no retry remains.
    Failed {
        /// Why no further attempt is made
        reason: String,
    },
    /// The attempt was made but its outcome could not be written. The
    /// delivery becomes due again when its claim expires.
    Unrecorded {
        /// Store error that lost the outcome
        error: String,
    },
}

/// Slack added to the HTTP timeout before a claimed attempt expires.
const CLAIM_MARGIN: Duration = Duration::from_secs(30);

/// Returns when an attempt claimed at `now` expires if its outcome is never
/// written.
pub(crate) fn claim_expiry(client: &DeliveryClient, now: DateTime<Utc>) -> DateTime<Utc> {
    let hold = client.config().timeout + CLAIM_MARGIN;
    now + chrono::Duration::from_std(hold).unwrap_or_else(|_| chrono::Duration::hours(1))
}

/// Result of delivering to one webhook.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// Delivery record written for the attempt.
    pub delivery_id: DeliveryId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Attempt number that was made.
    pub attempt_number: i32,
    /// HTTP outcome.
    pub response: DeliveryResponse,
    /// Resulting delivery state.
    pub outcome: AttemptOutcome,
}

/// Per-event fan-out counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Webhooks that passed the filter.
    pub matched: usize,
    /// First attempts that succeeded.
    pub delivered: usize,
    /// First attempts that failed with a retry scheduled.
    pub retry_scheduled: usize,
    /// First attempts that failed terminally.
    pub failed: usize,
    /// Matched webhooks skipped because no record could be written.
    pub skipped: usize,
    /// First attempts whose outcome could not be written.
    pub unrecorded: usize,
}

/// Fans events out to subscribed webhooks.
pub struct Dispatcher {
    store: Arc<dyn WebhookStore>,
    client: Arc<DeliveryClient>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        store: Arc<dyn WebhookStore>,
        client: Arc<DeliveryClient>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        Self { store, client, clock, config }
    }

    /// Dispatches an event read from the log.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the account's webhooks cannot
    /// be listed.
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchSummary> {
        debug!(event_id = %event.id, event_type = %event.event_type, "dispatching event");
        self.dispatch_event(
            event.account_id,
            event.campaign_id,
            &event.event_type,
            event.data.clone(),
        )
        .await
    }

    /// Delivers one event to every matching webhook of `account_id`.
    ///
    /// Only the webhook listing can fail the call. Failures for individual
    /// webhooks are recorded and logged.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StoreError` if the account's webhooks cannot
    /// be listed.
    pub async fn dispatch_event(
        &self,
        account_id: AccountId,
        campaign_id: Option<CampaignId>,
        event_type: &str,
        data: Value,
    ) -> Result<DispatchSummary> {
        let webhooks = self.store.get_webhooks_by_account(account_id).await.map_err(|e| {
            DeliveryError::store(format!("failed to list webhooks for account {account_id}: {e}"))
        })?;

        let matched: Vec<Webhook> =
            webhooks.into_iter().filter(|w| w.accepts(event_type, campaign_id)).collect();

        let mut summary = DispatchSummary { matched: matched.len(), ..DispatchSummary::default() };
        if matched.is_empty() {
            debug!(%account_id, event_type, "no webhooks subscribed to event");
            return Ok(summary);
        }

        let envelope = EventEnvelope::new(event_type, account_id, data, self.clock.now());

        for webhook in &matched {
            match self.deliver_new(webhook, &envelope).await {
                Ok(record) => match record.outcome {
                    AttemptOutcome::Delivered => summary.delivered += 1,
                    AttemptOutcome::RetryScheduled { .. } => summary.retry_scheduled += 1,
                    AttemptOutcome::Failed { .. } => summary.failed += 1,
                    AttemptOutcome::Unrecorded { .. } => summary.unrecorded += 1,
                },
                Err(e) => {
                    warn!(
                        webhook_id = %webhook.id,
                        event_type,
                        error = %e,
                        "skipping webhook, delivery record not created"
                    );
                    summary.skipped += 1;
                },
            }
        }

        info!(
            %account_id,
            event_type,
            matched = summary.matched,
            delivered = summary.delivered,
            retry_scheduled = summary.retry_scheduled,
            failed = summary.failed,
            skipped = summary.skipped,
            unrecorded = summary.unrecorded,
            "event dispatched"
        );

        Ok(summary)
    }

    /// Sends a synthetic `webhook.test` event to one webhook.
    ///
    /// Status and subscription filters are bypassed so paused webhooks can be
    /// tested. The attempt is recorded like any other delivery.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::WebhookNotFound` for a missing or deleted
    /// webhook and `DeliveryError::StoreError` if the record cannot be
    /// written.
    pub async fn test_webhook(&self, webhook_id: WebhookId) -> Result<DeliveryRecord> {
        let webhook = self
            .store
            .get_webhook_by_id(webhook_id)
            .await?
            .filter(|w| !w.is_deleted())
            .ok_or(DeliveryError::WebhookNotFound { webhook_id })?;

        let data = json!({
            "webhook_id": webhook.id,
            "message": "This is a test webhook delivery",
        });
        let envelope =
            EventEnvelope::new(TEST_EVENT_TYPE, webhook.account_id, data, self.clock.now());

        let record = self.deliver_new(&webhook, &envelope).await?;
        info!(
            webhook_id = %webhook.id,
            delivery_id = %record.delivery_id,
            success = record.response.success,
            "test delivery sent"
        );
        Ok(record)
    }

    /// Persists a pending record for `webhook`, then makes attempt 1.
    async fn deliver_new(
        &self,
        webhook: &Webhook,
        envelope: &EventEnvelope,
    ) -> Result<DeliveryRecord> {
        let delivery_id = DeliveryId::new();
        let payload = envelope.for_delivery(delivery_id);
        let body = payload.to_bytes()?;

        let mut delivery = WebhookDelivery::pending(
            delivery_id,
            webhook.id,
            &envelope.event_type,
            payload.to_value()?,
            self.clock.now(),
        );
        delivery.next_retry_at = Some(claim_expiry(&self.client, self.clock.now()));
        self.store.create_webhook_delivery(delivery).await?;

        let response = self.client.deliver(&webhook.url, &webhook.secret, &body).await;
        let outcome = record_outcome(
            self.store.as_ref(),
            webhook,
            delivery_id,
            1,
            &response,
            self.clock.now(),
            self.config.max_attempts,
        )
        .await;

        Ok(DeliveryRecord {
            delivery_id,
            webhook_id: webhook.id,
            attempt_number: 1,
            response,
            outcome,
        })
    }
}

/// Writes the outcome of an attempt and updates the webhook counters.
///
/// Store failures are logged and never returned, so a bookkeeping problem on
/// one delivery does not affect any other. Counters only move once the
/// outcome is written.
pub(crate) async fn record_outcome(
    store: &dyn WebhookStore,
    webhook: &Webhook,
    delivery_id: DeliveryId,
    attempt_number: i32,
    response: &DeliveryResponse,
    attempted_at: DateTime<Utc>,
    attempt_ceiling: i32,
) -> AttemptOutcome {
    let (outcome, status, next_retry_at) = if response.success {
        (AttemptOutcome::Delivered, DeliveryStatus::Success, None)
    } else {
        let policy = RetryPolicy::for_webhook(webhook, attempt_ceiling);
        match policy.decide(attempt_number, attempted_at) {
            RetryDecision::Retry { next_attempt_at } => (
                AttemptOutcome::RetryScheduled { next_attempt_at },
                DeliveryStatus::Pending,
                Some(next_attempt_at),
            ),
            RetryDecision::GiveUp { reason } => {
                (AttemptOutcome::Failed { reason }, DeliveryStatus::Failed, None)
            },
        }
    };

    let update = DeliveryUpdate {
        status,
        response_status: response.status_code.map(i32::from),
        response_body: Some(response.body.clone()),
        response_duration_ms: Some(response.duration_ms),
        error_message: response.error.clone(),
        next_retry_at,
    };

    if let Err(e) = store.update_webhook_delivery_status(delivery_id, update).await {
        error!(
            %delivery_id,
            webhook_id = %webhook.id,
            attempt_number,
            error = %e,
            "failed to record delivery outcome, retried once the claim expires"
        );
        return AttemptOutcome::Unrecorded { error: e.to_string() };
    }

    match &outcome {
        AttemptOutcome::Delivered => {
            debug!(
                %delivery_id,
                webhook_id = %webhook.id,
                attempt_number,
                status_code = response.status_code,
                duration_ms = response.duration_ms,
                "webhook delivered"
            );
            if let Err(e) = store.increment_webhook_sent(webhook.id).await {
                error!(webhook_id = %webhook.id, error = %e, "failed to increment sent counter");
            }
        },
        AttemptOutcome::RetryScheduled { next_attempt_at } => {
            warn!(
                %delivery_id,
                webhook_id = %webhook.id,
                attempt_number,
                status_code = response.status_code,
                error = response.error.as_deref().unwrap_or_default(),
                next_attempt_at = %next_attempt_at,
                "delivery failed, retry scheduled"
            );
        },
        AttemptOutcome::Failed { reason } => {
            warn!(
                %delivery_id,
                webhook_id = %webhook.id,
                attempt_number,
                status_code = response.status_code,
                error = response.error.as_deref().unwrap_or_default(),
                reason = %reason,
                "delivery failed permanently"
            );
            if let Err(e) = store.increment_webhook_failed(webhook.id).await {
                error!(webhook_id = %webhook.id, error = %e, "failed to increment failure counter");
            }
        },
        AttemptOutcome::Unrecorded { .. } => {},
    }

    outcome
}
