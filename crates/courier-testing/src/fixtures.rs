//! Builders for webhooks and events with sensible defaults.

use chrono::{DateTime, Utc};
use courier_core::{
    generate_secret, AccountId, CampaignId, Event, EventId, Webhook, WebhookStatus,
};
use serde_json::{json, Value};

/// Builder for test webhooks.
pub struct WebhookBuilder {
    account_id: AccountId,
    campaign_id: Option<CampaignId>,
    url: String,
    secret: String,
    events: Vec<String>,
    status: WebhookStatus,
    retry_enabled: bool,
    max_retries: i32,
    deleted_at: Option<DateTime<Utc>>,
}

impl WebhookBuilder {
    /// Creates an active webhook for a fresh account subscribed to
    /// `user.created`.
    pub fn new() -> Self {
        Self {
            account_id: AccountId::new(),
            campaign_id: None,
            url: "http://127.0.0.1:1/webhook".to_string(),
            secret: generate_secret(),
            events: vec!["user.created".to_string()],
            status: WebhookStatus::Active,
            retry_enabled: true,
            max_retries: 5,
            deleted_at: None,
        }
    }

    /// Sets the owning account.
    #[must_use]
    pub fn account(mut self, account_id: AccountId) -> Self {
        self.account_id = account_id;
        self
    }

    /// Limits the webhook to one campaign.
    #[must_use]
    pub fn campaign(mut self, campaign_id: CampaignId) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    /// Sets the target URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Replaces the subscribed event types.
    #[must_use]
    pub fn events(mut self, events: &[&str]) -> Self {
        self.events = events.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the lifecycle status.
    #[must_use]
    pub fn status(mut self, status: WebhookStatus) -> Self {
        self.status = status;
        self
    }

    /// Disables retries.
    #[must_use]
    pub fn retries_disabled(mut self) -> Self {
        self.retry_enabled = false;
        self
    }

    /// Sets the total attempts allowed per delivery.
    #[must_use]
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Marks the webhook soft-deleted.
    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.deleted_at = Some(Utc::now());
        self
    }

    /// Builds the webhook.
    pub fn build(self) -> Webhook {
        let mut webhook = Webhook::new(self.account_id, self.url, self.events);
        webhook.campaign_id = self.campaign_id;
        webhook.secret = self.secret;
        webhook.status = self.status;
        webhook.retry_enabled = self.retry_enabled;
        webhook.max_retries = self.max_retries;
        webhook.deleted_at = self.deleted_at;
        webhook
    }
}

impl Default for WebhookBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test events.
pub struct EventBuilder {
    event_type: String,
    account_id: AccountId,
    campaign_id: Option<CampaignId>,
    data: Value,
    produced_at: DateTime<Utc>,
}

impl EventBuilder {
    /// Creates a `user.created` event for a fresh account.
    pub fn new() -> Self {
        Self {
            event_type: "user.created".to_string(),
            account_id: AccountId::new(),
            campaign_id: None,
            data: json!({"user_id": "usr_123", "email": "user@example.com"}),
            produced_at: Utc::now(),
        }
    }

    /// Sets the event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the owning account.
    #[must_use]
    pub fn account(mut self, account_id: AccountId) -> Self {
        self.account_id = account_id;
        self
    }

    /// Scopes the event to a campaign.
    #[must_use]
    pub fn campaign(mut self, campaign_id: CampaignId) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    /// Sets the event data.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Sets when the event was produced.
    #[must_use]
    pub fn produced_at(mut self, produced_at: DateTime<Utc>) -> Self {
        self.produced_at = produced_at;
        self
    }

    /// Builds the event.
    pub fn build(self) -> Event {
        Event {
            id: EventId::new(),
            event_type: self.event_type,
            account_id: self.account_id,
            campaign_id: self.campaign_id,
            data: self.data,
            produced_at: self.produced_at,
        }
    }

    /// Builds the JSON value a producer writes to the log for this event.
    pub fn message_value(&self) -> Value {
        let mut value = json!({
            "type": self.event_type,
            "account_id": self.account_id,
            "data": self.data,
        });
        if let Some(campaign_id) = self.campaign_id {
            value["campaign_id"] = json!(campaign_id);
        }
        value
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}
