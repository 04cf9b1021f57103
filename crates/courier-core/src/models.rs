//! Domain models and strongly-typed identifiers.
//!
//! Defines webhook subscriptions, delivery records, transient events and the
//! wire payload signed and sent to subscribers. Identifiers are UUID newtypes
//! so a delivery id can never be passed where a webhook id is expected.

use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Prefix carried by every generated signing secret.
pub const SECRET_PREFIX: &str = "whsec_";

/// Event type used by synthetic test deliveries.
pub const TEST_EVENT_TYPE: &str = "webhook.test";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed webhook subscription identifier.
    WebhookId
);

uuid_id!(
    /// Strongly-typed delivery record identifier.
    ///
    /// Also sent to subscribers as the payload `id`, which they use to
    /// de-duplicate at-least-once deliveries.
    DeliveryId
);

uuid_id!(
    /// Owning account identifier.
    AccountId
);

uuid_id!(
    /// Campaign scope identifier.
    CampaignId
);

uuid_id!(
    /// Identifier of an event read from the log.
    EventId
);

/// Lifecycle status of a webhook subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Receives deliveries.
    Active,
    /// Paused by its owner; receives nothing.
    Paused,
    /// Disabled by the surrounding application; receives nothing.
    Failed,
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for WebhookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid webhook status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for WebhookStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Status of a delivery record.
///
/// ```text
/// Pending -> Success
///         -> Failed (retries exhausted or disabled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// First attempt in flight or a retry is scheduled.
    Pending,
    /// Subscriber answered 2xx. Terminal.
    Success,
    /// No further attempts will be made. Terminal.
    Failed,
}

impl DeliveryStatus {
    /// Returns true for states that accept no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Webhook subscription owned by an account.
///
/// A webhook receives an event when it is deliverable (active and not
/// soft-deleted), its campaign scope is unset or equal to the event's, and
/// its event list contains the event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    /// Unique identifier.
    pub id: WebhookId,
    /// Account that owns the subscription.
    pub account_id: AccountId,
    /// Optional campaign the subscription is limited to.
    pub campaign_id: Option<CampaignId>,
    /// Target URL receiving the POST.
    pub url: String,
    /// HMAC signing secret. Handed to the owner once at creation.
    #[serde(skip_serializing, default)]
    pub secret: String,
    /// Subscribed event types.
    pub events: Vec<String>,
    /// Lifecycle status.
    pub status: WebhookStatus,
    /// Whether failed deliveries are retried.
    pub retry_enabled: bool,
    /// Total attempts allowed per delivery, including the first.
    pub max_retries: i32,
    /// Successful deliveries.
    pub sent_count: i64,
    /// Terminally failed deliveries.
    pub failed_count: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Webhook {
    /// Creates an active webhook with a freshly generated secret.
    pub fn new(account_id: AccountId, url: impl Into<String>, events: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WebhookId::new(),
            account_id,
            campaign_id: None,
            url: url.into(),
            secret: generate_secret(),
            events,
            status: WebhookStatus::Active,
            retry_enabled: true,
            max_retries: 5,
            sent_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Returns true once the webhook has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns true if the webhook may receive new deliveries.
    pub fn is_deliverable(&self) -> bool {
        !self.is_deleted() && self.status == WebhookStatus::Active
    }

    /// Returns true if `event_type` is in the subscribed event list.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }

    /// Returns true if an event with the given campaign scope is in range.
    ///
    /// An unscoped webhook accepts every campaign, including none. A scoped
    /// webhook only accepts events carrying the same campaign.
    pub fn in_scope(&self, campaign_id: Option<CampaignId>) -> bool {
        match self.campaign_id {
            None => true,
            Some(scope) => campaign_id == Some(scope),
        }
    }

    /// Full dispatch filter for an event.
    pub fn accepts(&self, event_type: &str, campaign_id: Option<CampaignId>) -> bool {
        self.is_deliverable() && self.in_scope(campaign_id) && self.subscribes_to(event_type)
    }
}

/// Generates a new `whsec_`-prefixed signing secret from 32 random bytes.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    format!("{SECRET_PREFIX}{}", hex::encode(bytes))
}

/// One delivery sequence of one event to one webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookDelivery {
    /// Unique identifier, also the payload `id`.
    pub id: DeliveryId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Event type being delivered.
    pub event_type: String,
    /// Payload snapshot. Never modified after creation.
    pub payload: Value,
    /// Current status.
    pub status: DeliveryStatus,
    /// Attempts made so far, starting at 1.
    pub attempt_number: i32,
    /// HTTP status of the last attempt.
    pub response_status: Option<i32>,
    /// Response body of the last attempt, capped for audit.
    pub response_body: Option<String>,
    /// Duration of the last attempt.
    pub response_duration_ms: Option<i64>,
    /// Error of the last failed attempt.
    pub error_message: Option<String>,
    /// When the retry scheduler should pick the record up; null when none.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Creates the pending record written before the first attempt.
    pub fn pending(
        id: DeliveryId,
        webhook_id: WebhookId,
        event_type: impl Into<String>,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            webhook_id,
            event_type: event_type.into(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_number: 1,
            response_status: None,
            response_body: None,
            response_duration_ms: None,
            error_message: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a status transition in memory.
    pub fn apply(&mut self, update: &DeliveryUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.response_status = update.response_status;
        self.response_body.clone_from(&update.response_body);
        self.response_duration_ms = update.response_duration_ms;
        self.error_message.clone_from(&update.error_message);
        self.next_retry_at = update.next_retry_at;
        self.updated_at = now;
    }
}

/// Outcome of one attempt, written onto a delivery record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    /// New status.
    pub status: DeliveryStatus,
    /// HTTP status if a response was received.
    pub response_status: Option<i32>,
    /// Truncated response body.
    pub response_body: Option<String>,
    /// Attempt duration.
    pub response_duration_ms: Option<i64>,
    /// Error text for failures.
    pub error_message: Option<String>,
    /// Scheduled retry time; `None` means no retry.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryUpdate {
    /// Closes a record as failed without an HTTP attempt.
    pub fn abandoned(reason: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            response_status: None,
            response_body: None,
            response_duration_ms: None,
            error_message: Some(reason.into()),
            next_retry_at: None,
        }
    }
}

/// Business event read from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identity.
    pub id: EventId,
    /// Event type, matched against webhook subscriptions.
    pub event_type: String,
    /// Owning account.
    pub account_id: AccountId,
    /// Optional campaign scope.
    pub campaign_id: Option<CampaignId>,
    /// Arbitrary event data.
    pub data: Value,
    /// When the producer emitted the event.
    pub produced_at: DateTime<Utc>,
}

impl Event {
    /// Creates an event produced now.
    pub fn new(
        event_type: impl Into<String>,
        account_id: AccountId,
        campaign_id: Option<CampaignId>,
        data: Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            account_id,
            campaign_id,
            data,
            produced_at: Utc::now(),
        }
    }
}

/// Parts of a payload shared by every webhook matched by one event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Event type.
    pub event_type: String,
    /// Owning account.
    pub account_id: AccountId,
    /// Shared creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Shared event data.
    pub data: Value,
}

impl EventEnvelope {
    /// Creates an envelope stamped with `created_at`.
    pub fn new(
        event_type: impl Into<String>,
        account_id: AccountId,
        data: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self { event_type: event_type.into(), account_id, created_at, data }
    }

    /// Builds the payload for one delivery.
    pub fn for_delivery(&self, delivery_id: DeliveryId) -> WebhookPayload {
        WebhookPayload {
            id: delivery_id,
            event_type: self.event_type.clone(),
            created_at: self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            data: self.data.clone(),
            account_id: self.account_id,
        }
    }
}

/// Wire representation sent to subscribers.
///
/// Field order is fixed and object keys inside `data` serialize sorted, so a
/// payload produces the same bytes every time it is serialized, including
/// after a round trip through the delivery store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Delivery id.
    pub id: DeliveryId,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Event data.
    pub data: Value,
    /// Owning account.
    pub account_id: AccountId,
}

impl WebhookPayload {
    /// Serializes the payload to the bytes that are signed and sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Converts the payload into a JSON document for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Restores a payload from a stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot does not have the payload shape.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn webhook(events: &[&str]) -> Webhook {
        Webhook::new(
            AccountId::new(),
            "https://example.com/hook",
            events.iter().map(ToString::to_string).collect(),
        )
    }

    #[test]
    fn generated_secret_has_prefix_and_entropy() {
        let first = generate_secret();
        let second = generate_secret();

        assert!(first.starts_with(SECRET_PREFIX));
        assert_eq!(first.len(), SECRET_PREFIX.len() + 64);
        assert_ne!(first, second);
    }

    #[test]
    fn paused_and_deleted_webhooks_are_not_deliverable() {
        let mut hook = webhook(&["user.created"]);
        assert!(hook.is_deliverable());

        hook.status = WebhookStatus::Paused;
        assert!(!hook.is_deliverable());

        hook.status = WebhookStatus::Active;
        hook.deleted_at = Some(Utc::now());
        assert!(!hook.is_deliverable());
        assert!(!hook.accepts("user.created", None));
    }

    #[test]
    fn campaign_scope_filter() {
        let campaign = CampaignId::new();
        let mut hook = webhook(&["referral.converted"]);

        assert!(hook.in_scope(None));
        assert!(hook.in_scope(Some(campaign)));

        hook.campaign_id = Some(campaign);
        assert!(hook.in_scope(Some(campaign)));
        assert!(!hook.in_scope(Some(CampaignId::new())));
        assert!(!hook.in_scope(None));
    }

    #[test]
    fn subscription_is_exact_match() {
        let hook = webhook(&["user.created", "reward.granted"]);

        assert!(hook.subscribes_to("reward.granted"));
        assert!(!hook.subscribes_to("user.verified"));
        assert!(!hook.subscribes_to("user"));
    }

    #[test]
    fn status_text_round_trip() {
        for status in [WebhookStatus::Active, WebhookStatus::Paused, WebhookStatus::Failed] {
            assert_eq!(status.to_string().parse::<WebhookStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<DeliveryStatus>().is_err());
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }

    #[test]
    fn payload_serializes_in_wire_order() {
        let account_id = AccountId(Uuid::nil());
        let created_at = DateTime::parse_from_rfc3339("2024-05-01T12:30:45.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let envelope = EventEnvelope::new(
            "user.created",
            account_id,
            json!({"zeta": 1, "alpha": {"b": 2, "a": 1}}),
            created_at,
        );

        let payload = envelope.for_delivery(DeliveryId(Uuid::nil()));
        let body = String::from_utf8(payload.to_bytes().unwrap()).unwrap();

        assert_eq!(
            body,
            concat!(
                r#"{"id":"00000000-0000-0000-0000-000000000000","type":"user.created","#,
                r#""created_at":"2024-05-01T12:30:45Z","data":{"alpha":{"a":1,"b":2},"zeta":1},"#,
                r#""account_id":"00000000-0000-0000-0000-000000000000"}"#
            )
        );
    }

    #[test]
    fn stored_snapshot_reserializes_identically() {
        let envelope = EventEnvelope::new(
            "reward.granted",
            AccountId::new(),
            json!({"amount": 10}),
            Utc::now(),
        );
        let payload = envelope.for_delivery(DeliveryId::new());
        let original = payload.to_bytes().unwrap();

        // The store hands back a JSON document whose key order may differ.
        let stored: Value = serde_json::from_slice(&original).unwrap();
        let restored = WebhookPayload::from_value(stored).unwrap();

        assert_eq!(restored.to_bytes().unwrap(), original);
    }

    #[test]
    fn envelope_shares_timestamp_across_deliveries() {
        let envelope = EventEnvelope::new("user.created", AccountId::new(), json!({}), Utc::now());

        let first = envelope.for_delivery(DeliveryId::new());
        let second = envelope.for_delivery(DeliveryId::new());

        assert_ne!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.data, second.data);
    }

    #[test]
    fn update_applies_to_record() {
        let now = Utc::now();
        let mut delivery = WebhookDelivery::pending(
            DeliveryId::new(),
            WebhookId::new(),
            "user.created",
            json!({}),
            now,
        );
        assert_eq!(delivery.attempt_number, 1);

        delivery.apply(&DeliveryUpdate::abandoned("webhook deleted"), now);

        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.error_message.as_deref(), Some("webhook deleted"));
        assert!(delivery.next_retry_at.is_none());
    }

    #[test]
    fn ids_parse_from_strings() {
        let id = AccountId::new();
        assert_eq!(id.to_string().parse::<AccountId>().unwrap(), id);
        assert!("not-a-uuid".parse::<AccountId>().is_err());
    }
}
