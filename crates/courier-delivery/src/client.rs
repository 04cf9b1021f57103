//! Signed HTTP delivery primitive.
//!
//! Performs exactly one POST per call and classifies the outcome. It writes
//! nothing and schedules nothing: the dispatcher and retry scheduler decide
//! what an outcome means for the delivery record.

use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use courier_core::{Clock, RealClock};
use reqwest::{header::CONTENT_TYPE, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::{signature_header, SIGNATURE_HEADER},
};

/// Maximum number of response body bytes kept for audit.
pub const MAX_RESPONSE_BODY_BYTES: usize = 10 * 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hard timeout for one request, connect to last byte.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "Courier/1.0".to_string(),
            max_redirects: 0,
        }
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// True only for a 2xx response.
    pub success: bool,
    /// HTTP status, absent on transport failure.
    pub status_code: Option<u16>,
    /// Response body, at most `MAX_RESPONSE_BODY_BYTES`.
    pub body: String,
    /// Wall time spent on the request.
    pub duration_ms: i64,
    /// Failure description, absent on success.
    pub error: Option<String>,
}

/// HTTP client that signs and posts webhook payloads.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(RealClock::new()))
    }

    /// Creates a client that reads signing timestamps from `clock`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_clock(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let redirect = if config.max_redirects == 0 {
            reqwest::redirect::Policy::none()
        } else {
            reqwest::redirect::Policy::limited(config.max_redirects as usize)
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(redirect)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config, clock })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Signs `payload` with `secret` and posts it to `url`.
    ///
    /// Never fails: transport errors and non-2xx statuses come back as an
    /// unsuccessful `DeliveryResponse` with `error` set.
    pub async fn deliver(&self, url: &str, secret: &str, payload: &[u8]) -> DeliveryResponse {
        let span = info_span!("webhook_delivery", url = %url, payload_bytes = payload.len());

        async move {
            let timestamp = self.clock.now().timestamp();
            let signature = match signature_header(secret, timestamp, payload) {
                Ok(signature) => signature,
                Err(e) => {
                    warn!(error = %e, "failed to sign payload");
                    return DeliveryResponse {
                        success: false,
                        status_code: None,
                        body: String::new(),
                        duration_ms: 0,
                        error: Some(e.to_string()),
                    };
                },
            };

            let start_time = std::time::Instant::now();
            let result = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, signature)
                .body(payload.to_vec())
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration_ms = elapsed_ms(start_time);
                    let error = if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    };
                    warn!(duration_ms, error = %error, "request failed");

                    return DeliveryResponse {
                        success: false,
                        status_code: None,
                        body: String::new(),
                        duration_ms,
                        error: Some(error.to_string()),
                    };
                },
            };

            let status = response.status();
            let body = read_capped_body(response).await;
            let duration_ms = elapsed_ms(start_time);

            debug!(status = status.as_u16(), duration_ms, "received response");

            if status.is_success() {
                DeliveryResponse {
                    success: true,
                    status_code: Some(status.as_u16()),
                    body,
                    duration_ms,
                    error: None,
                }
            } else {
                DeliveryResponse {
                    success: false,
                    status_code: Some(status.as_u16()),
                    body,
                    duration_ms,
                    error: Some(DeliveryError::http_status(status.as_u16()).to_string()),
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn elapsed_ms(start: std::time::Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Reads at most `MAX_RESPONSE_BODY_BYTES` of the body and drops the rest.
async fn read_capped_body(mut response: Response) -> String {
    let mut buffer = BytesMut::new();

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = MAX_RESPONSE_BODY_BYTES - buffer.len();
                if chunk.len() >= remaining {
                    buffer.extend_from_slice(&chunk[..remaining]);
                    break;
                }
                buffer.extend_from_slice(&chunk);
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read response body");
                break;
            },
        }
    }

    String::from_utf8_lossy(&buffer).into_owned()
}
