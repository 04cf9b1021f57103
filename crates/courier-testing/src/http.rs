//! HTTP receiver double for webhook delivery tests.
//!
//! Wraps a wiremock server and exposes the requests it received in a form
//! that signature checks and payload assertions can use directly.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use serde_json::Value;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer as WiremockServer, ResponseTemplate,
};

/// HTTP mock server standing in for a subscriber endpoint.
pub struct MockServer {
    server: WiremockServer,
}

/// Canned subscriber response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Answer with `status` and `body`.
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
    /// Answer 200 after `delay`, long enough to trip a client timeout.
    Delayed {
        /// Delay before responding
        delay: Duration,
    },
}

impl MockResponse {
    /// 200 with an empty body.
    pub fn ok() -> Self {
        Self::Status { status: 200, body: String::new() }
    }

    /// Given status with an empty body.
    pub fn status(status: u16) -> Self {
        Self::Status { status, body: String::new() }
    }

    fn template(&self) -> ResponseTemplate {
        match self {
            Self::Status { status, body } => {
                ResponseTemplate::new(*status).set_body_string(body.clone())
            },
            Self::Delayed { delay } => ResponseTemplate::new(200).set_delay(*delay),
        }
    }
}

/// A request received by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Headers with lowercase names.
    pub headers: HashMap<String, String>,
    /// Raw body.
    pub body: Bytes,
}

impl RecordedRequest {
    /// Returns a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

impl MockServer {
    /// Starts a new mock server on a random port.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Returns the base URL of the mock server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Returns the URL of `path` on the mock server.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.server.uri())
    }

    /// Answers every POST to `endpoint_path` with `response`.
    pub async fn respond(&self, endpoint_path: &str, response: MockResponse) {
        Mock::given(method("POST"))
            .and(path(endpoint_path))
            .respond_with(response.template())
            .mount(&self.server)
            .await;
    }

    /// Answers successive POSTs to `endpoint_path` with `statuses` in order.
    ///
    /// The last status keeps answering once the sequence is used up.
    pub async fn respond_sequence(&self, endpoint_path: &str, statuses: &[u16]) {
        let Some((last, leading)) = statuses.split_last() else {
            return;
        };

        for status in leading {
            Mock::given(method("POST"))
                .and(path(endpoint_path))
                .respond_with(ResponseTemplate::new(*status))
                .up_to_n_times(1)
                .mount(&self.server)
                .await;
        }
        self.respond(endpoint_path, MockResponse::status(*last)).await;
    }

    /// Returns all requests received by the server, oldest first.
    pub async fn received_requests(&self) -> Vec<RecordedRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| RecordedRequest {
                method: request.method.to_string(),
                path: request.url.path().to_string(),
                headers: request
                    .headers
                    .iter()
                    .filter_map(|(name, value)| {
                        value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect(),
                body: Bytes::from(request.body),
            })
            .collect()
    }

    /// Returns the requests received on `endpoint_path`.
    pub async fn requests_to(&self, endpoint_path: &str) -> Vec<RecordedRequest> {
        self.received_requests().await.into_iter().filter(|r| r.path == endpoint_path).collect()
    }

    /// Asserts that exactly `expected` requests were received.
    pub async fn assert_request_count(&self, expected: usize) {
        let requests = self.received_requests().await;
        assert_eq!(
            requests.len(),
            expected,
            "expected {} requests, received {}",
            expected,
            requests.len()
        );
    }
}
