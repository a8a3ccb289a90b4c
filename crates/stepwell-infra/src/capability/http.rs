//! HTTP webhook capability.
//!
//! Generic outbound-call adapter: node params describe the request, the
//! response becomes the action output. Follows the engine's failure
//! taxonomy -- 5xx and transport errors are retryable, 4xx and malformed
//! params are fatal (retrying cannot fix a bad request).
//!
//! Params shape:
//! ```json
//! {
//!   "method": "POST",
//!   "url": "https://hooks.example.com/booking",
//!   "headers": { "Authorization": "Bearer ..." },
//!   "body": { "lead_id": "abc" }
//! }
//! ```
//!
//! The run's idempotency key is forwarded as `Idempotency-Key`, so a
//! well-behaved receiver deduplicates replays after a crash.

use std::pin::Pin;
use std::time::Duration;

use serde_json::{Value, json};
use stepwell_core::engine::capability::{
    Capability, CapabilityOutcome, CapabilityRequest,
};

/// Capability kind handled by this adapter.
pub const HTTP_WEBHOOK_KIND: &str = "http_webhook";

/// Request timeout for outbound calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// reqwest-backed webhook capability.
pub struct HttpWebhookCapability {
    client: reqwest::Client,
}

impl HttpWebhookCapability {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("stepwell-engine/0.1")
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    async fn perform(&self, request: CapabilityRequest) -> CapabilityOutcome {
        let Some(url) = request.params.get("url").and_then(Value::as_str) else {
            return CapabilityOutcome::FatalFailure {
                reason: "http_webhook params missing 'url'".to_string(),
            };
        };
        let method = request
            .params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST");
        let method = match method.parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => {
                return CapabilityOutcome::FatalFailure {
                    reason: format!("invalid HTTP method '{method}'"),
                };
            }
        };

        let mut builder = self
            .client
            .request(method, url)
            .header("Idempotency-Key", &request.idempotency_key);

        if let Some(headers) = request.params.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    builder = builder.header(name, value);
                }
            }
        }
        if let Some(body) = request.params.get("body") {
            builder = builder.json(body);
        }
        if request.draft {
            builder = builder.header("X-Stepwell-Draft", "true");
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                // Transport errors (DNS, connect, timeout) are transient.
                return CapabilityOutcome::RetryableFailure {
                    reason: format!("request failed: {e}"),
                };
            }
        };

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            CapabilityOutcome::Success {
                output: json!({
                    "status": status.as_u16(),
                    "body": body,
                }),
            }
        } else if status.is_server_error() || status.as_u16() == 429 {
            CapabilityOutcome::RetryableFailure {
                reason: format!("upstream returned {status}"),
            }
        } else {
            CapabilityOutcome::FatalFailure {
                reason: format!("upstream rejected request with {status}"),
            }
        }
    }
}

impl Default for HttpWebhookCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl Capability for HttpWebhookCapability {
    fn kind(&self) -> &str {
        HTTP_WEBHOOK_KIND
    }

    fn invoke(
        &self,
        request: CapabilityRequest,
    ) -> Pin<Box<dyn Future<Output = CapabilityOutcome> + Send + '_>> {
        Box::pin(self.perform(request))
    }
}
