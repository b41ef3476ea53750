// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of batches to a Loki push endpoint.
//!
//! A batch is encoded once (protobuf + Snappy) and the same body is sent on
//! every attempt. Connection errors, timeouts, 429 and 5xx responses are
//! retried with exponential back-off up to the configured attempt ceiling;
//! every other non-2xx response is returned as a permanent failure straight
//! away. A caller-supplied deadline caps both the per-attempt timeout and
//! the total time spent backing off.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::backoff::ExponentialBackoff;
use crate::batch::Batch;
use crate::config::{Config, Credentials};
use crate::constants;
use crate::errors::{is_retryable_status, DeliveryError};
use crate::http::get_client;
use crate::proto;

/// Outcome of a successful push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    /// Requests issued, zero for an empty batch.
    pub attempts: u32,
    pub entries: usize,
    pub streams: usize,
    /// Compressed body size.
    pub bytes: usize,
}

/// Destination for flushed batches.
///
/// Implementations take ownership of the batch and drop it once they reach
/// a terminal outcome.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn push(
        &self,
        batch: Batch,
        deadline: Option<Instant>,
    ) -> Result<PushSummary, DeliveryError>;
}

enum Attempt {
    Delivered,
    Retry {
        status: Option<StatusCode>,
        message: String,
        timed_out: bool,
    },
    Reject {
        status: StatusCode,
        message: String,
    },
    Failed(DeliveryError),
}

#[derive(Debug, Clone)]
pub struct LokiClient {
    client: reqwest::Client,
    endpoint: Url,
    credentials: Option<Credentials>,
    tenant_id: Option<String>,
    request_timeout: Duration,
    backoff: ExponentialBackoff,
}

impl LokiClient {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        LokiClient {
            client: get_client(config),
            endpoint: config.write_address.clone(),
            credentials: config.credentials.clone(),
            tenant_id: config.tenant_id.clone(),
            request_timeout: config.request_timeout,
            backoff: config.backoff,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn create_request(&self, body: Vec<u8>, timeout: Duration) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .timeout(timeout)
            .header(CONTENT_TYPE, constants::CONTENT_TYPE_PROTOBUF)
            .header(CONTENT_ENCODING, "snappy")
            .body(body);

        if let Some(tenant_id) = &self.tenant_id {
            request = request.header(constants::TENANT_HEADER, tenant_id);
        }

        match &self.credentials {
            Some(Credentials::Bearer(token)) => request.bearer_auth(token),
            Some(Credentials::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        }
    }

    async fn attempt(&self, body: &[u8], timeout: Duration) -> Attempt {
        let response = self.create_request(body.to_vec(), timeout).send().await;
        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Attempt::Delivered;
                }
                let message = read_error_message(response).await;
                if is_retryable_status(status) {
                    Attempt::Retry {
                        status: Some(status),
                        message,
                        timed_out: false,
                    }
                } else {
                    Attempt::Reject { status, message }
                }
            }
            Err(e) if e.is_builder() => Attempt::Failed(DeliveryError::Client(e.to_string())),
            Err(e) => Attempt::Retry {
                status: e.status(),
                message: error_chain(&e),
                timed_out: e.is_timeout(),
            },
        }
    }
}

#[async_trait]
impl Sink for LokiClient {
    async fn push(
        &self,
        batch: Batch,
        deadline: Option<Instant>,
    ) -> Result<PushSummary, DeliveryError> {
        if batch.is_empty() {
            debug!("PUSH | Skipping empty batch");
            return Ok(PushSummary::default());
        }

        let body = proto::encode(&batch).map_err(|e| DeliveryError::Client(e.to_string()))?;
        let mut summary = PushSummary {
            attempts: 0,
            entries: batch.len(),
            streams: batch.stream_count(),
            bytes: body.len(),
        };
        drop(batch);

        let max_attempts = self.backoff.attempts();
        loop {
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        error!(
                            "PUSH | Deadline reached before attempt {}",
                            summary.attempts + 1
                        );
                        return Err(DeliveryError::DeadlineExceeded {
                            attempts: summary.attempts,
                            message: "no time left for another attempt".to_string(),
                        });
                    }
                    remaining.min(self.request_timeout)
                }
                None => self.request_timeout,
            };

            summary.attempts += 1;
            let started = Instant::now();
            match self.attempt(&body, timeout).await {
                Attempt::Delivered => {
                    debug!(
                        "PUSH | Delivered {} entries in {} streams ({} bytes) in {} ms after {} attempts",
                        summary.entries,
                        summary.streams,
                        summary.bytes,
                        started.elapsed().as_millis(),
                        summary.attempts
                    );
                    return Ok(summary);
                }
                Attempt::Reject { status, message } => {
                    error!("PUSH | Batch rejected, not retrying: {message}");
                    return Err(DeliveryError::Permanent {
                        attempts: summary.attempts,
                        status,
                        message,
                    });
                }
                Attempt::Failed(e) => {
                    error!("PUSH | {e}");
                    return Err(e);
                }
                Attempt::Retry {
                    status,
                    message,
                    timed_out,
                } => {
                    let deadline_passed = deadline.is_some_and(|deadline| {
                        Instant::now() >= deadline || (timed_out && timeout < self.request_timeout)
                    });
                    if deadline_passed {
                        error!(
                            "PUSH | Deadline reached during attempt {}: {message}",
                            summary.attempts
                        );
                        return Err(DeliveryError::DeadlineExceeded {
                            attempts: summary.attempts,
                            message,
                        });
                    }

                    if summary.attempts >= max_attempts {
                        error!(
                            "PUSH | Failed to push batch after {} attempts: {message}",
                            summary.attempts
                        );
                        return Err(DeliveryError::Transient {
                            attempts: summary.attempts,
                            status,
                            message,
                        });
                    }

                    let delay = self.backoff.delay(summary.attempts);
                    if let Some(deadline) = deadline {
                        if Instant::now() + delay >= deadline {
                            error!(
                                "PUSH | Deadline would pass during back-off after {} attempts: {message}",
                                summary.attempts
                            );
                            return Err(DeliveryError::DeadlineExceeded {
                                attempts: summary.attempts,
                                message,
                            });
                        }
                    }

                    warn!(
                        "PUSH | Error sending batch (attempt {}), will retry in {} ms: {message}",
                        summary.attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Renders an error with every source in its chain, e.g.
/// `error sending request: operation timed out`.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Formats a non-2xx response, keeping only the first line of at most
/// [`constants::MAX_ERROR_MESSAGE_BYTES`] of its body.
async fn read_error_message(mut response: reqwest::Response) -> String {
    let status = response.status();
    let mut buf = Vec::new();
    while buf.len() < constants::MAX_ERROR_MESSAGE_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    buf.truncate(constants::MAX_ERROR_MESSAGE_BYTES);
    let text = String::from_utf8_lossy(&buf);
    let line = text.lines().next().unwrap_or_default().trim();
    format!(
        "server returned HTTP status {status} ({}): {line}",
        status.as_u16()
    )
}
