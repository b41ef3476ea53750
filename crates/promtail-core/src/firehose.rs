// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Kinesis Data Firehose HTTP endpoint delivery.
//!
//! Firehose POSTs a JSON envelope whose records carry base64 data. Every
//! record becomes one entry stamped with the envelope timestamp and labeled
//! with the delivery stream's source ARN and the request id. The response
//! echoes the request id and timestamp and carries an error message when
//! the delivery failed.
//!
//! See https://docs.aws.amazon.com/firehose/latest/dev/httpdeliveryrequestresponse.html

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::Engine;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::client::Sink;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Record};
use crate::errors::{AuthError, DecodeError, DispatchError};
use crate::labels::LabelSet;

pub const ACCESS_KEY_HEADER: &str = "x-amz-firehose-access-key";
pub const SOURCE_ARN_HEADER: &str = "x-amz-firehose-source-arn";

pub const LOG_TYPE_LABEL: &str = "__aws_log_type";
pub const SOURCE_ARN_LABEL: &str = "__aws_kinesis_firehose_source_arn";
pub const REQUEST_ID_LABEL: &str = "__aws_kinesis_firehose_request_id";
const LOG_TYPE: &str = "kinesis_delivery_stream";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseRequest {
    #[serde(default)]
    pub request_id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub records: Vec<FirehoseRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirehoseRecord {
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseResponse {
    pub request_id: String,
    pub timestamp: i64,
    pub error_message: String,
}

impl FirehoseResponse {
    #[must_use]
    pub fn to_json(&self) -> String {
        // Serializing plain strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn parse_request(body: &[u8]) -> Result<FirehoseRequest, DecodeError> {
    serde_json::from_slice(body).map_err(|e| DecodeError::Envelope(e.to_string()))
}

/// Checks the caller's access key. Unchecked when no key is configured.
pub fn authorize(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AuthError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = headers
        .get(ACCESS_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(AuthError(ACCESS_KEY_HEADER.to_string()))
    }
}

fn envelope_time(millis: i64) -> Result<SystemTime, DecodeError> {
    let offset = Duration::from_millis(millis.unsigned_abs());
    let time = if millis >= 0 {
        SystemTime::UNIX_EPOCH.checked_add(offset)
    } else {
        SystemTime::UNIX_EPOCH.checked_sub(offset)
    };
    time.ok_or_else(|| DecodeError::Envelope(format!("timestamp {millis} out of range")))
}

/// Decodes the envelope's records lazily, in order. Decoding stops being
/// useful at the first error; callers are expected to abort there.
pub fn records<'a>(
    request: &'a FirehoseRequest,
    source_arn: &str,
) -> impl Iterator<Item = Result<Record, DecodeError>> + 'a {
    let labels = LabelSet::new()
        .with(LOG_TYPE_LABEL, LOG_TYPE)
        .with(SOURCE_ARN_LABEL, source_arn)
        .with(REQUEST_ID_LABEL, request.request_id.as_str());
    let timestamp = envelope_time(request.timestamp);

    request
        .records
        .iter()
        .enumerate()
        .map(move |(index, record)| {
            let timestamp = timestamp.clone()?;
            let data = base64::engine::general_purpose::STANDARD
                .decode(record.data.as_bytes())
                .map_err(|e| DecodeError::Record {
                    index,
                    message: e.to_string(),
                })?;
            let line = String::from_utf8(data).map_err(|_| DecodeError::Record {
                index,
                message: "data is not valid UTF-8".to_string(),
            })?;
            Ok(Record {
                labels: labels.clone(),
                timestamp,
                line,
            })
        })
}

#[must_use]
pub fn status_for(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::Decode(_) => StatusCode::BAD_REQUEST,
        DispatchError::Auth(_) => StatusCode::UNAUTHORIZED,
        DispatchError::Delivery(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Runs one dispatch cycle for a Firehose delivery and builds the reply.
pub async fn handle(
    config: Arc<Config>,
    sink: Arc<dyn Sink>,
    headers: &HeaderMap,
    body: &[u8],
) -> (StatusCode, FirehoseResponse) {
    if let Err(e) = authorize(headers, config.firehose_access_key.as_deref()) {
        // Echo the envelope identity when the body happens to be readable.
        let mut response = parse_request(body)
            .map(|request| FirehoseResponse {
                request_id: request.request_id,
                timestamp: request.timestamp,
                error_message: String::new(),
            })
            .unwrap_or_default();
        error!("FIREHOSE | Request {} rejected: {e}", response.request_id);
        response.error_message = e.to_string();
        return (StatusCode::UNAUTHORIZED, response);
    }

    let request = match parse_request(body) {
        Ok(request) => request,
        Err(e) => {
            error!("FIREHOSE | {e}");
            let response = FirehoseResponse {
                error_message: e.to_string(),
                ..FirehoseResponse::default()
            };
            return (StatusCode::BAD_REQUEST, response);
        }
    };

    let mut response = FirehoseResponse {
        request_id: request.request_id.clone(),
        timestamp: request.timestamp,
        error_message: String::new(),
    };

    let source_arn = headers
        .get(SOURCE_ARN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let result = Dispatcher::new(config, sink)
        .run(records(&request, source_arn))
        .await;

    match result {
        Ok(summary) => {
            debug!(
                "FIREHOSE | Request {} forwarded {} records in {} batches",
                response.request_id, summary.entries, summary.batches
            );
            (StatusCode::OK, response)
        }
        Err(e) => {
            error!("FIREHOSE | Request {} failed: {e}", response.request_id);
            response.error_message = e.to_string();
            (status_for(&e), response)
        }
    }
}
