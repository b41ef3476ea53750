// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// A record from the ingestion boundary could not be turned into an entry.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid request body: {0}")]
    Envelope(String),
    #[error("record {index}: {message}")]
    Record { index: usize, message: String },
}

/// The caller presented a credential that does not match the configured one.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{0} unauthorized")]
pub struct AuthError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Retryable failures that persisted through every attempt.
    #[error("push failed after {attempts} attempts: {message}")]
    Transient {
        attempts: u32,
        status: Option<StatusCode>,
        message: String,
    },
    /// The sink rejected the payload; retrying would not help.
    #[error("{message}")]
    Permanent {
        attempts: u32,
        status: StatusCode,
        message: String,
    },
    #[error("deadline exceeded after {attempts} attempts: {message}")]
    DeadlineExceeded { attempts: u32, message: String },
    /// The request could not be built or the payload could not be encoded.
    #[error("failed to prepare push request: {0}")]
    Client(String),
}

impl DeliveryError {
    /// Status of the last response, if one was received.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Transient { status, .. } => *status,
            Self::Permanent { status, .. } => Some(*status),
            Self::DeadlineExceeded { .. } | Self::Client(_) => None,
        }
    }

    /// Attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transient { attempts, .. }
            | Self::Permanent { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. } => *attempts,
            Self::Client(_) => 0,
        }
    }
}

/// Whether a response status is worth another attempt: rate limiting or a
/// server-side failure.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Everything a dispatch cycle can surface to the ingestion boundary.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} is invalid: {message}")]
    Invalid { name: &'static str, message: String },
}
