// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults for batching and delivery.

use std::time::Duration;

/// Uncompressed bytes a batch may hold before it is flushed mid-cycle.
pub const DEFAULT_BATCH_SIZE_BYTES: usize = 131_072;

/// Entries a batch may hold before it is flushed mid-cycle.
pub const DEFAULT_BATCH_MAX_ENTRIES: usize = 10_000;

/// Per-attempt timeout for a push request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Upper bound on how much of an error response body is kept.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 1024;

pub const DEFAULT_PORT: u16 = 8080;

pub const EXTRA_LABEL_PREFIX: &str = "__extra_";

pub const USER_AGENT: &str = "lambda-promtail";
pub const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";
pub const TENANT_HEADER: &str = "X-Scope-OrgID";
