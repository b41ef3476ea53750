// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Promtail Core
//!
//! Batch accumulation and delivery of log entries to a Loki push endpoint.
//!
//! Decoded records are grouped into per-label-set streams inside a
//! [`batch::Batch`], encoded as snappy-compressed protobuf and pushed by a
//! [`client::LokiClient`] with bounded exponential retry. A
//! [`dispatcher::Dispatcher`] drives one processing cycle, flushing early
//! whenever the open batch passes its limits. [`firehose`] adapts Kinesis
//! Data Firehose deliveries into dispatch cycles.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]

pub mod backoff;
pub mod batch;
pub mod client;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod entry;
pub mod errors;
pub mod firehose;
pub mod http;
pub mod labels;
pub mod proto;
