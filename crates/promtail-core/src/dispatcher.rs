// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One processing cycle: decoded records in, delivered batches out.
//!
//! A [`Dispatcher`] is built for each inbound payload and consumed by
//! [`Dispatcher::finish`] or [`Dispatcher::run`]. It never carries entries
//! from one cycle into the next. Within a cycle it flushes early whenever the
//! open batch passes the configured [`BatchLimits`](crate::batch::BatchLimits)
//! and continues with a fresh one.
//!
//! If a record fails to decode, the open batch is discarded and the error is
//! returned. Batches already flushed earlier in the same cycle stay delivered.

use std::mem;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::client::Sink;
use crate::config::Config;
use crate::entry::Entry;
use crate::errors::DispatchError;
use crate::labels::LabelSet;

/// A decoded `(labels, timestamp, line)` tuple from the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub labels: LabelSet,
    pub timestamp: SystemTime,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// An open batch is receiving entries.
    Accumulating,
    /// The batch has been handed to the sink and its outcome is pending.
    Flushing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub entries: usize,
    /// Non-empty batches delivered.
    pub batches: usize,
    pub attempts: u32,
}

pub struct Dispatcher {
    config: Arc<Config>,
    sink: Arc<dyn Sink>,
    deadline: Option<Instant>,
    batch: Batch,
    state: DispatcherState,
    summary: CycleSummary,
}

impl Dispatcher {
    /// Starts a cycle. The deadline, if any, is `invocation_timeout` from now.
    #[must_use]
    pub fn new(config: Arc<Config>, sink: Arc<dyn Sink>) -> Self {
        let deadline = config
            .invocation_timeout
            .map(|timeout| Instant::now() + timeout);
        Dispatcher {
            config,
            sink,
            deadline,
            batch: Batch::new(),
            state: DispatcherState::Accumulating,
            summary: CycleSummary::default(),
        }
    }

    /// Overrides the cycle deadline, e.g. with one imposed by the platform.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// The open batch.
    #[must_use]
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    #[must_use]
    pub fn summary(&self) -> CycleSummary {
        self.summary
    }

    /// Applies the configured extra and dropped labels, then appends the
    /// entry. Flushes when the open batch passes its limits.
    pub async fn add(
        &mut self,
        labels: LabelSet,
        timestamp: SystemTime,
        line: impl Into<String>,
    ) -> Result<(), DispatchError> {
        let mut labels = LabelSet::merge(&labels, &self.config.extra_labels);
        if !self.config.drop_labels.is_empty() {
            labels = labels.without(&self.config.drop_labels);
        }

        self.batch.add(Entry::new(labels, timestamp, line));
        self.summary.entries += 1;

        if self.batch.exceeds(&self.config.batch_limits) {
            debug!(
                "DISPATCH | Batch limits reached with {} entries ({} bytes), flushing",
                self.batch.len(),
                self.batch.byte_size()
            );
            self.flush().await?;
        }
        Ok(())
    }

    /// Hands the open batch to the sink and starts a fresh one.
    pub async fn flush(&mut self) -> Result<(), DispatchError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        self.state = DispatcherState::Flushing;
        let batch = mem::take(&mut self.batch);
        let result = self.sink.push(batch, self.deadline).await;
        self.state = DispatcherState::Accumulating;

        let pushed = result?;
        self.summary.batches += 1;
        self.summary.attempts += pushed.attempts;
        Ok(())
    }

    /// Ends the cycle, flushing whatever is still open.
    pub async fn finish(mut self) -> Result<CycleSummary, DispatchError> {
        self.flush().await?;
        debug!(
            "DISPATCH | Cycle finished: {} entries in {} batches",
            self.summary.entries, self.summary.batches
        );
        Ok(self.summary)
    }

    /// Runs a whole cycle over `records`. The first failing record aborts the
    /// cycle and discards the open batch.
    pub async fn run<I, E>(mut self, records: I) -> Result<CycleSummary, DispatchError>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: Into<DispatchError>,
    {
        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    let e = e.into();
                    if !self.batch.is_empty() {
                        warn!(
                            "DISPATCH | Discarding {} unflushed entries: {e}",
                            self.batch.len()
                        );
                    }
                    return Err(e);
                }
            };
            self.add(record.labels, record.timestamp, record.line).await?;
        }
        self.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchLimits;
    use crate::client::PushSummary;
    use crate::errors::{AuthError, DecodeError, DeliveryError};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Stream selector and lines of every stream in a pushed batch.
    type PushedBatch = Vec<(String, Vec<String>)>;

    #[derive(Default)]
    struct RecordingSink {
        pushes: Mutex<Vec<PushedBatch>>,
        deadlines: Mutex<Vec<Option<Instant>>>,
        reject: bool,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn push(
            &self,
            batch: Batch,
            deadline: Option<Instant>,
        ) -> Result<PushSummary, DeliveryError> {
            self.deadlines.lock().unwrap().push(deadline);
            if self.reject {
                return Err(DeliveryError::Permanent {
                    attempts: 1,
                    status: StatusCode::BAD_REQUEST,
                    message: "rejected".to_string(),
                });
            }
            let pushed = batch
                .sorted_streams()
                .iter()
                .map(|s| {
                    (
                        s.selector().to_string(),
                        s.entries().iter().map(|e| e.line.clone()).collect(),
                    )
                })
                .collect();
            self.pushes.lock().unwrap().push(pushed);
            Ok(PushSummary {
                attempts: 1,
                entries: batch.len(),
                streams: batch.stream_count(),
                bytes: batch.byte_size(),
            })
        }
    }

    fn config() -> Config {
        Config::new("http://localhost:3100/loki/api/v1/push".parse().unwrap())
    }

    fn record(app: &str, line: &str) -> Record {
        Record {
            labels: LabelSet::from([("app", app)]),
            timestamp: SystemTime::UNIX_EPOCH,
            line: line.to_string(),
        }
    }

    #[tokio::test]
    async fn test_two_records_two_streams_one_push() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(Arc::new(config()), sink.clone());

        let summary = dispatcher
            .run(vec![
                Ok::<_, DecodeError>(record("one", "line-a")),
                Ok(record("two", "line-b")),
            ])
            .await
            .unwrap();

        assert_eq!(
            summary,
            CycleSummary {
                entries: 2,
                batches: 1,
                attempts: 1
            }
        );
        let pushes = sink.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(
            pushes[0],
            vec![
                (r#"{app="one"}"#.to_string(), vec!["line-a".to_string()]),
                (r#"{app="two"}"#.to_string(), vec!["line-b".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn test_extra_and_dropped_labels_applied() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            extra_labels: LabelSet::from([("__extra_env", "prod"), ("app", "override")]),
            drop_labels: vec!["request_id".to_string()],
            ..config()
        };
        let mut dispatcher = Dispatcher::new(Arc::new(config), sink.clone());

        dispatcher
            .add(
                LabelSet::from([("app", "orig"), ("request_id", "r-1")]),
                SystemTime::UNIX_EPOCH,
                "line",
            )
            .await
            .unwrap();

        let (labels, _) = dispatcher.batch().streams().next().unwrap();
        assert_eq!(
            labels,
            &LabelSet::from([("__extra_env", "prod"), ("app", "override")])
        );
        assert_eq!(dispatcher.state(), DispatcherState::Accumulating);
    }

    #[tokio::test]
    async fn test_threshold_flushes_mid_cycle() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            batch_limits: BatchLimits {
                max_bytes: 1,
                ..BatchLimits::default()
            },
            ..config()
        };
        let dispatcher = Dispatcher::new(Arc::new(config), sink.clone());

        let summary = dispatcher
            .run((0..3).map(|i| Ok::<_, DecodeError>(record("a", &format!("line-{i}")))))
            .await
            .unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.entries, 3);
        assert_eq!(sink.pushes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_cycle_pushes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(Arc::new(config()), sink.clone());

        let summary = dispatcher.finish().await.unwrap();

        assert_eq!(summary, CycleSummary::default());
        assert!(sink.deadlines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decode_error_discards_open_batch() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(Arc::new(config()), sink.clone());

        let err = dispatcher
            .run(vec![
                Ok(record("a", "accepted")),
                Err(DecodeError::Record {
                    index: 1,
                    message: "Invalid byte 33, offset 0.".to_string(),
                }),
                Ok(record("a", "never seen")),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Decode(_)));
        assert!(sink.pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decode_error_keeps_earlier_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            batch_limits: BatchLimits {
                max_entries: 2,
                ..BatchLimits::default()
            },
            ..config()
        };
        let dispatcher = Dispatcher::new(Arc::new(config), sink.clone());

        let err = dispatcher
            .run(vec![
                Ok(record("a", "1")),
                Ok(record("a", "2")),
                Ok(record("a", "3")),
                Err(DecodeError::Envelope("truncated".to_string())),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Decode(DecodeError::Envelope(_))));
        let pushes = sink.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0][0].1, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_auth_error_before_any_entry() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(Arc::new(config()), sink.clone());

        let err = dispatcher
            .run(std::iter::once(Err::<Record, _>(AuthError(
                "x-amz-firehose-access-key".to_string(),
            ))))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Auth(_)));
        assert!(sink.deadlines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_error_surfaces() {
        let sink = Arc::new(RecordingSink {
            reject: true,
            ..RecordingSink::default()
        });
        let dispatcher = Dispatcher::new(Arc::new(config()), sink.clone());

        let err = dispatcher
            .run(vec![Ok::<_, DecodeError>(record("a", "x"))])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Delivery(DeliveryError::Permanent { .. })
        ));
        assert_eq!(err.to_string(), "rejected");
    }

    #[tokio::test]
    async fn test_deadline_passed_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            invocation_timeout: Some(Duration::from_secs(30)),
            ..config()
        };
        let before = Instant::now();
        let mut dispatcher = Dispatcher::new(Arc::new(config), sink.clone());
        dispatcher
            .add(LabelSet::new(), SystemTime::UNIX_EPOCH, "x")
            .await
            .unwrap();
        dispatcher.finish().await.unwrap();

        let deadline = sink.deadlines.lock().unwrap()[0].unwrap();
        assert!(deadline >= before + Duration::from_secs(30));

        let sink = Arc::new(RecordingSink::default());
        let fixed = Instant::now() + Duration::from_secs(1);
        let mut dispatcher =
            Dispatcher::new(Arc::new(self::config()), sink.clone()).with_deadline(fixed);
        dispatcher
            .add(LabelSet::new(), SystemTime::UNIX_EPOCH, "x")
            .await
            .unwrap();
        dispatcher.finish().await.unwrap();
        assert_eq!(sink.deadlines.lock().unwrap()[0], Some(fixed));
    }
}
