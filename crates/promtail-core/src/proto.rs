// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loki push protocol: `logproto.PushRequest` encoded as protobuf and
//! compressed with Snappy block format.
//!
//! Message layout follows
//! https://github.com/grafana/loki/blob/main/pkg/push/push.proto

use std::hash::Hasher;

use fnv::FnvHasher;
use prost::Message;

use crate::batch::Batch;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushRequest {
    #[prost(message, repeated, tag = "1")]
    pub streams: Vec<StreamAdapter>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamAdapter {
    #[prost(string, tag = "1")]
    pub labels: String,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<EntryAdapter>,
    #[prost(uint64, tag = "3")]
    pub hash: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntryAdapter {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "2")]
    pub line: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("snappy: {0}")]
    Snappy(#[from] snap::Error),
    #[error("protobuf: {0}")]
    Decode(#[from] prost::DecodeError),
}

fn stream_hash(selector: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(selector.as_bytes());
    hasher.finish()
}

impl From<&Batch> for PushRequest {
    fn from(batch: &Batch) -> Self {
        let streams = batch
            .sorted_streams()
            .into_iter()
            .map(|stream| StreamAdapter {
                labels: stream.selector().to_string(),
                hash: stream_hash(stream.selector()),
                entries: stream
                    .entries()
                    .iter()
                    .map(|entry| EntryAdapter {
                        timestamp: Some(prost_types::Timestamp::from(entry.timestamp)),
                        line: entry.line.clone(),
                    })
                    .collect(),
            })
            .collect();
        PushRequest { streams }
    }
}

/// Serializes `batch` into a request body ready to be pushed.
pub fn encode(batch: &Batch) -> Result<Vec<u8>, ProtoError> {
    let request = PushRequest::from(batch);
    let buf = request.encode_to_vec();
    Ok(snap::raw::Encoder::new().compress_vec(&buf)?)
}

/// Inverse of [`encode`].
pub fn decode(body: &[u8]) -> Result<PushRequest, ProtoError> {
    let buf = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(PushRequest::decode(buf.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::labels::LabelSet;
    use proptest::prelude::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_encode_preserves_grouping_order_and_precision() {
        let ls1 = LabelSet::from([("app", "b")]);
        let ls2 = LabelSet::from([("app", "a")]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);

        let mut batch = Batch::new();
        batch.add(Entry::new(ls1.clone(), t0, "first"));
        batch.add(Entry::new(ls2.clone(), t0, "  untouched\ttext "));
        batch.add(Entry::new(ls1.clone(), t0 + Duration::from_millis(1), "second"));

        let request = decode(&encode(&batch).unwrap()).unwrap();

        assert_eq!(request.streams.len(), 2);
        assert_eq!(request.streams[0].labels, r#"{app="a"}"#);
        assert_eq!(request.streams[0].entries[0].line, "  untouched\ttext ");

        let b = &request.streams[1];
        assert_eq!(b.labels, r#"{app="b"}"#);
        assert_eq!(b.hash, stream_hash(r#"{app="b"}"#));
        let lines: Vec<&str> = b.entries.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["first", "second"]);

        let ts = b.entries[0].timestamp.clone().unwrap();
        assert_eq!(ts.seconds, 1_700_000_000);
        assert_eq!(ts.nanos, 123_456_789);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut batch = Batch::new();
        for i in 0..20 {
            batch.add(Entry::new(
                LabelSet::from([("app", format!("app-{i}"))]),
                SystemTime::UNIX_EPOCH,
                "line",
            ));
        }
        assert_eq!(encode(&batch).unwrap(), encode(&batch).unwrap());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(&[0xff; 12]).is_err());
    }

    proptest! {
        #[test]
        fn prop_stream_order_survives_encoding(
            entries in proptest::collection::vec((0u8..3, 0u64..1_000, 0u32..1_000_000_000), 1..64)
        ) {
            let mut batch = Batch::new();
            for (i, (app, secs, nanos)) in entries.iter().enumerate() {
                batch.add(Entry::new(
                    LabelSet::from([("app", app.to_string())]),
                    SystemTime::UNIX_EPOCH + Duration::new(*secs, *nanos),
                    format!("line-{i}"),
                ));
            }

            let request = decode(&encode(&batch).unwrap()).unwrap();
            prop_assert_eq!(request.streams.len(), batch.stream_count());

            for (pushed, stream) in request.streams.iter().zip(batch.sorted_streams()) {
                prop_assert_eq!(&pushed.labels, stream.selector());
                let lines: Vec<&str> = pushed.entries.iter().map(|e| e.line.as_str()).collect();
                let expected: Vec<&str> = stream.entries().iter().map(|e| e.line.as_str()).collect();
                prop_assert_eq!(lines, expected);

                let timestamps: Vec<(i64, i32)> = pushed
                    .entries
                    .iter()
                    .map(|e| {
                        let ts = e.timestamp.clone().unwrap();
                        (ts.seconds, ts.nanos)
                    })
                    .collect();
                prop_assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }
}
