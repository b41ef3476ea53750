// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accumulation of entries into per-label streams.
//!
//! A [`Batch`] groups entries by their [`LabelSet`] and keeps a running byte
//! count so threshold checks never need to serialize. Each stream is kept in
//! non-decreasing timestamp order: an entry that arrives older than the tail
//! of its stream is inserted after every entry with a timestamp less than or
//! equal to its own, so equal timestamps keep their arrival order.

use std::hash::BuildHasherDefault;
use std::time::{Duration, Instant};

use fnv::FnvHasher;
use hashbrown::hash_map::{Entry as MapEntry, HashMap};
use tracing::debug;

use crate::constants;
use crate::entry::Entry;
use crate::labels::LabelSet;

/// Thresholds past which a batch is flushed before the cycle ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_bytes: usize,
    pub max_entries: usize,
    pub max_age: Option<Duration>,
}

impl Default for BatchLimits {
    fn default() -> Self {
        BatchLimits {
            max_bytes: constants::DEFAULT_BATCH_SIZE_BYTES,
            max_entries: constants::DEFAULT_BATCH_MAX_ENTRIES,
            max_age: None,
        }
    }
}

/// The ordered entries sharing one label set. The label set itself is the
/// key the stream is stored under in its [`Batch`].
#[derive(Debug, Clone)]
pub struct Stream {
    selector: String,
    entries: Vec<Entry>,
}

impl Stream {
    fn new(labels: &LabelSet) -> Self {
        Stream {
            selector: labels.selector(),
            entries: Vec::new(),
        }
    }

    /// The rendered selector, e.g. `{app="api"}`.
    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Returns true when the entry had to be moved ahead of the tail.
    fn push(&mut self, entry: Entry) -> bool {
        let in_order = self
            .entries
            .last()
            .map_or(true, |last| last.timestamp <= entry.timestamp);
        if in_order {
            self.entries.push(entry);
            return false;
        }
        let idx = self
            .entries
            .partition_point(|e| e.timestamp <= entry.timestamp);
        self.entries.insert(idx, entry);
        true
    }
}

#[derive(Debug)]
pub struct Batch {
    streams: HashMap<LabelSet, Stream, BuildHasherDefault<FnvHasher>>,
    byte_size: usize,
    entries: usize,
    reordered: usize,
    created_at: Instant,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Batch {
            streams: HashMap::default(),
            byte_size: 0,
            entries: 0,
            reordered: 0,
            created_at: Instant::now(),
        }
    }

    /// Appends `entry` to the stream for its labels, creating the stream if
    /// needed. A new stream accounts for its rendered selector once.
    pub fn add(&mut self, entry: Entry) {
        let stream = match self.streams.entry(entry.labels.clone()) {
            MapEntry::Occupied(occupied) => occupied.into_mut(),
            MapEntry::Vacant(vacant) => {
                let stream = Stream::new(vacant.key());
                self.byte_size += stream.selector.len();
                vacant.insert(stream)
            }
        };

        self.byte_size += entry.byte_size();
        self.entries += 1;
        if stream.push(entry) {
            self.reordered += 1;
            debug!(
                "Out-of-order entry for stream {}, reordered on insert",
                stream.selector
            );
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of entries across all streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Entries that arrived older than the tail of their stream.
    #[must_use]
    pub fn reordered(&self) -> usize {
        self.reordered
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn stream(&self, labels: &LabelSet) -> Option<&Stream> {
        self.streams.get(labels)
    }

    /// Each stream with the label set it groups.
    pub fn streams(&self) -> impl Iterator<Item = (&LabelSet, &Stream)> {
        self.streams.iter()
    }

    /// Streams ordered by selector, so repeated encodings are identical.
    #[must_use]
    pub fn sorted_streams(&self) -> Vec<&Stream> {
        let mut streams: Vec<&Stream> = self.streams.values().collect();
        streams.sort_by(|a, b| a.selector.cmp(&b.selector));
        streams
    }

    /// Whether any of `limits` has been passed.
    #[must_use]
    pub fn exceeds(&self, limits: &BatchLimits) -> bool {
        self.byte_size > limits.max_bytes
            || self.entries >= limits.max_entries
            || limits.max_age.is_some_and(|max_age| self.age() >= max_age)
    }
}
