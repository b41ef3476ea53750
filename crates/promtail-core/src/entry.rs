// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use crate::labels::LabelSet;

/// Bytes accounted per entry for its timestamp (seconds + nanos on the wire).
pub const TIMESTAMP_OVERHEAD_BYTES: usize = 16;

/// One timestamped log line tagged with the labels of its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub labels: LabelSet,
    pub timestamp: SystemTime,
    pub line: String,
}

impl Entry {
    #[must_use]
    pub fn new(labels: LabelSet, timestamp: SystemTime, line: impl Into<String>) -> Self {
        Entry {
            labels,
            timestamp,
            line: line.into(),
        }
    }

    /// Size this entry contributes to a batch, excluding its stream's labels.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.line.len() + TIMESTAMP_OVERHEAD_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_counts_line_and_timestamp() {
        let entry = Entry::new(LabelSet::from([("a", "b")]), SystemTime::UNIX_EPOCH, "hello");
        assert_eq!(entry.byte_size(), 5 + TIMESTAMP_OVERHEAD_BYTES);
    }
}
