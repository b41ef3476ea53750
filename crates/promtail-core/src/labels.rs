// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label sets identifying the origin of a stream of log lines.
//!
//! A [`LabelSet`] is backed by an ordered map, so two sets holding the same
//! pairs compare and hash identically no matter how they were built. That
//! property is what lets a [`crate::batch::Batch`] use them as grouping keys.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Immutable mapping from label name to label value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet {
    labels: BTreeMap<String, String>,
}

impl LabelSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of `self` with `name` set to `value`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// All pairs of `base` plus all pairs of `extra`. On a name collision the
    /// value from `extra` wins.
    #[must_use]
    pub fn merge(base: &LabelSet, extra: &LabelSet) -> LabelSet {
        let mut labels = base.labels.clone();
        labels.extend(
            extra
                .labels
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        LabelSet { labels }
    }

    /// Returns a copy without the given label names.
    #[must_use]
    pub fn without<S: AsRef<str>>(&self, names: &[S]) -> LabelSet {
        let labels = self
            .labels
            .iter()
            .filter(|(name, _)| !names.iter().any(|n| n.as_ref() == name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        LabelSet { labels }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders the set as a Loki stream selector, e.g. `{app="api", env="prod"}`.
    ///
    /// Names are emitted in sorted order, values are quoted with `\`, `"` and
    /// newlines escaped.
    #[must_use]
    pub fn selector(&self) -> String {
        let mut out = String::with_capacity(2 + self.labels.len() * 16);
        out.push('{');
        for (i, (name, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(name);
            out.push_str("=\"");
            for c in value.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        out.push('}');
        out
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.selector())
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        LabelSet {
            labels: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

fn label_name_regex() -> &'static Regex {
    static LABEL_NAME: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    LABEL_NAME.get_or_init(|| {
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name pattern is valid")
    })
}

/// Whether `name` is accepted by Loki as a label name.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
    label_name_regex().is_match(name)
}
