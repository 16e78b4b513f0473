//! Repository metadata attached to document responses.

use std::collections::BTreeSet;

/// Unordered set of (key, value) string pairs.
///
/// Duplicate pairs collapse; the same key may carry several values.
/// Iteration order is deterministic (lexicographic) so feed output and
/// response headers are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeSet<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one pair. Both key and value may be empty strings but are
    /// always present.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert((key.into(), value.into()));
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
