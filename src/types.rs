//! Core types for the change feed client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an entry in a database's change log.
///
/// Sequences are:
/// - Opaque: only comparison is meaningful, never arithmetic
/// - Non-decreasing along a feed
/// - Usable as a resume token (`since`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// The start of the change log.
    pub const ZERO: Sequence = Sequence(0);

    /// Create a sequence from the server-assigned value.
    pub const fn new(value: u64) -> Self {
        Sequence(value)
    }

    /// Get the raw value, e.g. for persisting a checkpoint.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Convert to query parameter value
    pub fn to_query_value(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Sequence(value)
    }
}

/// An opaque revision marker listed in a change's `changes` array.
///
/// Only the winning revision is present unless conflicts were requested
/// with [`ChangeOptions::conflicts`](crate::ChangeOptions::conflicts).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub rev: String,
}

impl Revision {
    pub fn new(rev: impl Into<String>) -> Self {
        Revision { rev: rev.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.rev
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rev)
    }
}

/// Feed type requested from the `_changes` endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum FeedMode {
    /// Return everything since `since` and close the response
    #[default]
    Normal,
    /// Hold the response open until at least one change is available
    LongPoll,
    /// Keep the response open and stream one change per line
    Continuous,
}

impl FeedMode {
    /// Convert to query parameter value
    pub(crate) fn to_query_value(self) -> &'static str {
        match self {
            FeedMode::Normal => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }

    /// Whether the server holds the response open waiting for changes
    pub(crate) fn waits_for_changes(self) -> bool {
        matches!(self, FeedMode::LongPoll | FeedMode::Continuous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_orders_by_value() {
        let mut seqs = vec![Sequence::new(12), Sequence::new(3), Sequence::ZERO];
        seqs.sort();
        assert_eq!(seqs, vec![Sequence::ZERO, Sequence::new(3), Sequence::new(12)]);
        assert_eq!(Sequence::new(42).to_query_value(), "42");
    }

    #[test]
    fn test_sequence_is_a_bare_json_integer() {
        let seq: Sequence = serde_json::from_str("17").unwrap();
        assert_eq!(seq.value(), 17);
        assert_eq!(serde_json::to_string(&seq).unwrap(), "17");
    }

    #[test]
    fn test_feed_mode_query_values() {
        assert_eq!(FeedMode::default().to_query_value(), "normal");
        assert_eq!(FeedMode::LongPoll.to_query_value(), "longpoll");
        assert!(FeedMode::Continuous.waits_for_changes());
        assert!(FeedMode::LongPoll.waits_for_changes());
        assert!(!FeedMode::Normal.waits_for_changes());
    }
}
