//! Log sequence ids and reader cursors.
//!
//! Ids use the Redis stream layout `<millis>-<seq>`, so a local log and a
//! Redis log order entries the same way and hand out interchangeable cursors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// A monotonically increasing log entry id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SequenceId {
    pub millis: u64,
    pub seq: u64,
}

impl SequenceId {
    /// Sorts before every id a log can assign.
    pub const ZERO: SequenceId = SequenceId { millis: 0, seq: 0 };

    #[must_use]
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The id a log assigns to its next entry, given its last id and the clock.
    #[must_use]
    pub fn next_after(last: SequenceId, now_millis: u64) -> Self {
        if now_millis > last.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(last.millis, last.seq + 1)
        }
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for SequenceId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CacheError::InvalidSequenceId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl From<SequenceId> for String {
    fn from(id: SequenceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SequenceId {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A reader's position in a log. Reads return entries strictly after it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCursor {
    pub last_seen: SequenceId,
}

impl CacheCursor {
    /// A cursor before the first entry.
    #[must_use]
    pub const fn start() -> Self {
        Self {
            last_seen: SequenceId::ZERO,
        }
    }

    #[must_use]
    pub const fn after(last_seen: SequenceId) -> Self {
        Self { last_seen }
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: SequenceId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, SequenceId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!("42".parse::<SequenceId>().unwrap(), SequenceId::new(42, 0));
        assert!("abc-1".parse::<SequenceId>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(SequenceId::new(1, 9) < SequenceId::new(2, 0));
        assert!(SequenceId::new(2, 0) < SequenceId::new(2, 1));
        assert!(SequenceId::ZERO < SequenceId::new(0, 1));
    }

    #[test]
    fn test_next_after_is_monotonic() {
        let last = SequenceId::new(100, 4);
        assert_eq!(SequenceId::next_after(last, 100), SequenceId::new(100, 5));
        assert_eq!(SequenceId::next_after(last, 90), SequenceId::new(100, 5));
        assert_eq!(SequenceId::next_after(last, 101), SequenceId::new(101, 0));
    }

    #[test]
    fn test_cursor_serializes_id_as_string() {
        let cursor = CacheCursor::after(SequenceId::new(5, 1));
        let json = serde_json::to_string(&cursor).unwrap();
        assert_eq!(json, r#"{"last_seen":"5-1"}"#);
        let back: CacheCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cursor);
    }
}
