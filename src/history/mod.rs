//! Bounded, newest-first history of received clips

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of clips retained
pub const HISTORY_CAPACITY: usize = 10;

/// A clip received from another device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    /// Client id of the sending device
    pub client: String,
    /// Plaintext contents
    pub contents: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Clip {
    pub fn new(client: impl Into<String>, contents: impl Into<String>, timestamp: i64) -> Self {
        Self {
            client: client.into(),
            contents: contents.into(),
            timestamp,
        }
    }

    /// Local time rendering for display
    pub fn received_at(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.timestamp)
            .map(|ts| {
                ts.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| self.timestamp.to_string())
    }
}

/// Fixed-capacity clip buffer; index 0 is the newest entry
#[derive(Debug, Clone)]
pub struct ClipHistory {
    entries: VecDeque<Clip>,
}

impl Default for ClipHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipHistory {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Insert at the head, returning the evicted oldest clip if full
    pub fn insert(&mut self, clip: Clip) -> Option<Clip> {
        self.entries.push_front(clip);
        if self.entries.len() > HISTORY_CAPACITY {
            self.entries.pop_back()
        } else {
            None
        }
    }

    pub fn latest(&self) -> Option<&Clip> {
        self.entries.front()
    }

    pub fn get(&self, index: usize) -> Option<&Clip> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Clip> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn to_vec(&self) -> Vec<Clip> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn clip(n: i64) -> Clip {
        Clip::new(format!("client-{}", n), format!("clip {}", n), n)
    }

    #[test]
    fn test_newest_first() {
        let mut history = ClipHistory::new();
        history.insert(clip(1));
        history.insert(clip(2));

        assert_eq!(history.latest(), Some(&clip(2)));
        assert_eq!(history.get(1), Some(&clip(1)));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let mut history = ClipHistory::new();
        for n in 0..HISTORY_CAPACITY as i64 {
            assert!(history.insert(clip(n)).is_none());
        }

        let evicted = history.insert(clip(100));
        assert_eq!(evicted, Some(clip(0)));
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.latest(), Some(&clip(100)));
        assert_eq!(history.get(HISTORY_CAPACITY - 1), Some(&clip(1)));
    }

    #[test]
    fn test_clear() {
        let mut history = ClipHistory::new();
        history.insert(clip(1));
        history.clear();
        assert!(history.is_empty());
        assert!(history.latest().is_none());
    }

    #[test]
    fn test_received_at_renders() {
        let rendered = Clip::new("a", "b", 1_700_000_000_000).received_at();
        assert!(rendered.starts_with("2023-11-1"));
    }

    proptest! {
        #[test]
        fn prop_bounded_and_ordered(timestamps in proptest::collection::vec(any::<i64>(), 0..64)) {
            let mut history = ClipHistory::new();
            for (seq, ts) in timestamps.iter().enumerate() {
                history.insert(Clip::new(seq.to_string(), "x", *ts));
                prop_assert!(history.len() <= HISTORY_CAPACITY);
            }

            // Entries come out in reverse insertion order
            let order: Vec<usize> = history.iter().map(|c| c.client.parse().unwrap()).collect();
            let expected: Vec<usize> = (0..timestamps.len()).rev().take(HISTORY_CAPACITY).collect();
            prop_assert_eq!(order, expected);
        }
    }
}
