//! The ordered sequence of waiting entries.
//!
//! Entries are kept sorted by descending priority. Entries of equal priority
//! keep their insertion order: a new entry always lands after every existing
//! entry of the same priority.

use std::collections::VecDeque;
use std::fmt;

use super::task::Job;

pub(crate) struct QueueEntry {
    pub(crate) id: Option<String>,
    pub(crate) tag: Option<String>,
    pub(crate) priority: i64,
    /// Monotonic insertion number, used to find the most recent entry of a tag.
    pub(crate) seq: u64,
    pub(crate) run: Job,
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct OrderedSequence {
    entries: VecDeque<QueueEntry>,
}

impl OrderedSequence {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, entry: QueueEntry) {
        match self.entries.back() {
            // Binary search for the first slot whose priority is strictly lower.
            Some(tail) if tail.priority < entry.priority => {
                let index = self
                    .entries
                    .partition_point(|queued| queued.priority >= entry.priority);
                self.entries.insert(index, entry);
            }
            // Tail already ranks at least as high: appending keeps the order.
            _ => self.entries.push_back(entry),
        }
    }

    /// Remove the next entry to run.
    ///
    /// With a steering tag, the most recently inserted entry carrying that tag
    /// wins regardless of priority. When no entry carries the tag the tag is
    /// cleared and the head of the sequence is taken.
    pub(crate) fn select(&mut self, active_tag: &mut Option<String>) -> Option<QueueEntry> {
        if let Some(tag) = active_tag.as_deref() {
            let newest = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.tag.as_deref() == Some(tag))
                .max_by_key(|(_, entry)| entry.seq)
                .map(|(index, _)| index);

            match newest {
                Some(index) => return self.entries.remove(index),
                None => *active_tag = None,
            }
        }

        self.entries.pop_front()
    }

    pub(crate) fn contains_id(&self, id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.id.as_deref() == Some(id))
    }

    pub(crate) fn remove_id(&mut self, id: &str) -> Option<QueueEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id.as_deref() == Some(id))?;
        self.entries.remove(index)
    }

    pub(crate) fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn entry(label: &str, priority: i64, tag: Option<&str>, seq: u64) -> QueueEntry {
        QueueEntry {
            id: Some(label.to_string()),
            tag: tag.map(str::to_string),
            priority,
            seq,
            run: Box::new(|| async {}.boxed()),
        }
    }

    fn drain_order(sequence: &mut OrderedSequence, tag: &mut Option<String>) -> Vec<String> {
        std::iter::from_fn(|| sequence.select(tag))
            .filter_map(|entry| entry.id)
            .collect()
    }

    #[test]
    fn higher_priority_is_selected_first() {
        let mut sequence = OrderedSequence::default();
        sequence.insert(entry("a", 0, None, 0));
        sequence.insert(entry("b", 1, None, 1));
        sequence.insert(entry("c", 2, None, 2));

        assert_eq!(drain_order(&mut sequence, &mut None), ["c", "b", "a"]);
    }

    #[test]
    fn equal_priorities_keep_insertion_order() {
        let mut sequence = OrderedSequence::default();
        sequence.insert(entry("a", 1, None, 0));
        sequence.insert(entry("b", 5, None, 1));
        sequence.insert(entry("c", 1, None, 2));
        sequence.insert(entry("d", 5, None, 3));
        sequence.insert(entry("e", 1, None, 4));

        assert_eq!(
            drain_order(&mut sequence, &mut None),
            ["b", "d", "a", "c", "e"]
        );
    }

    #[test]
    fn negative_priorities_sort_below_default() {
        let mut sequence = OrderedSequence::default();
        sequence.insert(entry("low", i64::MIN + 1, None, 0));
        sequence.insert(entry("default", 0, None, 1));
        sequence.insert(entry("lower", -5, None, 2));

        assert_eq!(
            drain_order(&mut sequence, &mut None),
            ["default", "lower", "low"]
        );
    }

    #[test]
    fn active_tag_takes_most_recent_tagged_entry() {
        let mut sequence = OrderedSequence::default();
        sequence.insert(entry("a", 0, Some("high"), 0));
        sequence.insert(entry("b", 9, None, 1));
        sequence.insert(entry("c", 0, Some("high"), 2));
        sequence.insert(entry("d", 5, Some("high"), 3));
        sequence.insert(entry("e", 9, Some("high"), 4));
        sequence.insert(entry("f", 1, Some("high"), 5));

        let mut tag = Some("high".to_string());
        let first = sequence.select(&mut tag).and_then(|entry| entry.id);
        assert_eq!(first.as_deref(), Some("f"));
        assert_eq!(tag.as_deref(), Some("high"));
    }

    #[test]
    fn active_tag_clears_once_exhausted() {
        let mut sequence = OrderedSequence::default();
        sequence.insert(entry("a", 0, Some("high"), 0));
        sequence.insert(entry("b", 1, None, 1));
        sequence.insert(entry("c", 0, Some("high"), 2));
        sequence.insert(entry("d", 2, Some("low"), 3));

        let mut tag = Some("high".to_string());
        assert_eq!(drain_order(&mut sequence, &mut tag), ["c", "a", "d", "b"]);
        assert!(tag.is_none());
    }

    #[test]
    fn remove_id_takes_entry_out_of_sequence() {
        let mut sequence = OrderedSequence::default();
        sequence.insert(entry("a", 0, None, 0));
        sequence.insert(entry("b", 0, None, 1));

        assert!(sequence.contains_id("b"));
        let removed = sequence.remove_id("b").and_then(|entry| entry.id);
        assert_eq!(removed.as_deref(), Some("b"));
        assert!(!sequence.contains_id("b"));
        assert!(sequence.remove_id("missing").is_none());
        assert_eq!(sequence.len(), 1);
    }
}
