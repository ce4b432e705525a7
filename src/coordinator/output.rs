//! Finalized, not-yet-spoken output
//!
//! Entries are tagged with their turn's sequence number so a discard can pull
//! exactly that turn's chunks back out.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputItem {
    /// Speakable text
    Chunk(String),
    /// Turn output complete
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    pub seq: u64,
    pub item: OutputItem,
}

#[derive(Debug, Default)]
pub struct OutputQueue {
    entries: VecDeque<OutputEntry>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a turn's chunks followed by its end marker
    pub fn push_turn(&mut self, seq: u64, chunks: impl IntoIterator<Item = String>) {
        self.push_chunks(seq, chunks);
        self.push_end(seq);
    }

    /// Queue chunks and leave the turn's output open
    pub fn push_chunks(&mut self, seq: u64, chunks: impl IntoIterator<Item = String>) {
        for chunk in chunks {
            if !chunk.is_empty() {
                self.entries.push_back(OutputEntry {
                    seq,
                    item: OutputItem::Chunk(chunk),
                });
            }
        }
    }

    pub fn push_end(&mut self, seq: u64) {
        self.entries.push_back(OutputEntry {
            seq,
            item: OutputItem::End,
        });
    }

    /// Take the next entry for `seq`, if it is at the front
    pub fn pop_for(&mut self, seq: u64) -> Option<OutputItem> {
        match self.entries.front() {
            Some(entry) if entry.seq == seq => self.entries.pop_front().map(|e| e.item),
            _ => None,
        }
    }

    /// Remove every entry belonging to `seq`; returns whether any existed
    pub fn remove_turn(&mut self, seq: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.seq != seq);
        self.entries.len() != before
    }

    pub fn contains_turn(&self, seq: u64) -> bool {
        self.entries.iter().any(|entry| entry.seq == seq)
    }

    /// Sequence number at the front of the queue
    pub fn front_seq(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.seq)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_pop_in_order() {
        let mut queue = OutputQueue::new();
        queue.push_turn(1, vec!["a".to_string(), "b".to_string()]);

        assert_eq!(queue.pop_for(1), Some(OutputItem::Chunk("a".into())));
        assert_eq!(queue.pop_for(1), Some(OutputItem::Chunk("b".into())));
        assert_eq!(queue.pop_for(1), Some(OutputItem::End));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_only_for_front_turn() {
        let mut queue = OutputQueue::new();
        queue.push_turn(1, vec!["a".to_string()]);
        queue.push_turn(2, vec!["b".to_string()]);
        assert_eq!(queue.pop_for(2), None);
        assert_eq!(queue.front_seq(), Some(1));
    }

    #[test]
    fn test_remove_turn() {
        let mut queue = OutputQueue::new();
        queue.push_turn(1, vec!["a".to_string()]);
        queue.push_turn(2, vec!["b".to_string()]);

        assert!(queue.remove_turn(1));
        assert!(!queue.remove_turn(1));
        assert!(!queue.contains_turn(1));
        assert_eq!(queue.front_seq(), Some(2));
    }

    #[test]
    fn test_empty_turn_queues_only_end() {
        let mut queue = OutputQueue::new();
        queue.push_turn(3, Vec::new());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_for(3), Some(OutputItem::End));
    }
}
