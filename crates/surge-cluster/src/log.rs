//! # Replication Log
//!
//! In-memory Raft log. Indices start at 1; index 0 with term 0 is the empty
//! prefix every log agrees on. Pruning drops applied entries from the front
//! and remembers the last dropped (index, term) as the log's base.
//!
//! ```text
//!   base ─┐ ┌──────── entries ────────┐
//!         ▼ ▼                         ▼
//!   [pruned] 17 18 19 20 21 22 23 24 25
//!                  ▲        ▲        ▲
//!              applied   commit     last
//! ```

use std::collections::VecDeque;

use surge_core::EntryId;

use crate::message::{Command, LogEntry};

#[derive(Debug, Default)]
pub struct Log {
    entries: VecDeque<LogEntry>,
    base_index: u64,
    base_term: u64,
    commit: u64,
    applied: u64,
}

/// Result of offering a follower the leader's entries
#[derive(Debug, PartialEq, Eq)]
pub enum Accept {
    /// Log now matches the leader through `last`
    Matched { last: u64 },
    /// `prev_index`/`prev_term` did not match; retry from below `hint`
    Mismatch { hint: u64 },
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.back().map_or(self.base_index, |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.back().map_or(self.base_term, |e| e.term)
    }

    pub fn base(&self) -> (u64, u64) {
        (self.base_index, self.base_term)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit
    }

    pub fn applied_index(&self) -> u64 {
        self.applied
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`, when it is still known
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.base_index {
            return None;
        }
        self.entries.get((index - self.base_index - 1) as usize)
    }

    /// Leader-side append at `last_index + 1`
    pub fn append(&mut self, term: u64, id: EntryId, created_ms: u64, command: Command) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push_back(LogEntry {
            index,
            term,
            id,
            created_ms,
            command,
        });
        index
    }

    /// Up to `max` entries starting at `from`
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let start = from.max(self.base_index + 1);
        let skip = (start - self.base_index - 1) as usize;
        self.entries.iter().skip(skip).take(max).cloned().collect()
    }

    /// Follower-side consistency check and append.
    ///
    /// A conflicting suffix is truncated, but never below the commit index.
    pub fn accept(&mut self, prev_index: u64, prev_term: u64, entries: Vec<LogEntry>) -> Accept {
        match self.term_at(prev_index) {
            Some(term) if term == prev_term => {}
            Some(_) => return Accept::Mismatch { hint: prev_index.saturating_sub(1) },
            None if prev_index < self.base_index => {
                // Already pruned here, so already committed and identical.
            }
            None => return Accept::Mismatch { hint: self.last_index() },
        }

        let mut last = prev_index;
        for entry in entries {
            last = entry.index;
            if entry.index <= self.base_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit {
                        tracing::error!(
                            index = entry.index,
                            "refusing to overwrite a committed entry"
                        );
                        return Accept::Mismatch { hint: self.commit };
                    }
                    self.truncate_from(entry.index);
                }
                None => {}
            }
            self.entries.push_back(entry);
        }
        Accept::Matched { last }
    }

    fn truncate_from(&mut self, index: u64) {
        let keep = (index - self.base_index - 1) as usize;
        self.entries.truncate(keep);
    }

    /// Drop everything and restart at `(index, term)`, for followers that
    /// fell behind the leader's pruned base
    pub fn rebase(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.base_index = index;
        self.base_term = term;
        self.commit = index;
        self.applied = index;
    }

    /// Raise the commit index; never moves backwards or past the last entry
    pub fn commit_to(&mut self, index: u64) -> bool {
        let target = index.min(self.last_index());
        if target > self.commit {
            self.commit = target;
            return true;
        }
        false
    }

    /// Committed entries not yet handed out, marking them applied
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let from = self.applied + 1;
        let count = self.commit.saturating_sub(self.applied) as usize;
        let out = self.entries_from(from, count);
        self.applied = self.commit;
        out
    }

    /// Drop applied entries older than `cutoff_ms`, at most `max_count`.
    /// Returns how many were removed.
    pub fn prune(&mut self, cutoff_ms: u64, max_count: usize) -> usize {
        let mut removed = 0;
        while removed < max_count {
            match self.entries.front() {
                Some(e) if e.index <= self.applied && e.created_ms < cutoff_ms => {
                    self.base_index = e.index;
                    self.base_term = e.term;
                    self.entries.pop_front();
                    removed += 1;
                }
                _ => break,
            }
        }
        removed
    }

    /// Committed entries still held, in index order
    pub fn committed(&self) -> Vec<LogEntry> {
        self.entries
            .iter()
            .take_while(|e| e.index <= self.commit)
            .cloned()
            .collect()
    }

    /// Reload entries known to be committed and applied elsewhere
    pub fn restore(&mut self, entries: Vec<LogEntry>) {
        self.entries.clear();
        let Some(first) = entries.first() else {
            return;
        };
        self.base_index = first.index.saturating_sub(1);
        self.base_term = 0;
        self.entries.extend(entries);
        self.commit = self.last_index();
        self.applied = self.commit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            id: EntryId::compose(index, 1, 0),
            created_ms: index * 10,
            command: Command::Noop,
        }
    }

    fn log_with(terms: &[u64]) -> Log {
        let mut log = Log::new();
        for (i, term) in terms.iter().enumerate() {
            let id = EntryId::compose(i as u64, 1, 0);
            log.append(*term, id, (i as u64 + 1) * 10, Command::Noop);
        }
        log
    }

    #[test]
    fn test_empty_log() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert!(log.get(1).is_none());
    }

    #[test]
    fn test_append_and_read() {
        let log = log_with(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(2), Some(1));
        let tail: Vec<u64> = log.entries_from(2, 10).iter().map(|e| e.index).collect();
        assert_eq!(tail, vec![2, 3]);
    }

    #[test]
    fn test_accept_rejects_gap() {
        let mut log = log_with(&[1]);
        let verdict = log.accept(3, 1, vec![entry(4, 1)]);
        assert_eq!(verdict, Accept::Mismatch { hint: 1 });
    }

    #[test]
    fn test_accept_truncates_conflicts() {
        let mut log = log_with(&[1, 1, 1]);
        log.commit_to(1);
        let verdict = log.accept(1, 1, vec![entry(2, 2)]);
        assert_eq!(verdict, Accept::Matched { last: 2 });
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(2));
    }

    #[test]
    fn test_accept_is_idempotent() {
        let mut log = log_with(&[1, 1]);
        let verdict = log.accept(0, 0, vec![entry(1, 1), entry(2, 1)]);
        assert_eq!(verdict, Accept::Matched { last: 2 });
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_committed_entries_are_never_overwritten() {
        let mut log = log_with(&[1, 1]);
        log.commit_to(2);
        let verdict = log.accept(1, 1, vec![entry(2, 3)]);
        assert_eq!(verdict, Accept::Mismatch { hint: 2 });
        assert_eq!(log.term_at(2), Some(1));
    }

    #[test]
    fn test_take_committed_once() {
        let mut log = log_with(&[1, 1, 1]);
        assert!(log.commit_to(2));
        assert!(!log.commit_to(1));
        let first: Vec<u64> = log.take_committed().iter().map(|e| e.index).collect();
        assert_eq!(first, vec![1, 2]);
        assert!(log.take_committed().is_empty());
        log.commit_to(99);
        assert_eq!(log.commit_index(), 3);
        assert_eq!(log.take_committed().len(), 1);
    }

    #[test]
    fn test_prune_respects_age_count_and_applied() {
        let mut log = log_with(&[1, 1, 1, 2, 2]);
        log.commit_to(4);
        log.take_committed();
        // created_ms = 10, 20, 30, 40, 50
        assert_eq!(log.prune(35, 2), 2);
        assert_eq!(log.base(), (2, 1));
        assert_eq!(log.prune(35, 10), 1);
        assert_eq!(log.prune(1_000, 10), 1);
        assert_eq!(log.base(), (4, 2));
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_at(4), Some(2));
        assert!(log.get(4).is_none());
    }

    #[test]
    fn test_accept_below_pruned_base() {
        let mut log = log_with(&[1, 1, 1]);
        log.commit_to(3);
        log.take_committed();
        log.prune(u64::MAX, 10);
        let verdict = log.accept(1, 1, vec![entry(2, 1), entry(3, 1), entry(4, 1)]);
        assert_eq!(verdict, Accept::Matched { last: 4 });
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_rebase_and_restore() {
        let mut log = log_with(&[1]);
        log.rebase(10, 3);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.term_at(10), Some(3));
        assert_eq!(
            log.accept(10, 3, vec![entry(11, 3)]),
            Accept::Matched { last: 11 }
        );

        let mut restored = Log::new();
        restored.restore(vec![entry(5, 2), entry(6, 2)]);
        assert_eq!(restored.commit_index(), 6);
        assert_eq!(restored.applied_index(), 6);
        assert!(restored.take_committed().is_empty());
        assert_eq!(restored.committed().len(), 2);
    }

    proptest! {
        #[test]
        fn prop_commit_is_monotone(steps in proptest::collection::vec(0u64..20, 1..30)) {
            let mut log = log_with(&[1; 10]);
            let mut last = 0;
            for step in steps {
                log.commit_to(step);
                prop_assert!(log.commit_index() >= last);
                prop_assert!(log.commit_index() <= log.last_index());
                last = log.commit_index();
            }
        }
    }
}
