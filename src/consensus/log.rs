//! In-memory replicated log
//!
//! 1-indexed: `entries[i]` holds index `i + 1`. Index 0 is the empty prefix
//! with term 0. Only the suffix above the commit index may be rewritten.

use super::message::LogEntry;
use crate::common::{Error, Result};

/// Result of matching a leader's append against the local log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// `prev_log_index`/`prev_log_term` did not match
    Mismatch { conflict_index: u64 },
    Appended {
        /// Last index covered by the request
        match_index: u64,
        /// Suffix dropped because it conflicted with the leader
        truncated_from: Option<u64>,
        /// Entries that were actually new
        appended: Vec<LogEntry>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, which must be contiguous from index 1
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self> {
        for (pos, entry) in entries.iter().enumerate() {
            if entry.index != pos as u64 + 1 {
                return Err(Error::Raft(format!(
                    "log gap: expected index {}, found {}",
                    pos + 1,
                    entry.index
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.term)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Up to `max` entries starting at `from`
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    /// Entries in `from..=to`
    pub fn slice(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if to < from {
            return Vec::new();
        }
        self.entries_from(from, (to - from + 1) as usize)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Leader-side append of a fresh entry at the next index
    pub fn append(&mut self, term: u64, body: LogEntryBody) -> LogEntry {
        let index = self.last_index() + 1;
        let entry = match body {
            LogEntryBody::Noop => LogEntry::noop(term, index),
            LogEntryBody::Command(data) => LogEntry::command(term, index, data),
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Whether a candidate log ending at (`last_term`, `last_index`) is at
    /// least as up to date as ours
    pub fn is_up_to_date(&self, last_term: u64, last_index: u64) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }

    /// Follower-side append
    ///
    /// Entries already present with the same term are kept; the first entry
    /// whose term differs truncates the local suffix from its index. Rewriting
    /// anything at or below `commit_index` is refused.
    pub fn try_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    ) -> Result<AppendOutcome> {
        match self.term_at(prev_index) {
            Some(term) if term == prev_term => {}
            Some(term) => {
                // skip back over the whole conflicting term
                let mut conflict_index = prev_index;
                while conflict_index > 1 && self.term_at(conflict_index - 1) == Some(term) {
                    conflict_index -= 1;
                }
                return Ok(AppendOutcome::Mismatch {
                    conflict_index: conflict_index.max(commit_index + 1),
                });
            }
            None => {
                return Ok(AppendOutcome::Mismatch {
                    conflict_index: self.last_index() + 1,
                });
            }
        }

        let match_index = prev_index + entries.len() as u64;
        let mut truncated_from = None;
        let mut appended = Vec::new();

        for (offset, entry) in entries.into_iter().enumerate() {
            let index = prev_index + offset as u64 + 1;
            if entry.index != index {
                return Err(Error::Raft(format!(
                    "entry index {} out of sequence, expected {}",
                    entry.index, index
                )));
            }
            if appended.is_empty() {
                match self.term_at(index) {
                    Some(term) if term == entry.term => continue,
                    Some(_) => {
                        if index <= commit_index {
                            return Err(Error::Internal(format!(
                                "refusing to overwrite committed entry {} (commit {})",
                                index, commit_index
                            )));
                        }
                        self.entries.truncate(index as usize - 1);
                        truncated_from = Some(index);
                    }
                    None => {}
                }
            }
            self.entries.push(entry.clone());
            appended.push(entry);
        }

        Ok(AppendOutcome::Appended {
            match_index,
            truncated_from,
            appended,
        })
    }
}

/// Payload of a leader-created entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntryBody {
    Noop,
    Command(Vec<u8>),
}
