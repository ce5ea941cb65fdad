//! Bounded, newest-first event history.
//!
//! This is the only observability record the session exposes to its
//! consumer.  Every push is mirrored to the process log at `info` level.

use std::collections::VecDeque;

use chrono::{DateTime, Local};

/// One `(timestamp, label)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEntry {
    pub at: DateTime<Local>,
    pub label: String,
}

impl EventEntry {
    /// `HH:MM:SS.mmm label`, the form shown by the consumer.
    pub fn display(&self) -> String {
        format!("{} {}", self.at.format("%H:%M:%S%.3f"), self.label)
    }
}

/// Fixed-capacity event log; pushing past capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<EventEntry>,
    capacity: usize,
}

impl EventLog {
    pub const DEFAULT_CAPACITY: usize = 10;

    /// A zero capacity is raised to one so the latest event is always visible.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, label: impl Into<String>) {
        let label = label.into();
        log::info!("session: {label}");
        self.entries.push_front(EventEntry {
            at: Local::now(),
            label,
        });
        self.entries.truncate(self.capacity);
    }

    /// Entries, newest first.
    pub fn entries(&self) -> impl Iterator<Item = &EventEntry> {
        self.entries.iter()
    }

    /// Labels only, newest first.
    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.label.clone()).collect()
    }

    /// Display strings, newest first.
    pub fn display_lines(&self) -> Vec<String> {
        self.entries.iter().map(EventEntry::display).collect()
    }

    pub fn latest(&self) -> Option<&EventEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
