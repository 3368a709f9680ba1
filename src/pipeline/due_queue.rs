//! Min-heap of wake-up times.
//!
//! Each domain has at most one live entry; pushing again supersedes the old
//! one, which stays in the heap until it surfaces and is skipped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    live: HashMap<String, DateTime<Utc>>,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `domain` at `at`, replacing its previous entry.
    pub fn push(&mut self, domain: impl Into<String>, at: DateTime<Utc>) {
        let domain = domain.into();
        self.live.insert(domain.clone(), at);
        self.heap.push(Reverse((at, domain)));
    }

    fn is_live(&self, at: DateTime<Utc>, domain: &str) -> bool {
        self.live.get(domain) == Some(&at)
    }

    fn drop_stale(&mut self) {
        while let Some(Reverse((at, domain))) = self.heap.peek() {
            if self.is_live(*at, domain) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Earliest live wake-up time.
    pub fn peek_time(&mut self) -> Option<DateTime<Utc>> {
        self.drop_stale();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Remove and return every domain due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        loop {
            self.drop_stale();
            match self.heap.peek() {
                Some(Reverse((at, _))) if *at <= now => {}
                _ => break,
            }
            if let Some(Reverse((_, domain))) = self.heap.pop() {
                self.live.remove(&domain);
                due.push(domain);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}
