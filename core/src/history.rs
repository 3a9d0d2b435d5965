//! Time-indexed archives of accepted estimates.
//!
//! A [`History`] is append-only and keeps insertion order. With
//! [`HistoryRetention::Bounded`] it behaves as a ring buffer and evicts the oldest
//! entry once the capacity is reached.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// How many entries an archive keeps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRetention {
    /// Keep every accepted entry
    #[default]
    Full,
    /// Keep only the most recent `capacity` entries
    Bounded(usize),
}

impl HistoryRetention {
    pub fn validate(&self) -> Result<()> {
        match self {
            HistoryRetention::Bounded(0) => Err(FilterError::configuration(
                "bounded history retention needs a capacity of at least one",
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct History<T> {
    entries: VecDeque<(f64, T)>,
    retention: HistoryRetention,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        History::new(HistoryRetention::Full)
    }
}

impl<T> History<T> {
    pub fn new(retention: HistoryRetention) -> Self {
        let entries = match retention {
            HistoryRetention::Full => VecDeque::new(),
            HistoryRetention::Bounded(capacity) => VecDeque::with_capacity(capacity),
        };
        History { entries, retention }
    }

    pub fn push(&mut self, time: f64, value: T) {
        if let HistoryRetention::Bounded(capacity) = self.retention {
            while self.entries.len() >= capacity.max(1) {
                self.entries.pop_front();
            }
        }
        self.entries.push_back((time, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn retention(&self) -> HistoryRetention {
        self.retention
    }
    pub fn last(&self) -> Option<&(f64, T)> {
        self.entries.back()
    }
    /// Most recent entry recorded at exactly `time`
    pub fn get(&self, time: f64) -> Option<&T> {
        self.entries
            .iter()
            .rev()
            .find(|(t, _)| *t == time)
            .map(|(_, v)| v)
    }
    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|(t, _)| *t)
    }
    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (f64, &T)> {
        self.entries.iter().map(|(t, v)| (*t, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_history_keeps_everything() {
        let mut h = History::new(HistoryRetention::Full);
        for i in 0..100 {
            h.push(i as f64, i);
        }
        assert_eq!(h.len(), 100);
        assert_eq!(h.get(42.0), Some(&42));
        assert_eq!(h.last(), Some(&(99.0, 99)));
    }

    #[test]
    fn bounded_history_evicts_oldest() {
        let mut h = History::new(HistoryRetention::Bounded(3));
        for i in 0..5 {
            h.push(i as f64 * 0.5, i);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.times().collect::<Vec<_>>(), vec![1.0, 1.5, 2.0]);
        assert_eq!(h.get(0.0), None);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut h = History::default();
        h.push(3.0, "c");
        h.push(1.0, "a");
        h.push(2.0, "b");
        let values: Vec<_> = h.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!["c", "a", "b"]);
    }

    #[test]
    fn zero_capacity_is_invalid() {
        assert!(HistoryRetention::Bounded(0).validate().is_err());
        assert!(HistoryRetention::Bounded(1).validate().is_ok());
        assert!(HistoryRetention::Full.validate().is_ok());
    }
}
