//! In-memory error accounting for end-of-run reporting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::WorkerError;
use crate::retry::RetryObserver;

/// Number of recent errors kept for inspection.
pub const MAX_RECENT_ERRORS: usize = 100;

/// Recorded messages are cut to this many characters.
pub const MAX_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub context: String,
    pub operation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total_errors: u64,
    pub distinct_kinds: usize,
    pub most_frequent_kind: Option<String>,
    pub distinct_operations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub by_kind: HashMap<String, u64>,
    pub by_operation: HashMap<String, u64>,
    /// Oldest first
    pub recent: Vec<ErrorRecord>,
}

#[derive(Debug, Default)]
struct TrackerState {
    total: u64,
    by_kind: HashMap<String, u64>,
    by_operation: HashMap<String, u64>,
    recent: VecDeque<ErrorRecord>,
}

/// Thread-safe error counters plus a bounded ring of recent errors.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    state: Mutex<TrackerState>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a worker error.
    pub fn record(&self, error: &WorkerError, context: &str, operation: &str) {
        self.record_raw(error.kind(), &error.to_string(), context, operation);
    }

    /// Record a failure that is not a [`WorkerError`].
    pub fn record_raw(&self, kind: &str, message: &str, context: &str, operation: &str) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            message: truncate(message, MAX_MESSAGE_CHARS),
            context: context.to_string(),
            operation: operation.to_string(),
        };

        let mut state = self.lock();
        state.total += 1;
        *state.by_kind.entry(record.kind.clone()).or_insert(0) += 1;
        *state.by_operation.entry(record.operation.clone()).or_insert(0) += 1;
        if state.recent.len() >= MAX_RECENT_ERRORS {
            state.recent.pop_front();
        }
        state.recent.push_back(record);
    }

    pub fn summary(&self) -> ErrorSummary {
        let state = self.lock();
        let most_frequent_kind = state
            .by_kind
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(kind, _)| kind.clone());

        ErrorSummary {
            total_errors: state.total,
            distinct_kinds: state.by_kind.len(),
            most_frequent_kind,
            distinct_operations: state.by_operation.len(),
        }
    }

    pub fn detailed_stats(&self) -> ErrorStats {
        let state = self.lock();
        ErrorStats {
            total_errors: state.total,
            by_kind: state.by_kind.clone(),
            by_operation: state.by_operation.clone(),
            recent: state.recent.iter().cloned().collect(),
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.lock().total
    }

    /// Observer that tags every retried failure with a job context.
    pub fn observer<'a>(&'a self, context: &'a str) -> TrackerObserver<'a> {
        TrackerObserver {
            tracker: self,
            context,
        }
    }

    // A panic while holding the lock leaves the counters usable.
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Feeds retry failures into an [`ErrorTracker`].
pub struct TrackerObserver<'a> {
    tracker: &'a ErrorTracker,
    context: &'a str,
}

impl RetryObserver for TrackerObserver<'_> {
    fn on_failure(&self, error: &WorkerError, operation: &str, _attempt: u32) {
        self.tracker.record(error, self.context, operation);
    }
}

fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
