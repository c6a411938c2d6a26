//! Per-session operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::operation::OperationCategory;

/// Monotonic counters for one session.
///
/// A fresh set is created on every connect; nothing survives a disconnect.
#[derive(Debug, Default)]
pub struct SessionCounters {
    tool_calls: AtomicU64,
    resources_read: AtomicU64,
    prompts_retrieved: AtomicU64,
    errors: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed operation.
    ///
    /// Successful listings have no counter of their own and record nothing.
    pub fn record(&self, category: OperationCategory, success: bool) {
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let counter = match category {
            OperationCategory::ToolCall => &self.tool_calls,
            OperationCategory::ResourceRead => &self.resources_read,
            OperationCategory::PromptGet => &self.prompts_retrieved,
            OperationCategory::ToolList
            | OperationCategory::ResourceList
            | OperationCategory::PromptList => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            resources_read: self.resources_read.load(Ordering::Relaxed),
            prompts_retrieved: self.prompts_retrieved.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub tool_calls: u64,
    pub resources_read: u64,
    pub prompts_retrieved: u64,
    pub errors: u64,
}

impl CounterSnapshot {
    pub fn total(&self) -> u64 {
        self.tool_calls + self.resources_read + self.prompts_retrieved + self.errors
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_increments_category() {
        let counters = SessionCounters::new();
        counters.record(OperationCategory::ToolCall, true);
        counters.record(OperationCategory::ToolCall, true);
        counters.record(OperationCategory::ResourceRead, true);
        counters.record(OperationCategory::PromptGet, true);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.tool_calls, 2);
        assert_eq!(snapshot.resources_read, 1);
        assert_eq!(snapshot.prompts_retrieved, 1);
        assert_eq!(snapshot.errors, 0);
    }

    #[test]
    fn test_failure_only_increments_errors() {
        let counters = SessionCounters::new();
        counters.record(OperationCategory::ToolCall, false);
        counters.record(OperationCategory::ResourceRead, false);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.tool_calls, 0);
        assert_eq!(snapshot.resources_read, 0);
        assert_eq!(snapshot.errors, 2);
    }

    #[test]
    fn test_listings_have_no_counter() {
        let counters = SessionCounters::new();
        counters.record(OperationCategory::ToolList, true);
        counters.record(OperationCategory::ResourceList, true);
        counters.record(OperationCategory::PromptList, true);
        assert!(counters.snapshot().is_zero());

        counters.record(OperationCategory::PromptList, false);
        assert_eq!(counters.snapshot().errors, 1);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = CounterSnapshot {
            tool_calls: 1,
            ..Default::default()
        };
        let value = serde_json::to_value(snapshot).unwrap();
        assert_eq!(value["toolCalls"], 1);
        assert_eq!(value["promptsRetrieved"], 0);
    }
}
