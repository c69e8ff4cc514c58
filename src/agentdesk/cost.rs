//! Token accounting shared across a run.
//!
//! Counters are plain atomics so assistants, the manager, and panel agents
//! can record usage from any task without a lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::agentdesk::chat_client::TokenUsage;

/// Cumulative usage counters for one orchestrator instance.
#[derive(Default)]
pub struct CostTracker {
    input_tokens: AtomicUsize,
    output_tokens: AtomicUsize,
    llm_calls: AtomicUsize,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostSnapshot {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub llm_calls: usize,
}

impl CostSnapshot {
    pub fn total_tokens(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: &TokenUsage) {
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CostSnapshot {
        CostSnapshot {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.input_tokens.store(0, Ordering::Relaxed);
        self.output_tokens.store(0, Ordering::Relaxed);
        self.llm_calls.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let tracker = CostTracker::new();
        tracker.record(&TokenUsage { input_tokens: 10, output_tokens: 4 });
        tracker.record(&TokenUsage { input_tokens: 5, output_tokens: 1 });
        let snap = tracker.snapshot();
        assert_eq!(snap.input_tokens, 15);
        assert_eq!(snap.output_tokens, 5);
        assert_eq!(snap.llm_calls, 2);
        assert_eq!(snap.total_tokens(), 20);

        tracker.reset();
        assert_eq!(tracker.snapshot().total_tokens(), 0);
    }
}
