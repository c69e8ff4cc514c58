//! Per-task recording of tool activity.
//!
//! An assistant worker starts one [`ToolTraceCollector`] for its ephemeral
//! session, lets it run for the lifetime of the task, and collects the
//! ordered [`ToolExecution`] records when the task ends. Collectors filter
//! the shared tool event channel by session id, so concurrent tasks never see
//! each other's tools. Each collector owns its own lock; there is no
//! cross-collector coupling.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agentdesk::chat_client::{ToolEvent, ToolEventKind};

/// One observed tool invocation.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub tool_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub description: String,
}

impl ToolExecution {
    pub fn duration(&self) -> Duration {
        self.completed_at - self.started_at
    }
}

struct OpenTool {
    tool_call_id: String,
    name: String,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct CollectorState {
    open: Option<OpenTool>,
    completed: Vec<ToolExecution>,
}

impl CollectorState {
    fn close_open(&mut self, description: &str) {
        if let Some(open) = self.open.take() {
            self.completed.push(ToolExecution {
                tool_name: open.name,
                started_at: open.started_at,
                completed_at: Utc::now(),
                success: true,
                description: description.to_string(),
            });
        }
    }

    fn handle(&mut self, kind: ToolEventKind) {
        match kind {
            ToolEventKind::ToolStart { tool_call_id, name } => {
                // A new start while a tool is still open means the adapter
                // never reported completion; treat the old one as done.
                self.close_open("superseded");
                self.open = Some(OpenTool { tool_call_id, name, started_at: Utc::now() });
            }
            ToolEventKind::ToolComplete { tool_call_id } => {
                let matches = self
                    .open
                    .as_ref()
                    .is_some_and(|open| open.tool_call_id == tool_call_id);
                if matches {
                    self.close_open("completed");
                }
            }
            ToolEventKind::ReasoningDelta { .. } => {}
        }
    }
}

/// Subscribes to a session's tool events and yields ordered execution records.
pub struct ToolTraceCollector {
    state: Arc<Mutex<CollectorState>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ToolTraceCollector {
    /// Begin collecting events for `session_id` from `receiver`.
    pub fn start(mut receiver: broadcast::Receiver<ToolEvent>, session_id: String) -> Self {
        let state = Arc::new(Mutex::new(CollectorState::default()));
        let stop = CancellationToken::new();

        let task = {
            let state = state.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        event = receiver.recv() => match event {
                            Ok(event) if event.session_id == session_id => {
                                state.lock().expect("collector lock poisoned").handle(event.kind);
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                log::warn!(
                                    "tool trace collector for '{}' lagged, lost {} events",
                                    session_id, skipped
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                // Receiver drops here, which is the unsubscribe.
            })
        };

        Self { state, stop, task }
    }

    /// Stop collecting, flush any still-open tool, and return the records.
    pub async fn complete(mut self) -> Vec<ToolExecution> {
        self.stop.cancel();
        let _ = (&mut self.task).await;
        let mut state = self.state.lock().expect("collector lock poisoned");
        state.close_open("finalized at collection end");
        std::mem::take(&mut state.completed)
    }
}

impl Drop for ToolTraceCollector {
    fn drop(&mut self) {
        // Guarantees the subscription ends even when complete() is never
        // reached, e.g. a worker panicking mid-task.
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_event(session: &str, id: &str, name: &str) -> ToolEvent {
        ToolEvent {
            session_id: session.to_string(),
            kind: ToolEventKind::ToolStart {
                tool_call_id: id.to_string(),
                name: name.to_string(),
            },
        }
    }

    fn complete_event(session: &str, id: &str) -> ToolEvent {
        ToolEvent {
            session_id: session.to_string(),
            kind: ToolEventKind::ToolComplete { tool_call_id: id.to_string() },
        }
    }

    #[tokio::test]
    async fn deterministic_stream_yields_ordered_records() {
        let (tx, rx) = broadcast::channel(16);
        let collector = ToolTraceCollector::start(rx, "sess".to_string());

        tx.send(start_event("sess", "1", "read_file")).unwrap();
        tx.send(complete_event("sess", "1")).unwrap();
        tx.send(start_event("sess", "2", "write_file")).unwrap();
        tx.send(complete_event("sess", "2")).unwrap();
        tokio::task::yield_now().await;

        let executions = collector.complete().await;
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].tool_name, "read_file");
        assert_eq!(executions[1].tool_name, "write_file");
        assert!(executions.iter().all(|e| e.success));
    }

    #[tokio::test]
    async fn other_sessions_are_filtered_out() {
        let (tx, rx) = broadcast::channel(16);
        let collector = ToolTraceCollector::start(rx, "mine".to_string());

        tx.send(start_event("other", "1", "shell")).unwrap();
        tx.send(complete_event("other", "1")).unwrap();
        tx.send(start_event("mine", "2", "grep")).unwrap();
        tx.send(complete_event("mine", "2")).unwrap();
        tokio::task::yield_now().await;

        let executions = collector.complete().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].tool_name, "grep");
    }

    #[tokio::test]
    async fn new_start_supersedes_open_tool() {
        let (tx, rx) = broadcast::channel(16);
        let collector = ToolTraceCollector::start(rx, "sess".to_string());

        tx.send(start_event("sess", "1", "first")).unwrap();
        tx.send(start_event("sess", "2", "second")).unwrap();
        tx.send(complete_event("sess", "2")).unwrap();
        tokio::task::yield_now().await;

        let executions = collector.complete().await;
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].tool_name, "first");
        assert_eq!(executions[0].description, "superseded");
        assert_eq!(executions[1].tool_name, "second");
        assert_eq!(executions[1].description, "completed");
    }

    #[tokio::test]
    async fn still_open_tool_is_finalized_on_complete() {
        let (tx, rx) = broadcast::channel(16);
        let collector = ToolTraceCollector::start(rx, "sess".to_string());

        tx.send(start_event("sess", "1", "long_running")).unwrap();
        tokio::task::yield_now().await;

        let executions = collector.complete().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].description, "finalized at collection end");
        assert!(executions[0].success);
    }

    #[tokio::test]
    async fn mismatched_complete_is_ignored() {
        let (tx, rx) = broadcast::channel(16);
        let collector = ToolTraceCollector::start(rx, "sess".to_string());

        tx.send(start_event("sess", "1", "tool_a")).unwrap();
        tx.send(complete_event("sess", "999")).unwrap();
        tokio::task::yield_now().await;

        let executions = collector.complete().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].description, "finalized at collection end");
    }
}
