//! Bounded, priority-ordered dispatch of ephemeral assistant tasks.
//!
//! The pool runs each task in its own tokio task behind a weighted semaphore
//! sized `max(1, max_assistants)`, so at most that many assistants hold a
//! chat session at any instant. Tasks are dispatched in priority order
//! (lower value first, submission order breaking ties) but results always
//! come back in submission order regardless of completion order.
//!
//! Each worker gets a per-task cancellation anchor linked to the caller's
//! signal and armed with the configured timeout. Whatever happens, the
//! worker terminates its ephemeral session before releasing its semaphore
//! slot, so cancellation can never leak sessions.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::agentdesk::agent::short_id;
use crate::agentdesk::chat_client::{ChatClient, DeltaTracker, TokenUsage};
use crate::agentdesk::config::OfficeConfig;
use crate::agentdesk::cost::CostTracker;
use crate::agentdesk::error::OrchestratorError;
use crate::agentdesk::event::{OfficeEventKind, OfficeEvents};
use crate::agentdesk::protocol::truncate_with_ellipsis;
use crate::agentdesk::tool_trace::{ToolExecution, ToolTraceCollector};

/// Maximum characters of assistant output kept in a concise result.
const RESULT_PREVIEW_CHARS: usize = 500;

/// Lifecycle of an assistant task. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One unit of work the manager scheduled for an assistant.
#[derive(Debug, Clone)]
pub struct AssistantTask {
    /// Stable 8-hex identifier.
    pub id: String,
    pub iteration_number: u64,
    pub title: String,
    pub prompt: String,
    /// Lower runs first.
    pub priority: i64,
    pub status: TaskStatus,
    pub assistant_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl AssistantTask {
    pub fn new(
        iteration_number: u64,
        title: impl Into<String>,
        prompt: impl Into<String>,
        priority: i64,
    ) -> Self {
        Self {
            id: short_id(),
            iteration_number,
            title: title.into(),
            prompt: prompt.into(),
            priority,
            status: TaskStatus::Queued,
            assistant_index: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

/// Outcome of one assistant task: a concise summary, never a raw transcript.
#[derive(Debug, Clone)]
pub struct AssistantResult {
    pub task_id: String,
    pub assistant_index: Option<usize>,
    pub success: bool,
    pub content: String,
    pub tool_executions: Vec<ToolExecution>,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Dispatches assistant tasks with bounded concurrency.
pub struct AssistantPool {
    client: Arc<dyn ChatClient>,
    events: Arc<OfficeEvents>,
    cost: Arc<CostTracker>,
    next_index: Arc<AtomicUsize>,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl AssistantPool {
    pub fn new(
        client: Arc<dyn ChatClient>,
        events: Arc<OfficeEvents>,
        cost: Arc<CostTracker>,
    ) -> Self {
        Self {
            client,
            events,
            cost,
            next_index: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run every task and return results in submission order.
    pub async fn execute_tasks(
        &self,
        tasks: Vec<AssistantTask>,
        config: &OfficeConfig,
        cancel: &CancellationToken,
    ) -> Vec<AssistantResult> {
        let mut ordered: Vec<(usize, AssistantTask)> = tasks.into_iter().enumerate().collect();
        // Stable sort keeps submission order inside one priority band.
        ordered.sort_by_key(|(_, task)| task.priority);

        let capacity = config.max_assistants.max(1);
        let semaphore = Arc::new(Semaphore::new(capacity));

        let mut handles = Vec::with_capacity(ordered.len());
        for (submission_idx, task) in ordered {
            let worker = Worker {
                client: self.client.clone(),
                events: self.events.clone(),
                cost: self.cost.clone(),
                active: self.active.clone(),
                next_index: self.next_index.clone(),
                semaphore: semaphore.clone(),
                config: config.clone(),
                token: cancel.child_token(),
            };
            handles.push((submission_idx, tokio::spawn(worker.run(task))));
        }

        let mut results: Vec<(usize, AssistantResult)> = Vec::with_capacity(handles.len());
        for (submission_idx, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => AssistantResult {
                    task_id: String::new(),
                    assistant_index: None,
                    success: false,
                    content: String::new(),
                    tool_executions: Vec::new(),
                    duration: Duration::ZERO,
                    completed_at: Utc::now(),
                    error_message: Some(format!("worker crashed: {}", join_err)),
                },
            };
            results.push((submission_idx, result));
        }

        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Cancel every task currently queued or running.
    pub fn cancel_all(&self) {
        for token in self.active.lock().expect("pool lock poisoned").values() {
            token.cancel();
        }
    }
}

struct Worker {
    client: Arc<dyn ChatClient>,
    events: Arc<OfficeEvents>,
    cost: Arc<CostTracker>,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    next_index: Arc<AtomicUsize>,
    semaphore: Arc<Semaphore>,
    config: OfficeConfig,
    token: CancellationToken,
}

enum WorkerOutcome {
    Success(String),
    TimedOut,
    Cancelled,
    Failed(String),
}

impl Worker {
    async fn run(self, mut task: AssistantTask) -> AssistantResult {
        self.active
            .lock()
            .expect("pool lock poisoned")
            .insert(task.id.clone(), self.token.clone());

        let result = self.execute(&mut task).await;

        self.active.lock().expect("pool lock poisoned").remove(&task.id);
        result
    }

    async fn execute(&self, task: &mut AssistantTask) -> AssistantResult {
        self.events
            .emit(OfficeEventKind::SchedulingDispatched {
                task_id: task.id.clone(),
                title: task.title.clone(),
                priority: task.priority,
            })
            .await;

        // Queued tasks are cancellable while they wait for a slot.
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.expect("assistant semaphore closed")
            }
            _ = self.token.cancelled() => {
                task.status = TaskStatus::Cancelled;
                return self.finish(task, None, WorkerOutcome::Cancelled, Vec::new(), Instant::now()).await;
            }
        };

        let assistant_index = self.next_index();
        task.assistant_index = Some(assistant_index);
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        let started = Instant::now();

        self.events
            .emit(OfficeEventKind::AssistantStarted {
                task_id: task.id.clone(),
                assistant_index,
                title: task.title.clone(),
            })
            .await;

        let session_id = format!("assistant-{}-{}", assistant_index, task.id);
        let collector =
            ToolTraceCollector::start(self.client.tool_events(), session_id.clone());

        let prompt = self.compose_prompt(task);
        let timeout = Duration::from_secs(self.config.assistant_timeout_seconds);
        let outcome = tokio::select! {
            streamed = self.consume_stream(&session_id, &prompt, task, assistant_index) => {
                match streamed {
                    Ok(text) => WorkerOutcome::Success(text),
                    Err(err) => WorkerOutcome::Failed(err.to_string()),
                }
            }
            _ = self.token.cancelled() => WorkerOutcome::Cancelled,
            _ = tokio::time::sleep(timeout) => WorkerOutcome::TimedOut,
        };

        let traces = collector.complete().await;

        // Terminate the session, then release the slot, in that order.
        if let Err(err) = self.client.terminate_session(&session_id).await {
            log::warn!("failed to terminate assistant session '{}': {}", session_id, err);
        }
        drop(permit);

        self.finish(task, Some(assistant_index), outcome, traces, started).await
    }

    async fn consume_stream(
        &self,
        session_id: &str,
        prompt: &str,
        task: &AssistantTask,
        assistant_index: usize,
    ) -> Result<String, OrchestratorError> {
        let mut stream = self.client.send_streaming(session_id, prompt).await?;
        let mut tracker = DeltaTracker::new();
        let mut latest = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let delta = tracker.delta(&chunk.content);
            if !delta.is_empty() {
                self.events
                    .emit(OfficeEventKind::AssistantProgress {
                        task_id: task.id.clone(),
                        assistant_index,
                        delta_chars: delta.chars().count(),
                    })
                    .await;
            }
            latest = chunk.content;
        }
        let text = latest.trim_end().to_string();

        // Streaming responses carry no provider usage; estimate at four
        // characters per token.
        self.cost.record(&TokenUsage {
            input_tokens: prompt.len() / 4,
            output_tokens: text.len() / 4,
        });
        let snapshot = self.cost.snapshot();
        self.events
            .emit(OfficeEventKind::CostUpdated {
                input_tokens: snapshot.input_tokens,
                output_tokens: snapshot.output_tokens,
            })
            .await;

        Ok(text)
    }

    async fn finish(
        &self,
        task: &mut AssistantTask,
        assistant_index: Option<usize>,
        outcome: WorkerOutcome,
        traces: Vec<ToolExecution>,
        started: Instant,
    ) -> AssistantResult {
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;
        let idx = assistant_index.unwrap_or(0);

        let (success, content, error_message) = match outcome {
            WorkerOutcome::Success(text) => {
                task.status = TaskStatus::Completed;
                self.events
                    .emit(OfficeEventKind::AssistantCompleted {
                        task_id: task.id.clone(),
                        assistant_index: idx,
                        duration_ms,
                    })
                    .await;
                (true, self.concise_content(task, &traces, &text), None)
            }
            WorkerOutcome::TimedOut => {
                task.status = TaskStatus::Failed;
                let message =
                    format!("Task timed out after {}s", self.config.assistant_timeout_seconds);
                self.events
                    .emit(OfficeEventKind::AssistantTimedOut {
                        task_id: task.id.clone(),
                        assistant_index: idx,
                        timeout_seconds: self.config.assistant_timeout_seconds,
                    })
                    .await;
                (false, String::new(), Some(message))
            }
            WorkerOutcome::Cancelled => {
                task.status = TaskStatus::Cancelled;
                self.events
                    .emit(OfficeEventKind::AssistantCancelled {
                        task_id: task.id.clone(),
                        assistant_index: idx,
                    })
                    .await;
                (false, String::new(), Some("Task was cancelled".to_string()))
            }
            WorkerOutcome::Failed(error) => {
                task.status = TaskStatus::Failed;
                self.events
                    .emit(OfficeEventKind::AssistantFailed {
                        task_id: task.id.clone(),
                        assistant_index: idx,
                        error: error.clone(),
                    })
                    .await;
                (false, String::new(), Some(error))
            }
        };

        task.completed_at = Some(Utc::now());
        task.error_message = error_message.clone();

        AssistantResult {
            task_id: task.id.clone(),
            assistant_index,
            success,
            content,
            tool_executions: traces,
            duration,
            completed_at: Utc::now(),
            error_message,
        }
    }

    fn concise_content(
        &self,
        task: &AssistantTask,
        traces: &[ToolExecution],
        text: &str,
    ) -> String {
        let mut content = format!("### {}", task.title);
        if !traces.is_empty() {
            let names: Vec<&str> = traces.iter().map(|t| t.tool_name.as_str()).collect();
            content.push_str(&format!("\nTools: {}", names.join(", ")));
        }
        content.push('\n');
        content.push_str(&truncate_with_ellipsis(text, RESULT_PREVIEW_CHARS));
        content
    }

    fn compose_prompt(&self, task: &AssistantTask) -> String {
        let mut prompt = format!(
            "You are an ephemeral assistant working on: {title}\n\
             Workspace: {workspace}\n",
            title = task.title,
            workspace = self.config.workspace_path.display(),
        );
        if !self.config.mcp_server_ids.is_empty() {
            prompt.push_str(&format!("MCP servers: {}\n", self.config.mcp_server_ids.join(", ")));
        }
        if !self.config.skill_ids.is_empty() {
            prompt.push_str(&format!("Skills: {}\n", self.config.skill_ids.join(", ")));
        }
        prompt.push_str(&format!(
            "Retries allowed: {}\n\nTask:\n{}",
            self.config.max_retries, task.prompt
        ));
        prompt
    }

    /// Assistant indices increase monotonically across the pool's lifetime,
    /// not per batch.
    fn next_index(&self) -> usize {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }
}
