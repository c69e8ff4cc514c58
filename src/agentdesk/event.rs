//! Event system for the office and the panel.
//!
//! Both orchestrators publish typed, immutable, UTC-timestamped records.
//! The two taxonomies are deliberately disjoint: [`OfficeEvent`] describes the
//! cyclic manager/assistant loop, [`PanelEvent`] describes the finite
//! discussion, and nothing unions them. A single [`EventHandler`] trait with
//! two no-op default methods receives both, so subscribers override only what
//! they care about.
//!
//! # Delivery guarantees
//!
//! Events reach each subscriber in the order the producer emitted them.
//! Handler panics are caught and logged; one bad subscriber can never break
//! an orchestration loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::agentdesk::agent::{AgentStatus, PanelMessage};
use crate::agentdesk::brief::KnowledgeBrief;
use crate::agentdesk::chat_client::ChatRole;
use crate::agentdesk::event_log::EventLog;
use crate::agentdesk::office::ManagerPhase;
use crate::agentdesk::panel::PanelPhase;

/// A typed record from the office loop.
#[derive(Debug, Clone)]
pub struct OfficeEvent {
    pub timestamp: DateTime<Utc>,
    /// The iteration during which the event was produced; zero before the
    /// loop starts.
    pub iteration: u64,
    pub kind: OfficeEventKind,
}

/// Everything the office reports while running.
#[derive(Debug, Clone)]
pub enum OfficeEventKind {
    /// The manager FSM moved between phases. `previous` always equals the
    /// prior event's `current`.
    PhaseChanged { previous: ManagerPhase, current: ManagerPhase },
    /// A message posted to the office chat stream (plans, summaries,
    /// clarification questions, user replies).
    ChatMessage { role: ChatRole, content: String },
    /// The manager needs an answer before it can finish planning.
    ClarificationRequested { question: String },
    /// An injected instruction was drained into the current iteration.
    InstructionAbsorbed { instruction: String },
    /// A task was handed to the assistant pool.
    SchedulingDispatched { task_id: String, title: String, priority: i64 },
    /// A human-readable note about why the iteration was scheduled as it was.
    SchedulingDecision { detail: String },
    /// A worker acquired a slot and began executing.
    AssistantStarted { task_id: String, assistant_index: usize, title: String },
    /// Streaming progress from a running assistant.
    AssistantProgress { task_id: String, assistant_index: usize, delta_chars: usize },
    /// An assistant finished successfully.
    AssistantCompleted { task_id: String, assistant_index: usize, duration_ms: u64 },
    /// An assistant failed for a reason other than timeout or cancellation.
    AssistantFailed { task_id: String, assistant_index: usize, error: String },
    /// An assistant hit its per-task timeout.
    AssistantTimedOut { task_id: String, assistant_index: usize, timeout_seconds: u64 },
    /// An assistant was cancelled by the user or a stop.
    AssistantCancelled { task_id: String, assistant_index: usize },
    /// One second of the rest countdown elapsed. The final tick always
    /// carries `seconds_remaining` zero, even on early cancel.
    RestTick { seconds_remaining: u64, total_seconds: u64 },
    /// Free-form commentary for activity feeds.
    Commentary { text: String },
    /// Cumulative token counters changed.
    CostUpdated { input_tokens: usize, output_tokens: usize },
    /// A recoverable error was observed and absorbed.
    ErrorRaised { message: String },
    /// An iteration finished aggregating.
    IterationCompleted {
        iteration: u64,
        dispatched: usize,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
    },
}

/// Fieldless discriminants for filtering the event log by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfficeEventType {
    PhaseChanged,
    ChatMessage,
    ClarificationRequested,
    InstructionAbsorbed,
    SchedulingDispatched,
    SchedulingDecision,
    AssistantStarted,
    AssistantProgress,
    AssistantCompleted,
    AssistantFailed,
    AssistantTimedOut,
    AssistantCancelled,
    RestTick,
    Commentary,
    CostUpdated,
    ErrorRaised,
    IterationCompleted,
}

impl OfficeEvent {
    pub fn event_type(&self) -> OfficeEventType {
        match self.kind {
            OfficeEventKind::PhaseChanged { .. } => OfficeEventType::PhaseChanged,
            OfficeEventKind::ChatMessage { .. } => OfficeEventType::ChatMessage,
            OfficeEventKind::ClarificationRequested { .. } => {
                OfficeEventType::ClarificationRequested
            }
            OfficeEventKind::InstructionAbsorbed { .. } => OfficeEventType::InstructionAbsorbed,
            OfficeEventKind::SchedulingDispatched { .. } => OfficeEventType::SchedulingDispatched,
            OfficeEventKind::SchedulingDecision { .. } => OfficeEventType::SchedulingDecision,
            OfficeEventKind::AssistantStarted { .. } => OfficeEventType::AssistantStarted,
            OfficeEventKind::AssistantProgress { .. } => OfficeEventType::AssistantProgress,
            OfficeEventKind::AssistantCompleted { .. } => OfficeEventType::AssistantCompleted,
            OfficeEventKind::AssistantFailed { .. } => OfficeEventType::AssistantFailed,
            OfficeEventKind::AssistantTimedOut { .. } => OfficeEventType::AssistantTimedOut,
            OfficeEventKind::AssistantCancelled { .. } => OfficeEventType::AssistantCancelled,
            OfficeEventKind::RestTick { .. } => OfficeEventType::RestTick,
            OfficeEventKind::Commentary { .. } => OfficeEventType::Commentary,
            OfficeEventKind::CostUpdated { .. } => OfficeEventType::CostUpdated,
            OfficeEventKind::ErrorRaised { .. } => OfficeEventType::ErrorRaised,
            OfficeEventKind::IterationCompleted { .. } => OfficeEventType::IterationCompleted,
        }
    }
}

/// A typed record from a panel discussion.
#[derive(Debug, Clone)]
pub struct PanelEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: PanelEventKind,
}

/// Everything the panel reports while running.
#[derive(Debug, Clone)]
pub enum PanelEventKind {
    PhaseChanged { previous: PanelPhase, current: PanelPhase },
    /// A message entered the transcript.
    AgentMessage { message: PanelMessage },
    /// An agent's thinking/paused/disposed state changed.
    AgentStatusChanged { agent_id: u64, agent_name: String, status: AgentStatus },
    TurnStarted { turn: u64 },
    ConvergenceChecked { turn: u64, score: u32, threshold: u32, converged: bool },
    /// The moderator intervened (blocked a message, redirected the panel,
    /// fell back from a bad parallel group).
    ModerationNote { text: String },
    SynthesisReady { report: String },
    BriefReady { brief: KnowledgeBrief },
    CostUpdated { input_tokens: usize, output_tokens: usize },
    ErrorRaised { message: String },
}

impl PanelEvent {
    fn now(kind: PanelEventKind) -> Self {
        Self { timestamp: Utc::now(), kind }
    }

    pub fn agent_status(agent_id: u64, agent_name: &str, status: AgentStatus) -> Self {
        Self::now(PanelEventKind::AgentStatusChanged {
            agent_id,
            agent_name: agent_name.to_string(),
            status,
        })
    }

    pub fn moderation_note(text: impl Into<String>) -> Self {
        Self::now(PanelEventKind::ModerationNote { text: text.into() })
    }
}

/// Receives office and panel events.
///
/// Both methods default to no-ops so implementors override only the stream
/// they consume. Handlers are shared as `Arc<dyn EventHandler>` across tasks;
/// keep internal state behind atomics or a mutex.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_office_event(&self, _event: &OfficeEvent) {}
    async fn on_panel_event(&self, _event: &PanelEvent) {}
}

/// Publish side of the office event stream.
///
/// Every event is appended to the [`EventLog`] first, then delivered to the
/// handler. The current iteration number is stamped onto records so the log
/// can be filtered per iteration.
pub struct OfficeEvents {
    log: Arc<EventLog>,
    handler: Option<Arc<dyn EventHandler>>,
    iteration: AtomicU64,
}

impl OfficeEvents {
    pub fn new(log: Arc<EventLog>, handler: Option<Arc<dyn EventHandler>>) -> Self {
        Self { log, handler, iteration: AtomicU64::new(0) }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn set_iteration(&self, iteration: u64) {
        self.iteration.store(iteration, Ordering::Relaxed);
    }

    pub async fn emit(&self, kind: OfficeEventKind) {
        let event = OfficeEvent {
            timestamp: Utc::now(),
            iteration: self.iteration.load(Ordering::Relaxed),
            kind,
        };
        self.log.append(event.clone());
        if let Some(handler) = &self.handler {
            if AssertUnwindSafe(handler.on_office_event(&event))
                .catch_unwind()
                .await
                .is_err()
            {
                log::error!("office event handler panicked; event dropped for subscriber");
            }
        }
    }
}

/// Publish side of the panel event stream.
pub struct PanelEvents {
    handler: Option<Arc<dyn EventHandler>>,
}

impl PanelEvents {
    pub fn new(handler: Option<Arc<dyn EventHandler>>) -> Self {
        Self { handler }
    }

    pub async fn emit(&self, event: PanelEvent) {
        if let Some(handler) = &self.handler {
            if AssertUnwindSafe(handler.on_panel_event(&event))
                .catch_unwind()
                .await
                .is_err()
            {
                log::error!("panel event handler panicked; event dropped for subscriber");
            }
        }
    }

    pub async fn emit_kind(&self, kind: PanelEventKind) {
        self.emit(PanelEvent { timestamp: Utc::now(), kind }).await;
    }
}
