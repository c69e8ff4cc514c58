// src/lib.rs

// Import the top-level `agentdesk` module.
pub mod agentdesk;

// Re-export the key items so callers reach them without the full path,
// e.g. agentdesk::OfficeOrchestrator instead of
// agentdesk::agentdesk::office::OfficeOrchestrator.
pub use agentdesk::agent::{Agent, AgentRole, AgentStatus, MessageType, PanelMessage};
pub use agentdesk::approval::{
    ApprovalBroker, ApprovalScope, ApprovalUi, RiskLevel, RuleDecision, ToolApprovalRequest,
    ToolApprovalResponse,
};
pub use agentdesk::assistant_pool::{AssistantPool, AssistantResult, AssistantTask, TaskStatus};
pub use agentdesk::brief::KnowledgeBrief;
pub use agentdesk::chat_client::{
    ChatClient, ChatMessage, ChatRole, ChatStream, DeltaTracker, StreamChunk, TokenUsage,
    ToolEvent, ToolEventKind,
};
pub use agentdesk::config::{
    AppSettings, ApprovalUiMode, DiscussionDepth, OfficeConfig, PanelSettings,
};
pub use agentdesk::error::{OrchestratorError, OrchestratorResult};
pub use agentdesk::event::{EventHandler, OfficeEvent, OfficeEventKind, PanelEvent, PanelEventKind};
pub use agentdesk::event_log::EventLog;
pub use agentdesk::moderator::ModeratorDecision;
pub use agentdesk::office::{IterationReport, ManagerPhase, OfficeOrchestrator};
pub use agentdesk::panel::{PanelOrchestrator, PanelPhase};
pub use agentdesk::scheduler::{CountdownScheduler, RestOutcome, RestTick};
pub use agentdesk::tool_trace::{ToolExecution, ToolTraceCollector};
pub use agentdesk::watchdog::ZombieWatcher;
