//! Tool approval gate.
//!
//! Every tool request an agent makes passes through the [`ApprovalBroker`]
//! before execution. The broker consults its rule cache first and only
//! bothers the user when no rule matches; the answer then travels back
//! through one of three UI strategies. The broker is fail-closed at the UI
//! boundary: any surface error resolves the request as denied.
//!
//! # Rule cache
//!
//! Decisions are cached per `(tool, scope, session)` key. `Global` rules
//! persist across runs in `tool-approval-rules.json`; `Session` rules live
//! for the owning session only and are never written to disk; `Once` answers
//! are transient and never cached at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::agentdesk::config::ApprovalUiMode;
use crate::agentdesk::error::OrchestratorResult;
use crate::agentdesk::storage;

/// How long an inline toast waits before auto-denying.
pub const INLINE_AUTO_DENY: Duration = Duration::from_secs(10);

/// How long the quick-action toast of the `Both` strategy waits before
/// escalating to a modal dialog.
pub const QUICK_TOAST_WINDOW: Duration = Duration::from_secs(3);

/// Reach of a cached approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub enum ApprovalScope {
    /// Applies to this request only; never cached.
    Once,
    /// Applies to every request from the same session, in memory only.
    Session,
    /// Applies everywhere and persists across runs.
    Global,
}

/// Rough danger classification shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A pending request for permission to run a tool.
#[derive(Debug, Clone)]
pub struct ToolApprovalRequest {
    pub tool_name: String,
    /// Opaque arguments, rendered by the UI but never interpreted here.
    pub tool_args: serde_json::Value,
    pub working_directory: Option<PathBuf>,
    pub risk_level: RiskLevel,
    pub description: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ToolApprovalRequest {
    pub fn new(tool_name: impl Into<String>, tool_args: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args,
            working_directory: None,
            risk_level: RiskLevel::Medium,
            description: None,
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }
}

/// The user's (or a rule's) answer to an approval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolApprovalResponse {
    pub approved: bool,
    pub scope: ApprovalScope,
    pub remember_decision: bool,
    pub reason: Option<String>,
}

impl ToolApprovalResponse {
    pub fn allow_once() -> Self {
        Self { approved: true, scope: ApprovalScope::Once, remember_decision: false, reason: None }
    }

    pub fn deny_once(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            scope: ApprovalScope::Once,
            remember_decision: false,
            reason: Some(reason.into()),
        }
    }
}

/// A cached allow/deny verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub enum RuleDecision {
    Allow,
    Deny,
}

/// The surfaces a pending request can be shown on.
///
/// `modal` blocks until the user answers. `inline` renders a toast and
/// resolves when the user reacts; the broker imposes the auto-deny timeout,
/// so implementations may simply never resolve when ignored.
#[async_trait]
pub trait ApprovalUi: Send + Sync {
    async fn modal(&self, request: &ToolApprovalRequest)
        -> OrchestratorResult<ToolApprovalResponse>;

    async fn inline(&self, request: &ToolApprovalRequest)
        -> OrchestratorResult<ToolApprovalResponse>;
}

/// Brokers approval requests between agents and the user.
pub struct ApprovalBroker {
    ui: Arc<dyn ApprovalUi>,
    ui_mode: ApprovalUiMode,
    global_rules: Mutex<HashMap<String, RuleDecision>>,
    session_rules: Mutex<HashMap<(String, String), RuleDecision>>,
    autonomous_sessions: Mutex<HashSet<String>>,
    requests_tx: broadcast::Sender<ToolApprovalRequest>,
    rules_path: Option<PathBuf>,
}

impl ApprovalBroker {
    pub fn new(ui: Arc<dyn ApprovalUi>, ui_mode: ApprovalUiMode) -> Self {
        let (requests_tx, _) = broadcast::channel(64);
        Self {
            ui,
            ui_mode,
            global_rules: Mutex::new(HashMap::new()),
            session_rules: Mutex::new(HashMap::new()),
            autonomous_sessions: Mutex::new(HashSet::new()),
            requests_tx,
            rules_path: None,
        }
    }

    /// Attach the file Global rules persist in.
    pub fn with_rules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = Some(path.into());
        self
    }

    /// Observe requests that actually reach a UI surface. Rule cache hits and
    /// autonomous bypasses never appear here.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<ToolApprovalRequest> {
        self.requests_tx.subscribe()
    }

    /// Toggle autonomous mode for a session. While enabled, every request
    /// from that session resolves as approved-once without touching the rule
    /// cache or any UI.
    pub fn set_autonomous(&self, session_id: &str, enabled: bool) {
        let mut set = self.autonomous_sessions.lock().expect("broker lock poisoned");
        if enabled {
            set.insert(session_id.to_string());
        } else {
            set.remove(session_id);
        }
    }

    /// Resolve one approval request. Always completes with exactly one
    /// response, in bounded time for the non-modal strategies.
    pub async fn request_approval(&self, request: ToolApprovalRequest) -> ToolApprovalResponse {
        if let Some(session_id) = &request.session_id {
            let bypass = self
                .autonomous_sessions
                .lock()
                .expect("broker lock poisoned")
                .contains(session_id);
            if bypass {
                return ToolApprovalResponse::allow_once();
            }
        }

        if let Some(decision) = self.cached_decision(&request) {
            return ToolApprovalResponse {
                approved: decision == RuleDecision::Allow,
                scope: ApprovalScope::Once,
                remember_decision: false,
                reason: Some("cached rule".to_string()),
            };
        }

        let _ = self.requests_tx.send(request.clone());

        let response = match self.ui_mode {
            ApprovalUiMode::Modal => self.ui.modal(&request).await,
            ApprovalUiMode::Inline => {
                match tokio::time::timeout(INLINE_AUTO_DENY, self.ui.inline(&request)).await {
                    Ok(answer) => answer,
                    Err(_) => Ok(ToolApprovalResponse::deny_once(format!(
                        "auto-denied after {}s",
                        INLINE_AUTO_DENY.as_secs()
                    ))),
                }
            }
            ApprovalUiMode::Both => {
                match tokio::time::timeout(QUICK_TOAST_WINDOW, self.ui.inline(&request)).await {
                    Ok(answer) => answer,
                    Err(_) => self.ui.modal(&request).await,
                }
            }
        };

        let response = match response {
            Ok(response) => response,
            // Fail closed at the UI boundary.
            Err(err) => ToolApprovalResponse::deny_once(err.to_string()),
        };

        self.record_decision(&request, &response);
        response
    }

    /// Store a decision in the matching cache tier. `Once` answers are never
    /// stored; other scopes are stored when requested or implied.
    pub fn record_decision(&self, request: &ToolApprovalRequest, response: &ToolApprovalResponse) {
        if response.scope == ApprovalScope::Once && !response.remember_decision {
            return;
        }
        let decision = if response.approved { RuleDecision::Allow } else { RuleDecision::Deny };
        match response.scope {
            ApprovalScope::Once => {}
            ApprovalScope::Session => {
                if let Some(session_id) = &request.session_id {
                    self.session_rules
                        .lock()
                        .expect("broker lock poisoned")
                        .insert((request.tool_name.clone(), session_id.clone()), decision);
                }
            }
            ApprovalScope::Global => {
                self.global_rules
                    .lock()
                    .expect("broker lock poisoned")
                    .insert(request.tool_name.clone(), decision);
            }
        }
    }

    /// Persist Global rules. Session rules are intentionally not written.
    pub fn save_rules(&self) -> OrchestratorResult<()> {
        if let Some(path) = &self.rules_path {
            let rules = self.global_rules.lock().expect("broker lock poisoned").clone();
            storage::save_approval_rules(path, &rules)?;
        }
        Ok(())
    }

    /// Load Global rules from disk. A missing or corrupt file is logged and
    /// treated as empty; startup never fails here.
    pub fn load_rules(&self) {
        if let Some(path) = &self.rules_path {
            let rules = storage::load_approval_rules(path);
            *self.global_rules.lock().expect("broker lock poisoned") = rules;
        }
    }

    /// Drop every Session rule belonging to `session_id`.
    pub fn clear_session_rules(&self, session_id: &str) {
        self.session_rules
            .lock()
            .expect("broker lock poisoned")
            .retain(|(_, sid), _| sid != session_id);
    }

    fn cached_decision(&self, request: &ToolApprovalRequest) -> Option<RuleDecision> {
        if let Some(decision) = self
            .global_rules
            .lock()
            .expect("broker lock poisoned")
            .get(&request.tool_name)
        {
            return Some(*decision);
        }
        if let Some(session_id) = &request.session_id {
            if let Some(decision) = self
                .session_rules
                .lock()
                .expect("broker lock poisoned")
                .get(&(request.tool_name.clone(), session_id.clone()))
            {
                return Some(*decision);
            }
        }
        None
    }

    #[cfg(test)]
    fn global_rule(&self, tool: &str) -> Option<RuleDecision> {
        self.global_rules.lock().unwrap().get(tool).copied()
    }

    #[cfg(test)]
    fn session_rule(&self, tool: &str, session: &str) -> Option<RuleDecision> {
        self.session_rules
            .lock()
            .unwrap()
            .get(&(tool.to_string(), session.to_string()))
            .copied()
    }
}
