//! Configuration types for the office, the panel, and the application shell.
//!
//! Configs are plain structs with serde derives; persistence lives in
//! [`storage`](crate::agentdesk::storage). Construct them manually or load
//! them from `settings.json`. Values outside their documented ranges are
//! clamped by `normalized()` rather than rejected, so a hand-edited settings
//! file can never wedge startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How tool approval requests reach the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub enum ApprovalUiMode {
    /// A blocking dialog; the request waits until the user answers.
    #[default]
    Modal,
    /// A non-blocking toast that auto-denies after ten seconds.
    Inline,
    /// A three second quick-action toast that escalates to a modal dialog
    /// when no quick answer arrives.
    Both,
}

/// Immutable configuration for one office run.
///
/// The orchestrator snapshots this at `start()`; later edits to the source
/// settings do not affect a running office (except the check interval, which
/// has its own live command).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub struct OfficeConfig {
    /// The standing objective the manager plans against every iteration.
    pub objective: String,
    /// Directory assistants operate in; forwarded to assistant prompts.
    pub workspace_path: PathBuf,
    /// Minutes to rest between iterations. Minimum 1.
    pub check_interval_minutes: u64,
    /// Upper bound on concurrently running assistants. Minimum 1.
    pub max_assistants: usize,
    /// When true, the generated plan must be approved before the loop starts.
    pub require_plan_approval: bool,
    /// Model id used for the persistent manager session.
    pub manager_model: String,
    /// Model id used for ephemeral assistant sessions.
    pub assistant_model: String,
    /// Per-assistant-task timeout in seconds. Must be positive.
    pub assistant_timeout_seconds: u64,
    /// Retry budget forwarded to assistant prompts.
    pub max_retries: u32,
    /// Opaque MCP server identifiers passed through to assistant sessions.
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,
    /// Opaque skill identifiers passed through to assistant sessions.
    #[serde(default)]
    pub skill_ids: Vec<String>,
}

impl Default for OfficeConfig {
    fn default() -> Self {
        Self {
            objective: String::new(),
            workspace_path: PathBuf::from("."),
            check_interval_minutes: 5,
            max_assistants: 3,
            require_plan_approval: true,
            manager_model: "default".to_string(),
            assistant_model: "default".to_string(),
            assistant_timeout_seconds: 300,
            max_retries: 2,
            mcp_server_ids: Vec::new(),
            skill_ids: Vec::new(),
        }
    }
}

impl OfficeConfig {
    /// Clamp out-of-range fields to their documented minimums.
    pub fn normalized(mut self) -> Self {
        self.check_interval_minutes = self.check_interval_minutes.max(1);
        self.max_assistants = self.max_assistants.max(1);
        self.assistant_timeout_seconds = self.assistant_timeout_seconds.max(1);
        self
    }
}

/// Discussion depth presets for the panel.
///
/// `Auto` defers to whatever the head detects from the user's request;
/// the other three force a preset regardless of detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub enum DiscussionDepth {
    #[default]
    Auto,
    Quick,
    Standard,
    Deep,
}

impl DiscussionDepth {
    /// Parse a depth keyword, case-insensitively.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(DiscussionDepth::Auto),
            "quick" => Some(DiscussionDepth::Quick),
            "standard" => Some(DiscussionDepth::Standard),
            "deep" => Some(DiscussionDepth::Deep),
            _ => None,
        }
    }
}

/// Tunables for one panel discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub struct PanelSettings {
    /// Model used for the head and as the panelist fallback.
    pub primary_model: String,
    /// Candidate models assigned to panelists round-robin by profile id.
    #[serde(default)]
    pub panelist_models: Vec<String>,
    /// Number of panelists to seat, clamped to `2..=8`.
    pub max_panelists: usize,
    /// Upper bound on moderator-gated turns.
    pub max_turns: u64,
    /// Token budget across the whole discussion; exhaustion forces convergence.
    pub max_total_tokens: usize,
    /// Tool-call budget across the whole discussion.
    pub max_tool_calls: usize,
    /// Wall-clock budget; the zombie watcher force-stops at twice this.
    pub max_duration_minutes: u64,
    /// Convergence score needed to end the discussion, `0..=100`.
    pub convergence_threshold: u32,
    /// Estimated-token ceiling for a single panelist message.
    pub max_tokens_per_turn: usize,
    /// Manual depth override; wins over head detection when not `Auto`.
    #[serde(default)]
    pub depth_override: DiscussionDepth,
    /// Regex patterns a panelist message must not match.
    #[serde(default)]
    pub prohibited_patterns: Vec<String>,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            primary_model: "default".to_string(),
            panelist_models: Vec::new(),
            max_panelists: 4,
            max_turns: 20,
            max_total_tokens: 200_000,
            max_tool_calls: 50,
            max_duration_minutes: 30,
            convergence_threshold: 80,
            max_tokens_per_turn: 1_500,
            depth_override: DiscussionDepth::Auto,
            prohibited_patterns: Vec::new(),
        }
    }
}

impl PanelSettings {
    /// Clamp out-of-range fields to their documented bounds.
    pub fn normalized(mut self) -> Self {
        self.max_panelists = self.max_panelists.clamp(2, 8);
        self.convergence_threshold = self.convergence_threshold.min(100);
        self.max_turns = self.max_turns.max(1);
        self
    }

    /// Apply a depth preset on top of the current values.
    ///
    /// Quick caps the turn count and lowers the bar for convergence; Deep
    /// raises both. Standard and Auto leave the configured values untouched.
    pub fn apply_depth(&mut self, depth: DiscussionDepth) {
        match depth {
            DiscussionDepth::Quick => {
                self.max_turns = self.max_turns.min(10);
                self.convergence_threshold = 60;
            }
            DiscussionDepth::Deep => {
                self.max_turns = self.max_turns.max(50);
                self.convergence_threshold = 90;
            }
            DiscussionDepth::Standard | DiscussionDepth::Auto => {}
        }
    }

    /// The effective depth for a discussion: the manual override when set,
    /// otherwise whatever the head detected, otherwise Standard.
    pub fn effective_depth(&self, detected: Option<DiscussionDepth>) -> DiscussionDepth {
        if self.depth_override != DiscussionDepth::Auto {
            return self.depth_override;
        }
        match detected {
            Some(DiscussionDepth::Auto) | None => DiscussionDepth::Standard,
            Some(d) => d,
        }
    }
}

/// App-wide preferences persisted in `settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub struct AppSettings {
    pub approval_ui_mode: ApprovalUiMode,
    pub default_depth: DiscussionDepth,
    #[serde(default)]
    pub office: OfficeDefaults,
}

/// Default values copied into a fresh [`OfficeConfig`] by UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub struct OfficeDefaults {
    pub check_interval_minutes: u64,
    pub max_assistants: usize,
    pub require_plan_approval: bool,
}

impl Default for OfficeDefaults {
    fn default() -> Self {
        Self {
            check_interval_minutes: 5,
            max_assistants: 3,
            require_plan_approval: true,
        }
    }
}
