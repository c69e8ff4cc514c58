//! Panel agent roles.
//!
//! A panel run owns one [`Head`], one [`Moderator`], and a set of
//! [`Panelist`]s. All three are thin variants over a single [`Agent`]
//! capability: identity, a chat session, a publish-only event sink, and a
//! cooperative cancel signal. Role-specific behaviour (clarify, synthesize,
//! decide, validate, argue) lives on the variants; agents never hold a
//! reference back to the orchestrator.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agentdesk::chat_client::ChatClient;
use crate::agentdesk::cost::CostTracker;
use crate::agentdesk::error::{OrchestratorError, OrchestratorResult};
use crate::agentdesk::event::{PanelEvent, PanelEvents};
use crate::agentdesk::moderator::{self, MessageValidator, ModeratorDecision, ModeratorVerdict};

/// Generate a stable 8-hex identifier for tasks and sessions.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// The three discussion roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Head,
    Moderator,
    Panelist,
}

/// Lifecycle state reported through agent status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Thinking,
    Paused,
    Disposed,
}

/// What kind of contribution a panel message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    UserMessage,
    Clarification,
    TopicOfDiscussion,
    PanelistArgument,
    ModerationNote,
    Synthesis,
}

/// A single message in a panel transcript.
///
/// `author_agent_id` zero denotes the user; agents are numbered from one.
#[derive(Debug, Clone)]
pub struct PanelMessage {
    pub session_id: String,
    pub author_agent_id: u64,
    pub author_name: String,
    pub author_role: AgentRole,
    pub content: String,
    pub message_type: MessageType,
    pub in_reply_to: Option<u64>,
    pub tool_calls: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl PanelMessage {
    /// A message authored by the user (agent id zero, routed via the head).
    pub fn from_user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            author_agent_id: 0,
            author_name: "User".to_string(),
            author_role: AgentRole::Head,
            content: content.into(),
            message_type: MessageType::UserMessage,
            in_reply_to: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_agent(
        session_id: impl Into<String>,
        agent: &Agent,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            author_agent_id: agent.id,
            author_name: agent.name.clone(),
            author_role: agent.role,
            content: content.into(),
            message_type,
            in_reply_to: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// A panelist archetype from the balanced default set.
#[derive(Debug, Clone)]
pub struct PanelistProfile {
    pub id: usize,
    pub name: String,
    pub expertise: String,
    pub personality: String,
}

lazy_static! {
    /// The balanced default profile set a panel seats panelists from.
    ///
    /// `max_panelists` slices this list front to back, so the most
    /// complementary pairings come first.
    pub static ref DEFAULT_PROFILES: Vec<PanelistProfile> = vec![
        PanelistProfile {
            id: 0,
            name: "Analyst".to_string(),
            expertise: "Breaking problems into measurable parts".to_string(),
            personality: "Methodical and evidence-driven".to_string(),
        },
        PanelistProfile {
            id: 1,
            name: "Skeptic".to_string(),
            expertise: "Finding failure modes and hidden assumptions".to_string(),
            personality: "Challenges every claim before accepting it".to_string(),
        },
        PanelistProfile {
            id: 2,
            name: "Pragmatist".to_string(),
            expertise: "Shipping workable solutions under real constraints".to_string(),
            personality: "Prefers the feasible over the ideal".to_string(),
        },
        PanelistProfile {
            id: 3,
            name: "Visionary".to_string(),
            expertise: "Long-range consequences and second-order effects".to_string(),
            personality: "Optimistic, favors bold framing".to_string(),
        },
        PanelistProfile {
            id: 4,
            name: "Researcher".to_string(),
            expertise: "Prior art, references, and comparative evidence".to_string(),
            personality: "Thorough and citation-minded".to_string(),
        },
        PanelistProfile {
            id: 5,
            name: "Critic".to_string(),
            expertise: "Quality bars and rigorous evaluation".to_string(),
            personality: "Direct, holds a high standard".to_string(),
        },
        PanelistProfile {
            id: 6,
            name: "Synthesizer".to_string(),
            expertise: "Reconciling positions into coherent wholes".to_string(),
            personality: "Bridging and integrative".to_string(),
        },
        PanelistProfile {
            id: 7,
            name: "Advocate".to_string(),
            expertise: "User impact and stakeholder perspectives".to_string(),
            personality: "Empathetic, argues from lived consequences".to_string(),
        },
    ];
}

/// The shared agent capability: identity, session, sink, cancel signal.
pub struct Agent {
    pub id: u64,
    pub name: String,
    pub role: AgentRole,
    pub model: String,
    session_id: String,
    client: Arc<dyn ChatClient>,
    events: Arc<PanelEvents>,
    cost: Arc<CostTracker>,
    cancel: CancellationToken,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        name: impl Into<String>,
        role: AgentRole,
        model: impl Into<String>,
        client: Arc<dyn ChatClient>,
        events: Arc<PanelEvents>,
        cost: Arc<CostTracker>,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let session_id = format!(
            "panel-{}-{}",
            name.to_ascii_lowercase().replace(' ', "-"),
            short_id()
        );
        Self {
            id,
            name,
            role,
            model: model.into(),
            session_id,
            client,
            events,
            cost,
            cancel,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send a prompt on this agent's session, honoring the cancel signal.
    ///
    /// Status events bracket the call so UIs can render a thinking indicator
    /// that is guaranteed to clear.
    pub async fn process(&self, prompt: &str) -> OrchestratorResult<String> {
        self.publish_status(AgentStatus::Thinking).await;
        let result = tokio::select! {
            r = self.client.send_blocking(&self.session_id, prompt) => r,
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
        };
        self.publish_status(AgentStatus::Idle).await;
        let message = result?;
        if let Some(usage) = &message.usage {
            self.cost.record(usage);
        }
        Ok(message.content)
    }

    pub async fn pause(&self) {
        self.publish_status(AgentStatus::Paused).await;
    }

    pub async fn resume(&self) {
        self.publish_status(AgentStatus::Idle).await;
    }

    /// Terminate the agent's session. Termination failures are logged and
    /// swallowed; dispose never propagates an error.
    pub async fn dispose(&self) {
        if let Err(err) = self.client.terminate_session(&self.session_id).await {
            log::warn!(
                "failed to terminate session '{}' for agent '{}': {}",
                self.session_id,
                self.name,
                err
            );
        }
        self.publish_status(AgentStatus::Disposed).await;
    }

    async fn publish_status(&self, status: AgentStatus) {
        self.events
            .emit(PanelEvent::agent_status(self.id, &self.name, status))
            .await;
    }
}

/// The head drives clarification, topic composition, and synthesis.
pub struct Head {
    pub agent: Agent,
}

impl Head {
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }

    /// Ask the head to clarify the user's request. The reply either asks a
    /// question or opens with `CLEAR:` followed by its understanding.
    pub async fn clarify(&self, user_text: &str) -> OrchestratorResult<String> {
        let prompt = format!(
            "A user wants the panel to discuss the following request.\n\n\
             Request: {}\n\n\
             If anything essential is ambiguous, ask ONE clarifying question. \
             When the request is clear enough to discuss, reply starting with \
             'CLEAR:' followed by a one-paragraph restatement. \
             You may include a line 'DISCUSSION_DEPTH: Quick|Standard|Deep' \
             matching the weight of the request.",
            user_text
        );
        self.agent.process(&prompt).await
    }

    /// Compose the topic of discussion from the clarification exchange.
    pub async fn compose_topic(&self, restatement: &str) -> OrchestratorResult<String> {
        let prompt = format!(
            "Based on the clarification exchange so far, write the Topic of \
             Discussion the panel will debate. Restatement: {}\n\n\
             Reply with the topic only: a title line and two or three framing \
             sentences.",
            restatement
        );
        self.agent.process(&prompt).await
    }

    /// Produce the final structured Markdown report from a compressed
    /// transcript.
    pub async fn synthesize(&self, compressed_transcript: &str) -> OrchestratorResult<String> {
        let prompt = format!(
            "The panel discussion is complete. Synthesize a structured \
             Markdown report with sections for Summary, Key Arguments, \
             Consensus, Dissent, and Recommendations.\n\n\
             Discussion transcript:\n{}",
            compressed_transcript
        );
        self.agent.process(&prompt).await
    }
}

/// The moderator arbitrates turns and validates messages.
pub struct Moderator {
    pub agent: Agent,
    validator: MessageValidator,
}

impl Moderator {
    pub fn new(agent: Agent, validator: MessageValidator) -> Self {
        Self { agent, validator }
    }

    /// Ask for a turn decision. Any failure, transport or parse, yields the
    /// fallback decision: continue with all panelists, score zero.
    pub async fn decide(
        &self,
        topic: &str,
        turn: u64,
        panelist_names: &[String],
        recent_transcript: &str,
    ) -> ModeratorDecision {
        let prompt = format!(
            "You moderate a panel discussion.\n\
             Topic: {topic}\nTurn: {turn}\nPanelists: {names}\n\n\
             Recent discussion:\n{recent}\n\n\
             Reply with ONLY a JSON object: {{\"nextSpeaker\": string|null, \
             \"convergenceScore\": 0-100, \"stopDiscussion\": bool, \
             \"reason\": string, \"redirectMessage\": string|null, \
             \"allowParallelThinking\": bool, \"parallelGroup\": [string], \
             \"parallelRationale\": string|null}}. \
             Use null nextSpeaker for a full round.",
            topic = topic,
            turn = turn,
            names = panelist_names.join(", "),
            recent = recent_transcript,
        );
        match self.agent.process(&prompt).await {
            Ok(reply) => moderator::parse_moderator_decision(&reply),
            Err(err) => {
                log::warn!("moderator decision failed, using fallback: {}", err);
                ModeratorDecision::fallback()
            }
        }
    }

    /// Validate a produced message against local policy and budgets.
    pub fn validate(
        &self,
        message: &PanelMessage,
        tokens_spent: usize,
        tool_calls_made: usize,
    ) -> ModeratorVerdict {
        self.validator.validate(&message.content, tokens_spent, tool_calls_made)
    }
}

/// A panelist argues one perspective of the topic.
pub struct Panelist {
    pub agent: Agent,
    pub profile: PanelistProfile,
}

impl Panelist {
    pub fn new(agent: Agent, profile: PanelistProfile) -> Self {
        Self { agent, profile }
    }

    /// Produce this panelist's next argument.
    pub async fn argue(
        &self,
        topic: &str,
        redirect: Option<&str>,
        recent_transcript: &str,
    ) -> OrchestratorResult<String> {
        let mut prompt = format!(
            "You are {name}, a panelist. Expertise: {expertise}. \
             Approach: {personality}.\n\nTopic: {topic}\n\n\
             Recent discussion:\n{recent}\n\n",
            name = self.agent.name,
            expertise = self.profile.expertise,
            personality = self.profile.personality,
            topic = topic,
            recent = recent_transcript,
        );
        if let Some(redirect) = redirect {
            prompt.push_str(&format!("Moderator direction: {}\n\n", redirect));
        }
        prompt.push_str(
            "Contribute your next argument. Engage with what others said; \
             be concise and concrete.",
        );
        self.agent.process(&prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(short_id(), short_id());
    }

    #[test]
    fn default_profiles_cover_the_panelist_range() {
        assert_eq!(DEFAULT_PROFILES.len(), 8);
        for (idx, profile) in DEFAULT_PROFILES.iter().enumerate() {
            assert_eq!(profile.id, idx);
            assert!(!profile.name.is_empty());
        }
    }

    #[test]
    fn user_messages_use_agent_id_zero() {
        let msg = PanelMessage::from_user("sess", "hello");
        assert_eq!(msg.author_agent_id, 0);
        assert_eq!(msg.message_type, MessageType::UserMessage);
    }
}
