//! The panel: a finite Head/Moderator/Panelist discussion engine.
//!
//! A discussion moves through clarification (the head asks questions until
//! the request is clear), topic approval, preparation (seating a moderator
//! and panelists), a moderator-gated running loop, convergence, and
//! synthesis into a report plus a knowledge brief.
//!
//! ```text
//! Idle -> Clarifying -> AwaitingApproval -> Preparing -> Running
//!      -> Converging -> Synthesizing -> Completed
//! ```
//!
//! The moderator decides each turn who speaks: one panelist, a parallel
//! group (scatter/gather, transcript order preserved), or everyone
//! round-robin. A heuristic convergence detector ends the discussion when
//! agreement is high enough; budgets and turn limits bound it otherwise.
//! `Failed` is reserved for unrecoverable loop errors; a single bad turn is
//! logged and the discussion continues.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agentdesk::agent::{
    short_id, Agent, AgentRole, Head, MessageType, Moderator, PanelMessage, Panelist,
    DEFAULT_PROFILES,
};
use crate::agentdesk::brief::{self, KnowledgeBrief};
use crate::agentdesk::chat_client::ChatClient;
use crate::agentdesk::config::{DiscussionDepth, PanelSettings};
use crate::agentdesk::cost::CostTracker;
use crate::agentdesk::error::{OrchestratorError, OrchestratorResult};
use crate::agentdesk::event::{EventHandler, PanelEvent, PanelEventKind, PanelEvents};
use crate::agentdesk::moderator::{
    evaluate_convergence, MessageValidator, ModeratorVerdict,
};
use crate::agentdesk::protocol::{self, truncate_with_ellipsis};

/// Recent panelist messages kept verbatim during synthesis compression.
const COMPRESS_KEEP_RECENT: usize = 40;
/// Character cap applied to each kept message.
const COMPRESS_MESSAGE_CHARS: usize = 500;

/// Phases of the panel FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelPhase {
    Idle,
    Clarifying,
    AwaitingApproval,
    Preparing,
    Running,
    Paused,
    Converging,
    Synthesizing,
    Completed,
    Stopped,
    Failed,
}

impl fmt::Display for PanelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Default)]
struct PanelState {
    settings: PanelSettings,
    session_id: String,
    transcript: Vec<PanelMessage>,
    topic: Option<String>,
    synthesis: Option<String>,
    brief: Option<KnowledgeBrief>,
    detected_depth: Option<DiscussionDepth>,
    head_replies: u32,
    turn: u64,
    estimated_tokens: usize,
    tool_calls_made: usize,
    head: Option<Arc<Head>>,
    moderator: Option<Arc<Moderator>>,
    panelists: Vec<Arc<Panelist>>,
}

/// The finite discussion orchestrator.
pub struct PanelOrchestrator {
    client: Arc<dyn ChatClient>,
    events: Arc<PanelEvents>,
    cost: Arc<CostTracker>,
    base_settings: PanelSettings,
    phase: Mutex<PanelPhase>,
    transition_lock: TokioMutex<()>,
    state: Mutex<PanelState>,
    paused: watch::Sender<bool>,
    cancel: Mutex<CancellationToken>,
    run_handle: TokioMutex<Option<JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl PanelOrchestrator {
    pub fn new(
        client: Arc<dyn ChatClient>,
        settings: PanelSettings,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            client,
            events: Arc::new(PanelEvents::new(handler)),
            cost: Arc::new(CostTracker::new()),
            base_settings: settings.normalized(),
            phase: Mutex::new(PanelPhase::Idle),
            transition_lock: TokioMutex::new(()),
            state: Mutex::new(PanelState::default()),
            paused,
            cancel: Mutex::new(CancellationToken::new()),
            run_handle: TokioMutex::new(None),
            weak: weak.clone(),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("orchestrator dropped while in use")
    }

    pub fn current_phase(&self) -> PanelPhase {
        *self.phase.lock().expect("panel phase lock poisoned")
    }

    /// The active discussion id, empty before the first start.
    pub fn session_id(&self) -> String {
        self.state.lock().expect("panel state lock poisoned").session_id.clone()
    }

    /// Effective settings for the active discussion (depth presets applied).
    pub fn settings(&self) -> PanelSettings {
        self.state.lock().expect("panel state lock poisoned").settings.clone()
    }

    pub fn transcript(&self) -> Vec<PanelMessage> {
        self.state.lock().expect("panel state lock poisoned").transcript.clone()
    }

    pub fn topic(&self) -> Option<String> {
        self.state.lock().expect("panel state lock poisoned").topic.clone()
    }

    pub fn synthesis(&self) -> Option<String> {
        self.state.lock().expect("panel state lock poisoned").synthesis.clone()
    }

    pub fn brief(&self) -> Option<KnowledgeBrief> {
        self.state.lock().expect("panel state lock poisoned").brief.clone()
    }

    pub fn cost(&self) -> &Arc<CostTracker> {
        &self.cost
    }

    /// Name and model of every seated panelist, in seat order. Empty before
    /// Preparing and after disposal.
    pub fn seated_panelists(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .expect("panel state lock poisoned")
            .panelists
            .iter()
            .map(|p| (p.agent.name.clone(), p.agent.model.clone()))
            .collect()
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// Submit the user's request and begin clarification. No-op unless Idle.
    pub async fn start(&self, prompt: impl Into<String>) {
        if self.current_phase() != PanelPhase::Idle {
            log::warn!("panel start ignored in phase {}", self.current_phase());
            return;
        }
        let prompt = prompt.into();

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("panel cancel lock poisoned") = cancel.clone();
        self.paused.send_replace(false);

        let session_id = format!("panel-{}", short_id());
        let head = Arc::new(Head::new(Agent::new(
            1,
            "Head",
            AgentRole::Head,
            self.base_settings.primary_model.clone(),
            self.client.clone(),
            self.events.clone(),
            self.cost.clone(),
            cancel.clone(),
        )));
        {
            let mut state = self.state.lock().expect("panel state lock poisoned");
            *state = PanelState {
                settings: self.base_settings.clone(),
                session_id: session_id.clone(),
                head: Some(head),
                ..PanelState::default()
            };
        }

        self.transition(PanelPhase::Clarifying).await;
        self.append_message(PanelMessage::from_user(&session_id, prompt.clone())).await;
        self.head_exchange(&prompt).await;
    }

    /// Continue the clarification dialogue. No-op outside Clarifying.
    pub async fn send_user_message(&self, text: impl Into<String>) {
        if self.current_phase() != PanelPhase::Clarifying {
            return;
        }
        let text = text.into();
        let session_id = self.session_id();
        self.append_message(PanelMessage::from_user(session_id, text.clone())).await;
        self.head_exchange(&text).await;
    }

    /// Reject the proposed topic; the head resumes clarifying with the
    /// feedback. No-op outside AwaitingApproval.
    pub async fn reject_topic(&self, feedback: impl Into<String>) {
        if self.current_phase() != PanelPhase::AwaitingApproval {
            return;
        }
        let feedback = feedback.into();
        self.transition(PanelPhase::Clarifying).await;
        let session_id = self.session_id();
        self.append_message(PanelMessage::from_user(session_id, feedback.clone())).await;
        self.head_exchange(&feedback).await;
    }

    /// Approve the topic, seat the panel, and start the discussion loop.
    pub async fn approve_and_start(&self) {
        if self.current_phase() != PanelPhase::AwaitingApproval {
            return;
        }
        self.transition(PanelPhase::Preparing).await;

        let cancel = self.cancel.lock().expect("panel cancel lock poisoned").clone();
        {
            let mut state = self.state.lock().expect("panel state lock poisoned");
            let detected = state.detected_depth;
            let depth = state.settings.effective_depth(detected);
            state.settings.apply_depth(depth);

            let validator = MessageValidator::new(&state.settings);
            state.moderator = Some(Arc::new(Moderator::new(
                Agent::new(
                    2,
                    "Moderator",
                    AgentRole::Moderator,
                    state.settings.primary_model.clone(),
                    self.client.clone(),
                    self.events.clone(),
                    self.cost.clone(),
                    cancel.clone(),
                ),
                validator,
            )));

            let models = state.settings.panelist_models.clone();
            let primary = state.settings.primary_model.clone();
            state.panelists = DEFAULT_PROFILES
                .iter()
                .take(state.settings.max_panelists)
                .map(|profile| {
                    let model = if models.is_empty() {
                        primary.clone()
                    } else {
                        models[profile.id % models.len()].clone()
                    };
                    Arc::new(Panelist::new(
                        Agent::new(
                            3 + profile.id as u64,
                            profile.name.clone(),
                            AgentRole::Panelist,
                            model,
                            self.client.clone(),
                            self.events.clone(),
                            self.cost.clone(),
                            cancel.clone(),
                        ),
                        profile.clone(),
                    ))
                })
                .collect();
        }

        self.transition(PanelPhase::Running).await;
        let this = self.strong();
        let handle = tokio::spawn(async move {
            let result = this.discussion_loop(&cancel).await;
            if let Err(err) = result {
                if !cancel.is_cancelled() {
                    this.events
                        .emit_kind(PanelEventKind::ErrorRaised { message: err.to_string() })
                        .await;
                    this.transition(PanelPhase::Failed).await;
                    this.dispose_agents().await;
                }
            }
        });
        *self.run_handle.lock().await = Some(handle);
    }

    /// Pause the discussion. Agents report paused so UIs can stop their
    /// thinking indicators.
    pub async fn pause(&self) {
        if self.current_phase() != PanelPhase::Running {
            return;
        }
        self.paused.send_replace(true);
        self.transition(PanelPhase::Paused).await;
        for agent in self.agent_handles() {
            agent.agent_ref().pause().await;
        }
    }

    pub async fn resume(&self) {
        if self.current_phase() != PanelPhase::Paused {
            return;
        }
        self.transition(PanelPhase::Running).await;
        for agent in self.agent_handles() {
            agent.agent_ref().resume().await;
        }
        self.paused.send_replace(false);
    }

    /// Stop the discussion and dispose every agent. Safe from any phase;
    /// never propagates an error.
    pub async fn stop(&self) {
        if matches!(self.current_phase(), PanelPhase::Idle | PanelPhase::Stopped) {
            return;
        }
        self.cancel.lock().expect("panel cancel lock poisoned").cancel();
        self.paused.send_replace(false);

        if let Some(handle) = self.run_handle.lock().await.take() {
            if let Err(err) = handle.await {
                log::warn!("panel loop join failed: {}", err);
            }
        }

        self.dispose_agents().await;
        self.transition(PanelPhase::Stopped).await;
    }

    /// Stop, clear all discussion state, and return to Idle.
    pub async fn reset(&self) {
        self.stop().await;
        {
            let mut state = self.state.lock().expect("panel state lock poisoned");
            *state = PanelState::default();
        }
        self.cost.reset();
        self.transition(PanelPhase::Idle).await;
    }

    /// Answer a follow-up question from the knowledge brief. Only valid in
    /// Completed; the transcript is never replayed.
    pub async fn follow_up(&self, question: &str) -> OrchestratorResult<String> {
        if self.current_phase() != PanelPhase::Completed {
            return Err(OrchestratorError::FsmTransition {
                phase: self.current_phase().to_string(),
                trigger: "FollowUp".to_string(),
            });
        }
        let brief = self
            .brief()
            .ok_or_else(|| OrchestratorError::Parse("no knowledge brief available".to_string()))?;
        brief::answer_follow_up(self.client.clone(), &brief, question).await
    }

    // ── Clarification ────────────────────────────────────────────────────

    async fn head_exchange(&self, user_text: &str) {
        let head = match self.state.lock().expect("panel state lock poisoned").head.clone() {
            Some(head) => head,
            None => return,
        };

        let reply = match head.clarify(user_text).await {
            Ok(reply) => reply,
            Err(OrchestratorError::Cancelled) => return,
            Err(err) => {
                log::warn!("head clarification failed: {}", err);
                self.events
                    .emit_kind(PanelEventKind::ErrorRaised { message: err.to_string() })
                    .await;
                return;
            }
        };

        let session_id = {
            let mut state = self.state.lock().expect("panel state lock poisoned");
            if state.head_replies == 0 {
                state.detected_depth = protocol::discussion_depth(&reply);
            }
            state.head_replies += 1;
            state.session_id.clone()
        };

        if let Some(restatement) = protocol::clear_payload(&reply) {
            let topic = match head.compose_topic(restatement).await {
                Ok(topic) => topic,
                Err(OrchestratorError::Cancelled) => return,
                Err(err) => {
                    log::warn!("topic composition failed, using restatement: {}", err);
                    restatement.to_string()
                }
            };
            {
                let mut state = self.state.lock().expect("panel state lock poisoned");
                state.topic = Some(topic.clone());
            }
            self.append_message(PanelMessage::from_agent(
                &session_id,
                &head.agent,
                MessageType::TopicOfDiscussion,
                topic,
            ))
            .await;
            self.transition(PanelPhase::AwaitingApproval).await;
        } else {
            self.append_message(PanelMessage::from_agent(
                &session_id,
                &head.agent,
                MessageType::Clarification,
                reply,
            ))
            .await;
        }
    }

    // ── Discussion loop ──────────────────────────────────────────────────

    async fn discussion_loop(&self, cancel: &CancellationToken) -> OrchestratorResult<()> {
        let (settings, session_id, topic, moderator, panelists, head) = {
            let state = self.state.lock().expect("panel state lock poisoned");
            (
                state.settings.clone(),
                state.session_id.clone(),
                state.topic.clone().unwrap_or_default(),
                state.moderator.clone(),
                state.panelists.clone(),
                state.head.clone(),
            )
        };
        let moderator = moderator.ok_or(OrchestratorError::FsmTransition {
            phase: "Running".to_string(),
            trigger: "DiscussionLoop".to_string(),
        })?;
        let head = head.ok_or(OrchestratorError::FsmTransition {
            phase: "Running".to_string(),
            trigger: "DiscussionLoop".to_string(),
        })?;
        if panelists.is_empty() {
            return Err(OrchestratorError::FsmTransition {
                phase: "Running".to_string(),
                trigger: "DiscussionLoop".to_string(),
            });
        }
        let panelist_names: Vec<String> =
            panelists.iter().map(|p| p.agent.name.clone()).collect();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.wait_while_paused(cancel).await;
            if cancel.is_cancelled() {
                return Ok(());
            }

            let turn = {
                let mut state = self.state.lock().expect("panel state lock poisoned");
                state.turn += 1;
                state.turn
            };
            self.events.emit_kind(PanelEventKind::TurnStarted { turn }).await;

            let recent = self.recent_transcript(8);
            let decision = moderator.decide(&topic, turn, &panelist_names, &recent).await;

            if decision.stop_discussion {
                break;
            }
            if let Some(reason) = &decision.redirect_message {
                self.events.emit(PanelEvent::moderation_note(reason.clone())).await;
            }

            let speakers = self.select_speakers(&decision, &panelists).await;
            let redirect = decision.redirect_message.as_deref();

            let produced: Vec<(Arc<Panelist>, OrchestratorResult<String>)> = match speakers {
                Speakers::Parallel(group) => {
                    // Scatter in group order, gather in the same order, so
                    // the transcript matches the moderator's list even when
                    // completion order differs.
                    let mut handles = Vec::with_capacity(group.len());
                    for panelist in &group {
                        let panelist = panelist.clone();
                        let topic = topic.clone();
                        let recent = recent.clone();
                        let redirect = redirect.map(str::to_string);
                        handles.push((
                            panelist.clone(),
                            tokio::spawn(async move {
                                panelist.argue(&topic, redirect.as_deref(), &recent).await
                            }),
                        ));
                    }
                    let mut produced = Vec::with_capacity(handles.len());
                    for (panelist, handle) in handles {
                        let outcome = match handle.await {
                            Ok(result) => result,
                            Err(join_err) => Err(OrchestratorError::Transport(format!(
                                "panelist task crashed: {}",
                                join_err
                            ))),
                        };
                        produced.push((panelist, outcome));
                    }
                    produced
                }
                Speakers::Single(panelist) => {
                    let outcome = panelist.argue(&topic, redirect, &recent).await;
                    vec![(panelist, outcome)]
                }
                Speakers::All => {
                    let mut produced = Vec::with_capacity(panelists.len());
                    for panelist in &panelists {
                        let recent = self.recent_transcript(8);
                        let outcome = panelist.argue(&topic, redirect, &recent).await;
                        produced.push((panelist.clone(), outcome));
                    }
                    produced
                }
            };

            let mut force_converge = false;
            for (panelist, outcome) in produced {
                let content = match outcome {
                    Ok(content) => content,
                    Err(OrchestratorError::Cancelled) => return Ok(()),
                    Err(err) => {
                        // One bad turn; the discussion continues.
                        log::warn!("panelist '{}' failed: {}", panelist.agent.name, err);
                        self.events
                            .emit_kind(PanelEventKind::ErrorRaised { message: err.to_string() })
                            .await;
                        continue;
                    }
                };

                let message = PanelMessage::from_agent(
                    &session_id,
                    &panelist.agent,
                    MessageType::PanelistArgument,
                    content,
                );
                self.append_message(message.clone()).await;

                let (tokens_spent, tool_calls_made) = {
                    let state = self.state.lock().expect("panel state lock poisoned");
                    (state.estimated_tokens, state.tool_calls_made)
                };
                match moderator.validate(&message, tokens_spent, tool_calls_made) {
                    ModeratorVerdict::Accept => {}
                    ModeratorVerdict::Blocked(reason) => {
                        self.drop_last_message();
                        self.events
                            .emit(PanelEvent::moderation_note(format!(
                                "blocked message from {}: {}",
                                panelist.agent.name, reason
                            )))
                            .await;
                    }
                    ModeratorVerdict::ForceConverge(reason) => {
                        self.events
                            .emit(PanelEvent::moderation_note(format!(
                                "forcing convergence: {}",
                                reason
                            )))
                            .await;
                        force_converge = true;
                        break;
                    }
                }
            }
            if force_converge {
                break;
            }

            let transcript = self.transcript();
            let report = evaluate_convergence(
                &transcript,
                turn,
                settings.max_turns,
                settings.convergence_threshold,
                &panelist_names,
            );
            if report.evaluated {
                self.events
                    .emit_kind(PanelEventKind::ConvergenceChecked {
                        turn,
                        score: report.score,
                        threshold: settings.convergence_threshold,
                        converged: report.converged,
                    })
                    .await;
            }
            if report.converged {
                break;
            }
            if turn >= settings.max_turns {
                break;
            }
        }

        self.transition(PanelPhase::Converging).await;
        self.transition(PanelPhase::Synthesizing).await;

        let transcript = self.transcript();
        let compressed = compress_transcript(&transcript);
        let synthesis = match head.synthesize(&compressed).await {
            Ok(synthesis) => synthesis,
            Err(OrchestratorError::Cancelled) => return Ok(()),
            Err(err) => {
                log::warn!("synthesis failed, using compressed transcript: {}", err);
                format!("# Discussion summary\n\n{}", compressed)
            }
        };
        {
            let mut state = self.state.lock().expect("panel state lock poisoned");
            state.synthesis = Some(synthesis.clone());
        }
        self.append_message({
            let session_id = self.session_id();
            PanelMessage::from_agent(&session_id, &head.agent, MessageType::Synthesis, synthesis.clone())
        })
        .await;
        self.events
            .emit_kind(PanelEventKind::SynthesisReady { report: synthesis.clone() })
            .await;

        let brief = brief::generate_brief(self.client.clone(), &synthesis, &transcript).await;
        {
            let mut state = self.state.lock().expect("panel state lock poisoned");
            state.brief = Some(brief.clone());
        }
        self.transition(PanelPhase::Completed).await;
        self.events.emit_kind(PanelEventKind::BriefReady { brief }).await;

        // The discussion is over; no agent keeps a live session around.
        self.dispose_agents().await;
        Ok(())
    }

    async fn select_speakers(
        &self,
        decision: &crate::agentdesk::moderator::ModeratorDecision,
        panelists: &[Arc<Panelist>],
    ) -> Speakers {
        if decision.allow_parallel_thinking && decision.parallel_group.len() >= 2 {
            let resolved: Vec<Option<Arc<Panelist>>> = decision
                .parallel_group
                .iter()
                .map(|name| resolve_panelist(name, panelists))
                .collect();
            if resolved.iter().all(Option::is_some) {
                return Speakers::Parallel(resolved.into_iter().flatten().collect());
            }
            let unknown: Vec<&str> = decision
                .parallel_group
                .iter()
                .zip(&resolved)
                .filter(|(_, hit)| hit.is_none())
                .map(|(name, _)| name.as_str())
                .collect();
            log::warn!(
                "parallel group contains unknown panelists ({}); falling back to round-robin",
                unknown.join(", ")
            );
            self.events
                .emit(PanelEvent::moderation_note(format!(
                    "parallel group unresolved ({}); running a full round instead",
                    unknown.join(", ")
                )))
                .await;
            return Speakers::All;
        }

        if let Some(name) = &decision.next_speaker {
            if let Some(panelist) = resolve_panelist(name, panelists) {
                return Speakers::Single(panelist);
            }
            log::warn!("next speaker '{}' not found; running a full round", name);
        }
        Speakers::All
    }

    // ── Shared helpers ───────────────────────────────────────────────────

    async fn append_message(&self, message: PanelMessage) {
        {
            let mut state = self.state.lock().expect("panel state lock poisoned");
            state.estimated_tokens += MessageValidator::estimate_tokens(&message.content);
            state.tool_calls_made += message.tool_calls.len();
            state.transcript.push(message.clone());
        }
        self.events.emit_kind(PanelEventKind::AgentMessage { message }).await;
    }

    fn drop_last_message(&self) {
        let mut state = self.state.lock().expect("panel state lock poisoned");
        state.transcript.pop();
    }

    fn recent_transcript(&self, count: usize) -> String {
        let state = self.state.lock().expect("panel state lock poisoned");
        let messages = &state.transcript;
        let start = messages.len().saturating_sub(count);
        messages[start..]
            .iter()
            .map(|m| format!("{}: {}", m.author_name, truncate_with_ellipsis(&m.content, 400)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn agent_handles(&self) -> Vec<Arc<dyn AgentHandle>> {
        let state = self.state.lock().expect("panel state lock poisoned");
        let mut handles: Vec<Arc<dyn AgentHandle>> = Vec::new();
        if let Some(head) = &state.head {
            handles.push(head.clone());
        }
        if let Some(moderator) = &state.moderator {
            handles.push(moderator.clone());
        }
        for panelist in &state.panelists {
            handles.push(panelist.clone());
        }
        handles
    }

    async fn dispose_agents(&self) {
        let handles = {
            let mut state = self.state.lock().expect("panel state lock poisoned");
            let mut handles: Vec<Arc<dyn AgentHandle>> = Vec::new();
            if let Some(head) = state.head.take() {
                handles.push(head);
            }
            if let Some(moderator) = state.moderator.take() {
                handles.push(moderator);
            }
            for panelist in state.panelists.drain(..) {
                handles.push(panelist);
            }
            handles
        };
        for handle in handles {
            handle.agent_ref().dispose().await;
        }
    }

    async fn wait_while_paused(&self, cancel: &CancellationToken) {
        let mut gate = self.paused.subscribe();
        loop {
            if !*gate.borrow() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = gate.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn transition(&self, to: PanelPhase) {
        let _guard = self.transition_lock.lock().await;
        let previous = {
            let mut phase = self.phase.lock().expect("panel phase lock poisoned");
            let previous = *phase;
            *phase = to;
            previous
        };
        if previous != to {
            self.events
                .emit_kind(PanelEventKind::PhaseChanged { previous, current: to })
                .await;
        }
    }
}

enum Speakers {
    Parallel(Vec<Arc<Panelist>>),
    Single(Arc<Panelist>),
    All,
}

/// Uniform pause/resume/dispose access over the three agent variants.
trait AgentHandle: Send + Sync {
    fn agent_ref(&self) -> &Agent;
}

impl AgentHandle for Head {
    fn agent_ref(&self) -> &Agent {
        &self.agent
    }
}

impl AgentHandle for Moderator {
    fn agent_ref(&self) -> &Agent {
        &self.agent
    }
}

impl AgentHandle for Panelist {
    fn agent_ref(&self) -> &Agent {
        &self.agent
    }
}

fn resolve_panelist(name: &str, panelists: &[Arc<Panelist>]) -> Option<Arc<Panelist>> {
    let wanted = name.trim();
    panelists
        .iter()
        .find(|p| p.agent.name.eq_ignore_ascii_case(wanted))
        .cloned()
}

/// Compress a transcript for synthesis: the most recent panelist messages
/// stay (capped per message), everything older collapses into a single
/// condensed block of one-line snippets.
fn compress_transcript(messages: &[PanelMessage]) -> String {
    let arguments: Vec<&PanelMessage> = messages
        .iter()
        .filter(|m| m.message_type == MessageType::PanelistArgument)
        .collect();
    let split = arguments.len().saturating_sub(COMPRESS_KEEP_RECENT);
    let (older, recent) = arguments.split_at(split);

    let mut out = String::new();
    if !older.is_empty() {
        out.push_str("Earlier discussion (condensed):\n");
        for message in older {
            let first_line = message.content.lines().next().unwrap_or("").trim();
            out.push_str(&format!(
                "- {}: {}\n",
                message.author_name,
                truncate_with_ellipsis(first_line, 100)
            ));
        }
        out.push('\n');
    }
    for message in recent {
        out.push_str(&format!(
            "{}: {}\n\n",
            message.author_name,
            truncate_with_ellipsis(&message.content, COMPRESS_MESSAGE_CHARS)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn argument(author: &str, content: &str) -> PanelMessage {
        PanelMessage {
            session_id: "sess".to_string(),
            author_agent_id: 1,
            author_name: author.to_string(),
            author_role: AgentRole::Panelist,
            content: content.to_string(),
            message_type: MessageType::PanelistArgument,
            in_reply_to: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn compression_keeps_recent_and_condenses_older() {
        let messages: Vec<PanelMessage> = (0..50)
            .map(|i| argument(&format!("P{}", i % 3), &format!("Argument number {}\nDetails.", i)))
            .collect();

        let compressed = compress_transcript(&messages);
        assert!(compressed.starts_with("Earlier discussion (condensed):"));
        // The ten oldest collapse into one-liners; the rest stay verbatim.
        assert!(compressed.contains("- P0: Argument number 0"));
        assert!(compressed.contains("Argument number 49"));
        assert!(!compressed.contains("Argument number 0\nDetails."));
    }

    #[test]
    fn compression_caps_message_length() {
        let long = "x".repeat(2_000);
        let messages = vec![argument("P0", &long)];
        let compressed = compress_transcript(&messages);
        assert!(compressed.chars().count() < 600);
        assert!(compressed.contains('…'));
    }

    #[test]
    fn short_transcripts_skip_the_condensed_block() {
        let messages = vec![argument("P0", "only one")];
        let compressed = compress_transcript(&messages);
        assert!(!compressed.contains("condensed"));
        assert!(compressed.contains("only one"));
    }
}
