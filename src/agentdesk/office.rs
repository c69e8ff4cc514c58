//! The office: a cyclic Manager/Assistant supervisor.
//!
//! One manager session plans against a standing objective, turns findings
//! into assistant tasks each iteration, dispatches them through the
//! [`AssistantPool`](crate::agentdesk::assistant_pool::AssistantPool),
//! aggregates the results, rests, and goes around again until stopped.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Planning -> (Clarifying -> Planning)* -> AwaitingApproval?
//!      -> [ FetchingEvents -> Scheduling -> Executing -> Aggregating -> Resting ]*
//! ```
//!
//! Every transition emits a `PhaseChanged` event and transitions are totally
//! ordered per orchestrator. Commands issued in a non-matching phase are
//! no-ops, never errors; the user mashing buttons cannot corrupt the FSM.
//!
//! Instructions injected mid-run accumulate in a concurrent bag and are
//! drained exactly once at the top of each iteration; a drained instruction
//! appears in that iteration's prompts and nowhere else.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{oneshot, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agentdesk::agent::short_id;
use crate::agentdesk::assistant_pool::{AssistantPool, AssistantResult, AssistantTask};
use crate::agentdesk::chat_client::{ChatClient, ChatRole};
use crate::agentdesk::config::OfficeConfig;
use crate::agentdesk::cost::CostTracker;
use crate::agentdesk::error::OrchestratorError;
use crate::agentdesk::event::{EventHandler, OfficeEventKind, OfficeEvents};
use crate::agentdesk::event_log::EventLog;
use crate::agentdesk::protocol::{self, TaskSpec};
use crate::agentdesk::scheduler::{CountdownScheduler, RestOutcome};
use crate::agentdesk::storage::{self, OfficeSessionRecord};

/// Retained iteration reports; older ones are dropped first.
const MAX_ITERATION_REPORTS: usize = 100;

/// Phases of the manager FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Idle,
    Clarifying,
    Planning,
    AwaitingApproval,
    FetchingEvents,
    Scheduling,
    Executing,
    Aggregating,
    Resting,
    Paused,
    Stopped,
    Error,
}

impl fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Everything one office iteration produced.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u64,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub scheduling_notes: Vec<String>,
    pub results: Vec<AssistantResult>,
    /// Aggregated Markdown summary posted to the chat stream.
    pub summary: String,
    pub instructions_absorbed: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

enum PlanReview {
    Approved,
    Rejected(Option<String>),
}

enum PlanOutcome {
    Plan(String),
    NeedsClarification(String),
    Cancelled,
}

#[derive(Default)]
struct OfficeState {
    session_id: Option<String>,
    plan: Option<String>,
    iteration: u64,
    reports: VecDeque<IterationReport>,
    clarification_gate: Option<oneshot::Sender<String>>,
    approval_gate: Option<oneshot::Sender<PlanReview>>,
}

/// The cyclic Manager/Assistant orchestrator.
pub struct OfficeOrchestrator {
    client: Arc<dyn ChatClient>,
    pool: AssistantPool,
    scheduler: Arc<CountdownScheduler>,
    events: Arc<OfficeEvents>,
    cost: Arc<CostTracker>,
    phase: Mutex<ManagerPhase>,
    transition_lock: TokioMutex<()>,
    state: Mutex<OfficeState>,
    injected: Mutex<Vec<String>>,
    paused: watch::Sender<bool>,
    check_interval_minutes: AtomicU64,
    run_handle: TokioMutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    session_dir: Option<PathBuf>,
    weak: Weak<Self>,
}

impl OfficeOrchestrator {
    /// Build an office over `client`. Events flow to `handler` and the
    /// internal log; session metadata is persisted under `session_dir` when
    /// provided.
    pub fn new(
        client: Arc<dyn ChatClient>,
        handler: Option<Arc<dyn EventHandler>>,
        session_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        let log = Arc::new(EventLog::new());
        let events = Arc::new(OfficeEvents::new(log, handler));
        let cost = Arc::new(CostTracker::new());
        let pool = AssistantPool::new(client.clone(), events.clone(), cost.clone());
        let (paused, _) = watch::channel(false);

        Arc::new_cyclic(|weak| Self {
            client,
            pool,
            scheduler: Arc::new(CountdownScheduler::new()),
            events,
            cost,
            phase: Mutex::new(ManagerPhase::Idle),
            transition_lock: TokioMutex::new(()),
            state: Mutex::new(OfficeState::default()),
            injected: Mutex::new(Vec::new()),
            paused,
            check_interval_minutes: AtomicU64::new(5),
            run_handle: TokioMutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            session_dir,
            weak: weak.clone(),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("orchestrator dropped while in use")
    }

    pub fn current_phase(&self) -> ManagerPhase {
        *self.phase.lock().expect("office phase lock poisoned")
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        self.events.log().clone()
    }

    pub fn cost(&self) -> &Arc<CostTracker> {
        &self.cost
    }

    pub fn scheduler(&self) -> &Arc<CountdownScheduler> {
        &self.scheduler
    }

    /// Snapshot of the retained iteration reports, oldest first.
    pub fn iteration_reports(&self) -> Vec<IterationReport> {
        self.state
            .lock()
            .expect("office state lock poisoned")
            .reports
            .iter()
            .cloned()
            .collect()
    }

    pub fn current_plan(&self) -> Option<String> {
        self.state.lock().expect("office state lock poisoned").plan.clone()
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// Begin a run. A no-op unless the office is `Idle`.
    pub async fn start(&self, config: OfficeConfig) {
        if self.current_phase() != ManagerPhase::Idle {
            log::warn!("start ignored: office is {}", self.current_phase());
            return;
        }
        let config = config.normalized();
        self.check_interval_minutes.store(config.check_interval_minutes, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("office cancel lock poisoned") = cancel.clone();
        self.paused.send_replace(false);

        let session_id = format!("office-manager-{}", short_id());
        {
            let mut state = self.state.lock().expect("office state lock poisoned");
            state.session_id = Some(session_id.clone());
            state.plan = None;
            state.iteration = 0;
        }
        self.events.set_iteration(0);
        self.transition(ManagerPhase::Planning).await;

        // Forward rest ticks into the event stream for the run's lifetime.
        {
            let events = self.events.clone();
            let mut ticks = self.scheduler.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        tick = ticks.recv() => match tick {
                            Ok(tick) => {
                                events
                                    .emit(OfficeEventKind::RestTick {
                                        seconds_remaining: tick.seconds_remaining,
                                        total_seconds: tick.total_seconds,
                                    })
                                    .await;
                            }
                            Err(_) => break,
                        },
                    }
                }
            });
        }

        let this = self.strong();
        let handle = tokio::spawn(async move {
            this.run(config, session_id, cancel.clone()).await;
            if !cancel.is_cancelled() {
                this.events
                    .emit(OfficeEventKind::ErrorRaised {
                        message: "office loop exited unexpectedly".to_string(),
                    })
                    .await;
                this.transition(ManagerPhase::Error).await;
            }
        });
        *self.run_handle.lock().await = Some(handle);
    }

    /// Approve the generated plan. A no-op outside `AwaitingApproval`.
    pub async fn approve_plan(&self) {
        if self.current_phase() != ManagerPhase::AwaitingApproval {
            return;
        }
        let gate = self.state.lock().expect("office state lock poisoned").approval_gate.take();
        if let Some(gate) = gate {
            let _ = gate.send(PlanReview::Approved);
        }
    }

    /// Reject the plan, optionally with feedback fed into the next attempt.
    pub async fn reject_plan(&self, feedback: Option<String>) {
        if self.current_phase() != ManagerPhase::AwaitingApproval {
            return;
        }
        let gate = self.state.lock().expect("office state lock poisoned").approval_gate.take();
        if let Some(gate) = gate {
            let _ = gate.send(PlanReview::Rejected(feedback));
        }
    }

    /// Answer the pending clarification question.
    ///
    /// The FSM moves back to `Planning` before the planner task is resumed,
    /// so the awaiter always wakes in the phase it expects.
    pub async fn respond_to_clarification(&self, answer: impl Into<String>) {
        if self.current_phase() != ManagerPhase::Clarifying {
            return;
        }
        let gate = self.state.lock().expect("office state lock poisoned").clarification_gate.take();
        if let Some(gate) = gate {
            let answer = answer.into();
            self.events
                .emit(OfficeEventKind::ChatMessage {
                    role: ChatRole::User,
                    content: answer.clone(),
                })
                .await;
            self.transition(ManagerPhase::Planning).await;
            let _ = gate.send(answer);
        }
    }

    /// Post an instruction for the next iteration. Instructions accumulate
    /// until the iteration drains them, each absorbed exactly once.
    pub async fn inject_instruction(&self, instruction: impl Into<String>) {
        let instruction = instruction.into();
        self.events
            .emit(OfficeEventKind::ChatMessage {
                role: ChatRole::User,
                content: instruction.clone(),
            })
            .await;
        self.injected.lock().expect("office inject lock poisoned").push(instruction);
    }

    /// Request a pause. The in-flight iteration runs to completion; the loop
    /// freezes at the next iteration boundary, and only then does the FSM
    /// report `Paused`.
    pub async fn pause(&self) {
        if !matches!(
            self.current_phase(),
            ManagerPhase::FetchingEvents
                | ManagerPhase::Scheduling
                | ManagerPhase::Executing
                | ManagerPhase::Aggregating
                | ManagerPhase::Resting
        ) {
            return;
        }
        self.paused.send_replace(true);
        self.scheduler.cancel_rest();
    }

    /// Release the pause gate. Also retracts a pause that was requested but
    /// has not gated the loop yet, in which case `Paused` never appears.
    pub async fn resume(&self) {
        if !*self.paused.borrow() {
            return;
        }
        self.paused.send_replace(false);
    }

    /// Change the rest interval used from the next rest onward.
    pub fn update_check_interval(&self, minutes: u64) {
        self.check_interval_minutes.store(minutes.max(1), Ordering::Relaxed);
    }

    /// End the current rest early.
    pub fn skip_rest(&self) {
        self.scheduler.cancel_rest();
    }

    /// Stop the run: cancel everything, wait for the loop, terminate the
    /// manager session, and land in `Stopped`. Never returns an error; all
    /// cleanup failures are logged and swallowed.
    pub async fn stop(&self) {
        if matches!(self.current_phase(), ManagerPhase::Idle | ManagerPhase::Stopped) {
            return;
        }

        self.cancel.lock().expect("office cancel lock poisoned").cancel();
        self.paused.send_replace(false);
        self.scheduler.cancel_rest();
        self.pool.cancel_all();
        {
            // Dropping the gate senders wakes any awaiter with a cancel.
            let mut state = self.state.lock().expect("office state lock poisoned");
            state.clarification_gate = None;
            state.approval_gate = None;
        }

        if let Some(handle) = self.run_handle.lock().await.take() {
            if let Err(err) = handle.await {
                log::warn!("office loop join failed: {}", err);
            }
        }

        let session_id = {
            self.state.lock().expect("office state lock poisoned").session_id.take()
        };
        if let Some(session_id) = session_id {
            if let Err(err) = self.client.terminate_session(&session_id).await {
                log::warn!("failed to terminate manager session '{}': {}", session_id, err);
            }
        }

        self.transition(ManagerPhase::Stopped).await;
    }

    /// Stop, clear all run state and the event log, and return to `Idle`.
    pub async fn reset(&self) {
        self.stop().await;
        {
            let mut state = self.state.lock().expect("office state lock poisoned");
            *state = OfficeState::default();
        }
        self.injected.lock().expect("office inject lock poisoned").clear();
        self.transition(ManagerPhase::Idle).await;
        self.events.log().clear();
        self.events.set_iteration(0);
        self.cost.reset();
    }

    // ── Run loop ─────────────────────────────────────────────────────────

    async fn run(&self, config: OfficeConfig, session_id: String, cancel: CancellationToken) {
        let mut feedback: Option<String> = None;
        let mut clarifications: Vec<String> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self
                .generate_plan(&session_id, &config, feedback.take(), &clarifications, &cancel)
                .await
            {
                PlanOutcome::Cancelled => return,
                PlanOutcome::NeedsClarification(question) => {
                    let (tx, rx) = oneshot::channel();
                    self.state.lock().expect("office state lock poisoned").clarification_gate =
                        Some(tx);
                    self.transition(ManagerPhase::Clarifying).await;
                    self.events
                        .emit(OfficeEventKind::ClarificationRequested { question: question.clone() })
                        .await;
                    self.events
                        .emit(OfficeEventKind::ChatMessage {
                            role: ChatRole::Assistant,
                            content: question,
                        })
                        .await;
                    match rx.await {
                        Ok(answer) => {
                            clarifications.push(answer);
                            continue;
                        }
                        Err(_) => return,
                    }
                }
                PlanOutcome::Plan(plan) => {
                    self.state.lock().expect("office state lock poisoned").plan =
                        Some(plan.clone());
                    self.events
                        .emit(OfficeEventKind::ChatMessage {
                            role: ChatRole::Assistant,
                            content: plan,
                        })
                        .await;

                    if config.require_plan_approval {
                        let (tx, rx) = oneshot::channel();
                        self.state.lock().expect("office state lock poisoned").approval_gate =
                            Some(tx);
                        self.transition(ManagerPhase::AwaitingApproval).await;
                        match rx.await {
                            Ok(PlanReview::Approved) => break,
                            Ok(PlanReview::Rejected(fb)) => {
                                self.transition(ManagerPhase::Planning).await;
                                feedback = fb;
                                continue;
                            }
                            Err(_) => return,
                        }
                    } else {
                        break;
                    }
                }
            }
        }

        self.iteration_loop(&config, &session_id, &cancel).await;
    }

    async fn iteration_loop(
        &self,
        config: &OfficeConfig,
        session_id: &str,
        cancel: &CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            self.wait_while_paused(cancel).await;
            if cancel.is_cancelled() {
                return;
            }

            let iteration = {
                let mut state = self.state.lock().expect("office state lock poisoned");
                state.iteration += 1;
                state.iteration
            };
            self.events.set_iteration(iteration);

            let instructions = std::mem::take(
                &mut *self.injected.lock().expect("office inject lock poisoned"),
            );
            for instruction in &instructions {
                self.events
                    .emit(OfficeEventKind::InstructionAbsorbed { instruction: instruction.clone() })
                    .await;
            }

            self.transition(ManagerPhase::FetchingEvents).await;
            let tasks = match self
                .fetch_tasks(session_id, config, iteration, &instructions, cancel)
                .await
            {
                Some(tasks) => tasks,
                None => return,
            };

            if tasks.is_empty() {
                self.events
                    .emit(OfficeEventKind::Commentary {
                        text: format!("No tasks for iteration {}.", iteration),
                    })
                    .await;
            } else {
                self.transition(ManagerPhase::Scheduling).await;
                let scheduling_notes: Vec<String> = tasks
                    .iter()
                    .map(|t| format!("[p{}] {}", t.priority, t.title))
                    .collect();
                self.events
                    .emit(OfficeEventKind::SchedulingDecision {
                        detail: format!(
                            "Iteration {}: dispatching {} task(s): {}",
                            iteration,
                            tasks.len(),
                            scheduling_notes.join("; ")
                        ),
                    })
                    .await;

                let titles: Vec<(String, String)> =
                    tasks.iter().map(|t| (t.id.clone(), t.title.clone())).collect();

                self.transition(ManagerPhase::Executing).await;
                let results = self.pool.execute_tasks(tasks, config, cancel).await;

                self.transition(ManagerPhase::Aggregating).await;
                let summary = self.aggregate(session_id, &titles, &results, cancel).await;

                let dispatched = results.len();
                let succeeded = results.iter().filter(|r| r.success).count();
                let cancelled = results
                    .iter()
                    .filter(|r| r.error_message.as_deref() == Some("Task was cancelled"))
                    .count();
                let failed = dispatched - succeeded - cancelled;

                let report = IterationReport {
                    iteration,
                    dispatched,
                    succeeded,
                    failed,
                    cancelled,
                    scheduling_notes,
                    results,
                    summary: summary.clone(),
                    instructions_absorbed: instructions.clone(),
                    completed_at: Utc::now(),
                };
                {
                    let mut state = self.state.lock().expect("office state lock poisoned");
                    state.reports.push_back(report);
                    while state.reports.len() > MAX_ITERATION_REPORTS {
                        state.reports.pop_front();
                    }
                }

                self.events
                    .emit(OfficeEventKind::ChatMessage {
                        role: ChatRole::Assistant,
                        content: summary,
                    })
                    .await;
                self.events
                    .emit(OfficeEventKind::IterationCompleted {
                        iteration,
                        dispatched,
                        succeeded,
                        failed,
                        cancelled,
                    })
                    .await;
                self.persist_session(config, iteration);
            }

            self.transition(ManagerPhase::Resting).await;
            let mut minutes = self.check_interval_minutes.load(Ordering::Relaxed);
            loop {
                // A pause requested mid-iteration skips the rest so the loop
                // reaches the gate promptly.
                if *self.paused.borrow() {
                    break;
                }
                match self.scheduler.wait_for_next_iteration(minutes, cancel).await {
                    RestOutcome::Completed => break,
                    RestOutcome::Cancelled => return,
                    RestOutcome::Skipped => {
                        if let Some(new_minutes) = self.scheduler.take_override() {
                            minutes = new_minutes.max(1);
                            self.check_interval_minutes.store(minutes, Ordering::Relaxed);
                            continue;
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn wait_while_paused(&self, cancel: &CancellationToken) {
        let mut gate = self.paused.subscribe();
        loop {
            if !*gate.borrow() {
                return;
            }
            self.transition(ManagerPhase::Paused).await;
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

    // ── Manager LLM calls ────────────────────────────────────────────────

    async fn generate_plan(
        &self,
        session_id: &str,
        config: &OfficeConfig,
        feedback: Option<String>,
        clarifications: &[String],
        cancel: &CancellationToken,
    ) -> PlanOutcome {
        let mut prompt = format!(
            "You are the manager of an autonomous office.\n\
             Objective: {objective}\n\
             Workspace: {workspace}\n\n\
             Produce a concise numbered plan for pursuing the objective. \
             If essential information is missing, reply with the prefix \
             \"{marker} \" followed by ONE question.",
            objective = config.objective,
            workspace = config.workspace_path.display(),
            marker = protocol::CLARIFICATION_MARKER,
        );
        if !clarifications.is_empty() {
            prompt.push_str("\n\nUser clarifications so far:\n");
            for answer in clarifications {
                prompt.push_str(&format!("- {}\n", answer));
            }
        }
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\n\nThe previous plan was rejected with this feedback: {}\nRevise accordingly.",
                feedback
            ));
        }

        let reply = tokio::select! {
            r = self.client.send_blocking(session_id, &prompt) => r,
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        };

        match reply {
            Err(OrchestratorError::Cancelled) => PlanOutcome::Cancelled,
            Err(err) => {
                log::warn!("plan generation failed, using fallback plan: {}", err);
                self.events
                    .emit(OfficeEventKind::ErrorRaised { message: err.to_string() })
                    .await;
                PlanOutcome::Plan(format!(
                    "1. Review the objective: {}\n2. Break it into concrete tasks and execute them.",
                    config.objective
                ))
            }
            Ok(message) => {
                if let Some(usage) = &message.usage {
                    self.cost.record(usage);
                }
                if let Some(question) = protocol::clarification_question(&message.content) {
                    PlanOutcome::NeedsClarification(question.to_string())
                } else {
                    PlanOutcome::Plan(message.content.trim().to_string())
                }
            }
        }
    }

    /// Ask the manager for this iteration's tasks. `None` means cancelled.
    async fn fetch_tasks(
        &self,
        session_id: &str,
        config: &OfficeConfig,
        iteration: u64,
        instructions: &[String],
        cancel: &CancellationToken,
    ) -> Option<Vec<AssistantTask>> {
        let plan = self.current_plan().unwrap_or_default();
        let mut prompt = format!(
            "Iteration {iteration}. Objective: {objective}\n\
             Current plan:\n{plan}\n\n",
            iteration = iteration,
            objective = config.objective,
            plan = plan,
        );
        if !instructions.is_empty() {
            prompt.push_str("New user instructions to absorb this iteration:\n");
            for instruction in instructions {
                prompt.push_str(&format!("- {}\n", instruction));
            }
            prompt.push('\n');
        }
        if let Some(last) = self.last_report_summary() {
            prompt.push_str(&format!("Previous iteration summary:\n{}\n\n", last));
        }
        prompt.push_str(
            "Decide what the assistants should do next. Reply with ONLY a JSON \
             array of objects {\"title\": string, \"prompt\": string, \
             \"priority\": integer}; lower priority runs first. Reply with [] \
             when there is nothing to do.",
        );

        let reply = tokio::select! {
            r = self.client.send_blocking(session_id, &prompt) => r,
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        };

        let specs: Vec<TaskSpec> = match reply {
            Err(OrchestratorError::Cancelled) => return None,
            Err(err) => {
                log::warn!("task fetch failed, using fallback tasks: {}", err);
                self.events
                    .emit(OfficeEventKind::ErrorRaised { message: err.to_string() })
                    .await;
                fallback_task_specs(&config.objective)
            }
            Ok(message) => {
                if let Some(usage) = &message.usage {
                    self.cost.record(usage);
                }
                match protocol::parse_task_specs(&message.content) {
                    Some(specs) => specs,
                    None => {
                        log::warn!("task list did not parse, using fallback tasks");
                        fallback_task_specs(&config.objective)
                    }
                }
            }
        };

        Some(
            specs
                .into_iter()
                .map(|spec| AssistantTask::new(iteration, spec.title, spec.prompt, spec.priority))
                .collect(),
        )
    }

    async fn aggregate(
        &self,
        session_id: &str,
        titles: &[(String, String)],
        results: &[AssistantResult],
        cancel: &CancellationToken,
    ) -> String {
        let mut digest = String::new();
        for result in results {
            let title = titles
                .iter()
                .find(|(id, _)| id == &result.task_id)
                .map(|(_, title)| title.as_str())
                .unwrap_or("(unknown task)");
            if result.success {
                digest.push_str(&format!("## {}\n{}\n\n", title, result.content));
            } else {
                digest.push_str(&format!(
                    "## {}\nFAILED: {}\n\n",
                    title,
                    result.error_message.as_deref().unwrap_or("unspecified")
                ));
            }
        }

        let prompt = format!(
            "Summarize this iteration's assistant results as a short Markdown \
             report for the user. Lead with outcomes, then next steps.\n\n{}",
            digest
        );

        let reply = tokio::select! {
            r = self.client.send_blocking(session_id, &prompt) => r,
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        };

        match reply {
            Ok(message) => {
                if let Some(usage) = &message.usage {
                    self.cost.record(usage);
                }
                message.content.trim().to_string()
            }
            Err(err) => {
                if !matches!(err, OrchestratorError::Cancelled) {
                    log::warn!("aggregation failed, using fallback summary: {}", err);
                }
                fallback_summary(titles, results)
            }
        }
    }

    fn last_report_summary(&self) -> Option<String> {
        self.state
            .lock()
            .expect("office state lock poisoned")
            .reports
            .back()
            .map(|report| report.summary.clone())
    }

    fn persist_session(&self, config: &OfficeConfig, iteration: u64) {
        let Some(dir) = &self.session_dir else { return };
        let session_id = match self.state.lock().expect("office state lock poisoned").session_id.clone() {
            Some(session_id) => session_id,
            None => return,
        };
        let record = OfficeSessionRecord {
            session_id,
            objective: config.objective.clone(),
            created_at: Utc::now(),
            iteration_count: iteration,
            last_phase: self.current_phase().to_string(),
        };
        if let Err(err) = storage::save_office_session(dir, &record) {
            log::warn!("failed to persist office session: {}", err);
        }
    }

    async fn transition(&self, to: ManagerPhase) {
        let _guard = self.transition_lock.lock().await;
        let previous = {
            let mut phase = self.phase.lock().expect("office phase lock poisoned");
            let previous = *phase;
            *phase = to;
            previous
        };
        if previous != to {
            self.events
                .emit(OfficeEventKind::PhaseChanged { previous, current: to })
                .await;
        }
    }
}

/// Two generic tasks derived from the objective, used whenever the task list
/// cannot be decoded.
fn fallback_task_specs(objective: &str) -> Vec<TaskSpec> {
    vec![
        TaskSpec {
            title: "Assess current state".to_string(),
            prompt: format!(
                "Review the current state of the work toward this objective and \
                 report findings: {}",
                objective
            ),
            priority: 0,
        },
        TaskSpec {
            title: "Advance the objective".to_string(),
            prompt: format!("Take the most valuable next step toward: {}", objective),
            priority: 1,
        },
    ]
}

/// Deterministic aggregation: one status line per task.
fn fallback_summary(titles: &[(String, String)], results: &[AssistantResult]) -> String {
    let mut lines = vec!["## Iteration results".to_string()];
    for result in results {
        let title = titles
            .iter()
            .find(|(id, _)| id == &result.task_id)
            .map(|(_, title)| title.as_str())
            .unwrap_or("(unknown task)");
        if result.success {
            lines.push(format!("- {}: completed", title));
        } else {
            lines.push(format!(
                "- {}: {}",
                title,
                result.error_message.as_deref().unwrap_or("failed")
            ));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_tasks_reference_the_objective() {
        let specs = fallback_task_specs("keep the build green");
        assert_eq!(specs.len(), 2);
        assert!(specs[0].prompt.contains("keep the build green"));
        assert!(specs[0].priority < specs[1].priority);
    }

    #[test]
    fn fallback_summary_lists_every_task() {
        let titles = vec![("t1".to_string(), "Task one".to_string())];
        let results = vec![AssistantResult {
            task_id: "t1".to_string(),
            assistant_index: Some(0),
            success: false,
            content: String::new(),
            tool_executions: Vec::new(),
            duration: std::time::Duration::ZERO,
            completed_at: Utc::now(),
            error_message: Some("Task was cancelled".to_string()),
        }];
        let summary = fallback_summary(&titles, &results);
        assert!(summary.contains("Task one"));
        assert!(summary.contains("Task was cancelled"));
    }
}
