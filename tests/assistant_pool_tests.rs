use async_trait::async_trait;
use futures_util::stream;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use agentdesk::agentdesk::cost::CostTracker;
use agentdesk::agentdesk::event::OfficeEvents;
use agentdesk::agentdesk::event_log::EventLog;
use agentdesk::{
    AssistantPool, AssistantTask, ChatClient, ChatMessage, ChatStream, OfficeConfig,
    OrchestratorError, OrchestratorResult, StreamChunk, ToolEvent,
};

#[derive(Clone)]
enum StreamBehavior {
    /// Yield the text in two cumulative chunks, immediately.
    Immediate(String),
    /// Never yield anything.
    Pending,
    /// Yield the full text after a delay.
    Slow(Duration, String),
}

struct PoolMockClient {
    behavior: StreamBehavior,
    created: Mutex<HashSet<String>>,
    terminated: Mutex<HashSet<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    tool_tx: broadcast::Sender<ToolEvent>,
}

impl PoolMockClient {
    fn new(behavior: StreamBehavior) -> Arc<Self> {
        let (tool_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            behavior,
            created: Mutex::new(HashSet::new()),
            terminated: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            tool_tx,
        })
    }

    fn leaked_sessions(&self) -> Vec<String> {
        let created = self.created.lock().unwrap();
        let terminated = self.terminated.lock().unwrap();
        created.difference(&terminated).cloned().collect()
    }
}

fn cumulative_chunks(text: &str) -> Vec<OrchestratorResult<StreamChunk>> {
    let half = text.len() / 2;
    vec![
        Ok(StreamChunk { content: text[..half].to_string(), finish_reason: None }),
        Ok(StreamChunk { content: text.to_string(), finish_reason: Some("stop".to_string()) }),
    ]
}

#[async_trait]
impl ChatClient for PoolMockClient {
    async fn send_blocking(
        &self,
        session_id: &str,
        _prompt: &str,
    ) -> OrchestratorResult<ChatMessage> {
        self.created.lock().unwrap().insert(session_id.to_string());
        Ok(ChatMessage {
            role: agentdesk::ChatRole::Assistant,
            content: "ok".to_string(),
            usage: None,
        })
    }

    async fn send_streaming(
        &self,
        session_id: &str,
        _prompt: &str,
    ) -> OrchestratorResult<ChatStream> {
        self.created.lock().unwrap().insert(session_id.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        match &self.behavior {
            StreamBehavior::Immediate(text) => Ok(Box::pin(stream::iter(cumulative_chunks(text)))),
            StreamBehavior::Pending => Ok(Box::pin(stream::pending())),
            StreamBehavior::Slow(delay, text) => {
                let delay = *delay;
                let text = text.clone();
                Ok(Box::pin(stream::once(async move {
                    tokio::time::sleep(delay).await;
                    Ok(StreamChunk { content: text, finish_reason: Some("stop".to_string()) })
                })))
            }
        }
    }

    async fn terminate_session(&self, session_id: &str) -> OrchestratorResult<()> {
        let was_created = self.created.lock().unwrap().contains(session_id);
        let newly = self.terminated.lock().unwrap().insert(session_id.to_string());
        if was_created && newly {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_models(&self) -> OrchestratorResult<Vec<String>> {
        Ok(vec!["default".to_string()])
    }

    fn tool_events(&self) -> broadcast::Receiver<ToolEvent> {
        self.tool_tx.subscribe()
    }
}

fn pool_over(client: Arc<PoolMockClient>) -> AssistantPool {
    let events = Arc::new(OfficeEvents::new(Arc::new(EventLog::new()), None));
    AssistantPool::new(client, events, Arc::new(CostTracker::new()))
}

fn config(max_assistants: usize, timeout_seconds: u64) -> OfficeConfig {
    OfficeConfig {
        objective: "test objective".to_string(),
        max_assistants,
        assistant_timeout_seconds: timeout_seconds,
        ..OfficeConfig::default()
    }
}

#[tokio::test]
async fn results_come_back_in_submission_order() {
    let client = PoolMockClient::new(StreamBehavior::Immediate("done".to_string()));
    let pool = pool_over(client.clone());

    let tasks = vec![
        AssistantTask::new(1, "slowest priority", "p", 2),
        AssistantTask::new(1, "highest priority", "p", 0),
        AssistantTask::new(1, "middle priority", "p", 1),
    ];
    let submitted_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let high_priority_id = tasks[1].id.clone();

    let cancel = CancellationToken::new();
    let results = pool.execute_tasks(tasks, &config(1, 60), &cancel).await;

    let result_ids: Vec<String> = results.iter().map(|r| r.task_id.clone()).collect();
    assert_eq!(result_ids, submitted_ids);
    assert!(results.iter().all(|r| r.success));

    // With one slot, execution follows priority: the priority-0 task runs
    // first and receives the first assistant index.
    let high = results.iter().find(|r| r.task_id == high_priority_id).unwrap();
    assert_eq!(high.assistant_index, Some(0));

    assert!(client.leaked_sessions().is_empty());
}

#[tokio::test]
async fn concurrency_never_exceeds_max_assistants() {
    let client = PoolMockClient::new(StreamBehavior::Slow(
        Duration::from_millis(30),
        "done".to_string(),
    ));
    let pool = pool_over(client.clone());

    let tasks: Vec<AssistantTask> =
        (0..5).map(|i| AssistantTask::new(1, format!("task {}", i), "p", 0)).collect();

    let cancel = CancellationToken::new();
    let results = pool.execute_tasks(tasks, &config(2, 60), &cancel).await;

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.success));
    assert!(client.max_active.load(Ordering::SeqCst) <= 2);
    assert!(client.leaked_sessions().is_empty());
}

#[tokio::test]
async fn cancellation_fails_all_tasks_and_leaks_no_sessions() {
    let client = PoolMockClient::new(StreamBehavior::Pending);
    let pool = Arc::new(pool_over(client.clone()));

    let tasks: Vec<AssistantTask> =
        (0..3).map(|i| AssistantTask::new(1, format!("task {}", i), "p", 0)).collect();

    let cancel = CancellationToken::new();
    let runner = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.execute_tasks(tasks, &config(1, 60), &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    let results = runner.await.unwrap();

    assert_eq!(results.len(), 3);
    for result in &results {
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("Task was cancelled"));
    }
    assert!(client.leaked_sessions().is_empty(), "sessions left active after cancel");
}

#[tokio::test]
async fn cancel_all_behaves_like_external_cancellation() {
    let client = PoolMockClient::new(StreamBehavior::Pending);
    let pool = Arc::new(pool_over(client.clone()));

    let tasks: Vec<AssistantTask> =
        (0..2).map(|i| AssistantTask::new(1, format!("task {}", i), "p", 0)).collect();

    let cancel = CancellationToken::new();
    let runner = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.execute_tasks(tasks, &config(2, 60), &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.cancel_all();
    let results = runner.await.unwrap();

    assert!(results.iter().all(|r| !r.success));
    assert!(results
        .iter()
        .all(|r| r.error_message.as_deref() == Some("Task was cancelled")));
    assert!(client.leaked_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timeout_is_a_distinct_failure() {
    let client = PoolMockClient::new(StreamBehavior::Pending);
    let pool = pool_over(client.clone());

    let tasks = vec![AssistantTask::new(1, "stuck task", "p", 0)];
    let cancel = CancellationToken::new();
    let results = pool.execute_tasks(tasks, &config(1, 1), &cancel).await;

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(results[0].error_message.as_deref(), Some("Task timed out after 1s"));
    assert!(client.leaked_sessions().is_empty());
}

#[tokio::test]
async fn concise_results_truncate_long_output() {
    let long_output = "x".repeat(2_000);
    let client = PoolMockClient::new(StreamBehavior::Immediate(long_output));
    let pool = pool_over(client.clone());

    let tasks = vec![AssistantTask::new(1, "verbose task", "p", 0)];
    let cancel = CancellationToken::new();
    let results = pool.execute_tasks(tasks, &config(1, 60), &cancel).await;

    assert!(results[0].success);
    assert!(results[0].content.contains("verbose task"));
    // Title line plus a capped body; nowhere near the raw 2000 chars.
    assert!(results[0].content.chars().count() < 600);
    assert!(results[0].content.ends_with('…'));
}

// Keep the error taxonomy honest: the pool never surfaces raw transport
// errors as successes.
#[tokio::test]
async fn transport_failure_is_reported_as_failure() {
    struct FailingClient {
        tool_tx: broadcast::Sender<ToolEvent>,
        terminated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatClient for FailingClient {
        async fn send_blocking(
            &self,
            _session_id: &str,
            _prompt: &str,
        ) -> OrchestratorResult<ChatMessage> {
            Err(OrchestratorError::Transport("boom".to_string()))
        }

        async fn send_streaming(
            &self,
            _session_id: &str,
            _prompt: &str,
        ) -> OrchestratorResult<ChatStream> {
            Err(OrchestratorError::Transport("boom".to_string()))
        }

        async fn terminate_session(&self, session_id: &str) -> OrchestratorResult<()> {
            self.terminated.lock().unwrap().push(session_id.to_string());
            Ok(())
        }

        async fn list_models(&self) -> OrchestratorResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn tool_events(&self) -> broadcast::Receiver<ToolEvent> {
            self.tool_tx.subscribe()
        }
    }

    let (tool_tx, _) = broadcast::channel(8);
    let client = Arc::new(FailingClient { tool_tx, terminated: Mutex::new(Vec::new()) });
    let events = Arc::new(OfficeEvents::new(Arc::new(EventLog::new()), None));
    let pool = AssistantPool::new(client.clone(), events, Arc::new(CostTracker::new()));

    let tasks = vec![AssistantTask::new(1, "doomed", "p", 0)];
    let cancel = CancellationToken::new();
    let results = pool.execute_tasks(tasks, &config(1, 60), &cancel).await;

    assert!(!results[0].success);
    assert!(results[0].error_message.as_ref().unwrap().contains("boom"));
    // Termination is still attempted on the failure path.
    assert!(!client.terminated.lock().unwrap().is_empty());
}
