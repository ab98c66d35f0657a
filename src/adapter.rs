//! Event-to-message adapter: the single integration point between the
//! application and a running agent session.
//!
//! Owns one session against the agent server, consumes its push event
//! stream on a background task, deduplicates and reshapes the heterogeneous
//! part payloads into a small closed set of normalized messages, and drives
//! the completion enforcer. Everything the application learns about a task
//! arrives through the broadcast [`AdapterEvent`] stream.

use crate::client::AgentClient;
use crate::config::{CredentialSync, ModelRef, NoopCredentialSync, RuntimeLocator, TaskConfig};
use crate::enforcer::{CompletionEnforcer, StepVerdict};
use crate::error::{Result, TaskwingError};
use crate::protocol::{AgentEvent, EventPart, PartKind, StepFinishReason, TodoItem, ToolStatus};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tool the agent must call to declare the task finished.
pub const COMPLETION_TOOL: &str = "attempt_completion";
/// Tool the agent uses to publish its own checklist.
pub const TODO_WRITE_TOOL: &str = "todowrite";
/// Tool the agent uses to ask the user a question.
pub const QUESTION_TOOL: &str = "ask_question";

/// If no tool call lands this long after a step starts, surface a
/// "waiting for response" progress signal.
const FIRST_TOOL_GRACE: Duration = Duration::from_millis(500);

const EVENT_CHANNEL_CAPACITY: usize = 2048;

const CONTINUATION_PROMPT: &str = "You stopped before the task was finished. Continue working \
through the remaining items, and call attempt_completion once everything is done.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Success,
    Error,
    Interrupted,
}

/// Caller-facing record of one unit of work. Message content never rides on
/// this record; it arrives exclusively through [`AdapterEvent`]s.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub directory: Option<String>,
    pub created: DateTime<Utc>,
    pub started: DateTime<Utc>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Connecting,
    WaitingForResponse,
}

/// The adapter's output contract: a closed set of message kinds.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedMessage {
    Text {
        text: String,
        start_ms: Option<u64>,
        end_ms: Option<u64>,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    StepStart,
    StepFinish {
        reason: StepFinishReason,
    },
    Error {
        message: String,
        code: Option<String>,
    },
}

/// A question the agent wants answered before it proceeds.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionRequest {
    pub id: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub multiple: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdapterEvent {
    Message {
        message: NormalizedMessage,
    },
    ToolUse {
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    PermissionRequest {
        request: QuestionRequest,
    },
    Progress {
        stage: ProgressStage,
        text: String,
        model: Option<String>,
    },
    Complete {
        status: TaskStatus,
        error: Option<String>,
        session_id: Option<String>,
    },
    Error {
        message: String,
    },
    Debug {
        message: String,
    },
    TodoUpdate {
        todos: Vec<TodoItem>,
    },
    AuthError {
        provider_id: Option<String>,
        message: String,
    },
}

struct ConsumerHandle {
    cancel: CancellationToken,
    #[allow(dead_code)]
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct AdapterShared {
    disposed: bool,
    session_id: Option<String>,
    task: Option<Task>,
    model: Option<ModelRef>,
    interrupted: bool,
    finalized: bool,
    consumer: Option<ConsumerHandle>,
}

pub struct TaskAdapter {
    client: Arc<AgentClient>,
    locator: Arc<dyn RuntimeLocator>,
    credentials: Arc<dyn CredentialSync>,
    events: broadcast::Sender<AdapterEvent>,
    shared: Arc<Mutex<AdapterShared>>,
}

impl TaskAdapter {
    pub fn new(client: Arc<AgentClient>, locator: Arc<dyn RuntimeLocator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            locator,
            credentials: Arc::new(NoopCredentialSync),
            events,
            shared: Arc::new(Mutex::new(AdapterShared::default())),
        }
    }

    pub fn with_credential_sync(mut self, credentials: Arc<dyn CredentialSync>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    pub async fn current_task(&self) -> Option<Task> {
        self.shared.lock().await.task.clone()
    }

    /// Start a new task: validate the runtime is available, reset all
    /// per-task state, create a session (optionally scoped to a working
    /// directory), begin consuming its event stream, and issue the initial
    /// prompt without waiting for the agent to finish.
    pub async fn start_task(&self, config: TaskConfig) -> Result<Task> {
        self.reset_for_new_task().await?;
        // Fail with a distinguished error before touching the server at all.
        self.locator.locate()?;

        if let Err(e) = self.credentials.materialize() {
            tracing::warn!("Credential sync failed before task start: {}", e);
        }

        let directory = config
            .directory
            .as_ref()
            .map(|path| path.to_string_lossy().to_string());
        let session = match self.client.create_session(directory.as_deref()).await {
            Ok(session) => session,
            Err(e) => {
                let message = format!("Failed to create session: {}", e);
                let _ = self.events.send(AdapterEvent::Complete {
                    status: TaskStatus::Error,
                    error: Some(message.clone()),
                    session_id: None,
                });
                return Err(TaskwingError::Session(message));
            }
        };

        let task = Task {
            id: config
                .task_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            prompt: config.prompt.clone(),
            status: TaskStatus::Running,
            directory,
            created: Utc::now(),
            started: Utc::now(),
            session_id: Some(session.id.clone()),
        };
        let model = config.model.clone().unwrap_or_default();
        self.attach_session(session.id, task.clone(), model, config.prompt)
            .await?;
        Ok(task)
    }

    /// Start a task against an existing session, reusing its conversational
    /// continuity.
    pub async fn resume_session(
        &self,
        session_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<Task> {
        let session_id = session_id.into();
        let prompt = prompt.into();

        self.reset_for_new_task().await?;
        self.locator.locate()?;
        if let Err(e) = self.credentials.materialize() {
            tracing::warn!("Credential sync failed before resume: {}", e);
        }

        let task = Task {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.clone(),
            status: TaskStatus::Running,
            directory: None,
            created: Utc::now(),
            started: Utc::now(),
            session_id: Some(session_id.clone()),
        };
        self.attach_session(session_id, task.clone(), ModelRef::default(), prompt)
            .await?;
        Ok(task)
    }

    /// Inject a follow-up user turn into the active session.
    pub async fn send_response(&self, text: &str) -> Result<()> {
        let (session_id, model) = {
            let shared = self.shared.lock().await;
            if shared.disposed {
                return Err(TaskwingError::Disposed);
            }
            let session_id = shared
                .session_id
                .clone()
                .ok_or(TaskwingError::NoActiveSession)?;
            (session_id, shared.model.clone())
        };
        self.client
            .send_prompt(&session_id, text, model.as_ref())
            .await
    }

    /// Hard interruption: finalize as interrupted, request session abort,
    /// and tear down the event stream subscription.
    pub async fn cancel_task(&self) {
        let (session_id, consumer) = {
            let mut shared = self.shared.lock().await;
            shared.interrupted = true;
            (shared.session_id.clone(), shared.consumer.take())
        };

        finalize(&self.shared, &self.events, TaskStatus::Interrupted, None).await;

        if let Some(session_id) = session_id {
            // Best-effort: a failed abort during cancellation is logged,
            // never thrown.
            if let Err(e) = self.client.abort_session(&session_id).await {
                tracing::warn!("Abort during cancel failed: {}", e);
            }
        }
        if let Some(consumer) = consumer {
            consumer.cancel.cancel();
        }
    }

    /// Soft interruption: request remote abort but keep consuming events, so
    /// the normal completion path still runs and finalizes as interrupted.
    pub async fn interrupt_task(&self) {
        let session_id = {
            let mut shared = self.shared.lock().await;
            shared.interrupted = true;
            shared.session_id.clone()
        };
        if let Some(session_id) = session_id {
            if let Err(e) = self.client.abort_session(&session_id).await {
                tracing::warn!("Abort during interrupt failed: {}", e);
            }
        }
    }

    /// Idempotent teardown. After this, `start_task` always fails.
    pub async fn dispose(&self) {
        let consumer = {
            let mut shared = self.shared.lock().await;
            if shared.disposed {
                return;
            }
            shared.disposed = true;
            shared.session_id = None;
            shared.task = None;
            shared.model = None;
            shared.consumer.take()
        };
        if let Some(consumer) = consumer {
            consumer.cancel.cancel();
        }
    }

    async fn reset_for_new_task(&self) -> Result<()> {
        let previous = {
            let mut shared = self.shared.lock().await;
            if shared.disposed {
                return Err(TaskwingError::Disposed);
            }
            let previous = shared.consumer.take();
            shared.session_id = None;
            shared.task = None;
            shared.model = None;
            shared.interrupted = false;
            shared.finalized = false;
            previous
        };
        // Abandon any previous session's stream.
        if let Some(consumer) = previous {
            consumer.cancel.cancel();
        }
        Ok(())
    }

    async fn attach_session(
        &self,
        session_id: String,
        task: Task,
        model: ModelRef,
        prompt: String,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut shared = self.shared.lock().await;
            if shared.disposed {
                return Err(TaskwingError::Disposed);
            }
            shared.session_id = Some(session_id.clone());
            shared.task = Some(task);
            shared.model = Some(model.clone());
        }

        let consumer_task = tokio::spawn(run_consumer(
            self.client.clone(),
            self.events.clone(),
            self.shared.clone(),
            cancel.clone(),
            session_id.clone(),
            model.clone(),
        ));
        {
            let mut shared = self.shared.lock().await;
            shared.consumer = Some(ConsumerHandle {
                cancel,
                task: consumer_task,
            });
        }

        // Issue the initial prompt asynchronously; the agent's run streams
        // back over the event subscription.
        let client = self.client.clone();
        let events = self.events.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = client.send_prompt(&session_id, &prompt, Some(&model)).await {
                let message = format!("Failed to send prompt: {}", e);
                tracing::error!("{}", message);
                let _ = events.send(AdapterEvent::Error {
                    message: message.clone(),
                });
                finalize(&shared, &events, TaskStatus::Error, Some(message)).await;
            }
        });
        Ok(())
    }
}

/// Exactly-once task finalization; every terminal path funnels through here.
async fn finalize(
    shared: &Arc<Mutex<AdapterShared>>,
    events: &broadcast::Sender<AdapterEvent>,
    status: TaskStatus,
    error: Option<String>,
) {
    let session_id = {
        let mut shared = shared.lock().await;
        if shared.finalized {
            return;
        }
        shared.finalized = true;
        if let Some(task) = shared.task.as_mut() {
            task.status = status;
        }
        shared.session_id.clone()
    };
    tracing::debug!("Task finalized with status {:?}", status);
    let _ = events.send(AdapterEvent::Complete {
        status,
        error,
        session_id,
    });
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Per-task translation state. The consumer loop is its only writer.
struct TranslationState {
    session_id: String,
    model: ModelRef,
    enforcer: CompletionEnforcer,
    calls_emitted: HashSet<String>,
    results_emitted: HashSet<String>,
    text_emitted: HashSet<String>,
    grace_deadline: Option<tokio::time::Instant>,
}

impl TranslationState {
    fn new(session_id: String, model: ModelRef) -> Self {
        Self {
            session_id,
            model,
            enforcer: CompletionEnforcer::new(),
            calls_emitted: HashSet::new(),
            results_emitted: HashSet::new(),
            text_emitted: HashSet::new(),
            grace_deadline: None,
        }
    }
}

async fn grace_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_consumer(
    client: Arc<AgentClient>,
    events: broadcast::Sender<AdapterEvent>,
    shared: Arc<Mutex<AdapterShared>>,
    cancel: CancellationToken,
    session_id: String,
    model: ModelRef,
) {
    let stream = match client.subscribe_events().await {
        Ok(stream) => stream,
        Err(e) => {
            let message = format!("Failed to subscribe to session events: {}", e);
            tracing::error!("{}", message);
            finalize(&shared, &events, TaskStatus::Error, Some(message)).await;
            return;
        }
    };
    futures::pin_mut!(stream);

    let mut state = TranslationState::new(session_id, model);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Event consumption aborted");
                break;
            }
            _ = grace_elapsed(state.grace_deadline) => {
                state.grace_deadline = None;
                let _ = events.send(AdapterEvent::Progress {
                    stage: ProgressStage::WaitingForResponse,
                    text: "Waiting for the agent to respond".to_string(),
                    model: Some(state.model.model_id.clone()),
                });
            }
            next = stream.next() => {
                match next {
                    Some(Ok(event)) => {
                        if handle_event(event, &mut state, &client, &events, &shared).await
                            == Flow::Stop
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // Not retried here; a stalled stream is the caller's
                        // liveness policy to handle.
                        tracing::error!("Event stream error, stopping consumption: {}", e);
                        break;
                    }
                    None => {
                        tracing::debug!("Event stream ended");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_event(
    event: AgentEvent,
    state: &mut TranslationState,
    client: &Arc<AgentClient>,
    events: &broadcast::Sender<AdapterEvent>,
    shared: &Arc<Mutex<AdapterShared>>,
) -> Flow {
    match event {
        AgentEvent::PartUpdated { part } => {
            // The server multiplexes sessions over one stream; everything
            // outside our session is dropped here.
            if part.session_id != state.session_id {
                return Flow::Continue;
            }
            handle_part(part, state, client, events, shared).await
        }
        AgentEvent::SessionError { session_id, error } => {
            if session_id != state.session_id {
                return Flow::Continue;
            }
            if let Some(provider_id) = classify_auth_error(&error) {
                let _ = events.send(AdapterEvent::AuthError {
                    provider_id,
                    message: error.clone(),
                });
            }
            let _ = events.send(AdapterEvent::Message {
                message: NormalizedMessage::Error {
                    message: error.clone(),
                    code: None,
                },
            });
            finalize(shared, events, TaskStatus::Error, Some(error)).await;
            Flow::Stop
        }
        // Completion is decided at step boundaries, not on idle signals.
        AgentEvent::SessionIdle { .. } => Flow::Continue,
        AgentEvent::Unknown { event_type, .. } => {
            tracing::debug!("Ignoring unhandled event type: {}", event_type);
            Flow::Continue
        }
    }
}

async fn handle_part(
    part: EventPart,
    state: &mut TranslationState,
    client: &Arc<AgentClient>,
    events: &broadcast::Sender<AdapterEvent>,
    shared: &Arc<Mutex<AdapterShared>>,
) -> Flow {
    match part.kind {
        PartKind::Text {
            text,
            start_ms,
            end_ms,
        } => {
            // Whole parts only: skip until generation of this part finished,
            // then emit exactly once.
            if end_ms.is_none() {
                return Flow::Continue;
            }
            if !state.text_emitted.insert(part.id.clone()) {
                return Flow::Continue;
            }
            let _ = events.send(AdapterEvent::Message {
                message: NormalizedMessage::Text {
                    text,
                    start_ms,
                    end_ms,
                },
            });
            Flow::Continue
        }
        PartKind::Tool {
            name,
            status,
            input,
            output,
            error,
        } => {
            handle_tool_part(part.id, name, status, input, output, error, state, events);
            Flow::Continue
        }
        PartKind::StepStart => {
            let _ = events.send(AdapterEvent::Message {
                message: NormalizedMessage::StepStart,
            });
            let _ = events.send(AdapterEvent::Progress {
                stage: ProgressStage::Connecting,
                text: "Connecting to agent".to_string(),
                model: Some(state.model.model_id.clone()),
            });
            state.grace_deadline = Some(tokio::time::Instant::now() + FIRST_TOOL_GRACE);
            Flow::Continue
        }
        PartKind::StepFinish { reason } => {
            state.grace_deadline = None;
            let _ = events.send(AdapterEvent::Message {
                message: NormalizedMessage::StepFinish { reason },
            });

            if reason == StepFinishReason::Error {
                // Bypasses the enforcer entirely.
                finalize(
                    shared,
                    events,
                    TaskStatus::Error,
                    Some("Agent step finished with an error".to_string()),
                )
                .await;
                return Flow::Stop;
            }

            if reason != StepFinishReason::ToolUse && shared.lock().await.interrupted {
                // An interrupt was requested earlier; label the terminal
                // state instead of re-engaging the agent.
                finalize(shared, events, TaskStatus::Interrupted, None).await;
                return Flow::Stop;
            }

            match state.enforcer.handle_step_finish(reason) {
                StepVerdict::Continue => Flow::Continue,
                StepVerdict::Complete => {
                    finalize(shared, events, TaskStatus::Success, None).await;
                    Flow::Stop
                }
                StepVerdict::RequestContinuation => {
                    let _ = events.send(AdapterEvent::Debug {
                        message: "Premature stop detected; dispatching continuation prompt"
                            .to_string(),
                    });
                    if let Err(e) = client
                        .send_prompt(&state.session_id, CONTINUATION_PROMPT, Some(&state.model))
                        .await
                    {
                        let message = format!("Failed to dispatch continuation prompt: {}", e);
                        tracing::error!("{}", message);
                        finalize(shared, events, TaskStatus::Error, Some(message)).await;
                        return Flow::Stop;
                    }
                    Flow::Continue
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_tool_part(
    id: String,
    name: String,
    status: ToolStatus,
    input: Value,
    output: Option<String>,
    error: Option<String>,
    state: &mut TranslationState,
    events: &broadcast::Sender<AdapterEvent>,
) {
    match status {
        ToolStatus::Pending | ToolStatus::Running => {
            // A part transitions call -> result over its lifetime but must
            // never yield two calls.
            if !state.calls_emitted.insert(id.clone()) {
                return;
            }
            state.enforcer.mark_tools_used();
            // A tool arrived; the "waiting for response" signal is moot.
            state.grace_deadline = None;

            if name == COMPLETION_TOOL {
                state.enforcer.set_completion_detected();
            }
            if name == TODO_WRITE_TOOL {
                let todos = parse_todo_input(&input);
                state.enforcer.update_todos(todos.clone());
                let _ = events.send(AdapterEvent::TodoUpdate { todos });
            }
            if name == QUESTION_TOOL {
                // Questions surface as permission requests, not tool calls.
                if let Some(request) = parse_question_input(&id, &input) {
                    let _ = events.send(AdapterEvent::PermissionRequest { request });
                    return;
                }
            }

            let _ = events.send(AdapterEvent::ToolUse {
                name: name.clone(),
                input: input.clone(),
            });
            let _ = events.send(AdapterEvent::Message {
                message: NormalizedMessage::ToolCall { id, name, input },
            });
        }
        ToolStatus::Completed | ToolStatus::Error => {
            if !state.results_emitted.insert(id.clone()) {
                return;
            }
            // A result proves a tool ran even if its call event was missed.
            state.enforcer.mark_tools_used();
            state.grace_deadline = None;

            let is_error = status == ToolStatus::Error;
            let output_text = if is_error {
                error.unwrap_or_else(|| "tool failed".to_string())
            } else {
                output.unwrap_or_default()
            };
            let _ = events.send(AdapterEvent::ToolResult {
                id: id.clone(),
                output: output_text.clone(),
                is_error,
            });
            let _ = events.send(AdapterEvent::Message {
                message: NormalizedMessage::ToolResult {
                    id,
                    output: output_text,
                    is_error,
                },
            });
        }
        ToolStatus::Unknown(raw) => {
            tracing::debug!("Ignoring tool part with unknown status: {}", raw);
        }
    }
}

fn parse_todo_input(input: &Value) -> Vec<TodoItem> {
    input
        .get("todos")
        .and_then(Value::as_array)
        .map(|todos| {
            todos
                .iter()
                .filter_map(|todo| {
                    Some(TodoItem {
                        id: todo.get("id")?.as_str()?.to_string(),
                        content: todo.get("content")?.as_str()?.to_string(),
                        status: todo.get("status")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Extract the first question from a question-tool invocation. Options come
/// either as plain strings or as `{label, description}` objects.
fn parse_question_input(part_id: &str, input: &Value) -> Option<QuestionRequest> {
    let question = input
        .get("questions")
        .and_then(Value::as_array)
        .and_then(|questions| questions.first())
        .or(Some(input))?;

    let prompt = question.get("question").and_then(Value::as_str)?.to_string();
    let options = question
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| {
                    option
                        .as_str()
                        .map(str::to_string)
                        .or_else(|| option.get("label")?.as_str().map(str::to_string))
                })
                .collect()
        })
        .unwrap_or_default();
    let multiple = question
        .get("multiple")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Some(QuestionRequest {
        id: part_id.to_string(),
        prompt,
        options,
        multiple,
    })
}

/// Credential failures deserve their own signal so the UI can route the user
/// to provider settings. Returns the provider id when one is recognizable.
fn classify_auth_error(error: &str) -> Option<Option<String>> {
    let lower = error.to_lowercase();
    let is_auth = ["401", "unauthorized", "invalid api key", "authentication"]
        .iter()
        .any(|marker| lower.contains(marker));
    if !is_auth {
        return None;
    }
    let provider = ["anthropic", "openai", "openrouter", "google", "mistral"]
        .iter()
        .find(|provider| lower.contains(*provider))
        .map(|provider| provider.to_string());
    Some(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExplicitRuntime, RuntimeCommand};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct AlwaysFound;

    impl RuntimeLocator for AlwaysFound {
        fn locate(&self) -> Result<RuntimeCommand> {
            Ok(RuntimeCommand {
                program: "agent-runtime".into(),
                args: Vec::new(),
            })
        }
    }

    struct MockAgent {
        base_url: String,
        prompt_count: Arc<AtomicUsize>,
    }

    /// Loopback stand-in for the agent server: answers session create,
    /// message, and abort requests, and replays the given SSE frames on
    /// `/event` before holding the stream open.
    async fn spawn_mock_agent(frames: Vec<String>, session_create_ok: bool) -> MockAgent {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let prompt_count = Arc::new(AtomicUsize::new(0));
        let counter = prompt_count.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let frames = frames.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16384];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let first_line = request.lines().next().unwrap_or("").to_string();

                    if first_line.starts_with("GET /event") {
                        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
                        let _ = socket.write_all(head.as_bytes()).await;
                        for frame in frames {
                            // "SLEEP:<ms>" entries pause the replay, letting
                            // tests interleave adapter calls with the stream.
                            if let Some(ms) = frame.strip_prefix("SLEEP:") {
                                let ms = ms.parse::<u64>().unwrap_or(0);
                                tokio::time::sleep(Duration::from_millis(ms)).await;
                                continue;
                            }
                            let _ = socket.write_all(frame.as_bytes()).await;
                        }
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    } else if first_line.contains("/message") {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let _ = socket
                            .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
                            .await;
                    } else if first_line.contains("/abort") {
                        let _ = socket
                            .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
                            .await;
                    } else if first_line.starts_with("POST /session") {
                        if session_create_ok {
                            let body = r#"{"id":"ses_1"}"#;
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                        } else {
                            let _ = socket
                                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                                .await;
                        }
                    } else {
                        let _ = socket
                            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                            .await;
                    }
                });
            }
        });

        MockAgent {
            base_url: format!("http://{}", addr),
            prompt_count,
        }
    }

    fn sse(value: Value) -> String {
        format!("data: {}\n\n", value)
    }

    fn text_part(session: &str, id: &str, text: &str, ended: bool) -> String {
        let mut part = json!({
            "id": id,
            "sessionID": session,
            "messageID": "msg_1",
            "type": "text",
            "text": text,
            "time": { "start": 1 }
        });
        if ended {
            part["time"]["end"] = json!(2);
        }
        sse(json!({ "type": "message.part.updated", "properties": { "part": part } }))
    }

    fn tool_part(session: &str, id: &str, tool: &str, status: &str, payload: Value) -> String {
        let state = match status {
            "completed" => json!({ "status": status, "output": payload }),
            "error" => json!({ "status": status, "error": payload }),
            _ => json!({ "status": status, "input": payload }),
        };
        sse(json!({
            "type": "message.part.updated",
            "properties": {
                "part": {
                    "id": id,
                    "callID": id,
                    "sessionID": session,
                    "messageID": "msg_1",
                    "type": "tool",
                    "tool": tool,
                    "state": state
                }
            }
        }))
    }

    fn step_start(session: &str) -> String {
        sse(json!({
            "type": "message.part.updated",
            "properties": {
                "part": { "id": "step_s", "sessionID": session, "messageID": "msg_1", "type": "step-start" }
            }
        }))
    }

    fn step_finish(session: &str, reason: &str) -> String {
        sse(json!({
            "type": "message.part.updated",
            "properties": {
                "part": { "id": "step_f", "sessionID": session, "messageID": "msg_1", "type": "step-finish", "reason": reason }
            }
        }))
    }

    fn session_error(session: &str, message: &str) -> String {
        sse(json!({
            "type": "session.error",
            "properties": { "sessionID": session, "error": message }
        }))
    }

    fn make_adapter(base_url: &str) -> TaskAdapter {
        TaskAdapter::new(Arc::new(AgentClient::new(base_url)), Arc::new(AlwaysFound))
    }

    async fn collect_events(
        rx: &mut broadcast::Receiver<AdapterEvent>,
        window: Duration,
    ) -> Vec<AdapterEvent> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => {
                    let done = matches!(event, AdapterEvent::Complete { .. });
                    events.push(event);
                    if done {
                        break;
                    }
                }
                _ => break,
            }
        }
        events
    }

    /// Like `collect_events` but never breaks early on `Complete`; used to
    /// prove a terminal event fires exactly once.
    async fn collect_for(
        rx: &mut broadcast::Receiver<AdapterEvent>,
        window: Duration,
    ) -> Vec<AdapterEvent> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => events.push(event),
                _ => break,
            }
        }
        events
    }

    fn completes(events: &[AdapterEvent]) -> Vec<(TaskStatus, Option<String>)> {
        events
            .iter()
            .filter_map(|event| match event {
                AdapterEvent::Complete { status, error, .. } => {
                    Some((*status, error.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn tool_lifecycle_emits_one_call_and_one_result() {
        let frames = vec![
            step_start("ses_1"),
            tool_part("ses_1", "call_1", "bash", "pending", json!({"command": "ls"})),
            tool_part("ses_1", "call_1", "bash", "running", json!({"command": "ls"})),
            tool_part("ses_1", "call_1", "bash", "completed", json!("file.txt")),
            tool_part("ses_1", "call_1", "bash", "completed", json!("file.txt")),
            step_finish("ses_1", "stop"),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("list files"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_secs(5)).await;

        let calls = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    AdapterEvent::Message { message: NormalizedMessage::ToolCall { id, .. } } if id == "call_1"
                )
            })
            .count();
        let results = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    AdapterEvent::Message { message: NormalizedMessage::ToolResult { id, .. } } if id == "call_1"
                )
            })
            .count();
        assert_eq!(calls, 1, "exactly one tool_call per part id");
        assert_eq!(results, 1, "exactly one tool_result per part id");
        assert_eq!(completes(&events), vec![(TaskStatus::Success, None)]);
    }

    #[tokio::test]
    async fn text_parts_emit_once_and_only_when_complete() {
        let frames = vec![
            step_start("ses_1"),
            text_part("ses_1", "txt_1", "partial", false),
            tool_part("ses_1", "call_1", "bash", "pending", json!({})),
            tool_part("ses_1", "call_1", "bash", "completed", json!("ok")),
            text_part("ses_1", "txt_1", "final answer", true),
            text_part("ses_1", "txt_1", "final answer", true),
            step_finish("ses_1", "stop"),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("answer"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_secs(5)).await;

        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AdapterEvent::Message {
                    message: NormalizedMessage::Text { text, .. },
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["final answer"]);
    }

    #[tokio::test]
    async fn events_for_other_sessions_are_dropped() {
        let frames = vec![
            text_part("ses_other", "txt_other", "not ours", true),
            tool_part("ses_other", "call_other", "bash", "completed", json!("x")),
            session_error("ses_1", "provider exploded"),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_secs(5)).await;

        assert!(!events.iter().any(|e| matches!(
            e,
            AdapterEvent::Message {
                message: NormalizedMessage::Text { .. } | NormalizedMessage::ToolResult { .. }
            }
        )));
        let completes = completes(&events);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].0, TaskStatus::Error);
        assert!(completes[0].1.as_deref().unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn step_finish_error_overrides_completion_detection() {
        let frames = vec![
            step_start("ses_1"),
            tool_part("ses_1", "call_done", COMPLETION_TOOL, "pending", json!({})),
            tool_part("ses_1", "call_done", COMPLETION_TOOL, "completed", json!("done")),
            step_finish("ses_1", "error"),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_secs(5)).await;

        let completes = completes(&events);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].0, TaskStatus::Error);
    }

    #[tokio::test]
    async fn completion_tool_then_stop_finalizes_success() {
        let frames = vec![
            step_start("ses_1"),
            tool_part("ses_1", "call_done", COMPLETION_TOOL, "pending", json!({"summary": "all done"})),
            tool_part("ses_1", "call_done", COMPLETION_TOOL, "completed", json!("ok")),
            step_finish("ses_1", "stop"),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(completes(&events), vec![(TaskStatus::Success, None)]);
    }

    #[tokio::test]
    async fn waiting_progress_suppressed_when_tool_arrives_in_grace_window() {
        let frames = vec![
            step_start("ses_1"),
            tool_part("ses_1", "call_1", "bash", "pending", json!({})),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_millis(900)).await;

        assert!(
            !events.iter().any(|e| matches!(
                e,
                AdapterEvent::Progress {
                    stage: ProgressStage::WaitingForResponse,
                    ..
                }
            )),
            "waiting signal must not fire when a tool arrives first"
        );
        adapter.dispose().await;
    }

    #[tokio::test]
    async fn waiting_progress_fires_when_no_tool_arrives() {
        let frames = vec![step_start("ses_1")];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_millis(1200)).await;

        assert!(events.iter().any(|e| matches!(
            e,
            AdapterEvent::Progress {
                stage: ProgressStage::WaitingForResponse,
                ..
            }
        )));
        adapter.dispose().await;
    }

    #[tokio::test]
    async fn premature_stop_with_incomplete_todos_sends_continuation() {
        let todos = json!({
            "todos": [
                { "id": "1", "content": "first", "status": "completed" },
                { "id": "2", "content": "second", "status": "in_progress" }
            ]
        });
        let frames = vec![
            step_start("ses_1"),
            tool_part("ses_1", "call_todo", TODO_WRITE_TOOL, "pending", todos),
            tool_part("ses_1", "call_todo", TODO_WRITE_TOOL, "completed", json!("ok")),
            step_finish("ses_1", "stop"),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_secs(2)).await;

        assert!(
            completes(&events).is_empty(),
            "task must not complete while todos are pending"
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, AdapterEvent::TodoUpdate { todos } if todos.len() == 2)));
        // Initial prompt plus the continuation prompt.
        assert!(
            mock.prompt_count.load(Ordering::SeqCst) >= 2,
            "continuation prompt must be dispatched"
        );
        adapter.dispose().await;
    }

    #[tokio::test]
    async fn question_tool_becomes_permission_request() {
        let input = json!({
            "questions": [{
                "question": "Which database?",
                "options": [ { "label": "Postgres" }, { "label": "SQLite" } ],
                "multiple": false
            }]
        });
        let frames = vec![
            step_start("ses_1"),
            tool_part("ses_1", "call_q", QUESTION_TOOL, "pending", input),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        let events = collect_events(&mut rx, Duration::from_millis(900)).await;

        let request = events
            .iter()
            .find_map(|e| match e {
                AdapterEvent::PermissionRequest { request } => Some(request.clone()),
                _ => None,
            })
            .expect("permission request");
        assert_eq!(request.prompt, "Which database?");
        assert_eq!(request.options, vec!["Postgres", "SQLite"]);
        assert!(!request.multiple);

        // Republished instead of a plain tool call.
        assert!(!events.iter().any(|e| matches!(
            e,
            AdapterEvent::ToolUse { name, .. } if name == QUESTION_TOOL
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            AdapterEvent::Message { message: NormalizedMessage::ToolCall { name, .. } } if name == QUESTION_TOOL
        )));
        adapter.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_blocks_new_tasks() {
        let mock = spawn_mock_agent(Vec::new(), true).await;
        let adapter = make_adapter(&mock.base_url);

        adapter.dispose().await;
        adapter.dispose().await;

        let err = adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect_err("start after dispose must fail");
        assert!(matches!(err, TaskwingError::Disposed));
    }

    #[tokio::test]
    async fn cancel_task_finalizes_interrupted_exactly_once() {
        let frames = vec![step_start("ses_1")];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        adapter.cancel_task().await;
        adapter.cancel_task().await;

        let events = collect_for(&mut rx, Duration::from_millis(1500)).await;
        assert_eq!(completes(&events), vec![(TaskStatus::Interrupted, None)]);
        assert_eq!(
            adapter.current_task().await.map(|task| task.status),
            Some(TaskStatus::Interrupted)
        );
    }

    #[tokio::test]
    async fn interrupt_lets_completion_path_finish_as_interrupted() {
        let frames = vec![
            step_start("ses_1"),
            "SLEEP:500".to_string(),
            step_finish("ses_1", "stop"),
        ];
        let mock = spawn_mock_agent(frames, true).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_millis(150)).await;
        adapter.interrupt_task().await;

        let events = collect_events(&mut rx, Duration::from_secs(3)).await;
        assert_eq!(completes(&events), vec![(TaskStatus::Interrupted, None)]);
    }

    #[tokio::test]
    async fn resume_session_reuses_session_continuity() {
        let mock = spawn_mock_agent(vec![step_start("ses_old")], true).await;
        let adapter = make_adapter(&mock.base_url);

        let task = adapter
            .resume_session("ses_old", "pick up where you left off")
            .await
            .expect("resume");
        assert_eq!(task.session_id.as_deref(), Some("ses_old"));
        assert_eq!(task.status, TaskStatus::Running);

        // The resume prompt goes straight into the existing session; no new
        // session is created.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mock.prompt_count.load(Ordering::SeqCst), 1);
        adapter.dispose().await;
    }

    #[tokio::test]
    async fn missing_runtime_fails_before_any_session_is_created() {
        let adapter = TaskAdapter::new(
            Arc::new(AgentClient::new("http://127.0.0.1:1")),
            Arc::new(ExplicitRuntime::new("/definitely/not/a/runtime")),
        );
        let err = adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect_err("must fail");
        assert!(matches!(err, TaskwingError::RuntimeNotFound(_)));
    }

    #[tokio::test]
    async fn session_create_failure_finalizes_task_as_error() {
        let mock = spawn_mock_agent(Vec::new(), false).await;
        let adapter = make_adapter(&mock.base_url);
        let mut rx = adapter.subscribe();

        let err = adapter
            .start_task(TaskConfig::new("task"))
            .await
            .expect_err("session create must fail");
        assert!(matches!(err, TaskwingError::Session(_)));

        let events = collect_events(&mut rx, Duration::from_secs(2)).await;
        let completes = completes(&events);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].0, TaskStatus::Error);
    }

    #[test]
    fn todo_input_tolerates_malformed_entries() {
        let input = json!({
            "todos": [
                { "id": "1", "content": "good", "status": "pending" },
                { "content": "missing id" }
            ]
        });
        let todos = parse_todo_input(&input);
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].id, "1");
    }

    #[test]
    fn question_input_supports_flat_and_string_option_shapes() {
        let flat = json!({ "question": "Proceed?", "options": ["yes", "no"], "multiple": true });
        let request = parse_question_input("p1", &flat).expect("request");
        assert_eq!(request.prompt, "Proceed?");
        assert_eq!(request.options, vec!["yes", "no"]);
        assert!(request.multiple);
    }

    #[test]
    fn auth_errors_are_classified_with_provider_guess() {
        assert_eq!(
            classify_auth_error("anthropic: 401 Unauthorized"),
            Some(Some("anthropic".to_string()))
        );
        assert_eq!(classify_auth_error("invalid api key"), Some(None));
        assert_eq!(classify_auth_error("disk full"), None);
    }
}
