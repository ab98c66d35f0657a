// Taskwing Core - agent runtime orchestration for the Taskwing desktop app
//
// Launches an opencode-style coding-agent CLI as a server-mode subprocess,
// discovers its port from process output, consumes its SSE event stream,
// and normalizes that stream into a small closed message model with
// deterministic task-completion semantics. The UI, settings persistence,
// and credential storage live elsewhere and talk to this crate through the
// interfaces in `config` and the broadcast event streams.

mod adapter;
mod client;
mod config;
mod enforcer;
mod error;
mod log_watcher;
mod logs;
mod protocol;
mod server;
mod stream_parser;

pub use adapter::{
    AdapterEvent, NormalizedMessage, ProgressStage, QuestionRequest, Task, TaskAdapter,
    TaskStatus, COMPLETION_TOOL, QUESTION_TOOL, TODO_WRITE_TOOL,
};
pub use client::{AgentClient, CircuitBreaker, Session};
pub use config::{
    CredentialSync, ExplicitRuntime, ModelRef, NoopCredentialSync, RuntimeCommand, RuntimeLocator,
    ServerConfig, TaskConfig, DEFAULT_MODEL_ID, DEFAULT_PROVIDER_ID,
};
pub use enforcer::{CompletionEnforcer, StepVerdict, MAX_CONSECUTIVE_CONTINUATIONS};
pub use error::{Result, TaskwingError};
pub use log_watcher::{LogWatcher, WatcherAlert, WatcherAlertKind};
pub use logs::{init_logging, now_ms, LogRingBuffer, RingLine};
pub use protocol::{
    decode_agent_event, extract_error_message, AgentEvent, EventPart, PartKind, StepFinishReason,
    TodoItem, ToolStatus,
};
pub use server::{ServerEvent, ServerProcessManager, ServerSnapshot, ServerState};
pub use stream_parser::{StreamParser, MAX_BUFFER_BYTES};
