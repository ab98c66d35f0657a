// Task and server configuration, plus the seams this crate consumes from the
// rest of the application: runtime discovery and credential sync.

use crate::error::{Result, TaskwingError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Fallback model pair used when neither the task nor the provider
/// selection state supplies one.
pub const DEFAULT_PROVIDER_ID: &str = "anthropic";
pub const DEFAULT_MODEL_ID: &str = "claude-sonnet-4-5";

/// A resolved provider/model selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
        }
    }
}

/// Caller-supplied description of a task to run.
#[derive(Debug, Clone, Default)]
pub struct TaskConfig {
    pub prompt: String,
    /// Working directory the session should be scoped to.
    pub directory: Option<PathBuf>,
    /// Caller-generated task id; one is generated when absent.
    pub task_id: Option<String>,
    /// Resolved model selection; the hardcoded default pair applies when
    /// absent.
    pub model: Option<ModelRef>,
}

impl TaskConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Resolved invocation of the agent runtime binary.
#[derive(Debug, Clone)]
pub struct RuntimeCommand {
    pub program: PathBuf,
    /// Arguments that precede the server-mode arguments (empty for a plain
    /// binary; launcher shims may need some).
    pub args: Vec<String>,
}

/// Resolves where the agent runtime lives. Packaged vs. development layouts
/// and per-OS install conventions are the application's concern; the core
/// only needs the resolved command or a distinguished failure.
pub trait RuntimeLocator: Send + Sync {
    fn locate(&self) -> Result<RuntimeCommand>;
}

/// Locator for a known, explicit binary path.
#[derive(Debug, Clone)]
pub struct ExplicitRuntime {
    path: PathBuf,
}

impl ExplicitRuntime {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RuntimeLocator for ExplicitRuntime {
    fn locate(&self) -> Result<RuntimeCommand> {
        if !self.path.is_file() {
            return Err(TaskwingError::RuntimeNotFound(
                self.path.to_string_lossy().to_string(),
            ));
        }
        Ok(RuntimeCommand {
            program: self.path.clone(),
            args: Vec::new(),
        })
    }
}

/// Materializes credentials into the config artifact the runtime expects.
/// Invoked fire-and-forget before each task; failures are logged, not fatal.
pub trait CredentialSync: Send + Sync {
    fn materialize(&self) -> Result<()>;
}

/// Default no-op sync for deployments that configure the runtime externally.
#[derive(Debug, Clone, Default)]
pub struct NoopCredentialSync;

impl CredentialSync for NoopCredentialSync {
    fn materialize(&self) -> Result<()> {
        Ok(())
    }
}

/// Configuration for the server process manager.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hostname the runtime binds; loopback only.
    pub hostname: String,
    /// How long to wait for the runtime to announce its port.
    pub startup_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub shutdown_grace: Duration,
    /// Captured-output ring buffer capacity in lines.
    pub log_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            log_capacity: 2000,
        }
    }
}
