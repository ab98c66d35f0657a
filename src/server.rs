// Agent server process manager
// Spawns the agent runtime in server mode on an OS-assigned ephemeral port,
// scrapes the bound port out of its unstructured stdout/stderr, and exposes
// lifecycle events plus graceful/forced shutdown. Exactly one child process
// per manager instance; concurrent starts are rejected, not queued.

use crate::config::{RuntimeCommand, ServerConfig};
use crate::error::{Result, TaskwingError};
use crate::logs::LogRingBuffer;
use regex::Regex;
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};

/// Server process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Observable lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Ready {
        base_url: String,
        port: u16,
    },
    Error(String),
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub state: ServerState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

/// Substrings in startup output that mean the server can never come up;
/// fail fast on these instead of waiting out the timeout.
const FATAL_STARTUP_MARKERS: &[&str] = &[
    "eaddrinuse",
    "address already in use",
    "eacces",
    "permission denied",
];

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const EXIT_TAIL_LINES: usize = 40;

pub struct ServerProcessManager {
    config: ServerConfig,
    state: RwLock<ServerState>,
    /// Serializes start/stop transitions so two starts can never race a
    /// spawn.
    lifecycle: Mutex<()>,
    process: Mutex<Option<Child>>,
    port: RwLock<Option<u16>>,
    log_buffer: Arc<LogRingBuffer>,
    events: broadcast::Sender<ServerEvent>,
}

impl ServerProcessManager {
    pub fn new(config: ServerConfig) -> Self {
        let log_capacity = config.log_capacity;
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            state: RwLock::new(ServerState::Stopped),
            lifecycle: Mutex::new(()),
            process: Mutex::new(None),
            port: RwLock::new(None),
            log_buffer: Arc::new(LogRingBuffer::new(log_capacity)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// The ring buffer holding the child's captured output; shared with the
    /// log watcher.
    pub fn log_buffer(&self) -> Arc<LogRingBuffer> {
        self.log_buffer.clone()
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    pub async fn port(&self) -> Option<u16> {
        *self.port.read().await
    }

    pub async fn base_url(&self) -> Result<String> {
        let port = self
            .port()
            .await
            .ok_or_else(|| TaskwingError::Server("Agent server not running".to_string()))?;
        Ok(format!("http://{}:{}", self.config.hostname, port))
    }

    pub async fn runtime_snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            state: *self.state.read().await,
            port: *self.port.read().await,
            pid: self.process.lock().await.as_ref().map(|child| child.id()),
        }
    }

    /// Spawn the runtime in server mode and resolve with the base URL once
    /// the bound port is confirmed. Rejects if a server is already starting
    /// or running, if startup exceeds the configured timeout, or if the
    /// process reports a fatal bind error.
    pub async fn start(&self, runtime: &RuntimeCommand) -> Result<String> {
        // Reject outright instead of queueing behind an in-flight startup.
        {
            let state = *self.state.read().await;
            if matches!(state, ServerState::Starting | ServerState::Running) {
                return Err(TaskwingError::AlreadyRunning);
            }
        }

        let _lifecycle_guard = self.lifecycle.lock().await;
        {
            let state = *self.state.read().await;
            if matches!(state, ServerState::Starting | ServerState::Running) {
                return Err(TaskwingError::AlreadyRunning);
            }
        }
        *self.state.write().await = ServerState::Starting;

        tracing::info!(
            "Starting agent runtime server: {} serve --port 0 --hostname {}",
            runtime.program.display(),
            self.config.hostname
        );

        let mut cmd = Command::new(&runtime.program);
        cmd.args(&runtime.args);
        cmd.args(["serve", "--port", "0", "--hostname", &self.config.hostname]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let cursor = self.log_buffer.latest_seq();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                *self.state.write().await = ServerState::Failed;
                return Err(TaskwingError::Startup(format!(
                    "Failed to spawn agent runtime: {}",
                    e
                )));
            }
        };

        // Always drain piped stdio; a full pipe buffer deadlocks the child.
        // The bounded ring keeps this cheap while feeding port discovery and
        // the log watcher.
        if let Some(stdout) = child.stdout.take() {
            let log_buf = self.log_buffer.clone();
            std::thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines().map_while(|l| l.ok()) {
                    log_buf.push(format!("STDOUT {line}"));
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let log_buf = self.log_buffer.clone();
            std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(|l| l.ok()) {
                    log_buf.push(format!("STDERR {line}"));
                }
            });
        }

        {
            let mut guard = self.process.lock().await;
            *guard = Some(child);
        }

        match self.await_announcement(cursor).await {
            Ok(port) => {
                *self.port.write().await = Some(port);
                *self.state.write().await = ServerState::Running;
                let base_url = format!("http://{}:{}", self.config.hostname, port);
                tracing::info!("Agent server ready at {}", base_url);
                let _ = self.events.send(ServerEvent::Ready {
                    base_url: base_url.clone(),
                    port,
                });
                Ok(base_url)
            }
            Err(e) => {
                // Failed startup must leave the manager cleanly restartable.
                if let Some(mut child) = self.process.lock().await.take() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                *self.port.write().await = None;
                *self.state.write().await = ServerState::Failed;
                let _ = self.events.send(ServerEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Graceful termination: SIGTERM now, SIGKILL after the grace period if
    /// the process has not exited. Fire-and-forget — returns once the
    /// escalation is scheduled, with `Exit` observable as an event.
    pub async fn stop(&self) {
        let _lifecycle_guard = self.lifecycle.lock().await;

        if *self.state.read().await == ServerState::Stopped {
            return;
        }
        *self.state.write().await = ServerState::Stopping;
        tracing::info!("Stopping agent server");

        let child = self.process.lock().await.take();
        *self.port.write().await = None;

        if let Some(child) = child {
            let grace = self.config.shutdown_grace;
            let events = self.events.clone();
            tokio::spawn(async move {
                reap_child(child, grace, events).await;
            });
        }

        *self.state.write().await = ServerState::Stopped;
    }

    pub async fn restart(&self, runtime: &RuntimeCommand) -> Result<String> {
        self.stop().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.start(runtime).await
    }

    async fn await_announcement(&self, start_cursor: u64) -> Result<u16> {
        let deadline = Instant::now() + self.config.startup_timeout;
        let mut cursor = start_cursor;

        loop {
            for line in self.log_buffer.since(cursor) {
                cursor = line.seq;
                if let Some(marker) = scan_for_fatal(&line.text) {
                    return Err(TaskwingError::Startup(format!(
                        "Agent runtime reported fatal startup error ({}): {}",
                        marker, line.text
                    )));
                }
                if let Some(port) = scan_for_port(&line.text) {
                    return Ok(port);
                }
            }

            let exited = {
                let mut guard = self.process.lock().await;
                match guard.as_mut().map(|child| child.try_wait()) {
                    Some(Ok(status)) => status,
                    Some(Err(e)) => {
                        tracing::warn!("Failed to query agent runtime status: {}", e);
                        None
                    }
                    None => None,
                }
            };
            if let Some(status) = exited {
                // Let the drain threads flush whatever the process wrote on
                // the way down, and give the announcement one last chance.
                tokio::time::sleep(Duration::from_millis(150)).await;
                for line in self.log_buffer.since(cursor) {
                    cursor = line.seq;
                    if let Some(port) = scan_for_port(&line.text) {
                        return Ok(port);
                    }
                }
                let tail = self.log_buffer.tail_joined(EXIT_TAIL_LINES);
                let detail = if tail.trim().is_empty() {
                    format!("Agent runtime exited early with status {}", status)
                } else {
                    format!(
                        "Agent runtime exited early with status {}\nrecent output:\n{}",
                        status, tail
                    )
                };
                return Err(TaskwingError::Startup(detail));
            }

            if Instant::now() >= deadline {
                return Err(TaskwingError::Startup(format!(
                    "Agent runtime did not announce a listening port within {}s",
                    self.config.startup_timeout.as_secs()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for ServerProcessManager {
    fn drop(&mut self) {
        // Drop cannot be async; best-effort kill so we never orphan the
        // runtime.
        if let Ok(mut guard) = self.process.try_lock() {
            if let Some(mut child) = guard.take() {
                tracing::info!("Killing agent server on manager drop");
                let _ = child.kill();
            }
        }
    }
}

async fn reap_child(mut child: Child, grace: Duration, events: broadcast::Sender<ServerEvent>) {
    terminate_gracefully(&mut child);
    let deadline = Instant::now() + grace;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    tracing::warn!("Agent runtime ignored graceful stop, escalating to kill");
                    let _ = child.kill();
                    break child.wait().ok();
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => {
                tracing::warn!("Failed to reap agent runtime: {}", e);
                break None;
            }
        }
    };

    let (code, signal) = match &status {
        Some(status) => (status.code(), exit_signal(status)),
        None => (None, None),
    };
    tracing::info!("Agent server exited (code={:?}, signal={:?})", code, signal);
    let _ = events.send(ServerEvent::Exit { code, signal });
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Match the runtime's listening announcement. The exact wording varies
/// across runtime versions; the first pattern to hit wins.
fn scan_for_port(line: &str) -> Option<u16> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"https?://[0-9.]+:(\d+)").unwrap(),
            Regex::new(r"listening on port (\d+)").unwrap(),
            Regex::new(r"running at .*:(\d+)").unwrap(),
        ]
    });
    for pattern in patterns {
        if let Some(caps) = pattern.captures(line) {
            if let Ok(port) = caps[1].parse::<u16>() {
                return Some(port);
            }
        }
    }
    None
}

fn scan_for_fatal(line: &str) -> Option<&'static str> {
    let lower = line.to_lowercase();
    FATAL_STARTUP_MARKERS
        .iter()
        .copied()
        .find(|marker| lower.contains(marker))
}
