// Watches the agent process's captured output for known fatal error
// signatures, turning silent hangs into early, actionable alerts. Purely
// advisory: it tails the shared ring buffer on a cursor and broadcasts one
// alert per matching line, never touching the process itself.

use crate::logs::{now_ms, LogRingBuffer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Signatures that mean the runtime is dying or already dead.
const FATAL_SIGNATURES: &[&str] = &[
    "panicked at",
    "fatal error",
    "out of memory",
    "eaddrinuse",
    "enoent",
    "unhandledpromiserejection",
    "segmentation fault",
];

/// Signatures that point at broken provider credentials rather than a
/// broken process.
const AUTH_SIGNATURES: &[&str] = &[
    "401 unauthorized",
    "invalid api key",
    "authentication failed",
    "missing api key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherAlertKind {
    Fatal,
    Auth,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherAlert {
    pub kind: WatcherAlertKind,
    pub signature: &'static str,
    pub line: String,
    pub at_ms: u64,
}

pub fn classify_line(line: &str) -> Option<(WatcherAlertKind, &'static str)> {
    let lower = line.to_lowercase();
    if let Some(signature) = AUTH_SIGNATURES
        .iter()
        .copied()
        .find(|signature| lower.contains(signature))
    {
        return Some((WatcherAlertKind::Auth, signature));
    }
    FATAL_SIGNATURES
        .iter()
        .copied()
        .find(|signature| lower.contains(signature))
        .map(|signature| (WatcherAlertKind::Fatal, signature))
}

pub struct LogWatcher {
    events: broadcast::Sender<WatcherAlert>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogWatcher {
    /// Start tailing the given ring buffer. Lines already captured before
    /// the watcher starts are scanned too — early startup errors matter the
    /// most.
    pub fn spawn(buffer: Arc<LogRingBuffer>) -> Self {
        let (events, _) = broadcast::channel(256);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let tx = events.clone();

        let task = tokio::spawn(async move {
            let mut cursor = 0u64;
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tick.tick() => {
                        for line in buffer.since(cursor) {
                            cursor = line.seq;
                            if let Some((kind, signature)) = classify_line(&line.text) {
                                tracing::warn!(
                                    signature,
                                    "Agent process output matched error signature: {}",
                                    line.text
                                );
                                let _ = tx.send(WatcherAlert {
                                    kind,
                                    signature,
                                    line: line.text,
                                    at_ms: now_ms(),
                                });
                            }
                        }
                    }
                }
            }
        });

        Self {
            events,
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatcherAlert> {
        self.events.subscribe()
    }

    pub async fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().await.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_and_auth_signatures() {
        assert_eq!(
            classify_line("thread 'main' panicked at src/main.rs:1"),
            Some((WatcherAlertKind::Fatal, "panicked at"))
        );
        assert_eq!(
            classify_line("Error: listen EADDRINUSE :::4096"),
            Some((WatcherAlertKind::Fatal, "eaddrinuse"))
        );
        assert_eq!(
            classify_line("provider anthropic: 401 Unauthorized"),
            Some((WatcherAlertKind::Auth, "401 unauthorized"))
        );
        assert_eq!(classify_line("server listening on port 4021"), None);
    }

    #[test]
    fn auth_takes_precedence_over_fatal_wording() {
        let line = "FATAL ERROR: authentication failed for provider";
        assert_eq!(
            classify_line(line).map(|(kind, _)| kind),
            Some(WatcherAlertKind::Auth)
        );
    }

    #[tokio::test]
    async fn watcher_alerts_on_matching_line() {
        let buffer = Arc::new(LogRingBuffer::new(100));
        let watcher = LogWatcher::spawn(buffer.clone());
        let mut alerts = watcher.subscribe();

        buffer.push("STDERR normal chatter".to_string());
        buffer.push("STDERR JavaScript heap out of memory".to_string());

        let alert = tokio::time::timeout(Duration::from_secs(2), alerts.recv())
            .await
            .expect("alert within poll window")
            .expect("alert");
        assert_eq!(alert.kind, WatcherAlertKind::Fatal);
        assert_eq!(alert.signature, "out of memory");
        assert!(alert.line.contains("heap"));

        watcher.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let buffer = Arc::new(LogRingBuffer::new(10));
        let watcher = LogWatcher::spawn(buffer);
        watcher.stop().await;
        watcher.stop().await;
    }
}
