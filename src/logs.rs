use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// One captured output line with its monotonically increasing sequence number.
#[derive(Debug, Clone)]
pub struct RingLine {
    pub seq: u64,
    pub text: String,
}

#[derive(Debug, Default)]
struct RingInner {
    next_seq: u64,
    dropped: u64,
    lines: VecDeque<RingLine>,
}

/// Bounded line buffer shared between the process drain threads and readers.
///
/// Readers track their position with the `seq` cursor returned by [`push`]
/// so the port scraper and the log watcher can each consume independently.
///
/// [`push`]: LogRingBuffer::push
#[derive(Debug)]
pub struct LogRingBuffer {
    max_lines: usize,
    inner: Mutex<RingInner>,
}

impl LogRingBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            inner: Mutex::new(RingInner::default()),
        }
    }

    /// Append a line, evicting the oldest entries past capacity.
    pub fn push(&self, text: String) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.lines.push_back(RingLine { seq, text });
        while inner.lines.len() > self.max_lines {
            inner.lines.pop_front();
            inner.dropped += 1;
        }
        seq
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// Sequence number of the most recently pushed line; 0 when empty.
    pub fn latest_seq(&self) -> u64 {
        self.inner.lock().unwrap().next_seq
    }

    /// The last `last_n` captured lines, oldest first.
    pub fn snapshot(&self, last_n: usize) -> Vec<RingLine> {
        let inner = self.inner.lock().unwrap();
        let start = inner.lines.len().saturating_sub(last_n);
        inner.lines.iter().skip(start).cloned().collect()
    }

    /// All lines captured after the given sequence number.
    pub fn since(&self, seq: u64) -> Vec<RingLine> {
        let inner = self.inner.lock().unwrap();
        inner
            .lines
            .iter()
            .filter(|line| line.seq > seq)
            .cloned()
            .collect()
    }

    /// Joined tail of the buffer, used for early-exit diagnostics.
    pub fn tail_joined(&self, last_n: usize) -> String {
        self.snapshot(last_n)
            .into_iter()
            .map(|line| line.text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Initialize process logging: compact console output always, plus a
/// daily-rolling JSONL file layer when a logs directory is provided.
///
/// The returned guard must be held for the lifetime of the process so the
/// non-blocking file writer flushes on shutdown.
pub fn init_logging(logs_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    match logs_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("taskwing.core")
                .filename_suffix("jsonl")
                .build(dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .ok();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .try_init()
                .ok();
            Ok(None)
        }
    }
}
