//! Legacy transport parser: recovers framed JSON objects from the raw text
//! stream of a pseudo-terminal-hosted agent process.
//!
//! The PTY host interleaves terminal escape sequences, banner lines, and the
//! occasional raw control byte with the JSON the agent actually emits, and
//! chunk boundaries land at arbitrary byte offsets. This parser accumulates
//! text, frames complete top-level objects with a string-aware brace scan,
//! and applies best-effort cleanup to candidates the host corrupted. Only
//! the legacy raw-text transport needs this; the structured SSE transport
//! bypasses it entirely.

use crate::error::{Result, TaskwingError};
use serde_json::Value;

/// Hard cap on unconsumed buffered text. Exceeding it is stream-fatal.
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Ceiling on objects extracted per `feed` call. Guards against crafted
/// input driving an unbounded extraction loop; leftovers are picked up by
/// the next call.
const MAX_OBJECTS_PER_FEED: usize = 1000;

#[derive(Debug, Default)]
pub struct StreamParser {
    buf: String,
}

enum Scan {
    Complete(usize),
    Incomplete,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and extract every complete top-level JSON object now
    /// present, in arrival order. Chunks may split objects at any byte
    /// offset. Corrupted candidates are repaired where possible and dropped
    /// (with a debug log) where not; consumed text is always removed so the
    /// stream keeps moving.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<Value>> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        for _ in 0..MAX_OBJECTS_PER_FEED {
            strip_leading_noise(&mut self.buf);
            if !self.buf.starts_with('{') {
                break;
            }
            match scan_object(&self.buf) {
                Scan::Complete(end) => {
                    let candidate: String = self.buf[..end].to_string();
                    self.buf.drain(..end);
                    match parse_candidate(&candidate) {
                        Some(value) => out.push(value),
                        None => {
                            tracing::debug!(
                                "Dropping unrecoverable stream fragment ({} bytes)",
                                candidate.len()
                            );
                        }
                    }
                }
                Scan::Incomplete => break,
            }
        }

        if self.buf.len() > MAX_BUFFER_BYTES {
            let dropped = self.buf.len();
            self.buf.clear();
            tracing::error!("Stream parser buffer overflow, discarding {} bytes", dropped);
            return Err(TaskwingError::ParserOverflow { dropped });
        }

        Ok(out)
    }

    /// One last extraction pass over whatever remains, including a
    /// truncation-recovery attempt on a trailing partial object, then clear.
    pub fn flush(&mut self) -> Vec<Value> {
        let mut out = self.feed("").unwrap_or_default();
        strip_leading_noise(&mut self.buf);
        if self.buf.starts_with('{') {
            let cleaned = strip_control_in_strings(&strip_ansi(&self.buf));
            if let Some(value) = recover_truncated(&cleaned) {
                out.push(value);
            }
        }
        self.buf.clear();
        out
    }

    /// Drop all buffered state. Used when a new task starts.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

/// Remove terminal noise ahead of the next object. A top-level JSON object
/// always starts with `{`, so anything before the first `{` is decoration:
/// ANSI escapes, box-drawing borders, banner lines, stray control bytes.
/// When no `{` is present at all, complete lines are discarded and only a
/// trailing partial line is retained (its `{` may still be in flight).
fn strip_leading_noise(buf: &mut String) {
    match buf.find('{') {
        Some(0) => {}
        Some(pos) => {
            buf.drain(..pos);
        }
        None => {
            if let Some(newline) = buf.rfind('\n') {
                buf.drain(..=newline);
            }
        }
    }
}

/// Find the end of the first balanced top-level object. Braces inside string
/// literals never count, and `\"` inside a string does not close it.
fn scan_object(s: &str) -> Scan {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in s.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Scan::Complete(i + 1);
                }
            }
            _ => {}
        }
    }
    Scan::Incomplete
}

fn parse_candidate(candidate: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }
    // The PTY host corrupted this one. Strip escape sequences and raw
    // control bytes, then fall back to truncation recovery.
    let cleaned = strip_control_in_strings(&strip_ansi(candidate));
    if let Ok(value) = serde_json::from_str(&cleaned) {
        return Some(value);
    }
    recover_truncated(&cleaned)
}

/// Remove ANSI CSI (`ESC [ ... cmd`), OSC (`ESC ] ... BEL`/`ESC \`), and
/// bare two-byte escape sequences.
fn strip_ansi(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b {
            match bytes.get(i + 1) {
                Some(b'[') => {
                    // CSI: parameter bytes 0x30-0x3f, intermediate 0x20-0x2f,
                    // terminated by a final byte 0x40-0x7e.
                    let mut j = i + 2;
                    while j < bytes.len() && !(0x40..=0x7e).contains(&bytes[j]) {
                        j += 1;
                    }
                    i = (j + 1).min(bytes.len());
                }
                Some(b']') => {
                    // OSC: runs to BEL or ESC \.
                    let mut j = i + 2;
                    while j < bytes.len() {
                        if bytes[j] == 0x07 {
                            j += 1;
                            break;
                        }
                        if bytes[j] == 0x1b && bytes.get(j + 1) == Some(&b'\\') {
                            j += 2;
                            break;
                        }
                        j += 1;
                    }
                    i = j;
                }
                Some(_) => i += 2,
                None => i += 1,
            }
            continue;
        }
        let ch_len = utf8_len(bytes[i]);
        if let Some(slice) = s.get(i..i + ch_len) {
            out.push_str(slice);
        }
        i += ch_len;
    }
    out
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xf0 => 4,
        b if b >= 0xe0 => 3,
        b if b >= 0xc0 => 2,
        _ => 1,
    }
}

/// Drop raw control characters that are illegal inside JSON string literals
/// (the host sometimes injects them mid-string). Structural whitespace
/// outside strings is preserved.
fn strip_control_in_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            if (c as u32) < 0x20 {
                continue;
            }
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

/// Best-effort recovery of an object whose tail was cut off (or mangled past
/// repair) mid-stream: cut back to the latest structural boundary outside a
/// string — a comma (dropping the trailing partial member) or a closing
/// brace/bracket — then close every still-open scope.
fn recover_truncated(s: &str) -> Option<Value> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // (cut position, open scopes at that point); the later boundary wins.
    let mut boundary: Option<(usize, Vec<u8>)> = None;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => stack.push(b),
            b'}' | b']' => {
                stack.pop();
                if stack.is_empty() {
                    // The object was complete after all.
                    return serde_json::from_str(&s[..=i]).ok();
                }
                boundary = Some((i + 1, stack.clone()));
            }
            b',' => boundary = Some((i, stack.clone())),
            _ => {}
        }
    }

    let (cut, open_scopes) = boundary?;
    let mut repaired = s[..cut].trim_end().to_string();
    for scope in open_scopes.iter().rev() {
        repaired.push(if *scope == b'{' { '}' } else { ']' });
    }
    serde_json::from_str(&repaired).ok()
}
