//! In-memory console for launched processes.
//!
//! Every process launched through this crate gets a console: a bounded ring of
//! parsed output lines plus a broadcast channel for live followers. The ring
//! answers "what happened so far" queries (`get_since`, `get_recent`), the
//! broadcast feeds UIs and log forwarders without them having to poll.

use std::collections::VecDeque;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::utils::current_timestamp;

/// Lines kept per console before the oldest are dropped.
pub const DEFAULT_CONSOLE_CAPACITY: usize = 10_000;

/// Broadcast backlog per console. Slow subscribers past this lag lose lines.
const BROADCAST_CAPACITY: usize = 2048;

/// A single line of process output, normalized for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    /// Strictly increasing per console, usable as a resume cursor.
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub source: ConsoleSource,
    pub content: String,
    pub level: ConsoleLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleSource {
    Stdout,
    Stderr,
    /// Lifecycle messages produced by this crate rather than the process.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Bounded ring of console lines with monotonically increasing ids.
#[derive(Debug)]
struct ConsoleRing {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    max_size: usize,
}

impl ConsoleRing {
    fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            next_id: 0,
            max_size: max_size.max(1),
        }
    }

    fn push(&mut self, source: ConsoleSource, content: String, level: ConsoleLevel) -> ConsoleLine {
        let line = ConsoleLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    fn get_since(&self, after_id: u64) -> Vec<ConsoleLine> {
        self.lines
            .iter()
            .filter(|l| l.id > after_id)
            .cloned()
            .collect()
    }

    fn get_recent(&self, count: usize) -> Vec<ConsoleLine> {
        let start = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(start).cloned().collect()
    }
}

/// Shared console handle. Cloning is cheap; all clones feed the same ring
/// and the same broadcast channel, so a console can outlive a single process
/// run and accumulate history across restarts.
#[derive(Debug, Clone)]
pub struct Console {
    ring: Arc<Mutex<ConsoleRing>>,
    tx: broadcast::Sender<ConsoleLine>,
}

impl Console {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            ring: Arc::new(Mutex::new(ConsoleRing::new(capacity))),
            tx,
        }
    }

    /// Append a line, assigning it the next id, and fan it out to
    /// subscribers. Returns the stored line.
    pub async fn push(
        &self,
        source: ConsoleSource,
        content: impl Into<String>,
        level: ConsoleLevel,
    ) -> ConsoleLine {
        let line = {
            let mut ring = self.ring.lock().await;
            ring.push(source, content.into(), level)
        };
        // 구독자가 없으면 send가 실패하지만 버퍼에는 이미 기록됐다
        let _ = self.tx.send(line.clone());
        line
    }

    /// Lines with an id strictly greater than `after_id`.
    pub async fn get_since(&self, after_id: u64) -> Vec<ConsoleLine> {
        self.ring.lock().await.get_since(after_id)
    }

    /// The most recent `count` lines, oldest first.
    pub async fn get_recent(&self, count: usize) -> Vec<ConsoleLine> {
        self.ring.lock().await.get_recent(count)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.tx.subscribe()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new(DEFAULT_CONSOLE_CAPACITY)
    }
}

/// Parse the severity of an output line using an optional regex pattern.
///
/// The pattern should carry a named capture group `level` matching level
/// keywords (INFO, WARN, ERROR, DEBUG, ...). Without a pattern, or when the
/// pattern does not match the line, the level is plain [`ConsoleLevel::Info`];
/// content is never scanned for keywords.
///
/// Example patterns:
///   bracketed:  `\[(?P<level>[A-Z]+)\]`
///   generic:    `(?P<level>INFO|WARN|ERROR|DEBUG|TRACE|FATAL)`
pub fn parse_console_level(content: &str, pattern: Option<&Regex>) -> ConsoleLevel {
    if let Some(re) = pattern {
        if let Some(caps) = re.captures(content) {
            if let Some(m) = caps.name("level") {
                return match m.as_str().to_ascii_uppercase().as_str() {
                    "ERROR" | "FATAL" => ConsoleLevel::Error,
                    "WARN" | "WARNING" => ConsoleLevel::Warn,
                    "DEBUG" | "TRACE" => ConsoleLevel::Debug,
                    _ => ConsoleLevel::Info,
                };
            }
        }
    }
    ConsoleLevel::Info
}
