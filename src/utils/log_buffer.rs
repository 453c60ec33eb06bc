use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Output,
    Error,
    Success,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    pub profile: Option<String>,
}

/// Bounded in-memory log of recent runs, oldest entries evicted first.
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn add_log(&self, level: LogLevel, message: String, profile: Option<String>) {
        if self.max_entries == 0 {
            return;
        }
        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level,
            message,
            profile,
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Most recent `limit` entries in chronological order.
    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let skip = limit.map_or(0, |n| buffer.len().saturating_sub(n));
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}
