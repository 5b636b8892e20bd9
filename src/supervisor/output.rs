//! Output ring buffer: the last N lines the child printed, newest last.
//! Uses `std::sync::Mutex` because pushes are short and never cross an await.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub stream: &'static str,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

pub struct OutputRingBuffer {
    entries: std::sync::Mutex<VecDeque<OutputLine>>,
    capacity: usize,
}

impl OutputRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, stream: &'static str, line: &str) {
        let mut buf = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(OutputLine {
            stream,
            line: line.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Up to `limit` most recent lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<OutputLine> {
        let buf = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let skip = buf.len().saturating_sub(limit);
        buf.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_lines() {
        let buf = OutputRingBuffer::new(3);
        for i in 0..5 {
            buf.push("stdout", &format!("line {i}"));
        }
        let lines: Vec<String> = buf.recent(10).into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buf.recent(1)[0].line, "line 4");
        buf.clear();
        assert!(buf.recent(10).is_empty());
    }
}
