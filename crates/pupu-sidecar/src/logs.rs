use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RingLine {
    pub seq: u64,
    pub stream: LogStream,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Bounded in-memory tail of the sidecar's output.
#[derive(Debug)]
pub struct LogRingBuffer {
    max_lines: usize,
    seq: AtomicU64,
    dropped_total: AtomicU64,
    lines: RwLock<VecDeque<RingLine>>,
}

impl LogRingBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            seq: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            lines: RwLock::new(VecDeque::new()),
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn push(&self, stream: LogStream, text: String) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut guard = self.lines.write();
        guard.push_back(RingLine { seq, stream, text });

        while guard.len() > self.max_lines {
            guard.pop_front();
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }

        seq
    }

    pub fn snapshot(&self, last_n: usize) -> Vec<RingLine> {
        let guard = self.lines.read();
        let start = guard.len().saturating_sub(last_n);
        guard.iter().skip(start).cloned().collect()
    }

    pub fn since(&self, seq: u64) -> Vec<RingLine> {
        let guard = self.lines.read();
        guard.iter().filter(|l| l.seq > seq).cloned().collect()
    }
}
