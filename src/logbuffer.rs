//! Bounded ring buffer of recent log lines with a live feed.
//!
//! Each process's stdout/stderr pump appends here; consumers fetch history
//! and subscribe for new lines. Slow subscribers lose lines rather than
//! applying backpressure to the pumps.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    tx: broadcast::Sender<String>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        LogBuffer {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    pub fn append(&self, line: &str) {
        {
            let mut lines = self.lines.lock().expect("log buffer lock poisoned");
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
        let _ = self.tx.send(line.to_string());
    }

    pub fn history(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("log buffer lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        LogBuffer::new(1024)
    }
}
