use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub level: String,
    pub message: String,
}

/// Bounded ring of recent log lines, surfaced in the stats snapshot so the
/// UI and dashboard collaborators can show them without scraping stderr.
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::with_capacity(DEFAULT_CAPACITY)),
            capacity: DEFAULT_CAPACITY,
        })
    }

    pub fn push(&self, level: &str, message: String) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogRecord {
            timestamp: SystemTime::now(),
            level: level.to_string(),
            message,
        });
    }

    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

/// tracing Layer that copies every event into a LogBuffer. Installed next to
/// the fmt layer so stderr output and the UI ring stay in sync.
pub struct BufferLayer {
    buffer: Arc<LogBuffer>,
}

impl BufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: tracing::Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.buffer
            .push(event.metadata().level().as_str(), visitor.message);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded() {
        let buf = LogBuffer::new();
        for i in 0..250 {
            buf.push("INFO", format!("line {i}"));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), DEFAULT_CAPACITY);
        assert_eq!(snap.first().unwrap().message, "line 150");
        assert_eq!(snap.last().unwrap().message, "line 249");
    }
}
