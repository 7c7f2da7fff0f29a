use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// 日志环形缓冲区
///
/// Fixed capacity, oldest entries overwritten on wrap. The dump walks slots
/// in insertion order and stops at the first empty one, so a ring that never
/// wrapped renders exactly what was appended.
pub struct LogRing {
    inner: RwLock<RingInner>,
}

struct RingInner {
    entries: Vec<String>,
    index: usize,
}

pub const LOG_RING_CAPACITY: usize = 10_000;

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(RingInner {
                entries: vec![String::new(); capacity],
                index: 0,
            }),
        }
    }

    /// Append one message, stamped `[YYYY-MM-DD HH:MM:SS]` in local time.
    pub fn append(&self, message: &str) {
        let line = format!(
            "[{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            message
        );
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.index == inner.entries.len() {
            inner.index = 0;
        }
        let at = inner.index;
        inner.entries[at] = line;
        inner.index += 1;
    }

    /// Dump entries in slot order until the first empty slot.
    pub fn dump(&self) -> String {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        for entry in &inner.entries {
            if entry.is_empty() {
                break;
            }
            let _ = writeln!(out, "{}", entry);
        }
        out
    }
}

/// tracing Layer，把每条事件写入 LogRing
pub struct RingLayer {
    ring: Arc<LogRing>,
}

impl RingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

/// 提取 tracing 事件的 message 与结构化字段
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn new() -> Self {
        Self {
            message: String::new(),
            fields: Vec::new(),
        }
    }

    fn format_output(&self) -> String {
        let mut output = self.message.clone();
        for (k, v) in &self.fields {
            let _ = write!(output, " {}={}", k, v);
        }
        output
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

impl<S> Layer<S> for RingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);
        self.ring.append(&visitor.format_output());
    }
}
