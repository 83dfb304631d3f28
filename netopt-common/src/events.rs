//! Structured event emission.
//!
//! The sink is a pure producer: every event is mirrored to `tracing` as a
//! JSON record and, when a buffer is attached, retained in memory so callers
//! (and tests) can inspect what was emitted. Durable storage and rotation
//! belong to the external log collaborator.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::clock;

/// Event severity. Ordered so `Fatal` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// A single structured event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Microseconds on the process-wide monotonic clock.
    pub monotonic_us: u64,
    /// Wall-clock UTC timestamp, RFC 3339.
    pub wall_utc: String,
    pub pid: u32,
    pub level: Level,
    /// Event-kind tag: `probe`, `plan`, `apply`, `watchdog`, `checkpoint`, ...
    pub kind: &'static str,
    /// Kind-specific structured fields.
    pub fields: serde_json::Value,
}

/// Shared handle to events captured by a buffered sink.
#[derive(Debug, Clone, Default)]
pub struct EventBuffer(Arc<Mutex<Vec<Event>>>);

impl EventBuffer {
    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().expect("event buffer poisoned").clone()
    }

    /// Whether any event matches the given level and kind.
    pub fn contains(&self, level: Level, kind: &str) -> bool {
        self.0.lock().expect("event buffer poisoned").iter().any(|e| e.level == level && e.kind == kind)
    }

    fn push(&self, event: Event) {
        self.0.lock().expect("event buffer poisoned").push(event);
    }
}

/// Event producer shared across the pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    buffer: Option<EventBuffer>,
}

impl EventSink {
    /// A sink that only mirrors events to `tracing`.
    pub fn new() -> Self {
        Self { buffer: None }
    }

    /// A sink that additionally retains events in memory.
    pub fn buffered() -> (Self, EventBuffer) {
        let buffer = EventBuffer::default();
        (Self { buffer: Some(buffer.clone()) }, buffer)
    }

    /// Emits one event.
    pub fn emit(&self, level: Level, kind: &'static str, fields: serde_json::Value) {
        let event = Event {
            monotonic_us: clock::monotonic_micros(),
            wall_utc: chrono::Utc::now().to_rfc3339(),
            pid: std::process::id(),
            level,
            kind,
            fields,
        };

        let record = serde_json::to_string(&event).unwrap_or_default();
        match level {
            Level::Debug => tracing::debug!(target: "netopt::events", kind, %record),
            Level::Info => tracing::info!(target: "netopt::events", kind, %record),
            Level::Warn => tracing::warn!(target: "netopt::events", kind, %record),
            Level::Error => tracing::error!(target: "netopt::events", kind, %record),
            Level::Fatal => tracing::error!(target: "netopt::events", kind, fatal = true, %record),
        }

        if let Some(buffer) = &self.buffer {
            buffer.push(event);
        }
    }

    pub fn debug(&self, kind: &'static str, fields: serde_json::Value) {
        self.emit(Level::Debug, kind, fields);
    }

    pub fn info(&self, kind: &'static str, fields: serde_json::Value) {
        self.emit(Level::Info, kind, fields);
    }

    pub fn warn(&self, kind: &'static str, fields: serde_json::Value) {
        self.emit(Level::Warn, kind, fields);
    }

    pub fn error(&self, kind: &'static str, fields: serde_json::Value) {
        self.emit(Level::Error, kind, fields);
    }

    pub fn fatal(&self, kind: &'static str, fields: serde_json::Value) {
        self.emit(Level::Fatal, kind, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn buffered_sink_retains_events() {
        let (sink, buffer) = EventSink::buffered();
        sink.info("probe", json!({ "link": "eth0", "latency_ms": 2.345 }));
        sink.fatal("watchdog", json!({ "action": "rollback" }));

        let events = buffer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "probe");
        assert_eq!(events[0].level, Level::Info);
        assert!(buffer.contains(Level::Fatal, "watchdog"));
        assert!(!buffer.contains(Level::Fatal, "probe"));
    }

    #[test]
    fn events_carry_both_timestamps() {
        let (sink, buffer) = EventSink::buffered();
        sink.debug("plan", json!({}));

        let event = &buffer.events()[0];
        assert!(event.wall_utc.contains('T'), "expected RFC 3339, got {}", event.wall_utc);
        assert_eq!(event.pid, std::process::id());
    }

    #[test]
    fn record_serializes_levels_lowercase() {
        let (sink, buffer) = EventSink::buffered();
        sink.warn("apply", json!({ "noop": true }));

        let record = serde_json::to_string(&buffer.events()[0]).unwrap();
        assert!(record.contains("\"level\":\"warn\""), "{record}");
        assert!(record.contains("\"noop\":true"), "{record}");
    }
}
