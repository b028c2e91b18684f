//! Audit trail sinks.
//!
//! Sinks implement [`AuditSink`] and may fail. The flow runner only talks to
//! an [`AuditEmitter`], which fans out to its sink and logs and discards any
//! failure, so a broken sink never stops a run.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use switchyard_core::error::{FlowError, Result};
use switchyard_core::traits::AuditSink;
use switchyard_core::types::AuditEvent;

/// Human-readable sink writing one line per event to stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }

    /// Render an event as a single console line.
    pub fn format_line(event: &AuditEvent) -> String {
        let mut line = format!(
            "{} [{}]",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.event_type
        );
        if let Some(ref node) = event.node_id {
            line.push_str(&format!(" node={}", node));
        }
        let has_payload = match &event.payload {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        if has_payload {
            line.push(' ');
            line.push_str(&event.payload.to_string());
        }
        line
    }
}

impl AuditSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn emit(&self, event: &AuditEvent) -> Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", Self::format_line(event))?;
        Ok(())
    }
}

/// Append-only JSONL audit log.
///
/// Each emit opens the file in append mode, writes one line and closes it,
/// so a crash mid-write can damage at most the line being written.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn emit(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|e| FlowError::AuditSink {
                sink: "memory".into(),
                message: e.to_string(),
            })?
            .push(event.clone());
        Ok(())
    }
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn emit(&self, _event: &AuditEvent) -> Result<()> {
        Ok(())
    }
}

/// Fan-out sink. Every child sees every event; child failures are logged
/// and never stop the remaining children.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for CompositeSink {
    fn name(&self) -> &str {
        "composite"
    }

    fn emit(&self, event: &AuditEvent) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event) {
                warn!(sink = sink.name(), event_type = %event.event_type, error = %e, "Audit sink failed, event dropped for this sink");
            }
        }
        Ok(())
    }
}

/// Infallible front for an audit sink.
#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// An emitter that discards every event.
    pub fn null() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Emit an event. Never fails; sink errors are logged.
    pub fn emit(&self, event: AuditEvent) {
        debug!(event_type = %event.event_type, node_id = ?event.node_id, "audit");
        if let Err(e) = self.sink.emit(&event) {
            warn!(sink = self.sink.name(), event_type = %event.event_type, error = %e, "Audit emit failed");
        }
    }
}

impl Default for AuditEmitter {
    fn default() -> Self {
        Self::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenSink {
        attempts: AtomicUsize,
    }

    impl AuditSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        fn emit(&self, _event: &AuditEvent) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(FlowError::AuditSink {
                sink: "broken".into(),
                message: "disk on fire".into(),
            })
        }
    }

    #[test]
    fn test_jsonl_appends_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("logs/audit.jsonl")).unwrap();
        sink.emit(&AuditEvent::new("run_started", json!({"flow": "f1"}))).unwrap();
        sink.emit(&AuditEvent::new("node_started", json!({})).for_node("a")).unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "run_started");
        assert!(first["node_id"].is_null());
        assert_eq!(first["payload"]["flow"], "f1");

        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.node_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_jsonl_keeps_prior_lines_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        JsonlSink::new(&path)
            .unwrap()
            .emit(&AuditEvent::new("first", json!({})))
            .unwrap();
        JsonlSink::new(&path)
            .unwrap()
            .emit(&AuditEvent::new("second", json!({})))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_composite_survives_broken_sink() {
        let broken = Arc::new(BrokenSink {
            attempts: AtomicUsize::new(0),
        });
        let memory = Arc::new(MemorySink::new());
        let composite = CompositeSink::new()
            .with(broken.clone())
            .with(memory.clone());

        assert!(composite.emit(&AuditEvent::new("a", json!({}))).is_ok());
        assert!(composite.emit(&AuditEvent::new("b", json!({}))).is_ok());

        assert_eq!(broken.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(memory.events().len(), 2);
    }

    #[test]
    fn test_emitter_swallows_errors() {
        let emitter = AuditEmitter::new(Arc::new(BrokenSink {
            attempts: AtomicUsize::new(0),
        }));
        emitter.emit(AuditEvent::new("run_started", json!({})));
    }

    #[test]
    fn test_memory_sink_filters_by_type() {
        let sink = MemorySink::new();
        sink.emit(&AuditEvent::new("node_started", json!({}))).unwrap();
        sink.emit(&AuditEvent::new("node_finished", json!({}))).unwrap();
        assert_eq!(sink.events_of_type("node_finished").len(), 1);
    }

    #[test]
    fn test_console_format() {
        let event = AuditEvent::new("node_finished", json!({"status": "PASS"})).for_node("b");
        let line = ConsoleSink::format_line(&event);
        assert!(line.contains("[node_finished]"));
        assert!(line.contains("node=b"));
        assert!(line.contains("\"status\":\"PASS\""));

        let bare = ConsoleSink::format_line(&AuditEvent::new("run_started", json!({})));
        assert!(bare.ends_with("[run_started]"));
    }
}
