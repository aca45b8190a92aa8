//! Escalation sinks
//!
//! The coordinator and the replay manager only need a fire-and-forget way
//! to hand an escalation to whoever notifies humans. Sinks must not block.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::plan::Severity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub severity: Severity,
    pub notify: Vec<String>,
    pub message: String,
    /// Plan, step, artifact and anything else useful to the responder
    pub context: Value,
    pub raised_at: DateTime<Utc>,
}

impl EscalationPayload {
    pub fn new(severity: Severity, notify: Vec<String>, message: impl Into<String>, context: Value) -> Self {
        Self {
            severity,
            notify,
            message: message.into(),
            context,
            raised_at: Utc::now(),
        }
    }
}

/// Receiver of escalations
pub trait EscalationSink: Send + Sync {
    fn notify(&self, payload: EscalationPayload);
}

/// Sink that writes escalations to the log
pub struct LoggingSink;

impl EscalationSink for LoggingSink {
    fn notify(&self, payload: EscalationPayload) {
        tracing::error!(
            severity = %payload.severity,
            notify = ?payload.notify,
            "Escalation: {} ({})",
            payload.message,
            payload.context
        );
    }
}

/// Sink that keeps every payload in memory
#[derive(Default)]
pub struct CollectingSink {
    received: Mutex<Vec<EscalationPayload>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<EscalationPayload> {
        self.received.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }
}

impl EscalationSink for CollectingSink {
    fn notify(&self, payload: EscalationPayload) {
        self.received.lock().push(payload);
    }
}

/// Sink that fans out to several sinks
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn EscalationSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EscalationSink>) {
        self.sinks.push(sink);
    }

    pub fn with_sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EscalationSink for CompositeSink {
    fn notify(&self, payload: EscalationPayload) {
        for sink in &self.sinks {
            sink.notify(payload.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(CollectingSink::new());
        let b = Arc::new(CollectingSink::new());
        let composite = CompositeSink::new()
            .with_sink(a.clone())
            .with_sink(b.clone())
            .with_sink(Arc::new(LoggingSink));

        composite.notify(EscalationPayload::new(
            Severity::S2,
            vec!["oncall".into()],
            "precondition failed",
            json!({"step_id": "ingest"}),
        ));

        assert_eq!(a.len(), 1);
        assert_eq!(b.received()[0].severity, Severity::S2);
    }
}
