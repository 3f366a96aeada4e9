//! Telemetry (C11, §4.11): five append-only structured event writers plus
//! correlation-ID propagation (AS.6).

pub mod trace;
pub mod writer;

use std::path::Path;
use writer::{Envelope, EventWriter};

pub use trace::{Trace, TraceFrame};

pub struct Telemetry {
    decision: EventWriter,
    order: EventWriter,
    tracer: EventWriter,
    audit: EventWriter,
    health: EventWriter,
}

impl Telemetry {
    pub fn new(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            decision: EventWriter::new(dir.join("decision.jsonl"))?,
            order: EventWriter::new(dir.join("order.jsonl"))?,
            tracer: EventWriter::new(dir.join("tracer.jsonl"))?,
            audit: EventWriter::new(dir.join("audit.jsonl"))?,
            health: EventWriter::new(dir.join("health.jsonl"))?,
        })
    }

    pub fn decision(&self, component: &str, event: &str, message: impl Into<String>, fields: serde_json::Value) {
        self.decision.record(&Envelope::new(component, event, message, fields));
    }

    pub fn order(&self, component: &str, event: &str, message: impl Into<String>, fields: serde_json::Value) {
        self.order.record(&Envelope::new(component, event, message, fields));
    }

    pub fn tracer(&self, component: &str, event: &str, message: impl Into<String>, fields: serde_json::Value) {
        self.tracer.record(&Envelope::new(component, event, message, fields));
    }

    pub fn audit(&self, component: &str, event: &str, message: impl Into<String>, fields: serde_json::Value) {
        self.audit.record(&Envelope::new(component, event, message, fields));
    }

    pub fn health(&self, component: &str, event: &str, message: impl Into<String>, fields: serde_json::Value) {
        self.health.record(&Envelope::new(component, event, message, fields));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn telemetry_creates_all_five_writers() {
        let dir = tempdir().unwrap();
        let telemetry = Telemetry::new(dir.path()).unwrap();
        telemetry.decision("fsm", "phase_transition", "test", serde_json::json!({}));
        telemetry.health("engine", "heartbeat", "tick", serde_json::json!({"tick": 1}));
        for name in ["decision.jsonl", "order.jsonl", "tracer.jsonl", "audit.jsonl", "health.jsonl"] {
            assert!(dir.path().join(name).exists(), "{name} should be created eagerly");
        }
    }
}
