//! Structured loader events.
//!
//! Every component appends to the owning context's log; nothing is written to
//! a process-wide sink. The orchestrator drains the log at teardown.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderEvent {
    pub seq: u64,
    pub trace_id: String,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: String,
    pub module_id: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoaderEventLog {
    trace_id: String,
    events: Vec<LoaderEvent>,
    next_seq: u64,
}

impl LoaderEventLog {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            events: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn allow(
        &mut self,
        component: &str,
        event: &str,
        module_id: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.push(component, event, "allow", "none", module_id, detail);
    }

    pub fn deny(
        &mut self,
        component: &str,
        event: &str,
        error_code: &str,
        module_id: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.push(component, event, "deny", error_code, module_id, detail);
    }

    pub fn push(
        &mut self,
        component: &str,
        event: &str,
        outcome: &str,
        error_code: &str,
        module_id: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.events.push(LoaderEvent {
            seq: self.next_seq,
            trace_id: self.trace_id.clone(),
            component: component.to_string(),
            event: event.to_string(),
            outcome: outcome.to_string(),
            error_code: error_code.to_string(),
            module_id: module_id.into(),
            detail: detail.into(),
        });
        self.next_seq = self.next_seq.saturating_add(1);
    }

    pub fn events(&self) -> &[LoaderEvent] {
        &self.events
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.iter().filter(|e| e.event == event).count()
    }

    pub fn into_events(self) -> Vec<LoaderEvent> {
        self.events
    }

    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut log = LoaderEventLog::new("trace-a");
        log.allow("module_loader", "module_execute", "/a.js", "executed");
        log.deny("module_resolver", "module_resolution", "FE-MODRES-0002", "x", "missing");
        let seqs: Vec<u64> = log.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(log.events()[1].outcome, "deny");
        assert_eq!(log.events()[1].trace_id, "trace-a");
    }

    #[test]
    fn json_lines_export_one_object_per_event() {
        let mut log = LoaderEventLog::new("t");
        log.allow("c", "e1", "m", "d");
        log.allow("c", "e2", "m", "d");
        let text = log.to_json_lines().expect("serialize");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let decoded: LoaderEvent = serde_json::from_str(lines[1]).expect("decode");
        assert_eq!(decoded.event, "e2");
        assert_eq!(log.count("e1"), 1);
    }
}
