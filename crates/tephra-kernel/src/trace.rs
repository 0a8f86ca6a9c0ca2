//! Trace hook for the observability layer.
//!
//! Every wait, event fire, interrupt, kill, and schedule-until transition
//! may be reported to a listener for diagnostics or record-and-replay.
//! Emission never alters scheduling order.

use std::sync::{Arc, Mutex};

use tephra_types::TraceRecord;

/// Observer receiving kernel trace records.
pub trait TraceListener: Send {
    fn record(&mut self, record: &TraceRecord);
}

/// A trace listener that accumulates records behind a shared handle, so the
/// host (or a test) can inspect them after the run.
#[derive(Debug, Clone, Default)]
pub struct SharedTraceLog(Arc<Mutex<Vec<TraceRecord>>>);

impl SharedTraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records seen so far.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.0.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceListener for SharedTraceLog {
    fn record(&mut self, record: &TraceRecord) {
        if let Ok(mut records) = self.0.lock() {
            records.push(record.clone());
        }
    }
}
