//! Per-session record of every tool call attempt.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Capability, ToolError, ToolErrorKind};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub capability: Capability,
    pub attempt: u32,
    pub elapsed_ms: u64,
    /// `None` on success.
    pub error: Option<ToolErrorKind>,
    pub at: DateTime<Utc>,
}

/// Cheaply cloneable, append-only attempt log.
#[derive(Debug, Clone, Default)]
pub struct AttemptLog {
    inner: Arc<Mutex<Vec<AttemptRecord>>>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, capability: Capability, attempt: u32, elapsed: Duration, error: Option<&ToolError>) {
        let record = AttemptRecord {
            capability,
            attempt,
            elapsed_ms: elapsed.as_millis() as u64,
            error: error.map(|e| e.kind),
            at: Utc::now(),
        };
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    pub fn snapshot(&self) -> Vec<AttemptRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|v| v.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self) -> usize {
        self.snapshot().iter().filter(|r| r.error.is_some()).count()
    }
}
