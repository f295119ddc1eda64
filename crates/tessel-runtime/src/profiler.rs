//! Chrome-trace profiling of session activity.

use crate::error::{Result, RuntimeError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// One complete ("X" phase) trace event.
#[derive(Debug, Serialize)]
struct TraceEvent {
    cat: &'static str,
    name: String,
    ph: &'static str,
    ts: u64,
    dur: u64,
    pid: u32,
    tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<NodeArgs>,
}

#[derive(Debug, Serialize)]
struct NodeArgs {
    op_name: String,
    provider: String,
}

/// Collects events for one session until [`finish`](Profiler::finish).
#[derive(Debug)]
pub(crate) struct Profiler {
    path: PathBuf,
    origin: Instant,
    events: Vec<TraceEvent>,
}

impl Profiler {
    /// Start profiling; the artifact will be `{prefix}_{timestamp}.json`.
    pub(crate) fn start(prefix: &Path) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let path = PathBuf::from(format!("{}_{}.json", prefix.display(), stamp));
        Self {
            path,
            origin: Instant::now(),
            events: Vec::new(),
        }
    }

    /// Record a session-level phase such as initialization or a run.
    pub(crate) fn record_session(&mut self, name: &str, start: Instant, duration: Duration) {
        self.events.push(TraceEvent {
            cat: "Session",
            name: name.to_string(),
            ph: "X",
            ts: self.micros_since_origin(start),
            dur: duration.as_micros() as u64,
            pid: std::process::id(),
            tid: 0,
            args: None,
        });
    }

    /// Record one node execution.
    pub(crate) fn record_node(
        &mut self,
        node: &str,
        op_type: &str,
        provider: &str,
        start: Instant,
        duration: Duration,
    ) {
        self.events.push(TraceEvent {
            cat: "Node",
            name: format!("{}_kernel_time", node),
            ph: "X",
            ts: self.micros_since_origin(start),
            dur: duration.as_micros() as u64,
            pid: std::process::id(),
            tid: 0,
            args: Some(NodeArgs {
                op_name: op_type.to_string(),
                provider: provider.to_string(),
            }),
        });
    }

    /// Write the trace and return its path.
    pub(crate) fn finish(self) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(&self.events)
            .map_err(|e| RuntimeError::Profiling(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        tracing::debug!(path = %self.path.display(), events = self.events.len(), "wrote profile");
        Ok(self.path)
    }

    fn micros_since_origin(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_micros() as u64
    }
}
