//! Operator progress trace.
//!
//! Trace lines are plain text with a fixed phrasing that operators search for.
//! They are separate from the structured `tracing` events the crate emits.
//!
//! Every planned mutation writes one line, so counts follow the plan. An
//! account that leaves the group and another whose Ilios user is disabled
//! each produce an `unassigning role:` line; scripts that expected a single
//! such line per run should count the `unenrolling:` lines instead, which
//! cover only removed enrolments. Each mutation line is written before the
//! roster call; a rejected call is followed by a `failed to ...` line, and
//! that account gets no further lines in the run.

use std::sync::Mutex;
use tracing::info;

/// Sink for progress trace lines, in order.
pub trait ProgressTrace: Send + Sync {
    fn line(&self, line: &str);
}

/// Forwards trace lines to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTrace;

impl ProgressTrace for TracingTrace {
    fn line(&self, line: &str) {
        info!(target: "ilios_sync::trace", "{line}");
    }
}

/// Keeps trace lines in memory.
#[derive(Debug, Default)]
pub struct BufferedTrace {
    lines: Mutex<Vec<String>>,
}

impl BufferedTrace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("lock poisoned").clone()
    }

    /// All lines joined with newlines.
    pub fn contents(&self) -> String {
        self.lines().join("\n")
    }

    /// Number of lines containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|l| l.contains(needle))
            .count()
    }
}

impl ProgressTrace for BufferedTrace {
    fn line(&self, line: &str) {
        self.lines
            .lock()
            .expect("lock poisoned")
            .push(line.to_string());
    }
}

impl<T: ProgressTrace + ?Sized> ProgressTrace for &T {
    fn line(&self, line: &str) {
        (**self).line(line);
    }
}
