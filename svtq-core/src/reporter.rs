//! `Reporter` (§1 "terminal reporter, NDJSON event emission"). The pipeline only ever calls
//! through this trait; which sink is active is an outer-driver decision.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tracing::error;

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    SessionStart {
        total_chunks: usize,
        already_done: usize,
    },
    ChunkStarted {
        idx: usize,
    },
    ProbeScored {
        idx: usize,
        round: u32,
        crf: f64,
        score: f64,
    },
    ChunkCompleted {
        idx: usize,
        final_crf: f64,
        frames: usize,
        size_bytes: u64,
    },
    Error {
        title: &'a str,
        message: String,
        context: String,
        suggestion: &'a str,
    },
    SessionFinished {
        output: String,
    },
}

pub trait Reporter: Send + Sync {
    fn report(&self, event: Event<'_>);
}

/// Renders chunk lifecycle events as a single progress bar (§"terminal rendering").
pub struct TerminalReporter;

impl Reporter for TerminalReporter {
    fn report(&self, event: Event<'_>) {
        match event {
            Event::SessionStart {
                total_chunks,
                already_done,
            } => crate::progress::init(total_chunks as u64, already_done as u64),
            Event::ChunkCompleted { .. } => crate::progress::inc(1),
            Event::Error {
                title,
                message,
                context,
                suggestion,
            } => {
                crate::progress::suspend(|| {
                    error!(%title, %message, %context, %suggestion, "fatal error");
                });
            }
            Event::SessionFinished { .. } => crate::progress::finish(),
            Event::ChunkStarted { .. } | Event::ProbeScored { .. } => {}
        }
    }
}

/// Emits one JSON object per line to `writer` (§"NDJSON event emission"), for machine
/// consumers driving a GUI or CI dashboard.
pub struct NdjsonReporter<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> NdjsonReporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> Reporter for NdjsonReporter<W> {
    fn report(&self, event: Event<'_>) {
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        let mut w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(w, "{line}");
    }
}

/// Builds the `Event::Error` payload for a fatal `PipelineError` (§7 "title, message, one-line
/// context, one-line suggestion").
pub fn error_event(err: &PipelineError, context: &str) -> Event<'static> {
    let (title, suggestion): (&str, &str) = match err {
        PipelineError::InvalidInput(_) => ("invalid input", "check the input path and CLI flags"),
        PipelineError::ToolFailure(_) => (
            "external tool failed",
            "inspect the captured stderr tail and retry",
        ),
        PipelineError::Io(_) => ("I/O failure", "check disk space and permissions on the work directory"),
        PipelineError::Pipeline(_) => ("pipeline failure", "re-run; the resume store will skip completed chunks"),
        PipelineError::Cancelled => ("cancelled", "re-run to resume from the last completed chunk"),
        PipelineError::Logical(_) => ("internal error", "this indicates a bug; please report it"),
    };
    Event::Error {
        title,
        message: err.to_string(),
        context: context.to_string(),
        suggestion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_reporter_writes_one_line_per_event() {
        let buf: Vec<u8> = Vec::new();
        let reporter = NdjsonReporter::new(buf);
        reporter.report(Event::ChunkStarted { idx: 0 });
        reporter.report(Event::ChunkCompleted {
            idx: 0,
            final_crf: 24.0,
            frames: 250,
            size_bytes: 1000,
        });
        let guard = reporter.writer.lock().unwrap();
        let text = String::from_utf8(guard.clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("chunk_started"));
        assert!(text.contains("chunk_completed"));
    }

    #[test]
    fn error_event_maps_cancellation_distinctly() {
        let event = error_event(&PipelineError::Cancelled, "during encode");
        match event {
            Event::Error { title, .. } => assert_eq!(title, "cancelled"),
            _ => panic!("expected an Error event"),
        }
    }
}
