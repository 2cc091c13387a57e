//! Structured error types for the pipeline.
//!
//! Every stage writes failures through [`ErrorSlot`] (see `pipeline_std`/`pipeline_tq`), which
//! implements the single-slot "first error wins" propagation policy. The orchestration layer
//! (the `svtq-cli` driver) wraps these in `anyhow::Context` for user-facing prose; this module
//! only carries the matchable, structured shape.

use std::fmt;
use std::process::ExitStatus;

use thiserror::Error;

/// Either a UTF-8 string or raw bytes, used to hold captured child-process output without
/// assuming it is valid UTF-8 (encoder stderr is not guaranteed to be).
pub enum StringOrBytes {
    String(String),
    Bytes(Vec<u8>),
}

impl fmt::Debug for StringOrBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => fmt::Debug::fmt(s, f),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => fmt::Debug::fmt(s, f),
                Err(_) => write!(f, "<{} bytes, not utf8>", b.len()),
            },
        }
    }
}

impl From<Vec<u8>> for StringOrBytes {
    fn from(b: Vec<u8>) -> Self {
        match String::from_utf8(b) {
            Ok(s) => Self::String(s),
            Err(e) => Self::Bytes(e.into_bytes()),
        }
    }
}

impl From<String> for StringOrBytes {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl fmt::Display for StringOrBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// Captures an external-tool failure (§7 "External tool failure"). The upstream pipe's stderr
/// is kept separate from the failing tool's own stderr because the tool is usually fed by a
/// chain of piped processes (decoder -> pixel-format pipe -> encoder) and a crash in any link
/// needs to stay distinguishable when read back by a human.
#[derive(Debug, Error)]
#[error("external tool exited with {exit_status}")]
pub struct ToolCrash {
    pub exit_status: ExitStatus,
    pub stdout: StringOrBytes,
    pub stderr: StringOrBytes,
    pub upstream_pipe_stderr: Option<StringOrBytes>,
}

/// The error kinds named in §7, collapsed into one enum so every stage can write into a single
/// `ErrorSlot<PipelineError>` regardless of which stage failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("external tool failed")]
    ToolFailure(#[from] ToolCrash),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline failure: {0}")]
    Pipeline(String),

    /// User-initiated cancellation. Kept distinct so the driver can suppress the noisy
    /// "fatal error" report for it (§7 "Cancellation").
    #[error("cancelled")]
    Cancelled,

    /// A logical impossibility: a bug, not a runtime condition. Fails fast rather than trying
    /// to recover (§7 "Logical impossibilities").
    #[error("logical impossibility: {0}")]
    Logical(String),
}

impl PipelineError {
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// One-shot, first-write-wins error slot shared across every pipeline stage (§5, §7).
pub struct ErrorSlot {
    inner: parking_lot::Mutex<Option<PipelineError>>,
}

impl Default for ErrorSlot {
    fn default() -> Self {
        Self {
            inner: parking_lot::Mutex::new(None),
        }
    }
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `err` only if the slot is still empty. Returns whether this call won the race.
    pub fn set(&self, err: PipelineError) -> bool {
        let mut guard = self.inner.lock();
        if guard.is_none() {
            *guard = Some(err);
            true
        } else {
            false
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn take(&self) -> Option<PipelineError> {
        self.inner.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let slot = ErrorSlot::new();
        assert!(slot.set(PipelineError::Logical("first".into())));
        assert!(!slot.set(PipelineError::Logical("second".into())));
        match slot.take() {
            Some(PipelineError::Logical(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
