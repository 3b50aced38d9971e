//! The notify/send primitive borrowed from the transport collaborator.
//!
//! Everything the upgrade core says — acks, progress, phase results —
//! leaves through a [`Notifier`]. The transport owns delivery; the core
//! only distinguishes transient exhaustion (retryable, see the memory
//! governor) from permanent channel failure.

use crate::error::NotifyError;

pub trait Notifier {
    fn notify(&mut self, line: &str) -> Result<(), NotifyError>;
}

/// Collects notifications in memory. Used by tests and by the one-shot
/// diagnostic paths that only need the text afterwards.
#[derive(Debug, Default)]
pub struct VecNotifier {
    pub lines: Vec<String>,
}

impl VecNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Notifier for VecNotifier {
    fn notify(&mut self, line: &str) -> Result<(), NotifyError> {
        self.lines.push(line.to_string());
        Ok(())
    }
}
