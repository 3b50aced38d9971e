//! Memory governor for the chunk hot path.
//!
//! The board has very little headroom, so reclamation runs after every
//! chunk rather than periodically: session scratch is trimmed, and when
//! available memory drops under the floor any queued pipeline state is
//! shed down to its most recent entry. Outbound notifies are wrapped in a
//! bounded retry that only re-attempts the transport's transient
//! out-of-memory condition.

use crate::error::NotifyError;
use crate::notify::Notifier;
use crate::pipeline::ChunkProcessor;
use crate::protocol::timing;
use crate::session::UpgradeSession;
use std::time::Duration;
use sysinfo::System;

pub struct MemoryGovernor {
    sys: System,
    low_memory_bytes: u64,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl MemoryGovernor {
    pub fn new(low_memory_bytes: u64) -> Self {
        Self {
            sys: System::new(),
            low_memory_bytes,
            retry_attempts: timing::NOTIFY_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(timing::NOTIFY_RETRY_DELAY_MS),
        }
    }

    pub fn available_memory(&mut self) -> u64 {
        self.sys.refresh_memory();
        self.sys.available_memory()
    }

    /// Reclamation pass after one unit of chunk work.
    pub fn after_chunk(&mut self, session: &mut UpgradeSession, processor: &mut dyn ChunkProcessor) {
        session.trim_scratch();
        if self.available_memory() < self.low_memory_bytes {
            processor.shed();
        }
    }

    /// Send one line, retrying transient exhaustion with a short pause.
    /// Permanent failures are returned on the first attempt.
    pub fn notify(&mut self, notifier: &mut dyn Notifier, line: &str) -> Result<(), NotifyError> {
        let mut attempt = 0u32;
        loop {
            match notifier.notify(line) {
                Ok(()) => return Ok(()),
                Err(NotifyError::Transient(msg)) => {
                    attempt += 1;
                    if attempt >= self.retry_attempts {
                        return Err(NotifyError::Transient(msg));
                    }
                    std::thread::sleep(self.retry_delay);
                }
                Err(permanent) => return Err(permanent),
            }
        }
    }
}
