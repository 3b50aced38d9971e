//! Chunk-processing strategies.
//!
//! [`SyncProcessor`] is the default: decode + write + ack runs to
//! completion inside the command handler, which is the only arrangement
//! that has survived sustained high-rate chunk streams on the board.
//!
//! [`ThreadedProcessor`] moves decoding onto a worker thread coordinated
//! through a lock-protected queue with a stop flag and a bounded
//! wait-for-exit, the same shape the melody and camera subsystems use for
//! their single-slot handoffs. It is kept as a swappable strategy but is
//! NOT validated for the chunk hot path: under load the original queued
//! design overflowed the runtime's interrupt-servicing work queue and
//! crashed the device. Validate under comparable transport backpressure
//! before wiring it in.

use crate::error::{DecodeError, SessionError};
use crate::protocol::timing;
use crate::session::{ChunkOutcome, UpgradeSession};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait ChunkProcessor: Send {
    /// Process one encoded payload against the session, returning the ack
    /// outcome for the chunk.
    fn process(
        &mut self,
        session: &mut UpgradeSession,
        payload: &str,
    ) -> Result<ChunkOutcome, SessionError>;

    /// Wait until queued work is finished. Returns false on timeout.
    fn drain(&mut self, timeout: Duration) -> bool;

    /// Under memory pressure: drop all queued state except the most
    /// recent entry.
    fn shed(&mut self);

    fn shutdown(&mut self);
}

/// Default strategy: everything inline, nothing queued.
pub struct SyncProcessor;

impl ChunkProcessor for SyncProcessor {
    fn process(
        &mut self,
        session: &mut UpgradeSession,
        payload: &str,
    ) -> Result<ChunkOutcome, SessionError> {
        session.receive_chunk(payload)
    }

    fn drain(&mut self, _timeout: Duration) -> bool {
        true
    }

    fn shed(&mut self) {}

    fn shutdown(&mut self) {}
}

struct PipeState {
    queue: VecDeque<String>,
    results: VecDeque<Result<Vec<u8>, DecodeError>>,
    busy: bool,
    stop: bool,
    finished: bool,
}

struct Shared {
    state: Mutex<PipeState>,
    work_cv: Condvar,
    done_cv: Condvar,
}

/// Background-decode strategy. Payloads queue to a worker that performs
/// the base64 repair/decode; the command thread waits (condvar with
/// deadline, no sleep polling) for the decoded bytes and applies them to
/// the session in order.
pub struct ThreadedProcessor {
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl ThreadedProcessor {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                results: VecDeque::new(),
                busy: false,
                stop: false,
                finished: false,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("chunk-decode".into())
            .spawn(move || Self::worker_loop(worker_shared))
            .ok();

        Self { shared, worker }
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            let payload = {
                let mut state = shared.state.lock();
                while state.queue.is_empty() && !state.stop {
                    shared.work_cv.wait(&mut state);
                }
                if state.stop {
                    state.finished = true;
                    shared.done_cv.notify_all();
                    return;
                }
                state.busy = true;
                state.queue.pop_front().unwrap()
            };

            let decoded = crate::decode::decode_chunk(&payload);

            let mut state = shared.state.lock();
            state.results.push_back(decoded);
            state.busy = false;
            shared.done_cv.notify_all();
        }
    }

    fn wait_result(&self, timeout: Duration) -> Option<Result<Vec<u8>, DecodeError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.results.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self
                .shared
                .done_cv
                .wait_for(&mut state, deadline - now)
                .timed_out()
                && state.results.is_empty()
            {
                return None;
            }
        }
        state.results.pop_front()
    }
}

impl Default for ThreadedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkProcessor for ThreadedProcessor {
    fn process(
        &mut self,
        session: &mut UpgradeSession,
        payload: &str,
    ) -> Result<ChunkOutcome, SessionError> {
        {
            let mut state = self.shared.state.lock();
            state.queue.push_back(payload.to_string());
            self.shared.work_cv.notify_one();
        }

        let timeout = Duration::from_millis(timing::DRAIN_TIMEOUT_MS);
        match self.wait_result(timeout) {
            Some(Ok(bytes)) => session.append_decoded(&bytes),
            Some(Err(e)) => Err(SessionError::Decode(e)),
            None => Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "background decode did not complete in time",
            ))),
        }
    }

    fn drain(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.busy {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.shared.done_cv.wait_for(&mut state, deadline - now);
        }
        true
    }

    fn shed(&mut self) {
        let mut state = self.shared.state.lock();
        while state.queue.len() > 1 {
            state.queue.pop_front();
        }
    }

    fn shutdown(&mut self) {
        if self.worker.is_none() {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.work_cv.notify_all();
        }
        // Bounded wait for the worker to acknowledge the stop flag, then
        // reap it. If it never acknowledges, leave it detached rather
        // than block teardown.
        let deadline = Instant::now() + Duration::from_millis(timing::DRAIN_TIMEOUT_MS);
        let acknowledged = {
            let mut state = self.shared.state.lock();
            loop {
                if state.finished {
                    break true;
                }
                let now = Instant::now();
                if now >= deadline {
                    break false;
                }
                self.shared.done_cv.wait_for(&mut state, deadline - now);
            }
        };
        if acknowledged {
            if let Some(handle) = self.worker.take() {
                handle.join().ok();
            }
        } else {
            self.worker.take();
        }
    }
}

impl Drop for ThreadedProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpgradeConfig;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[test]
    fn threaded_strategy_produces_same_file_as_sync() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = UpgradeConfig::for_root(dir.path());
        let data = b"threaded decode parity check";

        let mut session = UpgradeSession::new();
        session.start_file(&cfg, "t.bin", data.len() as u64).unwrap();

        let mut processor = ThreadedProcessor::new();
        for part in data.chunks(10) {
            let out = processor
                .process(&mut session, &STANDARD.encode(part))
                .unwrap();
            assert!(!out.duplicate);
        }
        assert!(processor.drain(Duration::from_millis(500)));
        processor.shutdown();

        let record = session.finish_file("t.bin").unwrap();
        assert!(record.sealed);
        assert_eq!(std::fs::read(&record.staging_path).unwrap(), data);
    }

    #[test]
    fn threaded_strategy_reports_decode_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = UpgradeConfig::for_root(dir.path());
        let mut session = UpgradeSession::new();
        session.start_file(&cfg, "bad.bin", 8).unwrap();

        let mut processor = ThreadedProcessor::new();
        let result = processor.process(&mut session, "not*base64");
        assert!(matches!(result, Err(SessionError::Decode(_))));
        processor.shutdown();
    }

    #[test]
    fn shed_keeps_only_most_recent_entry() {
        let shared = Arc::new(Shared {
            state: Mutex::new(PipeState {
                queue: VecDeque::from(vec!["a".into(), "b".into(), "c".into()]),
                results: VecDeque::new(),
                busy: false,
                stop: false,
                finished: false,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });
        let mut processor = ThreadedProcessor {
            shared,
            worker: None,
        };
        processor.shed();
        let state = processor.shared.state.lock();
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue.front().map(String::as_str), Some("c"));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut processor = ThreadedProcessor::new();
        processor.shutdown();
        processor.shutdown();
    }
}
