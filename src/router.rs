//! Command parsing and dispatch.
//!
//! Commands are `UPGRADE:OP[:arg]...`, case-sensitive. Each handler runs
//! to completion before the next command is read; there is no pipelining.
//! Unexpected failures at this level never take the process down: they
//! become an `*_ERROR` response plus an emergency cleanup that releases
//! the open handle and leaves staging/backup on disk as evidence.

use crate::apply;
use crate::backup;
use crate::cleanup::{self, DeviceReset, HardReset};
use crate::config::UpgradeConfig;
use crate::fsops;
use crate::logger::UpgradeLogger;
use crate::memory::MemoryGovernor;
use crate::notify::Notifier;
use crate::pipeline::{ChunkProcessor, SyncProcessor};
use crate::protocol::{cmd, resp, timing, NAMESPACE};
use crate::rollback;
use crate::scan;
use crate::session::{Phase, UpgradeSession, UpgradeState};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

pub struct CommandRouter {
    cfg: UpgradeConfig,
    session: Option<UpgradeSession>,
    governor: MemoryGovernor,
    processor: Box<dyn ChunkProcessor>,
    logger: Arc<dyn UpgradeLogger>,
    reset: Box<dyn DeviceReset>,
}

impl CommandRouter {
    /// Production wiring: synchronous chunk processing (see `pipeline`
    /// for why the threaded strategy stays off the hot path) and a real
    /// hard reset.
    pub fn new(cfg: UpgradeConfig, logger: Arc<dyn UpgradeLogger>) -> Self {
        Self::with_parts(cfg, logger, Box::new(SyncProcessor), Box::new(HardReset))
    }

    /// Full wiring control, used by tests and by any future strategy
    /// switch.
    pub fn with_parts(
        cfg: UpgradeConfig,
        logger: Arc<dyn UpgradeLogger>,
        processor: Box<dyn ChunkProcessor>,
        reset: Box<dyn DeviceReset>,
    ) -> Self {
        let low = cfg.low_memory_bytes;
        Self {
            cfg,
            session: None,
            governor: MemoryGovernor::new(low),
            processor,
            logger,
            reset,
        }
    }

    pub fn state_label(&self) -> String {
        match &self.session {
            Some(s) => s.state().to_string(),
            None => UpgradeState::Idle.to_string(),
        }
    }

    /// Handle one decoded command string, emitting responses through
    /// `notifier`.
    pub fn handle(&mut self, line: &str, notifier: &mut dyn Notifier) {
        let line = line.trim();
        let Some((namespace, rest)) = line.split_once(':') else {
            self.send(notifier, &format!("{}:MALFORMED", resp::UPGRADE_ERROR));
            return;
        };
        if namespace != NAMESPACE {
            self.send(
                notifier,
                &format!("{}:UNKNOWN_NAMESPACE:{namespace}", resp::UPGRADE_ERROR),
            );
            return;
        }

        let (op, args) = match rest.split_once(':') {
            Some((op, args)) => (op, Some(args)),
            None => (rest, None),
        };
        self.logger.command(op);

        let result = self.dispatch(op, args, notifier);
        if let Err(e) = result {
            self.logger.error("dispatch", &e.to_string());
            self.emergency_cleanup();
            self.send(
                notifier,
                &format!("{}:INTERNAL:{e}", resp::UPGRADE_ERROR),
            );
        }
    }

    fn dispatch(&mut self, op: &str, args: Option<&str>, notifier: &mut dyn Notifier) -> Result<()> {
        match op {
            cmd::START => self.handle_start(notifier),
            cmd::FILE_START => self.handle_file_start(args, notifier),
            cmd::FILE_DATA => self.handle_file_data(args, notifier),
            cmd::FILE_END => self.handle_file_end(args, notifier),
            cmd::COMMIT => self.handle_commit(notifier),
            cmd::STEP2_BACKUP => self.handle_step2(notifier),
            cmd::STEP3_APPLY => self.handle_step3(notifier),
            cmd::STEP4_CLEANUP => self.handle_step4(notifier),
            cmd::ABORT => self.handle_abort(notifier),
            cmd::ROLLBACK => self.handle_rollback(notifier),
            cmd::STATUS => self.handle_status(notifier),
            cmd::VERSION => {
                let version = self.cfg.firmware_version.clone();
                self.send(
                    notifier,
                    &format!("{}:{version}", resp::FIRMWARE_VERSION),
                );
                Ok(())
            }
            unknown => {
                self.send(
                    notifier,
                    &format!("{}:UNKNOWN_COMMAND:{unknown}", resp::UPGRADE_ERROR),
                );
                Ok(())
            }
        }
    }

    fn handle_start(&mut self, notifier: &mut dyn Notifier) -> Result<()> {
        self.session = Some(UpgradeSession::new());
        self.send(notifier, resp::UPGRADE_MODE_READY);
        Ok(())
    }

    fn handle_file_start(&mut self, args: Option<&str>, notifier: &mut dyn Notifier) -> Result<()> {
        let Some(args) = args else {
            self.send(
                notifier,
                &format!("{}:MISSING_ARGS", resp::FILE_START_ERROR),
            );
            return Ok(());
        };
        // Size is the final field; everything before it is the path.
        let Some((path, size_str)) = args.rsplit_once(':') else {
            self.send(
                notifier,
                &format!("{}:MISSING_SIZE:{args}", resp::FILE_START_ERROR),
            );
            return Ok(());
        };
        let Ok(size) = size_str.parse::<u64>() else {
            self.send(
                notifier,
                &format!("{}:BAD_SIZE:{size_str}", resp::FILE_START_ERROR),
            );
            return Ok(());
        };

        let Some(session) = self.session.as_mut() else {
            self.send(
                notifier,
                &format!("{}:NOT_IN_UPGRADE_MODE", resp::FILE_START_ERROR),
            );
            return Ok(());
        };

        let cfg = self.cfg.clone();
        match session.start_file(&cfg, path, size) {
            Ok(()) => {
                self.send(
                    notifier,
                    &format!("{}:{path}:{size}", resp::FILE_START_OK),
                );
            }
            Err(e) => {
                self.logger.error("file_start", &e.to_string());
                self.send(
                    notifier,
                    &format!("{}:{path}:{e}", resp::FILE_START_ERROR),
                );
            }
        }
        Ok(())
    }

    fn handle_file_data(&mut self, args: Option<&str>, notifier: &mut dyn Notifier) -> Result<()> {
        let payload = args.unwrap_or("");
        let Some(session) = self.session.as_mut() else {
            self.send(
                notifier,
                &format!("{}:0:ERROR:NOT_IN_UPGRADE_MODE", resp::CHUNK_ACK),
            );
            return Ok(());
        };

        let ack = match self.processor.process(session, payload) {
            Ok(out) if out.duplicate => {
                self.logger.chunk(out.index, 0, true);
                format!("{}:{}:DUPLICATE", resp::CHUNK_ACK, out.index)
            }
            Ok(out) => {
                self.logger.chunk(out.index, out.written, true);
                format!("{}:{}:OK:{}", resp::CHUNK_ACK, out.index, out.written)
            }
            Err(e) => {
                // NACK; the session stays open so the sender can resend
                // this logical chunk.
                let index = session.next_chunk_index();
                self.logger.chunk(index, 0, false);
                format!("{}:{index}:ERROR:{e}", resp::CHUNK_ACK)
            }
        };

        // One reclamation pass per chunk, deliberately not periodic.
        if let Some(session) = self.session.as_mut() {
            self.governor.after_chunk(session, self.processor.as_mut());
        }

        self.send(notifier, &ack);
        Ok(())
    }

    fn handle_file_end(&mut self, args: Option<&str>, notifier: &mut dyn Notifier) -> Result<()> {
        let Some(path) = args else {
            self.send(notifier, &format!("{}:MISSING_PATH", resp::FILE_END_ERROR));
            return Ok(());
        };
        let Some(session) = self.session.as_mut() else {
            self.send(
                notifier,
                &format!("{}:NOT_IN_UPGRADE_MODE", resp::FILE_END_ERROR),
            );
            return Ok(());
        };

        // Let a (non-default) background pipeline finish in-flight work
        // before sealing; bounded, never an open-ended poll.
        self.processor
            .drain(Duration::from_millis(timing::DRAIN_TIMEOUT_MS));

        match session.finish_file(path) {
            Ok(record) if record.sealed => {
                self.send(
                    notifier,
                    &format!("{}:{path}:{}", resp::FILE_END_OK, record.size),
                );
            }
            Ok(record) => {
                self.logger.error(
                    "file_end",
                    &format!(
                        "size mismatch {}: declared {} received {}",
                        path, record.declared, record.size
                    ),
                );
                self.send(
                    notifier,
                    &format!(
                        "{}:SIZE_MISMATCH:{path}:{}:{}",
                        resp::FILE_END_WARNING,
                        record.declared,
                        record.size
                    ),
                );
            }
            Err(e) => {
                self.send(notifier, &format!("{}:{path}:{e}", resp::FILE_END_ERROR));
            }
        }
        Ok(())
    }

    fn handle_commit(&mut self, notifier: &mut dyn Notifier) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            self.send(
                notifier,
                &format!("{}:NOT_IN_UPGRADE_MODE", resp::COMMIT_ERROR),
            );
            return Ok(());
        };
        let transfer_open = session.has_open_file();
        let unsealed: Vec<String> = session
            .unsealed()
            .iter()
            .map(|r| format!("{}:{}:{}", r.rel_path, r.declared, r.size))
            .collect();

        if transfer_open {
            self.send(
                notifier,
                &format!("{}:TRANSFER_IN_PROGRESS", resp::COMMIT_ERROR),
            );
            return Ok(());
        }
        if let Some(first) = unsealed.first() {
            let detail = format!("{}:SIZE_MISMATCH:{first}", resp::COMMIT_ERROR);
            self.send(notifier, &detail);
            return Ok(());
        }

        let cfg = self.cfg.clone();
        let logger = Arc::clone(&self.logger);

        self.set_session_state(UpgradeState::Committing(Phase::Backup));
        let backup_result = {
            let governor = &mut self.governor;
            let mut progress = |l: &str| {
                let _ = governor.notify(notifier, l);
            };
            backup::run_backup(&cfg, logger.as_ref(), &mut progress)
        };
        if let Err(e) = backup_result {
            return self.commit_failed(notifier, "BACKUP", &e.to_string());
        }

        self.set_session_state(UpgradeState::Committing(Phase::Apply));
        let apply_result = {
            let governor = &mut self.governor;
            let mut progress = |l: &str| {
                let _ = governor.notify(notifier, l);
            };
            apply::run_apply(&cfg, logger.as_ref(), &mut progress)
        };
        if let Err(e) = apply_result {
            return self.commit_failed(notifier, "APPLY", &e.to_string());
        }

        self.set_session_state(UpgradeState::Committing(Phase::Cleanup));
        let cleanup_result = {
            let governor = &mut self.governor;
            let mut progress = |l: &str| {
                let _ = governor.notify(notifier, l);
            };
            cleanup::run_cleanup(&cfg, logger.as_ref(), &mut progress)
        };
        if let Err(e) = cleanup_result {
            return self.commit_failed(notifier, "CLEANUP", &e.to_string());
        }

        self.session = None;
        self.send(notifier, resp::COMMIT_SUCCESS);
        self.schedule_reset();
        Ok(())
    }

    /// Fail-fast path for COMMIT: skip remaining phases, try a rollback,
    /// report.
    fn commit_failed(
        &mut self,
        notifier: &mut dyn Notifier,
        phase: &str,
        detail: &str,
    ) -> Result<()> {
        self.logger
            .error("commit", &format!("{phase} failed: {detail}"));

        let cfg = self.cfg.clone();
        let logger = Arc::clone(&self.logger);
        let rollback_result = {
            let governor = &mut self.governor;
            let mut progress = |l: &str| {
                let _ = governor.notify(notifier, l);
            };
            rollback::run_rollback(&cfg, logger.as_ref(), &mut progress)
        };
        if let Err(e) = rollback_result {
            self.logger
                .error("commit", &format!("best-effort rollback failed: {e}"));
        }

        self.session = None;
        self.send(
            notifier,
            &format!("{}:{phase}:{detail}", resp::COMMIT_ERROR),
        );
        Ok(())
    }

    fn handle_step2(&mut self, notifier: &mut dyn Notifier) -> Result<()> {
        let cfg = self.cfg.clone();
        let logger = Arc::clone(&self.logger);
        let result = {
            let governor = &mut self.governor;
            let mut progress = |l: &str| {
                let _ = governor.notify(notifier, l);
            };
            backup::run_backup(&cfg, logger.as_ref(), &mut progress)
        };
        match result {
            Ok(report) => self.send(
                notifier,
                &format!("{}:{}", resp::STEP2_SUCCESS, report.backed_up),
            ),
            Err(e) => self.send(notifier, &format!("{}:{e}", resp::STEP2_ERROR)),
        }
        Ok(())
    }

    fn handle_step3(&mut self, notifier: &mut dyn Notifier) -> Result<()> {
        let cfg = self.cfg.clone();
        let logger = Arc::clone(&self.logger);
        let result = {
            let governor = &mut self.governor;
            let mut progress = |l: &str| {
                let _ = governor.notify(notifier, l);
            };
            apply::run_apply(&cfg, logger.as_ref(), &mut progress)
        };
        match result {
            Ok(report) => self.send(
                notifier,
                &format!("{}:{}", resp::STEP3_SUCCESS, report.installed),
            ),
            Err(e) => self.send(notifier, &format!("{}:{e}", resp::STEP3_ERROR)),
        }
        Ok(())
    }

    fn handle_step4(&mut self, notifier: &mut dyn Notifier) -> Result<()> {
        let cfg = self.cfg.clone();
        let logger = Arc::clone(&self.logger);
        let result = {
            let governor = &mut self.governor;
            let mut progress = |l: &str| {
                let _ = governor.notify(notifier, l);
            };
            cleanup::run_cleanup(&cfg, logger.as_ref(), &mut progress)
        };
        match result {
            Ok(report) => {
                self.session = None;
                self.send(
                    notifier,
                    &format!("{}:{}", resp::STEP4_SUCCESS, report.files_removed),
                );
                self.schedule_reset();
            }
            Err(e) => self.send(notifier, &format!("{}:{e}", resp::STEP4_ERROR)),
        }
        Ok(())
    }

    fn handle_abort(&mut self, notifier: &mut dyn Notifier) -> Result<()> {
        if let Some(session) = self.session.as_mut() {
            session.abort();
        }
        self.session = None;
        if let Err(e) = fsops::remove_tree(&self.cfg.staging_root()) {
            self.logger.error("abort", &e.to_string());
        }
        self.send(notifier, resp::UPGRADE_ABORTED);
        Ok(())
    }

    fn handle_rollback(&mut self, notifier: &mut dyn Notifier) -> Result<()> {
        self.set_session_state(UpgradeState::RollingBack);
        let cfg = self.cfg.clone();
        let logger = Arc::clone(&self.logger);
        let result = {
            let governor = &mut self.governor;
            let mut progress = |l: &str| {
                let _ = governor.notify(notifier, l);
            };
            rollback::run_rollback(&cfg, logger.as_ref(), &mut progress)
        };
        self.session = None;
        match result {
            Ok(out) if out.threshold_met => {
                self.send(
                    notifier,
                    &format!(
                        "{}:{}:{}",
                        resp::ROLLBACK_SUCCESS,
                        out.restored,
                        out.attempted
                    ),
                );
                self.schedule_reset();
            }
            Ok(out) => {
                self.send(
                    notifier,
                    &format!(
                        "{}:{}:{}:BACKUP_PRESERVED",
                        resp::ROLLBACK_PARTIAL,
                        out.restored,
                        out.attempted
                    ),
                );
            }
            Err(e) => {
                self.send(notifier, &format!("{}:{e}", resp::ROLLBACK_ERROR));
            }
        }
        Ok(())
    }

    fn handle_status(&mut self, notifier: &mut dyn Notifier) -> Result<()> {
        let staged = scan::relative_file_set(&self.cfg.staging_root())?;
        let backed = scan::relative_file_set(&self.cfg.backup_root())?;

        let join = |set: &std::collections::BTreeSet<std::path::PathBuf>| {
            set.iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let temp_line = format!("{}:{}:{}", resp::TEMP_FILES, staged.len(), join(&staged));
        let backup_line = format!("{}:{}:{}", resp::BACKUP_FILES, backed.len(), join(&backed));
        self.send(notifier, &temp_line);
        self.send(notifier, &backup_line);

        let mode_line = format!("{}:{}", resp::MODE, self.state_label());
        self.send(notifier, &mode_line);

        let free = self.governor.available_memory();
        self.send(notifier, &format!("{}:{free}", resp::FREE_MEMORY));

        let pending_new = staged.difference(&backed).count();
        let pending_overwrite = staged.intersection(&backed).count();
        self.send(
            notifier,
            &format!(
                "{}:NEW:{pending_new}:OVERWRITE:{pending_overwrite}",
                resp::STATUS_ANALYSIS
            ),
        );
        Ok(())
    }

    /// Last-resort recovery: release the open handle and leave upgrade
    /// mode. Staging and backup stay on disk for inspection.
    fn emergency_cleanup(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.abort();
        }
        self.session = None;
    }

    fn set_session_state(&mut self, state: UpgradeState) {
        if let Some(session) = self.session.as_mut() {
            session.set_state(state);
        }
    }

    fn schedule_reset(&mut self) {
        self.logger.reset_scheduled(timing::RESET_DELAY_MS);
        self.reset
            .restart(Duration::from_millis(timing::RESET_DELAY_MS));
    }

    fn send(&mut self, notifier: &mut dyn Notifier, line: &str) {
        if let Err(e) = self.governor.notify(notifier, line) {
            self.logger.error("notify", &e.to_string());
        }
    }
}
