//! Phase 4: tear down the staging tree and restart the device.
//!
//! Files go first, then directories deepest-first, then the staging root
//! itself. Entries that vanished in the meantime are tolerated. On a
//! successful cleanup the caller schedules the hard reset: there is no
//! graceful shutdown, the running firmware ends by restart.

use crate::config::UpgradeConfig;
use crate::error::PhaseError;
use crate::fsops;
use crate::logger::UpgradeLogger;
use crate::scan::{scan_tree, EntryKind};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub files_removed: u64,
    pub dirs_removed: u64,
}

pub fn run_cleanup(
    cfg: &UpgradeConfig,
    logger: &dyn UpgradeLogger,
    progress: &mut dyn FnMut(&str),
) -> Result<CleanupReport, PhaseError> {
    let staging_root = cfg.staging_root();
    let mut report = CleanupReport::default();
    if !staging_root.exists() {
        return Ok(report);
    }

    let entries = scan_tree(&staging_root).map_err(|e| {
        PhaseError::io(
            format!("scan {}", staging_root.display()),
            std::io::Error::other(e.to_string()),
        )
    })?;

    let mut dirs = Vec::new();
    for entry in &entries {
        match entry.kind {
            EntryKind::File => {
                if fsops::remove_file_tolerant(&entry.path)? {
                    report.files_removed += 1;
                    if let Ok(rel) = entry.path.strip_prefix(&staging_root) {
                        progress(&format!("CLEANUP_FILE:{}", rel.display()));
                    }
                }
            }
            EntryKind::Dir => dirs.push(entry.path.clone()),
        }
    }

    // Sorted order lists parents before children; walking it backwards
    // removes the deepest directory first.
    dirs.sort();
    for dir in dirs.iter().rev() {
        match std::fs::remove_dir(dir) {
            Ok(()) => report.dirs_removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PhaseError::io(format!("rmdir {}", dir.display()), e)),
        }
    }

    match std::fs::remove_dir(&staging_root) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(PhaseError::io(format!("rmdir {}", staging_root.display()), e)),
    }

    logger.phase(
        "cleanup",
        &format!(
            "done files={} dirs={}",
            report.files_removed, report.dirs_removed
        ),
    );
    Ok(report)
}

/// Full device reset. The production implementation has no teardown to
/// run; it waits out the fixed delay so the final notification can leave
/// the transport, then hard-exits.
pub trait DeviceReset {
    fn restart(&self, delay: Duration);
}

pub struct HardReset;

impl DeviceReset for HardReset {
    fn restart(&self, delay: Duration) {
        std::thread::sleep(delay);
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::fs;

    #[test]
    fn staging_tree_is_fully_absent_afterwards() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = UpgradeConfig::for_root(dir.path());
        let staging = cfg.staging_root();
        fs::create_dir_all(staging.join("lib/a/b")).unwrap();
        fs::write(staging.join("main.py"), b"x").unwrap();
        fs::write(staging.join("lib/a/b/deep.py"), b"y").unwrap();

        let report = run_cleanup(&cfg, &NoopLogger, &mut |_| {}).unwrap();
        assert_eq!(report.files_removed, 2);
        assert_eq!(report.dirs_removed, 3);
        assert!(!staging.exists());
    }

    #[test]
    fn missing_staging_root_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = UpgradeConfig::for_root(dir.path());
        let report = run_cleanup(&cfg, &NoopLogger, &mut |_| {}).unwrap();
        assert_eq!(report.files_removed, 0);
    }
}
