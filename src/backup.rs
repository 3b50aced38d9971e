//! Phase 2: snapshot every live file the upgrade is about to overwrite.
//!
//! The backup tree starts empty every time — stale entries from an
//! earlier attempt would make rollback restore the wrong firmware.

use crate::config::UpgradeConfig;
use crate::error::PhaseError;
use crate::fsops;
use crate::logger::UpgradeLogger;
use crate::sandbox;
use crate::scan;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct BackupReport {
    /// Files copied into the backup tree.
    pub backed_up: usize,
    pub bytes: u64,
    /// Staged paths with no live counterpart: first-time installs.
    pub new_files: Vec<PathBuf>,
    /// Backup entries with no staged counterpart. Should never happen
    /// right after a wipe; reported, not fatal.
    pub anomalies: Vec<PathBuf>,
}

pub fn run_backup(
    cfg: &UpgradeConfig,
    logger: &dyn UpgradeLogger,
    progress: &mut dyn FnMut(&str),
) -> Result<BackupReport, PhaseError> {
    let staging_root = cfg.staging_root();
    let backup_root = cfg.backup_root();
    let mut report = BackupReport::default();

    logger.phase("backup", "wiping stale backup contents");
    std::fs::create_dir_all(&backup_root)
        .map_err(|e| PhaseError::io(format!("mkdir {}", backup_root.display()), e))?;
    fsops::clear_dir_contents(&backup_root)?;

    let staged = scan::relative_file_set(&staging_root).map_err(|e| {
        PhaseError::io(
            format!("scan {}", staging_root.display()),
            std::io::Error::other(e.to_string()),
        )
    })?;

    for rel in &staged {
        sandbox::check_allow_list(rel, &cfg.allowed_roots)?;
        let live = cfg.device_root.join(rel);
        if !live.is_file() {
            continue;
        }
        let dest = backup_root.join(rel);
        let bytes = fsops::copy_file(&live, &dest)?;
        logger.file_op("backup", &live, bytes);
        progress(&format!("BACKUP_FILE:{}:{}", rel.display(), bytes));
        report.backed_up += 1;
        report.bytes += bytes;
    }

    // Diff the trees: staged-but-not-backed is the expected new-file
    // case, backed-but-not-staged is an anomaly worth reporting.
    let backed = scan::relative_file_set(&backup_root).map_err(|e| {
        PhaseError::io(
            format!("scan {}", backup_root.display()),
            std::io::Error::other(e.to_string()),
        )
    })?;
    for rel in staged.difference(&backed) {
        progress(&format!("BACKUP_NEW:{}", rel.display()));
        report.new_files.push(rel.clone());
    }
    for rel in backed.difference(&staged) {
        logger.error("backup", &format!("anomalous backup entry {}", rel.display()));
        progress(&format!("BACKUP_ANOMALY:{}", rel.display()));
        report.anomalies.push(rel.clone());
    }

    logger.phase(
        "backup",
        &format!(
            "done backed_up={} new={} anomalies={}",
            report.backed_up,
            report.new_files.len(),
            report.anomalies.len()
        ),
    );
    Ok(report)
}
