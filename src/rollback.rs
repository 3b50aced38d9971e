//! Restore backed-up originals after a failed or regretted upgrade.
//!
//! Per-file failures do not abort the sweep; the outcome is judged by the
//! success ratio. At or above the threshold the backup has served its
//! purpose and is deleted; below it the backup tree is deliberately
//! preserved so an operator can retry or inspect by hand.

use crate::config::UpgradeConfig;
use crate::error::PhaseError;
use crate::fsops;
use crate::logger::UpgradeLogger;
use crate::scan;

#[derive(Debug, Default)]
pub struct RollbackOutcome {
    pub restored: usize,
    pub attempted: usize,
    pub threshold_met: bool,
    pub backup_removed: bool,
}

pub fn run_rollback(
    cfg: &UpgradeConfig,
    logger: &dyn UpgradeLogger,
    progress: &mut dyn FnMut(&str),
) -> Result<RollbackOutcome, PhaseError> {
    let backup_root = cfg.backup_root();
    let mut outcome = RollbackOutcome::default();

    let backed = scan::relative_file_set(&backup_root).map_err(|e| {
        PhaseError::io(
            format!("scan {}", backup_root.display()),
            std::io::Error::other(e.to_string()),
        )
    })?;

    for rel in &backed {
        outcome.attempted += 1;
        let live = cfg.device_root.join(rel);
        let saved = backup_root.join(rel);

        // A directory sitting where a file belongs is unexpected; skip
        // it rather than delete a subtree.
        if live.is_dir() {
            logger.error(
                "rollback",
                &format!("{} is a directory, skipping restore", live.display()),
            );
            progress(&format!("ROLLBACK_SKIP:{}", rel.display()));
            continue;
        }

        let restored = fsops::remove_file_tolerant(&live)
            .and_then(|_| fsops::copy_file(&saved, &live));
        match restored {
            Ok(bytes) => {
                logger.file_op("restore", &live, bytes);
                progress(&format!("ROLLBACK_FILE:{}:{}", rel.display(), bytes));
                outcome.restored += 1;
            }
            Err(e) => {
                logger.error("rollback", &format!("{}: {}", rel.display(), e));
                progress(&format!("ROLLBACK_FAIL:{}", rel.display()));
            }
        }
    }

    let ratio = if outcome.attempted == 0 {
        1.0
    } else {
        outcome.restored as f64 / outcome.attempted as f64
    };
    outcome.threshold_met = ratio >= cfg.rollback_threshold;

    if outcome.threshold_met {
        fsops::remove_tree(&backup_root)?;
        outcome.backup_removed = true;
    }

    logger.phase(
        "rollback",
        &format!(
            "done restored={}/{} threshold_met={}",
            outcome.restored, outcome.attempted, outcome.threshold_met
        ),
    );
    Ok(outcome)
}
