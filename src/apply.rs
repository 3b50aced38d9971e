//! Phase 3: copy staged files into their final locations.
//!
//! Staged files are left in place — phase 4 owns deletion — so a failure
//! partway through leaves the staging tree intact for a retry or for
//! diagnosis.

use crate::checksum::hash_file_blake3;
use crate::config::UpgradeConfig;
use crate::error::PhaseError;
use crate::fsops;
use crate::logger::UpgradeLogger;
use crate::sandbox;
use crate::scan;

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub installed: usize,
    pub bytes: u64,
}

pub fn run_apply(
    cfg: &UpgradeConfig,
    logger: &dyn UpgradeLogger,
    progress: &mut dyn FnMut(&str),
) -> Result<ApplyReport, PhaseError> {
    let staging_root = cfg.staging_root();
    let mut report = ApplyReport::default();

    let staged = scan::relative_file_set(&staging_root).map_err(|e| {
        PhaseError::io(
            format!("scan {}", staging_root.display()),
            std::io::Error::other(e.to_string()),
        )
    })?;

    for rel in &staged {
        sandbox::check_allow_list(rel, &cfg.allowed_roots)?;
        let src = staging_root.join(rel);
        let dst = cfg.device_root.join(rel);

        let bytes = fsops::copy_file(&src, &dst)?;
        verify_identical(&src, &dst, rel)?;

        logger.file_op("apply", &dst, bytes);
        progress(&format!("APPLY_FILE:{}:{}", rel.display(), bytes));
        report.installed += 1;
        report.bytes += bytes;
    }

    logger.phase("apply", &format!("done installed={}", report.installed));
    Ok(report)
}

fn verify_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
    rel: &std::path::Path,
) -> Result<(), PhaseError> {
    let to_io = |e: anyhow::Error| {
        PhaseError::io("verify hash".to_string(), std::io::Error::other(e.to_string()))
    };
    if hash_file_blake3(src).map_err(to_io)? != hash_file_blake3(dst).map_err(to_io)? {
        return Err(PhaseError::VerifyMismatch {
            path: rel.display().to_string(),
        });
    }
    Ok(())
}
