//! Shared protocol constants for the upgrade command channel.

/// Every command carries this namespace prefix.
pub const NAMESPACE: &str = "UPGRADE";

/// Command keywords (case-sensitive, colon-delimited).
pub mod cmd {
    pub const START: &str = "START";
    pub const FILE_START: &str = "FILE_START";
    pub const FILE_DATA: &str = "FILE_DATA";
    pub const FILE_END: &str = "FILE_END";
    pub const COMMIT: &str = "COMMIT";
    pub const STEP2_BACKUP: &str = "STEP2_BACKUP";
    pub const STEP3_APPLY: &str = "STEP3_APPLY";
    pub const STEP4_CLEANUP: &str = "STEP4_CLEANUP";
    pub const ABORT: &str = "ABORT";
    pub const ROLLBACK: &str = "ROLLBACK";
    pub const STATUS: &str = "STATUS";
    pub const VERSION: &str = "VERSION";
}

/// Response keywords. Everything the device says goes out as one of these,
/// colon-joined with its arguments, over the notify channel.
pub mod resp {
    pub const UPGRADE_MODE_READY: &str = "UPGRADE_MODE_READY";
    pub const FILE_START_OK: &str = "FILE_START_OK";
    pub const FILE_START_ERROR: &str = "FILE_START_ERROR";
    pub const CHUNK_ACK: &str = "CHUNK_ACK";
    pub const FILE_END_OK: &str = "FILE_END_OK";
    pub const FILE_END_WARNING: &str = "FILE_END_WARNING";
    pub const FILE_END_ERROR: &str = "FILE_END_ERROR";
    pub const COMMIT_SUCCESS: &str = "COMMIT_SUCCESS";
    pub const COMMIT_ERROR: &str = "COMMIT_ERROR";
    pub const STEP2_SUCCESS: &str = "STEP2_SUCCESS";
    pub const STEP2_ERROR: &str = "STEP2_ERROR";
    pub const STEP3_SUCCESS: &str = "STEP3_SUCCESS";
    pub const STEP3_ERROR: &str = "STEP3_ERROR";
    pub const STEP4_SUCCESS: &str = "STEP4_SUCCESS";
    pub const STEP4_ERROR: &str = "STEP4_ERROR";
    pub const UPGRADE_ABORTED: &str = "UPGRADE_ABORTED";
    pub const ROLLBACK_SUCCESS: &str = "ROLLBACK_SUCCESS";
    pub const ROLLBACK_PARTIAL: &str = "ROLLBACK_PARTIAL";
    pub const ROLLBACK_ERROR: &str = "ROLLBACK_ERROR";
    pub const TEMP_FILES: &str = "TEMP_FILES";
    pub const BACKUP_FILES: &str = "BACKUP_FILES";
    pub const STATUS_ANALYSIS: &str = "STATUS_ANALYSIS";
    pub const FREE_MEMORY: &str = "FREE_MEMORY";
    pub const MODE: &str = "MODE";
    pub const FIRMWARE_VERSION: &str = "FIRMWARE_VERSION";
    pub const UPGRADE_ERROR: &str = "UPGRADE_ERROR";
}

/// Hard limits on what a sender may declare. A violated limit rejects the
/// file before any byte lands in staging.
pub mod limits {
    /// Largest single file the board will stage (8 MiB).
    pub const MAX_DECLARED_FILE_SIZE: u64 = 8 * 1024 * 1024;

    /// Longest encoded chunk payload accepted in one FILE_DATA.
    pub const MAX_CHUNK_CHARS: usize = 16 * 1024;

    /// Longest relative path in a FILE_START.
    pub const MAX_PATH_LEN: usize = 256;
}

/// Centralized timing constants so the sync path, the pipeline drain and
/// the reset behave consistently.
pub mod timing {
    /// Delay before the post-commit hard reset (ms).
    pub const RESET_DELAY_MS: u64 = 2_000;

    /// Attempts for a notify hit by transient transport exhaustion.
    pub const NOTIFY_RETRY_ATTEMPTS: u32 = 3;

    /// Pause between notify retries (ms).
    pub const NOTIFY_RETRY_DELAY_MS: u64 = 50;

    /// Bound on waiting for the (optional) background pipeline to drain
    /// while sealing a file (ms).
    pub const DRAIN_TIMEOUT_MS: u64 = 1_000;
}

/// Fraction of backed-up files that must restore cleanly before the
/// backup tree is considered safe to discard.
pub const ROLLBACK_SUCCESS_THRESHOLD: f64 = 0.80;

/// Default free-memory floor; below this the governor sheds queued state.
pub const DEFAULT_LOW_MEMORY_BYTES: u64 = 16 * 1024 * 1024;
