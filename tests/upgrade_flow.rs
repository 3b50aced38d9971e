//! End-to-end upgrade flows driven through the command router.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use firmup::cleanup::DeviceReset;
use firmup::config::UpgradeConfig;
use firmup::logger::NoopLogger;
use firmup::notify::VecNotifier;
use firmup::pipeline::SyncProcessor;
use firmup::router::CommandRouter;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Records the reset instead of killing the test process.
struct FakeReset {
    fired: Arc<AtomicBool>,
}

impl DeviceReset for FakeReset {
    fn restart(&self, _delay: Duration) {
        self.fired.store(true, Ordering::SeqCst);
    }
}

fn make_router(root: &Path) -> (CommandRouter, Arc<AtomicBool>) {
    let cfg = UpgradeConfig::for_root(root);
    let fired = Arc::new(AtomicBool::new(false));
    let router = CommandRouter::with_parts(
        cfg,
        Arc::new(NoopLogger),
        Box::new(SyncProcessor),
        Box::new(FakeReset {
            fired: Arc::clone(&fired),
        }),
    );
    (router, fired)
}

fn run(router: &mut CommandRouter, command: &str) -> Vec<String> {
    let mut notifier = VecNotifier::new();
    router.handle(command, &mut notifier);
    notifier.lines
}

fn upload(router: &mut CommandRouter, path: &str, data: &[u8], chunk_size: usize) {
    let lines = run(
        router,
        &format!("UPGRADE:FILE_START:{path}:{}", data.len()),
    );
    assert!(
        lines[0].starts_with("FILE_START_OK:"),
        "unexpected: {lines:?}"
    );
    for part in data.chunks(chunk_size.max(1)) {
        let lines = run(
            router,
            &format!("UPGRADE:FILE_DATA:{}", STANDARD.encode(part)),
        );
        assert!(lines[0].contains(":OK:"), "unexpected ack: {lines:?}");
    }
    let lines = run(router, &format!("UPGRADE:FILE_END:{path}"));
    assert!(lines[0].starts_with("FILE_END_OK:"), "unexpected: {lines:?}");
}

#[test]
fn two_chunk_upload_and_commit_resets_device() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, fired) = make_router(dir.path());
    let data = b"# boot script v2 -- 37 bytes of python"; // 38 bytes
    assert_eq!(data.len(), 38);

    assert_eq!(run(&mut router, "UPGRADE:START"), vec!["UPGRADE_MODE_READY"]);

    let lines = run(&mut router, &format!("UPGRADE:FILE_START:main.py:{}", data.len()));
    assert_eq!(lines, vec![format!("FILE_START_OK:main.py:{}", data.len())]);

    let first = run(
        &mut router,
        &format!("UPGRADE:FILE_DATA:{}", STANDARD.encode(&data[..20])),
    );
    assert_eq!(first, vec!["CHUNK_ACK:0:OK:20"]);
    let second = run(
        &mut router,
        &format!("UPGRADE:FILE_DATA:{}", STANDARD.encode(&data[20..])),
    );
    assert_eq!(second, vec!["CHUNK_ACK:1:OK:18"]);

    let sealed = run(&mut router, "UPGRADE:FILE_END:main.py");
    assert_eq!(sealed, vec![format!("FILE_END_OK:main.py:{}", data.len())]);

    let commit = run(&mut router, "UPGRADE:COMMIT");
    assert_eq!(commit.last().unwrap(), "COMMIT_SUCCESS");
    assert!(fired.load(Ordering::SeqCst), "device should reset");

    // Installed, staging fully gone.
    assert_eq!(fs::read(dir.path().join("main.py")).unwrap(), data);
    assert!(!dir.path().join("upgrade_staging").exists());
}

#[test]
fn nested_lib_path_creates_directories_via_manual_apply() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, _fired) = make_router(dir.path());

    run(&mut router, "UPGRADE:START");
    upload(&mut router, "lib/foo/bar.mpy", b"bytecode blob", 8);

    // Staging mirrors the layout.
    assert!(dir
        .path()
        .join("upgrade_staging/lib/foo/bar.mpy")
        .is_file());

    let lines = run(&mut router, "UPGRADE:STEP3_APPLY");
    assert_eq!(lines.last().unwrap(), "STEP3_SUCCESS:1");
    assert!(dir.path().join("lib/foo").is_dir());
    assert_eq!(
        fs::read(dir.path().join("lib/foo/bar.mpy")).unwrap(),
        b"bytecode blob"
    );
}

#[test]
fn corrupt_chunk_is_nacked_and_resend_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, _fired) = make_router(dir.path());
    let data = b"resilient payload";

    run(&mut router, "UPGRADE:START");
    run(
        &mut router,
        &format!("UPGRADE:FILE_START:main.py:{}", data.len()),
    );

    let good = STANDARD.encode(data);
    let corrupted = format!("{}*{}", &good[..4], &good[5..]);
    let nack = run(&mut router, &format!("UPGRADE:FILE_DATA:{corrupted}"));
    assert!(nack[0].starts_with("CHUNK_ACK:0:ERROR:"), "got {nack:?}");

    // Resend the same logical chunk correctly.
    let ack = run(&mut router, &format!("UPGRADE:FILE_DATA:{good}"));
    assert_eq!(ack, vec![format!("CHUNK_ACK:0:OK:{}", data.len())]);

    let sealed = run(&mut router, "UPGRADE:FILE_END:main.py");
    assert_eq!(sealed, vec![format!("FILE_END_OK:main.py:{}", data.len())]);
}

#[test]
fn duplicate_terminal_chunk_is_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, _fired) = make_router(dir.path());
    let data = b"tail chunk";
    let payload = STANDARD.encode(data);

    run(&mut router, "UPGRADE:START");
    run(
        &mut router,
        &format!("UPGRADE:FILE_START:dup.bin:{}", data.len()),
    );
    run(&mut router, &format!("UPGRADE:FILE_DATA:{payload}"));
    run(&mut router, "UPGRADE:FILE_END:dup.bin");

    let dup = run(&mut router, &format!("UPGRADE:FILE_DATA:{payload}"));
    assert_eq!(dup, vec!["CHUNK_ACK:0:DUPLICATE"]);
    assert_eq!(
        fs::read(dir.path().join("upgrade_staging/dup.bin")).unwrap(),
        data
    );
}

#[test]
fn commit_refuses_size_mismatch_and_leaves_live_files_alone() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.py"), b"live v1").unwrap();
    let (mut router, fired) = make_router(dir.path());

    run(&mut router, "UPGRADE:START");
    run(&mut router, "UPGRADE:FILE_START:main.py:100");
    run(
        &mut router,
        &format!("UPGRADE:FILE_DATA:{}", STANDARD.encode(b"too short")),
    );
    let warn = run(&mut router, "UPGRADE:FILE_END:main.py");
    assert!(
        warn[0].starts_with("FILE_END_WARNING:SIZE_MISMATCH:main.py:100:9"),
        "got {warn:?}"
    );

    let commit = run(&mut router, "UPGRADE:COMMIT");
    assert!(
        commit[0].starts_with("COMMIT_ERROR:SIZE_MISMATCH:main.py"),
        "got {commit:?}"
    );
    assert!(!fired.load(Ordering::SeqCst));
    assert_eq!(fs::read(dir.path().join("main.py")).unwrap(), b"live v1");
}

#[test]
fn abort_discards_staging_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, _fired) = make_router(dir.path());

    run(&mut router, "UPGRADE:START");
    run(&mut router, "UPGRADE:FILE_START:lib/half.py:1000");
    run(
        &mut router,
        &format!("UPGRADE:FILE_DATA:{}", STANDARD.encode(b"partial")),
    );

    assert_eq!(run(&mut router, "UPGRADE:ABORT"), vec!["UPGRADE_ABORTED"]);

    let status = run(&mut router, "UPGRADE:STATUS");
    assert!(
        status.iter().any(|l| l == "TEMP_FILES:0:"),
        "got {status:?}"
    );
    assert!(status.iter().any(|l| l == "MODE:IDLE"));
}

#[test]
fn commit_backs_up_originals_before_overwriting() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.py"), b"original").unwrap();
    let (mut router, fired) = make_router(dir.path());

    run(&mut router, "UPGRADE:START");
    upload(&mut router, "main.py", b"replacement", 6);

    let commit = run(&mut router, "UPGRADE:COMMIT");
    assert!(commit.iter().any(|l| l.starts_with("BACKUP_FILE:main.py:")));
    assert!(commit.iter().any(|l| l.starts_with("APPLY_FILE:main.py:")));
    assert_eq!(commit.last().unwrap(), "COMMIT_SUCCESS");
    assert!(fired.load(Ordering::SeqCst));

    assert_eq!(fs::read(dir.path().join("main.py")).unwrap(), b"replacement");
    assert_eq!(
        fs::read(dir.path().join("upgrade_backup/main.py")).unwrap(),
        b"original"
    );
}

#[test]
fn rollback_at_ninety_percent_discards_backup_and_resets() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, fired) = make_router(dir.path());
    let backup_root = dir.path().join("upgrade_backup");
    for i in 0..10 {
        let p = backup_root.join(format!("lib/m{i}.py"));
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, b"orig").unwrap();
    }
    // One restore target is blocked by a directory.
    fs::create_dir_all(dir.path().join("lib/m0.py")).unwrap();

    let lines = run(&mut router, "UPGRADE:ROLLBACK");
    assert!(
        lines.iter().any(|l| l == "ROLLBACK_SUCCESS:9:10"),
        "got {lines:?}"
    );
    assert!(fired.load(Ordering::SeqCst));
    assert!(!backup_root.exists());
}

#[test]
fn rollback_below_threshold_preserves_backup_and_skips_reset() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, fired) = make_router(dir.path());
    let backup_root = dir.path().join("upgrade_backup");
    for i in 0..10 {
        let p = backup_root.join(format!("lib/m{i}.py"));
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, b"orig").unwrap();
    }
    for i in 0..3 {
        fs::create_dir_all(dir.path().join(format!("lib/m{i}.py"))).unwrap();
    }

    let lines = run(&mut router, "UPGRADE:ROLLBACK");
    assert!(
        lines
            .iter()
            .any(|l| l == "ROLLBACK_PARTIAL:7:10:BACKUP_PRESERVED"),
        "got {lines:?}"
    );
    assert!(!fired.load(Ordering::SeqCst));
    assert!(backup_root.exists());
}

#[test]
fn disallowed_path_never_reaches_any_phase() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, _fired) = make_router(dir.path());

    run(&mut router, "UPGRADE:START");
    let lines = run(&mut router, "UPGRADE:FILE_START:etc/passwd:10");
    assert!(
        lines[0].starts_with("FILE_START_ERROR:etc/passwd:"),
        "got {lines:?}"
    );

    let status = run(&mut router, "UPGRADE:STATUS");
    assert!(status.iter().any(|l| l == "TEMP_FILES:0:"));

    let backup = run(&mut router, "UPGRADE:STEP2_BACKUP");
    assert_eq!(backup.last().unwrap(), "STEP2_SUCCESS:0");
}

#[test]
fn unknown_command_reports_error_without_touching_session() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, _fired) = make_router(dir.path());

    run(&mut router, "UPGRADE:START");
    run(&mut router, "UPGRADE:FILE_START:main.py:4");

    let lines = run(&mut router, "UPGRADE:SELFDESTRUCT");
    assert_eq!(lines, vec!["UPGRADE_ERROR:UNKNOWN_COMMAND:SELFDESTRUCT"]);

    // Session still accepts the transfer afterwards.
    let ack = run(
        &mut router,
        &format!("UPGRADE:FILE_DATA:{}", STANDARD.encode(b"abcd")),
    );
    assert_eq!(ack, vec!["CHUNK_ACK:0:OK:4"]);
}

#[test]
fn version_and_status_report_device_state() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, _fired) = make_router(dir.path());

    let version = run(&mut router, "UPGRADE:VERSION");
    assert!(version[0].starts_with("FIRMWARE_VERSION:firmup-"));

    run(&mut router, "UPGRADE:START");
    upload(&mut router, "lib/a.py", b"aa", 2);
    fs::create_dir_all(dir.path().join("upgrade_backup")).unwrap();
    fs::write(dir.path().join("upgrade_backup/old.py"), b"o").unwrap();

    let status = run(&mut router, "UPGRADE:STATUS");
    assert!(status.iter().any(|l| l == "TEMP_FILES:1:lib/a.py"));
    assert!(status.iter().any(|l| l == "BACKUP_FILES:1:old.py"));
    assert!(status.iter().any(|l| l.starts_with("FREE_MEMORY:")));
    assert!(status
        .iter()
        .any(|l| l == "STATUS_ANALYSIS:NEW:1:OVERWRITE:0"));
    assert!(status.iter().any(|l| l == "MODE:READY"));
}

#[test]
fn step4_cleanup_removes_staging_and_resets() {
    let dir = tempfile::tempdir().unwrap();
    let (mut router, fired) = make_router(dir.path());

    run(&mut router, "UPGRADE:START");
    upload(&mut router, "lib/deep/x.py", b"x", 1);

    let lines = run(&mut router, "UPGRADE:STEP4_CLEANUP");
    assert_eq!(lines.last().unwrap(), "STEP4_SUCCESS:1");
    assert!(fired.load(Ordering::SeqCst));
    assert!(!dir.path().join("upgrade_staging").exists());
}
