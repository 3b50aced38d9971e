use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Local event log for the upgrade core. Default methods are no-ops so
/// implementations only pick up the events they care about; the hot chunk
/// path costs nothing with [`NoopLogger`].
pub trait UpgradeLogger: Send + Sync {
    fn command(&self, _op: &str) {}
    fn chunk(&self, _index: u32, _bytes: usize, _ok: bool) {}
    fn phase(&self, _name: &str, _detail: &str) {}
    fn file_op(&self, _op: &str, _path: &Path, _bytes: u64) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn reset_scheduled(&self, _delay_ms: u64) {}
}

pub struct NoopLogger;
impl UpgradeLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl UpgradeLogger for TextLogger {
    fn command(&self, op: &str) {
        self.line(&format!("CMD op={op}"));
    }
    fn chunk(&self, index: u32, bytes: usize, ok: bool) {
        self.line(&format!("CHUNK idx={index} bytes={bytes} ok={ok}"));
    }
    fn phase(&self, name: &str, detail: &str) {
        self.line(&format!("PHASE name={name} {detail}"));
    }
    fn file_op(&self, op: &str, path: &Path, bytes: u64) {
        self.line(&format!("FILE op={} path={} bytes={}", op, path.display(), bytes));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
    fn reset_scheduled(&self, delay_ms: u64) {
        self.line(&format!("RESET delay_ms={delay_ms}"));
    }
}

/// One JSON object per line, for log files meant to be parsed rather
/// than read. Selected by a `.jsonl` log path.
pub struct JsonLogger {
    file: Mutex<File>,
}

impl JsonLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn event(&self, value: serde_json::Value) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{value}");
        }
    }
}

impl UpgradeLogger for JsonLogger {
    fn command(&self, op: &str) {
        self.event(serde_json::json!({
            "ts": Utc::now().to_rfc3339(), "event": "cmd", "op": op,
        }));
    }
    fn chunk(&self, index: u32, bytes: usize, ok: bool) {
        self.event(serde_json::json!({
            "ts": Utc::now().to_rfc3339(), "event": "chunk",
            "index": index, "bytes": bytes, "ok": ok,
        }));
    }
    fn phase(&self, name: &str, detail: &str) {
        self.event(serde_json::json!({
            "ts": Utc::now().to_rfc3339(), "event": "phase",
            "name": name, "detail": detail,
        }));
    }
    fn file_op(&self, op: &str, path: &Path, bytes: u64) {
        self.event(serde_json::json!({
            "ts": Utc::now().to_rfc3339(), "event": "file",
            "op": op, "path": path.display().to_string(), "bytes": bytes,
        }));
    }
    fn error(&self, context: &str, msg: &str) {
        self.event(serde_json::json!({
            "ts": Utc::now().to_rfc3339(), "event": "error",
            "ctx": context, "msg": msg,
        }));
    }
    fn reset_scheduled(&self, delay_ms: u64) {
        self.event(serde_json::json!({
            "ts": Utc::now().to_rfc3339(), "event": "reset", "delay_ms": delay_ms,
        }));
    }
}
