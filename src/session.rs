//! The single in-flight upgrade session.
//!
//! One owned [`UpgradeSession`] exists per upgrade attempt: constructed on
//! `START`, mutated per `FILE_DATA`, consumed by the terminal commands.
//! It owns the only open destination handle in the system.

use crate::checksum::{additive_checksum, AdditiveChecksum};
use crate::config::UpgradeConfig;
use crate::decode;
use crate::error::SessionError;
use crate::protocol::limits;
use crate::sandbox;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Commit sub-phase, used for state reporting while COMMIT runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Backup,
    Apply,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Backup => write!(f, "BACKUP"),
            Phase::Apply => write!(f, "APPLY"),
            Phase::Cleanup => write!(f, "CLEANUP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Idle,
    ModeReady,
    ReceivingFile,
    Committing(Phase),
    RollingBack,
    Aborted,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeState::Idle => write!(f, "IDLE"),
            UpgradeState::ModeReady => write!(f, "READY"),
            UpgradeState::ReceivingFile => write!(f, "RECEIVING"),
            UpgradeState::Committing(p) => write!(f, "COMMITTING_{p}"),
            UpgradeState::RollingBack => write!(f, "ROLLING_BACK"),
            UpgradeState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Immutable record of one completed file reception, read by the commit
/// phases. `sealed == false` marks a declared/actual size mismatch found
/// at FILE_END; COMMIT refuses to run while any record is unsealed.
#[derive(Debug, Clone)]
pub struct ReceivedFileRecord {
    pub rel_path: String,
    pub staging_path: PathBuf,
    pub size: u64,
    pub declared: u64,
    pub checksum: u32,
    pub chunks: u32,
    pub sealed: bool,
}

struct OpenFile {
    rel_path: String,
    staging_path: PathBuf,
    handle: File,
    declared: u64,
}

/// Per-chunk outcome; formatted into a CHUNK_ACK and dropped.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOutcome {
    pub index: u32,
    pub written: usize,
    pub duplicate: bool,
}

pub struct UpgradeSession {
    state: UpgradeState,
    open: Option<OpenFile>,
    bytes_received: u64,
    chunk_index: u32,
    checksum: AdditiveChecksum,
    files: BTreeMap<String, ReceivedFileRecord>,
    /// Reusable decode scratch; the governor trims it after every chunk.
    chunk_buf: Vec<u8>,
    /// (additive sum, length, index) of the most recent decoded chunk,
    /// kept to recognize an exact retransmission of the terminal chunk.
    last_chunk: Option<(u32, usize, u32)>,
}

impl UpgradeSession {
    pub fn new() -> Self {
        Self {
            state: UpgradeState::ModeReady,
            open: None,
            bytes_received: 0,
            chunk_index: 0,
            checksum: AdditiveChecksum::new(),
            files: BTreeMap::new(),
            chunk_buf: Vec::new(),
            last_chunk: None,
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    pub fn set_state(&mut self, state: UpgradeState) {
        self.state = state;
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn has_open_file(&self) -> bool {
        self.open.is_some()
    }

    /// Index the next accepted chunk will get; used to label NACKs.
    pub fn next_chunk_index(&self) -> u32 {
        self.chunk_index
    }

    pub fn records(&self) -> impl Iterator<Item = &ReceivedFileRecord> {
        self.files.values()
    }

    /// Records whose actual size disagreed with the declaration.
    pub fn unsealed(&self) -> Vec<&ReceivedFileRecord> {
        self.files.values().filter(|r| !r.sealed).collect()
    }

    /// Begin receiving one file into staging. A still-open previous file
    /// is implicitly discarded first: the sender is authoritative about
    /// what it is transmitting. On any failure no partial state remains.
    pub fn start_file(
        &mut self,
        cfg: &UpgradeConfig,
        raw_path: &str,
        declared: u64,
    ) -> Result<(), SessionError> {
        if raw_path.len() > limits::MAX_PATH_LEN {
            return Err(SessionError::Sandbox(
                crate::error::SandboxError::PathTooLong(raw_path.len()),
            ));
        }
        if declared > limits::MAX_DECLARED_FILE_SIZE {
            return Err(SessionError::OversizedFile {
                path: raw_path.to_string(),
                declared,
                limit: limits::MAX_DECLARED_FILE_SIZE,
            });
        }

        let rel = sandbox::clean_relative(raw_path)?;
        sandbox::check_allow_list(&rel, &cfg.allowed_roots)?;
        let staging_path = cfg.staging_root().join(&rel);

        // Discard a half-received predecessor, handle first.
        if let Some(old) = self.open.take() {
            drop(old.handle);
            fs::remove_file(&old.staging_path).ok();
        }
        self.reset_file_counters();

        let open_result = (|| -> Result<File, std::io::Error> {
            if let Some(parent) = staging_path.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(&staging_path)
        })();

        let handle = match open_result {
            Ok(h) => h,
            Err(e) => {
                // No partial state: a failed create leaves nothing open.
                self.state = UpgradeState::ModeReady;
                return Err(SessionError::Io(e));
            }
        };

        self.open = Some(OpenFile {
            rel_path: rel.to_string_lossy().into_owned(),
            staging_path,
            handle,
            declared,
        });
        self.state = UpgradeState::ReceivingFile;
        Ok(())
    }

    /// Decode one chunk and append it to the open file. Write length is
    /// clamped so `bytes_received` never exceeds the declared size; an
    /// exact resend of the terminal chunk is acked as a duplicate without
    /// touching the file.
    pub fn receive_chunk(&mut self, payload: &str) -> Result<ChunkOutcome, SessionError> {
        if payload.len() > limits::MAX_CHUNK_CHARS {
            return Err(SessionError::ChunkTooLong(payload.len()));
        }

        let mut buf = std::mem::take(&mut self.chunk_buf);
        let decoded_len = match decode::decode_chunk_into(payload, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.chunk_buf = buf;
                return Err(SessionError::Decode(e));
            }
        };
        let outcome = self.append_decoded_inner(&buf[..decoded_len]);
        self.chunk_buf = buf;
        outcome
    }

    /// Append already-decoded bytes (the background pipeline's entry
    /// point; the sync path arrives here through [`receive_chunk`]).
    pub fn append_decoded(&mut self, decoded: &[u8]) -> Result<ChunkOutcome, SessionError> {
        self.append_decoded_inner(decoded)
    }

    fn append_decoded_inner(&mut self, decoded: &[u8]) -> Result<ChunkOutcome, SessionError> {
        let sum = additive_checksum(decoded);

        let complete = match &self.open {
            Some(f) => self.bytes_received >= f.declared,
            None => true,
        };
        if let Some((last_sum, last_len, last_index)) = self.last_chunk {
            if complete && !decoded.is_empty() && last_sum == sum && last_len == decoded.len() {
                return Ok(ChunkOutcome {
                    index: last_index,
                    written: 0,
                    duplicate: true,
                });
            }
        }

        let file = self.open.as_mut().ok_or(SessionError::NoFileOpen)?;

        // Clamp to the declared remainder; excess is truncated, never
        // allowed to overflow the file.
        let remainder = file.declared.saturating_sub(self.bytes_received) as usize;
        let write_len = decoded.len().min(remainder);

        // Write at the last acked offset, not the cursor: a failed write
        // may have flushed partial bytes past it, and the resend must
        // overwrite those rather than land after them.
        file.handle.seek(SeekFrom::Start(self.bytes_received))?;
        if let Err(e) = file.handle.write_all(&decoded[..write_len]) {
            file.handle.set_len(self.bytes_received).ok();
            return Err(SessionError::Io(e));
        }

        self.checksum.update(&decoded[..write_len]);
        self.bytes_received += write_len as u64;
        let index = self.chunk_index;
        self.chunk_index += 1;
        self.last_chunk = Some((sum, decoded.len(), index));

        Ok(ChunkOutcome {
            index,
            written: write_len,
            duplicate: false,
        })
    }

    /// Seal the open file. On a size mismatch the record is kept with
    /// `sealed == false` so COMMIT can refuse later; the handle closes
    /// either way.
    pub fn finish_file(&mut self, raw_path: &str) -> Result<ReceivedFileRecord, SessionError> {
        let rel = sandbox::clean_relative(raw_path)?;
        let rel_str = rel.to_string_lossy().into_owned();

        let mut file = self.open.take().ok_or(SessionError::NoFileOpen)?;
        if file.rel_path != rel_str {
            let expected = file.rel_path.clone();
            self.open = Some(file);
            return Err(SessionError::WrongFile {
                expected,
                got: rel_str,
            });
        }

        // Stored length must equal the acked byte count, even if an
        // earlier failed write left stray bytes beyond it.
        file.handle.set_len(self.bytes_received)?;
        file.handle.flush()?;
        drop(file.handle);

        let record = ReceivedFileRecord {
            rel_path: file.rel_path.clone(),
            staging_path: file.staging_path,
            size: self.bytes_received,
            declared: file.declared,
            checksum: self.checksum.value(),
            chunks: self.chunk_index,
            sealed: self.bytes_received == file.declared,
        };
        self.files.insert(file.rel_path, record.clone());

        // Counters clear; last_chunk survives so a stray resend of the
        // terminal chunk is still recognized.
        self.reset_file_counters();
        self.state = UpgradeState::ModeReady;
        Ok(record)
    }

    fn reset_file_counters(&mut self) {
        self.bytes_received = 0;
        self.chunk_index = 0;
        self.checksum.reset();
    }

    /// Close any open handle and mark the session aborted. The staging
    /// tree itself is wiped by the caller.
    pub fn abort(&mut self) {
        if let Some(old) = self.open.take() {
            drop(old.handle);
            fs::remove_file(&old.staging_path).ok();
        }
        self.reset_file_counters();
        self.last_chunk = None;
        self.files.clear();
        self.state = UpgradeState::Aborted;
    }

    /// Release per-chunk scratch capacity. Called by the memory governor
    /// after every chunk.
    pub fn trim_scratch(&mut self) {
        self.chunk_buf.shrink_to_fit();
    }
}

impl Default for UpgradeSession {
    fn default() -> Self {
        Self::new()
    }
}
