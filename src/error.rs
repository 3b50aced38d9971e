//! Closed error kinds for each upgrade component.
//!
//! Reception-time failures (decode, sandbox) are recoverable: the chunk is
//! NACKed and the session stays open for retransmission. Phase failures
//! block later phases instead.

use std::path::PathBuf;
use thiserror::Error;

/// Chunk payload decoding failures. Never escapes the decoder boundary
/// unwrapped; the router turns these into `CHUNK_ACK:<n>:ERROR` lines.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload length mod 4 == 1 cannot come from any base64 stream split.
    #[error("payload length {0} is not repairable to a base64 quantum")]
    ImpossibleLength(usize),

    #[error("byte {index}: {ch:?} is outside the base64 alphabet")]
    InvalidChar { index: usize, ch: char },

    #[error("padding only permitted at end of payload")]
    EmbeddedPadding,

    #[error("base64 decode failed: {0}")]
    Malformed(#[from] base64::DecodeError),
}

/// Path confinement failures, raised before any byte is written.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path {0:?} escapes the staging sandbox")]
    Escape(PathBuf),

    #[error("path root {0:?} is not on the allow-list")]
    DisallowedRoot(String),

    #[error("empty or unusable relative path")]
    EmptyPath,

    #[error("path contains reserved character {0:?}")]
    ReservedChar(char),

    #[error("relative path of {0} bytes exceeds limit")]
    PathTooLong(usize),
}

/// Transfer session failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("no file transfer in progress")]
    NoFileOpen,

    #[error("chunk payload of {0} chars exceeds limit")]
    ChunkTooLong(usize),

    #[error("FILE_END for {got:?} but open file is {expected:?}")]
    WrongFile { expected: String, got: String },

    #[error("declared size {declared} for {path:?} exceeds limit {limit}")]
    OversizedFile {
        path: String,
        declared: u64,
        limit: u64,
    },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Commit-phase failures (backup/apply/cleanup/rollback). Fail-fast during
/// COMMIT; operator-directed when stepping phases manually.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("installed {path:?} does not match staged bytes")]
    VerifyMismatch { path: String },
}

impl PhaseError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PhaseError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Outbound notification failures. `Transient` covers the transport's
/// out-of-memory condition and is retried with a short delay; `Permanent`
/// is surfaced immediately.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transient notify failure: {0}")]
    Transient(String),

    #[error("notify channel failed: {0}")]
    Permanent(String),
}
