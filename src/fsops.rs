//! Plain copy/remove primitives shared by the phase managers.

use crate::error::PhaseError;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Buffer size tuned for the board's flash filesystem; large enough to
/// keep syscall count low, small enough not to pressure the heap.
const COPY_BUF: usize = 32 * 1024;

/// Copy `src` to `dst` byte for byte, creating `dst`'s parent directories.
/// Returns the number of bytes copied.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64, PhaseError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PhaseError::io(format!("mkdir {}", parent.display()), e))?;
    }

    let mut reader = BufReader::with_capacity(
        COPY_BUF,
        File::open(src).map_err(|e| PhaseError::io(format!("open {}", src.display()), e))?,
    );
    let mut writer = BufWriter::with_capacity(
        COPY_BUF,
        File::create(dst).map_err(|e| PhaseError::io(format!("create {}", dst.display()), e))?,
    );

    let mut buffer = [0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| PhaseError::io(format!("read {}", src.display()), e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .map_err(|e| PhaseError::io(format!("write {}", dst.display()), e))?;
        total += n as u64;
    }
    writer
        .flush()
        .map_err(|e| PhaseError::io(format!("flush {}", dst.display()), e))?;
    Ok(total)
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_tolerant(path: &Path) -> Result<bool, PhaseError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PhaseError::io(format!("remove {}", path.display()), e)),
    }
}

/// Delete everything inside `root` (files first, then directories
/// deepest-first) without removing `root` itself. Tolerates concurrent
/// disappearance of individual entries.
pub fn clear_dir_contents(root: &Path) -> Result<(), PhaseError> {
    use crate::scan::{scan_tree, EntryKind};

    if !root.exists() {
        return Ok(());
    }
    let entries = scan_tree(root).map_err(|e| {
        PhaseError::io(
            format!("scan {}", root.display()),
            std::io::Error::other(e.to_string()),
        )
    })?;

    let mut dirs = Vec::new();
    for entry in &entries {
        match entry.kind {
            EntryKind::File => {
                remove_file_tolerant(&entry.path)?;
            }
            EntryKind::Dir => dirs.push(entry.path.clone()),
        }
    }

    // Sorted paths put parents before children; reverse order guarantees
    // the deepest directory goes first.
    dirs.sort();
    for dir in dirs.iter().rev() {
        match fs::remove_dir(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PhaseError::io(format!("rmdir {}", dir.display()), e)),
        }
    }
    Ok(())
}

/// Delete an entire tree including its root.
pub fn remove_tree(root: &Path) -> Result<(), PhaseError> {
    clear_dir_contents(root)?;
    match fs::remove_dir(root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PhaseError::io(format!("rmdir {}", root.display()), e)),
    }
}
