//! Filesystem tree scanning for the staging and backup roots.
//!
//! The walker keeps an explicit work stack instead of recursing so call
//! stack use stays flat no matter how deep a tree gets; the same walker
//! backs the backup, apply, cleanup and rollback phases.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One visited entry, path absolute.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub kind: EntryKind,
    pub path: PathBuf,
}

/// Walk the subtree under `root`, returning every file and directory
/// (excluding `root` itself) in a deterministic order: each directory's
/// children sorted by name, parents before children. A missing root
/// yields an empty list.
pub fn scan_tree(root: &Path) -> Result<Vec<ScanEntry>> {
    let mut entries = Vec::new();
    if !root.exists() {
        return Ok(entries);
    }

    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut children: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("read_dir {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        children.sort();

        for child in children {
            // Symlink-aware: a link is listed as a file, never followed.
            let meta = std::fs::symlink_metadata(&child)
                .with_context(|| format!("stat {}", child.display()))?;
            if meta.is_dir() {
                entries.push(ScanEntry {
                    kind: EntryKind::Dir,
                    path: child.clone(),
                });
                stack.push(child);
            } else {
                entries.push(ScanEntry {
                    kind: EntryKind::File,
                    path: child,
                });
            }
        }
    }
    Ok(entries)
}

/// Relative paths of every file under `root`. This set is what the phase
/// managers diff: staged-set vs. backed-up-set vs. installed-set.
pub fn relative_file_set(root: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut set = BTreeSet::new();
    for entry in scan_tree(root)? {
        if entry.kind == EntryKind::File {
            let rel = entry
                .path
                .strip_prefix(root)
                .with_context(|| format!("strip {} from {}", root.display(), entry.path.display()))?
                .to_path_buf();
            set.insert(rel);
        }
    }
    Ok(set)
}
