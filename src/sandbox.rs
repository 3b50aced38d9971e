//! Path confinement for every write the upgrade performs.
//!
//! Two independent gates, both applied before any byte is written:
//! traversal rejection (no absolute paths, no `..`) and the directory
//! allow-list. Files directly under the device root are always permitted;
//! a path that introduces a subdirectory is only permitted when its first
//! segment is allow-listed.

use crate::error::SandboxError;
use std::path::{Component, Path, PathBuf};

/// Normalize a sender-supplied relative path. Strips `.` components,
/// rejects parent components, root components and empty paths. Colons
/// are rejected outright: they delimit response fields, so a path
/// carrying one would make `FILE_START_OK`/`FILE_END` lines ambiguous.
pub fn clean_relative(raw: &str) -> Result<PathBuf, SandboxError> {
    if raw.contains(':') {
        return Err(SandboxError::ReservedChar(':'));
    }
    let candidate = Path::new(raw);
    let mut cleaned = PathBuf::new();
    for comp in candidate.components() {
        match comp {
            Component::Normal(s) => cleaned.push(s),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::Escape(candidate.to_path_buf()))
            }
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(SandboxError::EmptyPath);
    }
    Ok(cleaned)
}

/// Enforce the directory allow-list on an already-cleaned relative path.
pub fn check_allow_list(rel: &Path, allowed_roots: &[String]) -> Result<(), SandboxError> {
    let mut comps = rel.components();
    let first = match comps.next() {
        Some(Component::Normal(s)) => s.to_string_lossy().into_owned(),
        _ => return Err(SandboxError::EmptyPath),
    };
    // A bare file name has no directory to create.
    if comps.next().is_none() {
        return Ok(());
    }
    if allowed_roots.iter().any(|r| r == &first) {
        return Ok(());
    }
    Err(SandboxError::DisallowedRoot(first))
}

/// Clean, allow-list check, and resolve under `root` in one step.
pub fn resolve_under(
    root: &Path,
    raw: &str,
    allowed_roots: &[String],
) -> Result<PathBuf, SandboxError> {
    let rel = clean_relative(raw)?;
    check_allow_list(&rel, allowed_roots)?;
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow() -> Vec<String> {
        vec!["lib".to_string()]
    }

    #[test]
    fn bare_file_is_allowed() {
        let p = resolve_under(Path::new("/dev"), "main.py", &allow()).unwrap();
        assert_eq!(p, PathBuf::from("/dev/main.py"));
    }

    #[test]
    fn allow_listed_subtree_is_allowed() {
        let p = resolve_under(Path::new("/dev"), "lib/foo/bar.mpy", &allow()).unwrap();
        assert_eq!(p, PathBuf::from("/dev/lib/foo/bar.mpy"));
    }

    #[test]
    fn other_top_level_dirs_are_rejected() {
        match resolve_under(Path::new("/dev"), "etc/passwd", &allow()) {
            Err(SandboxError::DisallowedRoot(root)) => assert_eq!(root, "etc"),
            other => panic!("expected DisallowedRoot, got {other:?}"),
        }
    }

    #[test]
    fn parent_traversal_is_rejected() {
        assert!(matches!(
            resolve_under(Path::new("/dev"), "lib/../../evil", &allow()),
            Err(SandboxError::Escape(_))
        ));
    }

    #[test]
    fn response_delimiter_in_path_is_rejected() {
        assert!(matches!(
            clean_relative("lib/a:b.py"),
            Err(SandboxError::ReservedChar(':'))
        ));
    }

    #[test]
    fn absolute_paths_are_rejected() {
        assert!(matches!(
            clean_relative("/flash/main.py"),
            Err(SandboxError::Escape(_))
        ));
    }

    #[test]
    fn current_dir_components_are_stripped() {
        assert_eq!(
            clean_relative("./lib/./x.py").unwrap(),
            PathBuf::from("lib/x.py")
        );
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(matches!(clean_relative(""), Err(SandboxError::EmptyPath)));
        assert!(matches!(clean_relative("."), Err(SandboxError::EmptyPath)));
    }
}
