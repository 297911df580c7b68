//! Path-safety contract (spec §5, §8, §9): any function that returns or
//! writes a path must first resolve its absolute form and verify it
//! descends from a declared root. This is a precondition, not a
//! best-effort check — callers that need to tolerate an escaping path
//! (snapshotting, modified-file verification) call `resolve_within` and
//! skip-with-warning on `Err`, they never panic or silently continue.

use std::path::{Component, Path, PathBuf};

use crate::error::PathSafetyError;

/// Resolves `candidate` (absolute or relative to `root`) to an absolute
/// path and verifies it descends from `root`. Neither path needs to exist
/// on disk; components are normalized lexically (`.`/`..` resolved)
/// rather than via `fs::canonicalize`, so the check also rejects
/// not-yet-created destination paths (e.g. snapshot targets).
pub fn resolve_within(root: &Path, candidate: &Path) -> Result<PathBuf, PathSafetyError> {
    let root_abs = lexical_absolute(root);
    let candidate_abs = if candidate.is_absolute() {
        lexical_absolute(candidate)
    } else {
        lexical_absolute(&root_abs.join(candidate))
    };

    if candidate_abs.starts_with(&root_abs) {
        Ok(candidate_abs)
    } else {
        Err(PathSafetyError::Escapes {
            path: candidate_abs.display().to_string(),
            root: root_abs.display().to_string(),
        })
    }
}

/// Reduces an externally reported path to a codespace-relative form,
/// rejecting anything that escapes `codespace_root`.
pub fn to_codespace_relative(codespace_root: &Path, reported: &Path) -> Result<PathBuf, PathSafetyError> {
    let abs = resolve_within(codespace_root, reported)?;
    let root_abs = lexical_absolute(codespace_root);
    Ok(abs
        .strip_prefix(&root_abs)
        .expect("resolve_within guarantees abs descends from root_abs")
        .to_path_buf())
}

/// Lexically normalizes `path` against the current working directory
/// without touching the filesystem (no symlink resolution, no existence
/// check) — `std::fs::canonicalize` would fail on paths that don't exist
/// yet, which snapshot destinations and not-yet-written artifacts both
/// are before their first write.
fn lexical_absolute(path: &Path) -> PathBuf {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_root_is_accepted() {
        let root = Path::new("/codespace");
        let resolved = resolve_within(root, Path::new("core.go")).unwrap();
        assert_eq!(resolved, PathBuf::from("/codespace/core.go"));
    }

    #[test]
    fn escaping_via_dotdot_is_rejected() {
        let root = Path::new("/codespace");
        let err = resolve_within(root, Path::new("../etc/passwd")).unwrap_err();
        assert!(matches!(err, PathSafetyError::Escapes { .. }));
    }

    #[test]
    fn absolute_escape_is_rejected() {
        let root = Path::new("/codespace");
        let err = resolve_within(root, Path::new("/etc/passwd")).unwrap_err();
        assert!(matches!(err, PathSafetyError::Escapes { .. }));
    }

    #[test]
    fn codespace_relative_strips_root() {
        let root = Path::new("/codespace");
        let rel = to_codespace_relative(root, Path::new("/codespace/src/core.go")).unwrap();
        assert_eq!(rel, PathBuf::from("src/core.go"));
    }

    proptest::proptest! {
        /// Any path built purely from non-empty, dot-free segments always
        /// resolves under the root, no matter how deep.
        #[test]
        fn safe_segments_always_resolve_within_root(segments in proptest::collection::vec("[a-zA-Z0-9_-]{1,12}", 1..8)) {
            let root = Path::new("/codespace");
            let candidate = PathBuf::from(segments.join("/"));
            let resolved = resolve_within(root, &candidate).unwrap();
            proptest::prop_assert!(resolved.starts_with(root));
        }

        /// Any path prefixed with at least one `..` climbs above
        /// `/codespace` (which has no sibling named `codespace`) and is
        /// always rejected.
        #[test]
        fn dotdot_prefixed_paths_always_escape(
            climbs in 1usize..4,
            segments in proptest::collection::vec("[a-zA-Z0-9_-]{1,12}", 0..4),
        ) {
            let root = Path::new("/codespace");
            let mut parts: Vec<String> = vec!["..".to_string(); climbs];
            parts.extend(segments);
            let candidate = PathBuf::from(parts.join("/"));
            let err = resolve_within(root, &candidate).unwrap_err();
            proptest::prop_assert!(matches!(err, PathSafetyError::Escapes { .. }));
        }
    }
}
