use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

pub(crate) fn expand_tilde(raw: &str) -> io::Result<PathBuf> {
    if raw.starts_with('~') {
        // `shellexpand::tilde` falls back to returning the input when the
        // home directory cannot be resolved; surface that as an error.
        let expanded = shellexpand::tilde(raw);
        if expanded.starts_with('~') {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "could not resolve home directory while expanding path",
            ));
        }
        return Ok(PathBuf::from(expanded.as_ref()));
    }

    Ok(PathBuf::from(raw))
}

/// Resolve `.` and `..` components without touching the filesystem, so paths
/// that do not exist yet still normalize deterministically.
pub(crate) fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir.as_os_str());
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(Component::CurDir.as_os_str());
    }
    normalized
}

/// Canonicalize when the path exists, otherwise fall back to lexical
/// normalization of the absolute form. `dunce` keeps Windows results free of
/// the `\\?\` verbatim prefix so policy comparisons stay stable.
pub(crate) fn canonicalize_best_effort(path: &Path) -> PathBuf {
    match dunce::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(_) => {
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(path))
                    .unwrap_or_else(|_| path.to_path_buf())
            };
            lexical_normalize(&absolute)
        }
    }
}

/// Normalize a declared policy scope: trim, expand `~`, canonicalize when
/// the path exists (lexical normalization otherwise), strip trailing
/// separators. Malformed input degrades to the trimmed original with a
/// debug-log warning; the validators still gate the actual I/O.
pub(crate) fn normalize_scope(raw: &str) -> String {
    let trimmed = raw.trim();
    let expanded = match expand_tilde(trimmed) {
        Ok(path) => path,
        Err(err) => {
            debug!("failed to expand policy path {trimmed:?}: {err}");
            PathBuf::from(trimmed)
        }
    };
    canonicalize_best_effort(&expanded)
        .to_string_lossy()
        .into_owned()
}

/// Key used for ancestor/equality comparisons between scopes and query
/// paths. Case-insensitive on Windows, verbatim elsewhere.
pub(crate) fn comparison_path(path: &Path) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(path.to_string_lossy().to_lowercase())
    } else {
        path.to_path_buf()
    }
}

/// Component-wise ancestor-or-equal test over pre-normalized paths.
pub(crate) fn is_ancestor_or_equal(ancestor: &Path, path: &Path) -> bool {
    comparison_path(path).starts_with(comparison_path(ancestor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lexical_normalize_resolves_dot_components() {
        assert_eq!(
            lexical_normalize(Path::new("/work/./a/../b")),
            PathBuf::from("/work/b")
        );
        assert_eq!(lexical_normalize(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn normalize_scope_strips_trailing_separators() {
        assert_eq!(normalize_scope(" /work/data/ "), "/work/data");
        assert_eq!(normalize_scope("/"), "/");
    }

    #[test]
    fn ancestor_check_is_component_wise() {
        assert!(is_ancestor_or_equal(Path::new("/work"), Path::new("/work")));
        assert!(is_ancestor_or_equal(
            Path::new("/work"),
            Path::new("/work/a/b.txt")
        ));
        // "/work2" is not under "/work" even though it shares the prefix
        // as a string.
        assert!(!is_ancestor_or_equal(
            Path::new("/work"),
            Path::new("/work2/file")
        ));
        assert!(is_ancestor_or_equal(Path::new("/"), Path::new("/etc/hosts")));
    }

    #[test]
    fn canonicalize_best_effort_handles_missing_paths() {
        let missing = Path::new("/no/such/dir/../file.txt");
        assert_eq!(
            canonicalize_best_effort(missing),
            PathBuf::from("/no/such/file.txt")
        );
    }
}
