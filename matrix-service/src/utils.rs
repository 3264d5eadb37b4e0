// Utility Functions
// Path helpers for repository discovery, work directories, and result names

use std::path::{Path, PathBuf};

/// Find the root of a git repository by walking up from the given starting path.
///
/// Returns `None` if no ancestor contains a `.git` entry. `.git` may be a
/// file (worktrees, submodules) as well as a directory.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    for ancestor in start.ancestors() {
        if ancestor.join(".git").exists() {
            return Some(ancestor.to_path_buf());
        }
    }
    None
}

/// Resolve the repository to test: the enclosing git repository of the
/// current directory, or the current directory itself.
pub fn resolve_repo_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd).unwrap_or(cwd)
}

/// Default scratch directory for worktrees and staged builds
pub fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prmatrix")
        .join("work")
}

/// Replace every character that is unsafe in a single path component with `_`
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" => "_".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn test_find_repo_root_with_git_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join(".git")).unwrap();

        let sub = root.join("a").join("b").join("c");
        fs::create_dir_all(&sub).unwrap();

        let found = find_repo_root(&sub);
        assert_eq!(
            found.unwrap().canonicalize().unwrap(),
            root.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_find_repo_root_with_git_file() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(root.join(".git"), "gitdir: /elsewhere").unwrap();

        let found = find_repo_root(root);
        assert_eq!(
            found.unwrap().canonicalize().unwrap(),
            root.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_find_repo_root_nonexistent_path() {
        let result = find_repo_root(Path::new("/nonexistent/path/that/does/not/exist"));
        assert!(result.is_none());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("nightly-2024-01-01"), "nightly-2024-01-01");
        assert_eq!(sanitize_name("crates/core"), "crates_core");
        assert_eq!(sanitize_name(""), "_");
        assert_eq!(sanitize_name(".."), "__");
    }

    #[test]
    fn test_default_work_dir_is_namespaced() {
        let dir = default_work_dir();
        assert!(dir.ends_with("prmatrix/work"));
    }
}
