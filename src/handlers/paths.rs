/// Root-relative path helpers
use crate::error::{PipelineError, PipelineResult};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Reject paths that are empty, absolute, contain `..` or `.`, or reach into `.git`
pub fn validate_relative(path: &str) -> PipelineResult<()> {
    if path.trim().is_empty() {
        return Err(PipelineError::Validation("Path must not be empty".to_string()));
    }

    for (idx, component) in Path::new(path).components().enumerate() {
        match component {
            Component::Normal(name) if idx == 0 && name == ".git" => {
                return Err(PipelineError::Validation(format!(
                    "Path is inside the repository metadata: {}",
                    path
                )));
            }
            Component::Normal(_) => {}
            _ => {
                return Err(PipelineError::Validation(format!(
                    "Path must be relative to the resource root: {}",
                    path
                )));
            }
        }
    }

    Ok(())
}

/// Absolute location of a validated root-relative path
pub fn resolve(root: &Path, path: &str) -> PipelineResult<PathBuf> {
    validate_relative(path)?;
    Ok(root.join(path))
}

/// Root-relative, `/`-separated form of `absolute`, if it lies under `root`
pub fn to_relative(root: &Path, absolute: &Path) -> Option<String> {
    let relative = absolute.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|component| match component {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Create `path`'s missing parent directories, returning them root-relative
pub async fn create_parents(root: &Path, path: &Path) -> std::io::Result<Vec<String>> {
    let mut missing = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) || fs::try_exists(dir).await? {
            break;
        }
        missing.push(dir.to_path_buf());
        current = dir.parent();
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    Ok(missing
        .iter()
        .filter_map(|dir| to_relative(root, dir))
        .collect())
}

/// Remove now-empty directories from `path`'s parent up to, not including, `root`.
///
/// Returns the removed directories, root-relative.
pub async fn prune_empty_parents(root: &Path, path: &Path) -> Vec<String> {
    let mut removed = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails on a non-empty directory, which ends the walk
        if fs::remove_dir(dir).await.is_err() {
            break;
        }
        removed.extend(to_relative(root, dir));
        current = dir.parent();
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_relative() {
        assert!(validate_relative("notes/a.md").is_ok());
        assert!(validate_relative("").is_err());
        assert!(validate_relative("/etc/passwd").is_err());
        assert!(validate_relative("notes/../../escape").is_err());
        assert!(validate_relative("./a.md").is_err());
        assert!(validate_relative(".git/config").is_err());
        assert!(validate_relative("notes/.git-ignored.md").is_ok());
    }

    #[test]
    fn test_to_relative() {
        let root = Path::new("/vault");
        assert_eq!(
            to_relative(root, Path::new("/vault/notes/a.md")),
            Some("notes/a.md".to_string())
        );
        assert_eq!(to_relative(root, Path::new("/vault")), None);
        assert_eq!(to_relative(root, Path::new("/elsewhere/a.md")), None);
    }

    #[tokio::test]
    async fn test_prune_stops_at_non_empty_and_root() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/b/c")).unwrap();
        std::fs::write(root.join("a/keep.md"), "x").unwrap();

        let removed = prune_empty_parents(root, &root.join("a/b/c/gone.md")).await;

        assert_eq!(removed, vec!["a/b/c".to_string(), "a/b".to_string()]);
        assert!(!root.join("a/b").exists());
        assert!(root.join("a").exists());

        std::fs::remove_file(root.join("a/keep.md")).unwrap();
        let removed = prune_empty_parents(root, &root.join("a/gone.md")).await;
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(!root.join("a").exists());
        assert!(root.exists());
    }

    #[tokio::test]
    async fn test_create_parents_reports_only_new_directories() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a")).unwrap();

        let created = create_parents(root, &root.join("a/b/c/new.md")).await.unwrap();
        assert_eq!(created, vec!["a/b/c".to_string(), "a/b".to_string()]);
        assert!(root.join("a/b/c").is_dir());

        let created = create_parents(root, &root.join("a/b/c/other.md")).await.unwrap();
        assert!(created.is_empty());
        assert!(create_parents(root, &root.join("top.md")).await.unwrap().is_empty());
    }
}
