//! Pure path helpers: lexical normalization, repo-root containment, and
//! container → host workspace translation for bind mounts.
//!
//! Everything here is lexical, apart from anchoring relative paths at the
//! current directory before a bind-mount translation. Callers that want
//! symlinks resolved should canonicalize before calling in.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathMapError {
    #[error("empty path given for bind mount translation")]
    Empty,
    #[error(
        "path '{path}' is under container workspace '{container_base}', but no host workspace \
         base is configured (set HOST_WORKSPACE_DIR to the matching host directory)"
    )]
    MissingHostBase {
        path: PathBuf,
        container_base: PathBuf,
    },
    #[error("cannot make '{path}' absolute: {message}")]
    Resolve { path: PathBuf, message: String },
}

fn absolute(path: &Path) -> Result<PathBuf, PathMapError> {
    std::path::absolute(path)
        .map(|abs| normalize(&abs))
        .map_err(|err| PathMapError::Resolve {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainmentError {
    #[error("refusing empty path")]
    Empty,
    #[error("refusing absolute path '{0}'")]
    Absolute(String),
    #[error("refusing to write outside repo: '{0}'")]
    Escapes(String),
}

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component. `..` above the root of an absolute path is dropped.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = match out.components().next_back() {
                    Some(Component::Normal(_)) => out.pop(),
                    _ => false,
                };
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Join a repo-relative path onto `root`, refusing anything that would land
/// outside it.
pub fn contained_join(root: &Path, relative: &str) -> Result<PathBuf, ContainmentError> {
    if relative.trim().is_empty() {
        return Err(ContainmentError::Empty);
    }
    let rel = Path::new(relative);
    if rel.has_root() {
        return Err(ContainmentError::Absolute(relative.to_string()));
    }
    let normalized = normalize(rel);
    match normalized.components().next() {
        None => Err(ContainmentError::Escapes(relative.to_string())),
        Some(Component::ParentDir) => Err(ContainmentError::Escapes(relative.to_string())),
        Some(_) => Ok(root.join(normalized)),
    }
}

/// Maps paths seen inside the orchestrator's container onto the host paths
/// the Docker daemon can bind-mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMapping {
    /// Workspace base as seen by this process (e.g. `/workspace/jobs`).
    pub container_base: PathBuf,
    /// Matching base on the Docker host, when running containerized.
    pub host_base: Option<PathBuf>,
}

impl WorkspaceMapping {
    pub fn new(container_base: impl Into<PathBuf>, host_base: Option<PathBuf>) -> Self {
        Self {
            container_base: container_base.into(),
            host_base,
        }
    }

    /// Translate `path` to a host path suitable as a bind-mount source.
    ///
    /// Paths equal to or nested under `container_base` are re-rooted under
    /// `host_base` (component-wise, so `/workspace/jobs2` is not under
    /// `/workspace/jobs`). Other paths are treated as host paths already.
    /// Relative paths and bases are anchored at the current directory first;
    /// the result is always absolute, since Docker reads a relative source
    /// as a volume name.
    pub fn to_host_path(&self, path: &Path) -> Result<PathBuf, PathMapError> {
        if path.as_os_str().is_empty() {
            return Err(PathMapError::Empty);
        }
        let path = absolute(path)?;
        let base = absolute(&self.container_base)?;
        let Ok(suffix) = path.strip_prefix(&base) else {
            return Ok(path);
        };
        let host_base = self
            .host_base
            .as_deref()
            .map(absolute)
            .transpose()?
            .ok_or_else(|| PathMapError::MissingHostBase {
                path: path.clone(),
                container_base: self.container_base.clone(),
            })?;
        if suffix.as_os_str().is_empty() {
            return Ok(host_base);
        }
        Ok(host_base.join(suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> WorkspaceMapping {
        WorkspaceMapping::new("/workspace/jobs", Some(PathBuf::from("/host/jobs")))
    }

    #[test]
    fn base_itself_maps_to_host_base() {
        let mapped = mapping().to_host_path(Path::new("/workspace/jobs")).expect("map");
        assert_eq!(mapped, PathBuf::from("/host/jobs"));
    }

    #[test]
    fn nested_path_is_rerooted() {
        let mapped = mapping()
            .to_host_path(Path::new("/workspace/jobs/42/repo"))
            .expect("map");
        assert_eq!(mapped, PathBuf::from("/host/jobs/42/repo"));
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_nested() {
        let mapped = mapping()
            .to_host_path(Path::new("/workspace/jobs2/x"))
            .expect("map");
        assert_eq!(mapped, PathBuf::from("/workspace/jobs2/x"));
    }

    #[test]
    fn trailing_slash_and_dots_are_normalized() {
        let mapped = mapping()
            .to_host_path(Path::new("/workspace/jobs/./42/../43/repo/"))
            .expect("map");
        assert_eq!(mapped, PathBuf::from("/host/jobs/43/repo"));
    }

    #[test]
    fn unrelated_path_passes_through() {
        let mapped = mapping().to_host_path(Path::new("/srv/checkout")).expect("map");
        assert_eq!(mapped, PathBuf::from("/srv/checkout"));
    }

    #[test]
    fn missing_host_base_fails_fast() {
        let mapping = WorkspaceMapping::new("/workspace/jobs", None);
        let err = mapping
            .to_host_path(Path::new("/workspace/jobs/1/repo"))
            .unwrap_err();
        assert!(matches!(err, PathMapError::MissingHostBase { .. }));
        assert!(err.to_string().contains("HOST_WORKSPACE_DIR"));

        let passthrough = mapping.to_host_path(Path::new("/tmp/other")).expect("map");
        assert_eq!(passthrough, PathBuf::from("/tmp/other"));
    }

    #[test]
    fn relative_paths_come_back_absolute() {
        let cwd = std::env::current_dir().expect("cwd");
        let mapping = WorkspaceMapping::new("/workspace/jobs", None);
        let mapped = mapping.to_host_path(Path::new("jobs/REQ-1/repo")).expect("map");
        assert!(mapped.is_absolute());
        assert_eq!(mapped, normalize(&cwd.join("jobs/REQ-1/repo")));
    }

    #[test]
    fn relative_base_matches_relative_repo_dir() {
        let cwd = std::env::current_dir().expect("cwd");
        let mapping = WorkspaceMapping::new("jobs", Some(PathBuf::from("/host/jobs")));
        let mapped = mapping.to_host_path(Path::new("jobs/REQ-1/repo")).expect("map");
        assert_eq!(mapped, PathBuf::from("/host/jobs/REQ-1/repo"));

        let absolute_repo = cwd.join("jobs/REQ-2/repo");
        let mapped = mapping.to_host_path(&absolute_repo).expect("map");
        assert_eq!(mapped, PathBuf::from("/host/jobs/REQ-2/repo"));
    }

    #[test]
    fn empty_path_is_rejected() {
        assert_eq!(
            mapping().to_host_path(Path::new("")),
            Err(PathMapError::Empty)
        );
    }

    #[test]
    fn contained_join_accepts_nested_paths() {
        let joined = contained_join(Path::new("/repo"), "src/./lib/../main.py").expect("join");
        assert_eq!(joined, PathBuf::from("/repo/src/main.py"));
    }

    #[test]
    fn contained_join_rejects_escapes() {
        let root = Path::new("/repo");
        assert!(matches!(
            contained_join(root, "../etc/passwd"),
            Err(ContainmentError::Escapes(_))
        ));
        assert!(matches!(
            contained_join(root, "a/../../b"),
            Err(ContainmentError::Escapes(_))
        ));
        assert!(matches!(
            contained_join(root, "/etc/passwd"),
            Err(ContainmentError::Absolute(_))
        ));
        assert!(matches!(contained_join(root, "."), Err(ContainmentError::Escapes(_))));
        assert!(matches!(contained_join(root, " "), Err(ContainmentError::Empty)));
    }
}
