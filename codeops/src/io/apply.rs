//! Apply sanitized file edits to a working tree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::path::contained_join;
use crate::core::types::{ApplySummary, EditAction, FileEdit};

enum Applied {
    Written,
    Deleted,
    Skipped,
}

/// Apply `edits` in order under `repo_dir`.
///
/// Each edit stands alone: a failing edit is logged and listed in
/// `skipped_files`, and the rest still apply. Deleting a missing file is a
/// skip, so re-applying the same edits is harmless.
#[instrument(skip_all, fields(repo_dir = %repo_dir.display(), edits = edits.len()))]
pub fn apply_edits(repo_dir: &Path, edits: &[FileEdit]) -> ApplySummary {
    let mut summary = ApplySummary::default();
    for edit in edits {
        match apply_one(repo_dir, edit) {
            Ok(Applied::Written) => summary.applied_files.push(edit.path.clone()),
            Ok(Applied::Deleted) => {
                summary.applied_files.push(edit.path.clone());
                summary.deleted_files.push(edit.path.clone());
            }
            Ok(Applied::Skipped) => {
                debug!(path = %edit.path, "delete target missing, skipped");
                summary.skipped_files.push(edit.path.clone());
            }
            Err(err) => {
                warn!(action = edit.action.as_str(), path = %edit.path, err = %format!("{err:#}"), "failed to apply edit");
                summary.skipped_files.push(edit.path.clone());
            }
        }
    }
    summary.applied_count = summary.applied_files.len();
    summary.deleted_count = summary.deleted_files.len();
    summary
}

fn apply_one(repo_dir: &Path, edit: &FileEdit) -> Result<Applied> {
    let target = contained_join(repo_dir, &edit.path)?;
    match edit.action {
        EditAction::Delete => {
            if !target.exists() {
                return Ok(Applied::Skipped);
            }
            ensure_inside(repo_dir, &target)?;
            fs::remove_file(&target).with_context(|| format!("delete {}", edit.path))?;
            Ok(Applied::Deleted)
        }
        EditAction::Create | EditAction::Modify => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory for {}", edit.path))?;
            }
            ensure_inside(repo_dir, &target)?;
            fs::write(&target, with_trailing_newline(&edit.content))
                .with_context(|| format!("write {}", edit.path))?;
            Ok(Applied::Written)
        }
    }
}

/// Refuse targets that resolve outside the repo through a symlink, either
/// on a parent directory or on the target file itself.
fn ensure_inside(repo_dir: &Path, target: &Path) -> Result<()> {
    let root = repo_dir
        .canonicalize()
        .with_context(|| format!("resolve repo dir {}", repo_dir.display()))?;
    let parent: PathBuf = match target.parent() {
        Some(parent) => parent
            .canonicalize()
            .with_context(|| format!("resolve {}", parent.display()))?,
        None => return Err(anyhow!("target has no parent")),
    };
    if !parent.starts_with(&root) {
        return Err(anyhow!("refusing to write outside repo: {}", target.display()));
    }
    if let Ok(meta) = fs::symlink_metadata(target)
        && meta.file_type().is_symlink()
    {
        // Dangling links fail to resolve and are refused too.
        let resolved = target
            .canonicalize()
            .with_context(|| format!("resolve symlink {}", target.display()))?;
        if !resolved.starts_with(&root) {
            return Err(anyhow!(
                "refusing to follow symlink outside repo: {}",
                target.display()
            ));
        }
    }
    Ok(())
}

fn with_trailing_newline(content: &str) -> String {
    if content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{content}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(action: EditAction, path: &str, content: &str) -> FileEdit {
        FileEdit {
            action,
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn creates_modifies_and_deletes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("old.txt"), "old\n").expect("seed");
        fs::write(root.join("keep.txt"), "v1\n").expect("seed");

        let summary = apply_edits(
            root,
            &[
                edit(EditAction::Create, "src/pkg/new.py", "print('hi')"),
                edit(EditAction::Modify, "keep.txt", "v2\n"),
                edit(EditAction::Delete, "old.txt", ""),
            ],
        );

        assert_eq!(summary.applied_count, 3);
        assert_eq!(summary.deleted_count, 1);
        assert_eq!(summary.deleted_files, vec!["old.txt"]);
        assert!(summary.skipped_files.is_empty());
        assert_eq!(
            fs::read_to_string(root.join("src/pkg/new.py")).expect("read"),
            "print('hi')\n"
        );
        assert_eq!(fs::read_to_string(root.join("keep.txt")).expect("read"), "v2\n");
        assert!(!root.join("old.txt").exists());
    }

    #[test]
    fn deleting_a_missing_file_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let edits = [edit(EditAction::Delete, "ghost.txt", "")];
        let first = apply_edits(temp.path(), &edits);
        let second = apply_edits(temp.path(), &edits);
        assert_eq!(first.skipped_files, vec!["ghost.txt"]);
        assert_eq!(first, second);
        assert_eq!(first.applied_count, 0);
    }

    #[test]
    fn escaping_paths_are_skipped_without_stopping_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir(&repo).expect("mkdir");

        let summary = apply_edits(
            &repo,
            &[
                edit(EditAction::Create, "../outside.txt", "x"),
                edit(EditAction::Create, "inside.txt", "y"),
            ],
        );
        assert_eq!(summary.skipped_files, vec!["../outside.txt"]);
        assert_eq!(summary.applied_files, vec!["inside.txt"]);
        assert!(!temp.path().join("outside.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_cannot_escape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        let outside = temp.path().join("outside");
        fs::create_dir(&repo).expect("mkdir");
        fs::create_dir(&outside).expect("mkdir");
        std::os::unix::fs::symlink(&outside, repo.join("link")).expect("symlink");

        let summary = apply_edits(&repo, &[edit(EditAction::Create, "link/pwned.txt", "x")]);
        assert_eq!(summary.skipped_files, vec!["link/pwned.txt"]);
        assert!(!outside.join("pwned.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_file_pointing_outside_is_not_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        let secret = temp.path().join("secret.txt");
        fs::create_dir(&repo).expect("mkdir");
        fs::write(&secret, "keep\n").expect("seed");
        std::os::unix::fs::symlink(&secret, repo.join("config.txt")).expect("symlink");

        let summary = apply_edits(
            &repo,
            &[
                edit(EditAction::Modify, "config.txt", "overwritten"),
                edit(EditAction::Delete, "config.txt", ""),
            ],
        );
        assert_eq!(summary.skipped_files, vec!["config.txt", "config.txt"]);
        assert_eq!(summary.applied_count, 0);
        assert_eq!(fs::read_to_string(&secret).expect("read"), "keep\n");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_file_inside_repo_is_written_through() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir(&repo).expect("mkdir");
        fs::write(repo.join("real.txt"), "v1\n").expect("seed");
        std::os::unix::fs::symlink(repo.join("real.txt"), repo.join("alias.txt"))
            .expect("symlink");

        let summary = apply_edits(&repo, &[edit(EditAction::Modify, "alias.txt", "v2")]);
        assert_eq!(summary.applied_files, vec!["alias.txt"]);
        assert_eq!(fs::read_to_string(repo.join("real.txt")).expect("read"), "v2\n");
    }

    #[test]
    fn reapplying_create_and_modify_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("keep.txt"), "v1\n").expect("seed");
        let edits = [
            edit(EditAction::Create, "src/app.py", "def greet():\n    return 'hi'"),
            edit(EditAction::Modify, "keep.txt", "v2"),
            edit(EditAction::Delete, "gone.txt", ""),
        ];

        let first = apply_edits(root, &edits);
        let app_after_first = fs::read_to_string(root.join("src/app.py")).expect("read");
        let keep_after_first = fs::read_to_string(root.join("keep.txt")).expect("read");

        let second = apply_edits(root, &edits);
        assert_eq!(first, second);
        assert_eq!(first.applied_files, vec!["src/app.py", "keep.txt"]);
        assert_eq!(first.skipped_files, vec!["gone.txt"]);
        assert_eq!(
            fs::read_to_string(root.join("src/app.py")).expect("read"),
            app_after_first
        );
        assert_eq!(
            fs::read_to_string(root.join("keep.txt")).expect("read"),
            keep_after_first
        );
        assert_eq!(keep_after_first, "v2\n");
    }
}
