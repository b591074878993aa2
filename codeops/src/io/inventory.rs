//! Repository inventory shown to the planner.

use std::path::Path;

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

const SKIP_DIRS: [&str; 10] = [
    ".git",
    ".venv",
    ".mypy_cache",
    ".pytest_cache",
    "node_modules",
    "dist",
    "build",
    "target",
    ".idea",
    ".vscode",
];

const INCLUDE_SUFFIXES: [&str; 12] = [
    ".py", ".ts", ".js", ".java", ".md", ".yml", ".yaml", ".toml", ".json", ".xml", ".gradle", ".rs",
];

pub const DEFAULT_MAX_FILES: usize = 250;

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref())
}

/// Sorted repo-relative paths of source-like files, at most `max_files`.
///
/// Hidden directories and common tool/build directories are not descended.
pub fn scan_repo(repo_dir: &Path, max_files: usize) -> Vec<String> {
    let mut out = Vec::new();
    let walker = WalkDir::new(repo_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(err = %err, "skipping unreadable inventory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !INCLUDE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(repo_dir) else {
            continue;
        };
        out.push(rel.to_string_lossy().replace('\\', "/"));
        if out.len() >= max_files {
            debug!(max_files, "inventory capped");
            break;
        }
    }
    out
}

/// Newline-joined [`scan_repo`] output, as embedded in the planning prompt.
pub fn inventory_text(repo_dir: &Path, max_files: usize) -> String {
    scan_repo(repo_dir, max_files).join("\n")
}
