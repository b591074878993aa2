//! Sanitation of model-proposed file edits.
//!
//! Generation output is untrusted: actions outside create/modify/delete are
//! dropped (not fatal), and paths are normalized to repo-relative `/` form.

use serde::{Deserialize, Serialize};

use crate::core::types::{EditAction, FileEdit};

/// Edit exactly as produced by the model, before sanitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFileEdit {
    pub action: String,
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Envelope the generation stage asks the model to return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEditList {
    pub edits: Vec<RawFileEdit>,
}

/// An edit removed during sanitation, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEdit {
    pub action: String,
    pub path: String,
    pub reason: &'static str,
}

/// Normalize a model-provided path: `\` → `/`, strip leading `./` and `/`.
///
/// Dotfiles (`.github/…`) keep their leading dot.
pub fn normalize_edit_path(raw: &str) -> String {
    let mut path = raw.trim().replace('\\', "/");
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest.to_string();
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest.to_string();
        } else {
            break;
        }
    }
    path
}

/// Split raw edits into accepted [`FileEdit`]s and dropped entries.
pub fn sanitize_edits(raw: Vec<RawFileEdit>) -> (Vec<FileEdit>, Vec<DroppedEdit>) {
    let mut kept = Vec::with_capacity(raw.len());
    let mut dropped = Vec::new();
    for edit in raw {
        let Some(action) = EditAction::parse(&edit.action) else {
            dropped.push(DroppedEdit {
                action: edit.action,
                path: edit.path,
                reason: "unsupported action",
            });
            continue;
        };
        let path = normalize_edit_path(&edit.path);
        if path.is_empty() {
            dropped.push(DroppedEdit {
                action: edit.action,
                path: edit.path,
                reason: "empty path",
            });
            continue;
        }
        kept.push(FileEdit {
            action,
            path,
            content: edit.content.unwrap_or_default(),
        });
    }
    (kept, dropped)
}
