//! Requirement loading: source text → YAML → schema → typed model → checks.

use std::fs;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::requirement::Requirement;
use crate::core::types::{FieldError, describe_field_errors};
use crate::io::schema::REQUIREMENT;

/// Which part of loading failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    /// The source could not be read.
    Load,
    /// The text is not a YAML mapping.
    Parse,
    /// The document does not describe a valid requirement.
    Validate,
}

impl LoadPhase {
    /// Name reported as `where` in pipeline results.
    pub fn stage_name(self) -> &'static str {
        match self {
            Self::Load => "load_requirement",
            Self::Parse => "parse_requirement",
            Self::Validate => "validate_requirement",
        }
    }
}

#[derive(Debug, Error)]
#[error("{}: {message}", phase.stage_name())]
pub struct LoadError {
    pub phase: LoadPhase,
    pub message: String,
    pub errors: Vec<FieldError>,
}

impl LoadError {
    fn new(phase: LoadPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    fn invalid(errors: Vec<FieldError>) -> Self {
        Self {
            phase: LoadPhase::Validate,
            message: format!("requirement is invalid: {}", describe_field_errors(&errors)),
            errors,
        }
    }
}

/// Load a requirement from a file path or from inline YAML text.
///
/// An existing path is read; anything that does not name an existing file is
/// treated as YAML text, except a bare `*.yml`/`*.yaml` name, which is
/// reported as a missing file.
#[instrument(skip_all)]
pub fn load_requirement(source: &str) -> Result<Requirement, LoadError> {
    let raw = read_source(source)?;
    parse_requirement(&raw)
}

/// Parse and validate requirement YAML text.
pub fn parse_requirement(raw: &str) -> Result<Requirement, LoadError> {
    let doc: Value = serde_yaml::from_str(raw)
        .map_err(|err| LoadError::new(LoadPhase::Parse, format!("invalid YAML: {err}")))?;
    if !doc.is_object() {
        return Err(LoadError::new(
            LoadPhase::Parse,
            "requirement document must be a YAML mapping",
        ));
    }

    let errors = REQUIREMENT.field_errors(&doc);
    if !errors.is_empty() {
        warn!(count = errors.len(), "requirement failed schema validation");
        return Err(LoadError::invalid(errors));
    }
    let req: Requirement = serde_json::from_value(doc)
        .map_err(|err| LoadError::invalid(vec![FieldError::new("", err.to_string())]))?;

    let errors = req.check();
    if !errors.is_empty() {
        warn!(count = errors.len(), "requirement failed semantic checks");
        return Err(LoadError::invalid(errors));
    }
    debug!(id = %req.id, branch = %req.branch_name(), "requirement loaded");
    Ok(req)
}

fn read_source(source: &str) -> Result<String, LoadError> {
    if source.trim().is_empty() {
        return Err(LoadError::new(LoadPhase::Load, "requirement source is empty"));
    }
    let path = Path::new(source.trim());
    let single_line = !source.trim().contains('\n');
    if single_line && path.is_file() {
        return fs::read_to_string(path).map_err(|err| {
            LoadError::new(LoadPhase::Load, format!("read {}: {err}", path.display()))
        });
    }
    let looks_like_file = single_line
        && !source.contains(": ")
        && path
            .extension()
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
    if looks_like_file {
        return Err(LoadError::new(
            LoadPhase::Load,
            format!("requirement file not found: {}", path.display()),
        ));
    }
    Ok(source.to_string())
}
