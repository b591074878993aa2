//! Embedded JSON Schemas and field-level validation against them.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::core::types::FieldError;

pub const REQUIREMENT_SCHEMA: &str = include_str!("../../schemas/requirement.schema.json");
pub const CHANGE_PLAN_SCHEMA: &str = include_str!("../../schemas/change_plan.schema.json");
pub const FILE_EDITS_SCHEMA: &str = include_str!("../../schemas/file_edits.schema.json");

/// A compiled schema plus its source, kept so it can be handed to the agent.
pub struct Schema {
    pub name: &'static str,
    pub raw: &'static str,
    validator: Validator,
}

impl Schema {
    pub fn compile(name: &'static str, raw: &'static str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).with_context(|| format!("parse {name} schema"))?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&value)
            .with_context(|| format!("compile {name} schema"))?;
        Ok(Self {
            name,
            raw,
            validator,
        })
    }

    /// Every violation in `instance`, located by JSON pointer.
    pub fn field_errors(&self, instance: &Value) -> Vec<FieldError> {
        self.validator
            .iter_errors(instance)
            .map(|err| FieldError::new(err.instance_path().to_string(), err.to_string()))
            .collect()
    }
}

fn builtin(name: &'static str, raw: &'static str) -> Schema {
    // Embedded schemas are covered by the tests below.
    Schema::compile(name, raw).unwrap()
}

pub static REQUIREMENT: LazyLock<Schema> =
    LazyLock::new(|| builtin("requirement", REQUIREMENT_SCHEMA));
pub static CHANGE_PLAN: LazyLock<Schema> =
    LazyLock::new(|| builtin("change_plan", CHANGE_PLAN_SCHEMA));
pub static FILE_EDITS: LazyLock<Schema> =
    LazyLock::new(|| builtin("file_edits", FILE_EDITS_SCHEMA));
