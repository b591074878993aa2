//! Agent backend for structured generation.
//!
//! The [`Executor`] trait decouples the planning and generation stages from
//! the actual agent (by default an external CLI such as `codex exec`). The
//! agent gets a prompt on stdin plus a JSON Schema, and must write one JSON
//! document to `output_path`. Tests use scripted executors that write
//! predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{FieldError, describe_field_errors};
use crate::io::config::AgentSettings;
use crate::io::process::{CommandOutput, run_command_with_stream};
use crate::io::schema::Schema;

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the agent process (the repository checkout).
    pub workdir: PathBuf,
    pub prompt: String,
    /// JSON Schema the agent output must conform to.
    pub output_schema_path: PathBuf,
    /// Where the agent must write its output JSON.
    pub output_path: PathBuf,
    pub executor_log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// When set, the agent's event stream is written here line by line.
    pub stream_path: Option<PathBuf>,
}

impl ExecRequest {
    /// Request with artifacts laid out under `<job_dir>/agent/<stage>/`.
    pub fn for_stage(
        job_dir: &Path,
        workdir: &Path,
        stage: &str,
        prompt: String,
        settings: &AgentSettings,
        stream: bool,
    ) -> Self {
        let dir = agent_dir(job_dir, stage);
        Self {
            workdir: workdir.to_path_buf(),
            prompt,
            output_schema_path: dir.join("schema.json"),
            output_path: dir.join("output.json"),
            executor_log_path: dir.join("executor.log"),
            timeout: Duration::from_secs(settings.timeout_secs),
            output_limit_bytes: settings.output_limit_bytes,
            stream_path: stream.then(|| dir.join("stream.jsonl")),
        }
    }
}

/// `<job_dir>/agent/<stage>`.
pub fn agent_dir(job_dir: &Path, stage: &str) -> PathBuf {
    job_dir.join("agent").join(stage)
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Run the agent. Must write output to `request.output_path`.
    fn exec(&self, request: &ExecRequest) -> Result<()>;
}

/// Agent output that did not match the requested shape.
#[derive(Debug, Error)]
#[error("{stage} output failed validation: {}", describe_field_errors(.errors))]
pub struct StructuredOutputError {
    pub stage: String,
    pub errors: Vec<FieldError>,
}

/// Executor that spawns an external agent CLI.
///
/// Invoked as `<command...> --output-schema <schema> --output-last-message
/// <output> [--json] <extra_args...> -` with the prompt on stdin.
pub struct CliExecutor {
    command: Vec<String>,
    extra_args: Vec<String>,
}

impl CliExecutor {
    pub fn new(settings: &AgentSettings) -> Self {
        Self {
            command: settings.command.clone(),
            extra_args: settings.extra_args.clone(),
        }
    }

    fn program(&self) -> Result<&str> {
        self.command
            .first()
            .map(String::as_str)
            .ok_or_else(|| anyhow!("agent command is empty"))
    }
}

impl Executor for CliExecutor {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), streaming = request.stream_path.is_some()))]
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        let program = self.program()?;
        info!(program, workdir = %request.workdir.display(), "starting agent");

        if !request.output_schema_path.exists() {
            return Err(anyhow!(
                "missing output schema {}",
                request.output_schema_path.display()
            ));
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..])
            .arg("--output-schema")
            .arg(&request.output_schema_path)
            .arg("--output-last-message")
            .arg(&request.output_path);
        if request.stream_path.is_some() {
            cmd.arg("--json");
        }
        cmd.args(&self.extra_args)
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_command_with_stream(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            request.stream_path.as_deref(),
        )
        .with_context(|| format!("run {program}"))?;

        write_executor_log(&request.executor_log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("{program} timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "{program} failed with status {:?} (see {})",
                output.status.code(),
                request.executor_log_path.display()
            ));
        }
        debug!("agent completed successfully");
        Ok(())
    }
}

/// Run the agent against `schema` and decode its validated output as `T`.
///
/// Output that is missing, not JSON, schema-invalid, or not decodable into
/// `T` is a [`StructuredOutputError`] tagged with `stage`.
#[instrument(skip_all, fields(stage = stage, schema = schema.name))]
pub fn structured_output<T: DeserializeOwned>(
    executor: &dyn Executor,
    request: &ExecRequest,
    schema: &Schema,
    stage: &str,
) -> Result<T> {
    if let Some(parent) = request.output_schema_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent dir {}", parent.display()))?;
    }
    fs::write(&request.output_schema_path, schema.raw).with_context(|| {
        format!("write schema {}", request.output_schema_path.display())
    })?;
    if let Some(dir) = request.output_schema_path.parent() {
        let prompt_path = dir.join("prompt.md");
        fs::write(&prompt_path, &request.prompt)
            .with_context(|| format!("write prompt {}", prompt_path.display()))?;
    }
    // A stale output from an earlier run must not be mistaken for this one.
    if request.output_path.exists() {
        fs::remove_file(&request.output_path)
            .with_context(|| format!("remove stale {}", request.output_path.display()))?;
    }

    executor.exec(request)?;

    let invalid = |errors: Vec<FieldError>| StructuredOutputError {
        stage: stage.to_string(),
        errors,
    };
    let contents = match fs::read_to_string(&request.output_path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(invalid(vec![FieldError::new("", "agent wrote no output")]).into());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", request.output_path.display()));
        }
    };
    let value: Value = serde_json::from_str(&contents)
        .map_err(|err| invalid(vec![FieldError::new("", format!("not valid JSON: {err}"))]))?;

    let errors = schema.field_errors(&value);
    if !errors.is_empty() {
        warn!(count = errors.len(), "agent output failed schema validation");
        return Err(invalid(errors).into());
    }
    let decoded = serde_json::from_value(value)
        .map_err(|err| invalid(vec![FieldError::new("", err.to_string())]))?;
    Ok(decoded)
}

fn write_executor_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    if output.stdout_truncated > 0 {
        buf.push_str(&format!("\n[stdout truncated {} bytes]\n", output.stdout_truncated));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_lossy());
    if output.stderr_truncated > 0 {
        buf.push_str(&format!("\n[stderr truncated {} bytes]\n", output.stderr_truncated));
    }
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChangePlan;
    use crate::io::schema::CHANGE_PLAN;
    use crate::test_support::ScriptedExecutor;
    use serde_json::json;

    fn request(dir: &Path) -> ExecRequest {
        ExecRequest::for_stage(
            dir,
            dir,
            "plan_changes",
            "plan it".to_string(),
            &AgentSettings::default(),
            false,
        )
    }

    #[test]
    fn request_layout_is_per_stage() {
        let req = ExecRequest::for_stage(
            Path::new("/jobs/42"),
            Path::new("/jobs/42/repo"),
            "generate_changes",
            String::new(),
            &AgentSettings::default(),
            true,
        );
        assert_eq!(req.output_path, PathBuf::from("/jobs/42/agent/generate_changes/output.json"));
        assert_eq!(
            req.stream_path,
            Some(PathBuf::from("/jobs/42/agent/generate_changes/stream.jsonl"))
        );
    }

    #[test]
    fn structured_output_decodes_valid_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = ScriptedExecutor::new(vec![json!({
            "summary": "add greet()",
            "touched_files": ["src/app.py"],
        })]);
        let req = request(temp.path());
        let plan: ChangePlan =
            structured_output(&exec, &req, &CHANGE_PLAN, "plan_changes").expect("plan");
        assert_eq!(plan.touched_files, vec!["src/app.py"]);
        assert!(req.output_schema_path.exists());
        assert_eq!(exec.prompts(), vec!["plan it".to_string()]);
    }

    #[test]
    fn schema_violation_is_a_structured_output_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = ScriptedExecutor::new(vec![json!({ "touched_files": "nope" })]);
        let err = structured_output::<ChangePlan>(&exec, &request(temp.path()), &CHANGE_PLAN, "plan_changes")
            .unwrap_err();
        let invalid = err
            .downcast_ref::<StructuredOutputError>()
            .expect("structured output error");
        assert_eq!(invalid.stage, "plan_changes");
        assert!(invalid.errors.len() >= 2);
    }

    #[test]
    fn missing_output_is_a_structured_output_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = ScriptedExecutor::silent();
        let err = structured_output::<ChangePlan>(&exec, &request(temp.path()), &CHANGE_PLAN, "plan_changes")
            .unwrap_err();
        assert!(err.downcast_ref::<StructuredOutputError>().is_some());
        assert!(err.to_string().contains("agent wrote no output"));
    }

    #[test]
    fn cli_executor_passes_schema_and_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Fake agent: copy a fixed answer into the path after --output-last-message.
        let script = temp.path().join("agent.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncat > \"$(dirname \"$0\")/stdin.txt\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = --output-last-message ]; then shift; printf '{\"summary\":\"s\",\"touched_files\":[]}' > \"$1\"; fi\n  shift\ndone\n",
        )
        .expect("write script");
        crate::test_support::make_executable(&script);

        let settings = AgentSettings {
            command: vec![script.display().to_string()],
            ..AgentSettings::default()
        };
        let exec = CliExecutor::new(&settings);
        let req = request(temp.path());
        let plan: ChangePlan =
            structured_output(&exec, &req, &CHANGE_PLAN, "plan_changes").expect("plan");
        assert_eq!(plan.summary, "s");
        let stdin = fs::read_to_string(temp.path().join("stdin.txt")).expect("stdin");
        assert_eq!(stdin, "plan it");
        assert!(req.executor_log_path.exists());
    }
}
