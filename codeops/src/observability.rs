//! In-memory run tracker polled by status consumers.
//!
//! One [`Observability`] holds the state of the current (single) run: status,
//! current stage, stage timeline and message log. Every mutation and every
//! [`Observability::snapshot`] goes through the same mutex, so a poller never
//! sees a half-written timeline entry.
//!
//! The tracker also mirrors the run into `tracing` spans: a root
//! `run_requirement_pipeline` span and one `stage` child span per stage, with
//! events for previews, messages, and run completion.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, info, info_span};

use crate::core::text::{ELLIPSIS, truncate_chars};

/// Default bound on stage previews, in characters.
pub const PREVIEW_LIMIT_CHARS: usize = 1024;
/// Default bound on message content, in characters.
pub const MESSAGE_LIMIT_CHARS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Timing record for one stage. `end`/`duration` are set once the stage ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub stage: String,
    /// Unix seconds.
    pub start: f64,
    pub end: Option<f64>,
    /// Seconds, rounded to milliseconds.
    pub duration: Option<f64>,
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    /// Unix seconds.
    pub time: f64,
}

/// Owned copy of the tracker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub timeline: Vec<TimelineEntry>,
    pub conversation: Vec<Message>,
    pub started_at: Option<f64>,
    pub finished_at: Option<f64>,
    pub duration: Option<f64>,
}

/// Size bounds applied to previews and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub preview_chars: usize,
    pub message_chars: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            preview_chars: PREVIEW_LIMIT_CHARS,
            message_chars: MESSAGE_LIMIT_CHARS,
        }
    }
}

struct State {
    status: RunStatus,
    current_stage: Option<String>,
    timeline: Vec<TimelineEntry>,
    conversation: Vec<Message>,
    started_at: Option<f64>,
    finished_at: Option<f64>,
    run_span: Option<Span>,
    stage_span: Option<Span>,
}

impl State {
    fn idle() -> Self {
        Self {
            status: RunStatus::Idle,
            current_stage: None,
            timeline: Vec::new(),
            conversation: Vec::new(),
            started_at: None,
            finished_at: None,
            run_span: None,
            stage_span: None,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            status: self.status,
            current_stage: self.current_stage.clone(),
            timeline: self.timeline.clone(),
            conversation: self.conversation.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration: match (self.started_at, self.finished_at) {
                (Some(start), Some(end)) => Some(round_millis(end - start)),
                _ => None,
            },
        }
    }
}

/// Thread-safe tracker for the current pipeline run.
pub struct Observability {
    limits: Limits,
    state: Mutex<State>,
}

impl Default for Observability {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl Observability {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::idle()),
        }
    }

    // A panic while holding the lock leaves the state structurally valid, so
    // poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset to idle, closing any open spans.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = State::idle();
    }

    /// Reset all state and mark a new run as running.
    pub fn start_run(&self) {
        let mut state = self.lock();
        // Spans left open by an aborted run end when dropped here.
        state.stage_span.take();
        state.run_span.take();
        *state = State::idle();

        let span = info_span!("run_requirement_pipeline", app.status = "running");
        state.started_at = Some(now());
        state.status = RunStatus::Running;
        state.run_span = Some(span);
        debug!("run started");
    }

    /// Record the start of a stage and make it current.
    pub fn stage_start(&self, name: &str) {
        let mut state = self.lock();
        if let Some(previous) = state.stage_span.take() {
            debug!(parent: &previous, "stage span closed by next stage_start");
        }

        let start = now();
        state.current_stage = Some(name.to_string());
        state.timeline.push(TimelineEntry {
            stage: name.to_string(),
            start,
            end: None,
            duration: None,
            preview: None,
        });

        let span = match &state.run_span {
            Some(run) => info_span!(parent: run, "stage", stage.name = %name),
            None => info_span!("stage", stage.name = %name),
        };
        info!(parent: &span, stage = %name, "stage started");
        state.stage_span = Some(span);
    }

    /// Close the stage `name`.
    ///
    /// Timing is filled in only when the most recent timeline entry is `name`;
    /// a mismatched name leaves existing entries untouched. Either way the
    /// open stage span is closed and the current stage cleared.
    pub fn stage_end(&self, name: &str, preview: Option<&str>) {
        let mut state = self.lock();
        let end = now();
        let preview = preview.map(|p| truncate_chars(p, self.limits.preview_chars, ELLIPSIS));

        let mut matched = false;
        if let Some(entry) = state.timeline.last_mut()
            && entry.stage == name
            && entry.end.is_none()
        {
            entry.end = Some(end);
            entry.duration = Some(round_millis(end - entry.start));
            entry.preview = preview.clone();
            matched = true;
        }

        if let Some(span) = state.stage_span.take() {
            if let Some(text) = &preview {
                info!(parent: &span, preview = %text, "stage preview");
            }
            info!(parent: &span, stage = %name, matched, "stage ended");
        }
        if !matched {
            debug!(stage = %name, "stage_end did not match the open timeline entry");
        }
        state.current_stage = None;
    }

    /// Append a message to the conversation log, truncating long content.
    pub fn add_message(&self, role: &str, content: &str) {
        let mut state = self.lock();
        let content_chars = content.chars().count();
        let content = truncate_chars(content, self.limits.message_chars, ELLIPSIS);
        if let Some(span) = state.stage_span.as_ref().or(state.run_span.as_ref()) {
            info!(parent: span, role = %role, content = %content, "message");
        }
        state.conversation.push(Message {
            role: role.to_string(),
            content,
            time: now(),
        });
        debug!(role = %role, chars = content_chars, "conversation message added");
    }

    /// Close any open stage and set the final status.
    pub fn finish_run(&self, status: RunStatus) {
        let mut state = self.lock();
        let finished = now();

        if let Some(span) = state.stage_span.take() {
            info!(parent: &span, "stage ended on finish");
            if let Some(entry) = state.timeline.last_mut()
                && entry.end.is_none()
            {
                entry.end = Some(finished);
                entry.duration = Some(round_millis(finished - entry.start));
            }
        }
        state.status = status;
        state.current_stage = None;
        state.finished_at = Some(finished);

        if let Some(span) = state.run_span.take() {
            span.record("app.status", status.as_str());
            let duration_ms = state
                .started_at
                .map(|start| ((finished - start) * 1000.0) as i64)
                .unwrap_or(0);
            info!(parent: &span, status = status.as_str(), duration_ms, "run finished");
        }
        debug!(status = status.as_str(), "run finished");
    }

    /// Owned copy of the current state.
    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    /// Run `op`, recording its outcome in the message log without failing
    /// the caller.
    pub fn best_effort<T, E: std::fmt::Display>(
        &self,
        label: &str,
        op: impl FnOnce() -> Result<T, E>,
    ) -> BestEffort<T> {
        match op() {
            Ok(value) => {
                self.record_outcome(label, Ok(()));
                BestEffort::Ok(value)
            }
            Err(err) => {
                let reason = err.to_string();
                self.record_outcome(label, Err(&reason));
                BestEffort::Failed(reason)
            }
        }
    }

    /// Record the outcome of a best-effort operation that already ran.
    pub fn record_outcome(&self, label: &str, outcome: Result<(), &str>) {
        match outcome {
            Ok(()) => self.add_message("system", &format!("{label}: ok")),
            Err(reason) => {
                tracing::warn!(op = label, err = %reason, "best-effort operation failed");
                self.add_message("system", &format!("{label}: failed: {reason}"));
            }
        }
    }
}

/// Outcome of an operation whose failure must not abort the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort<T> {
    Ok(T),
    Failed(String),
}

impl<T> BestEffort<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Failed(_) => None,
        }
    }
}

fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}
