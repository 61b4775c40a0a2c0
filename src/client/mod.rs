//! Client side of a build: the step state machine and the streaming driver.
//!
//! [`BuildState`] is a pure projection of the event stream. It owns the five
//! visible step rows, the generated-code transcript and the terminal outcome.
//! [`stream::BuildClient`] feeds it from a live `POST /build` response.
//!
//! Rows are keyed by event kind. An event advances the nearest row at or
//! before its position in the fixed event order: earlier rows become done,
//! that row becomes active, later rows are left alone. Once the phase leaves
//! `Building` nothing is applied any more.

pub mod stream;

use crate::protocol::{BuildEvent, EventKind};
use serde_json::Value;

/// Event kinds that own a visible step row, in display order.
pub const STEP_ROWS: [EventKind; 5] = [
    EventKind::SandboxInitStart,
    EventKind::DepsInstallStart,
    EventKind::AgentStart,
    EventKind::ServerStart,
    EventKind::BuildComplete,
];

/// Human label for an event kind.
pub fn step_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::SandboxInitStart => "Creating sandbox environment",
        EventKind::SandboxInitProgress => "Setting up sandbox",
        EventKind::SandboxInitComplete => "Sandbox ready",
        EventKind::DepsInstallStart => "Installing dependencies",
        EventKind::DepsInstallComplete => "Dependencies installed",
        EventKind::AgentStart => "AI is generating your widget",
        EventKind::AgentMessage => "Writing code",
        EventKind::AgentComplete => "Code generation complete",
        EventKind::ServerStart => "Starting preview server",
        EventKind::BuildComplete => "Build complete",
        EventKind::BuildError => "Build failed",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildPhase {
    #[default]
    Idle,
    Building,
    Completed,
    Failed,
    Cancelled,
}

impl BuildPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildPhase::Completed | BuildPhase::Failed | BuildPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Active,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub kind: EventKind,
    pub message: String,
    pub status: StepStatus,
}

fn initial_steps() -> Vec<BuildStep> {
    STEP_ROWS
        .iter()
        .map(|&kind| BuildStep {
            kind,
            message: step_label(kind).to_string(),
            status: StepStatus::Pending,
        })
        .collect()
}

/// Everything a renderer needs about one build attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildState {
    pub phase: BuildPhase,
    pub steps: Vec<BuildStep>,
    /// Text of every assistant turn so far. Only ever appended to.
    pub transcript: String,
    /// Latest one-line status.
    pub status_line: String,
    pub preview_url: Option<String>,
    pub sandbox_id: Option<String>,
    pub error: Option<String>,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            phase: BuildPhase::Idle,
            steps: initial_steps(),
            transcript: String::new(),
            status_line: String::new(),
            preview_url: None,
            sandbox_id: None,
            error: None,
        }
    }
}

impl BuildState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new attempt and enter `Building`.
    pub fn begin(&mut self) {
        *self = Self {
            phase: BuildPhase::Building,
            ..Self::default()
        };
    }

    pub fn active_step(&self) -> Option<&BuildStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Active)
    }

    /// Apply one event. Returns false when the event was ignored because the
    /// build is not in progress.
    pub fn apply(&mut self, event: &BuildEvent) -> bool {
        if self.phase != BuildPhase::Building {
            return false;
        }

        match event {
            BuildEvent::BuildError { error, sandbox_id } => {
                if let Some(id) = sandbox_id {
                    self.sandbox_id = Some(id.clone());
                }
                self.fail_active(error);
                self.status_line = step_label(EventKind::BuildError).to_string();
            }
            BuildEvent::BuildComplete {
                sandbox_id,
                preview_url,
            } => {
                self.sandbox_id = Some(sandbox_id.clone());
                self.preview_url = Some(preview_url.clone());
                for step in &mut self.steps {
                    step.status = StepStatus::Done;
                }
                self.status_line = step_label(EventKind::BuildComplete).to_string();
                self.phase = BuildPhase::Completed;
            }
            BuildEvent::AgentMessage(message) => {
                self.advance(EventKind::AgentMessage);
                self.apply_agent_message(message);
            }
            other => {
                if let BuildEvent::SandboxInitComplete { sandbox_id, .. } = other {
                    self.sandbox_id = Some(sandbox_id.clone());
                }
                self.advance(other.kind());
                self.status_line = step_label(other.kind()).to_string();
            }
        }
        true
    }

    /// Apply a batch, stopping at the first terminal event.
    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a BuildEvent>) {
        for event in events {
            self.apply(event);
            if self.phase.is_terminal() {
                break;
            }
        }
    }

    /// User cancel. Steps keep their statuses. Returns false when the build
    /// had already finished.
    pub fn cancel(&mut self) -> bool {
        if self.phase != BuildPhase::Building {
            return false;
        }
        self.phase = BuildPhase::Cancelled;
        true
    }

    /// Fail the build for a reason observed by the client itself (transport
    /// error, truncated stream).
    pub fn fail_locally(&mut self, message: &str) -> bool {
        if self.phase != BuildPhase::Building {
            return false;
        }
        self.fail_active(message);
        true
    }

    fn fail_active(&mut self, message: &str) {
        for step in &mut self.steps {
            if step.status == StepStatus::Active {
                step.status = StepStatus::Error;
                step.message = message.to_string();
            }
        }
        self.error = Some(message.to_string());
        self.phase = BuildPhase::Failed;
    }

    fn advance(&mut self, kind: EventKind) {
        let Some(position) = kind.order() else {
            return;
        };
        let Some(row) = self
            .steps
            .iter()
            .rposition(|s| s.kind.order().is_some_and(|p| p <= position))
        else {
            return;
        };
        // Late events for an earlier row never pull the active step back.
        if self.steps[row + 1..]
            .iter()
            .any(|s| s.status != StepStatus::Pending)
        {
            return;
        }
        for step in &mut self.steps[..row] {
            step.status = StepStatus::Done;
        }
        self.steps[row].status = StepStatus::Active;
    }

    fn apply_agent_message(&mut self, message: &Value) {
        match message.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let Some(content) = message.pointer("/message/content").and_then(Value::as_array)
                else {
                    self.status_line = message.to_string();
                    return;
                };
                for block in content {
                    if block.get("type").and_then(Value::as_str) == Some("text") {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            self.transcript.push_str(text);
                        }
                    }
                }
                self.status_line = step_label(EventKind::AgentMessage).to_string();
            }
            Some("result") => {
                self.status_line = step_label(EventKind::AgentComplete).to_string();
            }
            _ => self.status_line = message.to_string(),
        }
    }
}
