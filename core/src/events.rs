//! Progress events emitted while a request runs.
//!
//! The event stream is the human-facing side channel. Success or failure of
//! a request is read from the returned `PipelineOutcome`, never by scanning
//! messages.

use crate::process::{Invocation, ProcessResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Validate,
    Detach,
    Attach,
    Create,
    LocateBundle,
    Recreate,
    Compact,
    Convert,
    Resize,
    VolumeIcon,
    FileIcon,
    Cleanup,
    Done,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EventStatus {
    Started,
    /// A reproducible command line about to run.
    Command,
    /// Text a tool printed.
    Output,
    Info,
    Warning,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub status: EventStatus,
    pub message: String,
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            message: message.into(),
            exit_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.stage == Stage::Done
            && matches!(self.status, EventStatus::Succeeded | EventStatus::Failed)
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// A dropped receiver only means nobody is listening any more.
impl EventSink for UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

/// Thin helper over a sink that also mirrors every event to `tracing`.
#[derive(Clone, Copy)]
pub struct Reporter<'a> {
    sink: &'a dyn EventSink,
}

impl<'a> Reporter<'a> {
    pub fn new(sink: &'a dyn EventSink) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: ProgressEvent) {
        match event.status {
            EventStatus::Warning => {
                tracing::warn!(stage = ?event.stage, "{}", event.message)
            }
            EventStatus::Failed => {
                tracing::error!(stage = ?event.stage, exit_code = ?event.exit_code, "{}", event.message)
            }
            EventStatus::Output | EventStatus::Command => {
                tracing::debug!(stage = ?event.stage, "{}", event.message)
            }
            _ => tracing::info!(stage = ?event.stage, "{}", event.message),
        }
        self.sink.emit(event);
    }

    pub fn started(&self, stage: Stage, message: impl Into<String>) {
        self.emit(ProgressEvent::new(stage, EventStatus::Started, message));
    }

    pub fn info(&self, stage: Stage, message: impl Into<String>) {
        self.emit(ProgressEvent::new(stage, EventStatus::Info, message));
    }

    pub fn warn(&self, stage: Stage, message: impl Into<String>) {
        self.emit(ProgressEvent::new(stage, EventStatus::Warning, message));
    }

    pub fn succeeded(&self, stage: Stage, message: impl Into<String>) {
        self.emit(ProgressEvent::new(stage, EventStatus::Succeeded, message));
    }

    pub fn failed(&self, stage: Stage, message: impl Into<String>, exit_code: Option<i32>) {
        let mut event = ProgressEvent::new(stage, EventStatus::Failed, message);
        event.exit_code = exit_code;
        self.emit(event);
    }

    pub fn command(&self, stage: Stage, invocation: &Invocation) {
        self.emit(ProgressEvent::new(
            stage,
            EventStatus::Command,
            format!("$ {}", invocation.printable()),
        ));
    }

    /// Forward whatever the tool printed, stdout first.
    pub fn output(&self, stage: Stage, result: &ProcessResult) {
        for text in [&result.stdout, &result.stderr] {
            let text = text.trim();
            if !text.is_empty() {
                self.emit(
                    ProgressEvent::new(stage, EventStatus::Output, text).with_exit_code(result.status),
                );
            }
        }
    }
}
