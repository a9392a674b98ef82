/// Test doubles for exercising the pipeline without touching real images
use crate::events::{EventSink, EventStatus, ProgressEvent, Stage};
use crate::process::{Invocation, ProcessExecutor, ProcessResult};
use crate::DmgError;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

type Handler = Box<dyn Fn(&Invocation) -> Result<ProcessResult, DmgError> + Send + Sync>;

/// Executor that never spawns anything: every invocation is recorded and
/// answered by the handler closure.
pub struct ScriptedExecutor {
    handler: Handler,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Invocation) -> Result<ProcessResult, DmgError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Executor where every tool succeeds silently.
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(ProcessResult::new("", "", 0)))
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Invocation) -> bool,
    {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).iter().filter(|inv| predicate(inv)).count()
    }

    /// `hdiutil` invocations whose first argument is `verb`.
    pub fn hdiutil_calls(&self, verb: &str) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|inv| {
                inv.program_name() == "hdiutil" && inv.arg_list().first().map(String::as_str) == Some(verb)
            })
            .cloned()
            .collect()
    }

    fn answer(&self, invocation: &Invocation) -> Result<ProcessResult, DmgError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(invocation.clone());
        (self.handler)(invocation)
    }
}

#[async_trait]
impl ProcessExecutor for ScriptedExecutor {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessResult, DmgError> {
        self.answer(invocation)
    }

    fn run_blocking(&self, invocation: &Invocation) -> Result<ProcessResult, DmgError> {
        self.answer(invocation)
    }
}

/// Sink that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.message).collect()
    }

    pub fn terminal(&self) -> Option<ProgressEvent> {
        self.events().into_iter().rev().find(ProgressEvent::is_terminal)
    }

    pub fn count(&self, stage: Stage, status: EventStatus) -> usize {
        self.events()
            .iter()
            .filter(|e| e.stage == stage && e.status == status)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// `plutil`-converted `hdiutil info` output listing the given images as
/// `(image path, device nodes, mount points)`.
pub fn info_json(images: &[(&str, &[&str], &[&str])]) -> String {
    let images: Vec<serde_json::Value> = images
        .iter()
        .map(|(path, devices, mounts)| {
            let mut entities: Vec<serde_json::Value> = devices
                .iter()
                .map(|dev| serde_json::json!({ "dev-entry": dev }))
                .collect();
            for (entity, mount) in entities.iter_mut().rev().zip(mounts.iter()) {
                entity["mount-point"] = serde_json::json!(mount);
            }
            if devices.is_empty() {
                entities.extend(mounts.iter().map(|m| serde_json::json!({ "mount-point": m })));
            }
            serde_json::json!({ "image-path": path, "system-entities": entities })
        })
        .collect();
    serde_json::json!({ "images": images }).to_string()
}
