//! Request orchestration: creation, conversion, attach and detach.
//!
//! Each stage awaits its process before the next begins. Every temporary
//! artifact is recorded in the job's ledger and swept before the outcome is
//! returned, whichever branch ended the job.

mod compaction;
mod convert;
mod create;

use crate::artifact::ArtifactLedger;
use crate::events::{EventSink, ProgressEvent, Reporter, Stage};
use crate::icon::IconEmbedder;
use crate::mount::{normalize_image_path, MountRegistry, MountedImageEntry};
use crate::process::{Invocation, ProcessExecutor, ProcessResult, SystemExecutor};
use crate::request::{AttachRequest, ConversionRequest, CreationRequest, Passphrase};
use crate::{DmgError, ErrorKind, Settings};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

/// Structured result of one request.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Last stage reached; [`Stage::Done`] on success.
    pub stage: Stage,
    pub output: Option<PathBuf>,
    pub error: Option<DmgError>,
    /// Non-fatal problems, e.g. an icon that could not be applied.
    pub warnings: Vec<DmgError>,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(DmgError::kind)
    }

    pub fn warning_kinds(&self) -> Vec<ErrorKind> {
        self.warnings.iter().map(DmgError::kind).collect()
    }
}

/// State carried through one request.
struct Job<'a> {
    reporter: Reporter<'a>,
    ledger: ArtifactLedger,
    warnings: Vec<DmgError>,
    stage: Stage,
}

impl<'a> Job<'a> {
    fn new(sink: &'a dyn EventSink, temp_root: PathBuf) -> Self {
        Self {
            reporter: Reporter::new(sink),
            ledger: ArtifactLedger::new(temp_root),
            warnings: Vec::new(),
            stage: Stage::Validate,
        }
    }

    fn enter(&mut self, stage: Stage, message: impl Into<String>) {
        self.stage = stage;
        self.reporter.started(stage, message);
    }

    fn warn(&mut self, stage: Stage, error: DmgError) {
        self.reporter.warn(stage, error.to_string());
        self.warnings.push(error);
    }
}

/// Serialises requests that touch the same image.
#[derive(Default)]
struct ImageLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageLocks {
    /// Lock every path, in sorted key order so two requests sharing images
    /// cannot deadlock.
    async fn acquire(&self, paths: &[&Path]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys: Vec<String> = paths.iter().map(|p| normalize_image_path(p)).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = {
                let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
                locks.entry(key).or_default().clone()
            };
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

pub struct ConversionPipeline {
    executor: Arc<dyn ProcessExecutor>,
    settings: Settings,
    registry: Arc<MountRegistry>,
    icons: IconEmbedder,
    locks: ImageLocks,
}

impl ConversionPipeline {
    pub fn new(executor: Arc<dyn ProcessExecutor>, settings: Settings) -> Self {
        let registry = Arc::new(MountRegistry::new(executor.clone(), &settings));
        let icons = IconEmbedder::new(executor.clone(), settings.tools.clone(), registry.clone());
        Self {
            executor,
            settings,
            registry,
            icons,
            locks: ImageLocks::default(),
        }
    }

    /// Pipeline driving the real system tools.
    pub fn system(settings: Settings) -> Self {
        Self::new(Arc::new(SystemExecutor), settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    pub fn icons(&self) -> &IconEmbedder {
        &self.icons
    }

    pub async fn list_mounted_images(&self) -> Result<Vec<MountedImageEntry>, DmgError> {
        self.registry.list_mounted_images().await
    }

    /// `-encryption <cipher> -stdinpass` for a command whose output image
    /// must be protected by `passphrase`.
    fn with_encryption(&self, invocation: Invocation, passphrase: &Passphrase) -> Invocation {
        if passphrase.is_empty() {
            return invocation;
        }
        with_passphrase(
            invocation.args(["-encryption", self.settings.encryption.as_str()]),
            passphrase,
        )
    }

    fn job<'a>(&self, sink: &'a dyn EventSink) -> Job<'a> {
        Job::new(sink, self.settings.temp_dir())
    }

    /// Run one `hdiutil` step: log the command, run it, forward its output,
    /// and fail on a non-zero exit.
    async fn run_stage(
        &self,
        job: &mut Job<'_>,
        stage: Stage,
        invocation: Invocation,
    ) -> Result<ProcessResult, DmgError> {
        job.stage = stage;
        job.reporter.command(stage, &invocation);
        let result = self.executor.run(&invocation).await?;
        job.reporter.output(stage, &result);
        result.check(&invocation.program_name())
    }

    /// Sweep temporary artifacts and emit the terminal event.
    async fn finish(&self, mut job: Job<'_>, result: Result<PathBuf, DmgError>) -> PipelineOutcome {
        let reporter = job.reporter;
        job.ledger.cleanup(&self.registry, &reporter).await;

        match result {
            Ok(output) => {
                reporter.succeeded(Stage::Done, format!("Done: {}", output.display()));
                PipelineOutcome {
                    stage: Stage::Done,
                    output: Some(output),
                    error: None,
                    warnings: job.warnings,
                }
            }
            Err(error) => {
                reporter.failed(Stage::Done, format!("Error: {}", error), error.exit_code());
                PipelineOutcome {
                    stage: job.stage,
                    output: None,
                    error: Some(error),
                    warnings: job.warnings,
                }
            }
        }
    }

    /// Attach an image for inspection, optionally revealing the volume.
    pub async fn attach(&self, request: &AttachRequest, sink: &dyn EventSink) -> PipelineOutcome {
        let mut job = self.job(sink);
        if !request.image.is_file() {
            let err = DmgError::Validation(format!("image does not exist: {}", request.image.display()));
            return self.finish(job, Err(err)).await;
        }
        let _guards = self.locks.acquire(&[request.image.as_path()]).await;

        job.enter(Stage::Attach, format!("Attaching {}", request.image.display()));
        let attached = self
            .registry
            .attach(&request.image, request.read_only, &request.passphrase, &job.reporter)
            .await;
        let result = match attached {
            Ok(Some(mount)) => {
                job.reporter.info(Stage::Attach, format!("Mounted: {}", mount.display()));
                if request.reveal {
                    self.reveal(&mut job, &mount).await;
                }
                Ok(mount)
            }
            Ok(None) => {
                job.reporter.warn(Stage::Attach, "Attached, but no mount point was reported");
                Ok(request.image.clone())
            }
            Err(e) => Err(e),
        };
        self.finish(job, result).await
    }

    async fn reveal(&self, job: &mut Job<'_>, mount: &Path) {
        let invocation = Invocation::new(&self.settings.tools.open).arg("-R").arg_path(mount);
        let executor = self.executor.clone();
        let revealed = tokio::task::spawn_blocking(move || executor.run_blocking(&invocation)).await;
        match revealed {
            Ok(Ok(result)) if result.success() => {}
            Ok(Ok(result)) => job.reporter.warn(Stage::Attach, format!("Could not reveal volume: {}", result.stderr.trim())),
            Ok(Err(e)) => job.reporter.warn(Stage::Attach, format!("Could not reveal volume: {}", e)),
            Err(e) => job.reporter.warn(Stage::Attach, format!("Could not reveal volume: {}", e)),
        }
    }

    /// Release every attachment of `image`.
    pub async fn detach(&self, image: &Path, sink: &dyn EventSink) -> PipelineOutcome {
        let mut job = self.job(sink);
        let _guards = self.locks.acquire(&[image]).await;

        job.enter(Stage::Detach, format!("Checking mounts for {}", image.display()));
        let result = if self.registry.ensure_detached(image, &job.reporter).await {
            Ok(image.to_path_buf())
        } else {
            Err(DmgError::MountBusy(image.to_path_buf()))
        };
        self.finish(job, result).await
    }

    pub fn spawn_create(
        self: &Arc<Self>,
        request: CreationRequest,
    ) -> (UnboundedReceiver<ProgressEvent>, JoinHandle<PipelineOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move { pipeline.create(&request, &tx).await });
        (rx, handle)
    }

    pub fn spawn_convert(
        self: &Arc<Self>,
        request: ConversionRequest,
    ) -> (UnboundedReceiver<ProgressEvent>, JoinHandle<PipelineOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move { pipeline.convert(&request, &tx).await });
        (rx, handle)
    }

    pub fn spawn_attach(
        self: &Arc<Self>,
        request: AttachRequest,
    ) -> (UnboundedReceiver<ProgressEvent>, JoinHandle<PipelineOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move { pipeline.attach(&request, &tx).await });
        (rx, handle)
    }
}

/// Append `-stdinpass` and queue the passphrase for standard input.
fn with_passphrase(invocation: Invocation, passphrase: &Passphrase) -> Invocation {
    match passphrase.stdin_bytes() {
        Some(bytes) => invocation.arg("-stdinpass").stdin(bytes),
        None => invocation,
    }
}
