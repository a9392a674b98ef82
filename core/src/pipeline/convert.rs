use super::{with_passphrase, ConversionPipeline, Job, PipelineOutcome};
use crate::artifact::{copy_tree, remove_path, TemporaryArtifact};
use crate::events::{EventSink, Stage};
use crate::icon::find_app_bundle;
use crate::process::Invocation;
use crate::request::{ConversionRequest, Direction, ImageFormat, Passphrase};
use crate::DmgError;
use std::path::{Path, PathBuf};

const SECTOR_SIZE: u64 = 512;

/// `(min, current, max)` sector counts from `hdiutil resize -limits`.
pub(crate) fn parse_resize_limits(stdout: &str) -> Option<(u64, u64, u64)> {
    stdout.lines().find_map(|line| {
        let numbers: Vec<u64> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        match numbers[..] {
            [min, current, max, ..] => Some((min, current, max)),
            _ => None,
        }
    })
}

impl ConversionPipeline {
    /// `hdiutil convert` arguments; compressed output carries the zlib level.
    /// An encrypted source yields an encrypted result under the same
    /// passphrase.
    pub fn conversion_invocation(
        &self,
        source: &Path,
        format: ImageFormat,
        destination: &Path,
        passphrase: &Passphrase,
    ) -> Invocation {
        let mut invocation = self
            .registry
            .hdiutil()
            .arg("convert")
            .arg_path(source)
            .args(["-format", format.as_arg(), "-o"])
            .arg_path(destination);
        if format == ImageFormat::Compressed {
            invocation = invocation
                .arg("-imagekey")
                .arg(format!("zlib-level={}", self.settings.compression_level));
        }
        self.with_encryption(invocation, passphrase)
    }

    /// Change an image between writable and compressed read-only form.
    pub async fn convert(&self, request: &ConversionRequest, sink: &dyn EventSink) -> PipelineOutcome {
        let mut job = self.job(sink);
        job.enter(Stage::Validate, "Checking request");
        if let Err(e) = request.validate() {
            return self.finish(job, Err(e)).await;
        }
        let _guards = self
            .locks
            .acquire(&[request.source.as_path(), request.destination.as_path()])
            .await;

        let result = self.run_convert(&mut job, request).await;
        self.finish(job, result).await
    }

    async fn run_convert(&self, job: &mut Job<'_>, request: &ConversionRequest) -> Result<PathBuf, DmgError> {
        job.enter(Stage::Detach, format!("Checking mounts for {}", request.source.display()));
        if !self.registry.ensure_detached(&request.source, &job.reporter).await {
            return Err(DmgError::MountBusy(request.source.clone()));
        }
        self.clear_destination(job, &request.destination).await?;

        match request.direction {
            Direction::WritableToReadOnly if request.embed_app_icon => self.convert_with_icon(job, request).await,
            Direction::WritableToReadOnly => {
                self.compress(job, Stage::Convert, &request.source, &request.destination, &request.passphrase)
                    .await
            }
            Direction::ReadOnlyToWritable => {
                if request.embed_app_icon {
                    job.reporter
                        .info(Stage::Convert, "Icon embedding only applies when making an image read-only");
                }
                self.expand(job, request).await
            }
        }
    }

    /// Make sure nothing holds the destination, then delete it.
    pub(super) async fn clear_destination(&self, job: &mut Job<'_>, destination: &Path) -> Result<(), DmgError> {
        if !destination.exists() {
            return Ok(());
        }
        if !self.registry.ensure_detached(destination, &job.reporter).await {
            return Err(DmgError::MountBusy(destination.to_path_buf()));
        }
        remove_path(destination)?;
        job.reporter
            .info(Stage::Detach, format!("Existing destination removed: {}", destination.display()));
        Ok(())
    }

    pub(super) async fn compress(
        &self,
        job: &mut Job<'_>,
        stage: Stage,
        source: &Path,
        destination: &Path,
        passphrase: &Passphrase,
    ) -> Result<PathBuf, DmgError> {
        job.enter(stage, format!("Compressing {}", source.display()));
        let invocation = self.conversion_invocation(source, ImageFormat::Compressed, destination, passphrase);
        self.run_stage(job, stage, invocation).await?;
        Ok(destination.to_path_buf())
    }

    /// Writable copy of a read-only image, grown by the configured
    /// increment. A failed resize leaves the image at its original size.
    async fn expand(&self, job: &mut Job<'_>, request: &ConversionRequest) -> Result<PathBuf, DmgError> {
        job.enter(Stage::Convert, format!("Converting {} to writable", request.source.display()));
        let invocation = self.conversion_invocation(
            &request.source,
            ImageFormat::ReadWrite,
            &request.destination,
            &request.passphrase,
        );
        self.run_stage(job, Stage::Convert, invocation).await?;

        if self.settings.resize_increment_bytes > 0 {
            if let Err(e) = self.grow(job, &request.destination, &request.passphrase).await {
                job.warn(Stage::Resize, e);
            }
        }
        Ok(request.destination.clone())
    }

    async fn grow(&self, job: &mut Job<'_>, image: &Path, passphrase: &Passphrase) -> Result<(), DmgError> {
        job.enter(Stage::Resize, format!("Enlarging {}", image.display()));
        let limits = self.registry.hdiutil().args(["resize", "-limits"]);
        let limits = with_passphrase(limits, passphrase).arg_path(image);
        let output = self.run_stage(job, Stage::Resize, limits).await?;
        let (_, current, max) = parse_resize_limits(&output.stdout).ok_or_else(|| DmgError::UnexpectedOutput {
            program: "hdiutil".to_string(),
            detail: "no size limits in resize output".to_string(),
        })?;

        let increment = self.settings.resize_increment_bytes.div_ceil(SECTOR_SIZE);
        let target = current.saturating_add(increment).min(max.max(current));
        let resize = self
            .registry
            .hdiutil()
            .args(["resize", "-size"])
            .arg(format!("{}b", target));
        let resize = with_passphrase(resize, passphrase).arg_path(image);
        self.run_stage(job, Stage::Resize, resize).await?;
        job.reporter
            .succeeded(Stage::Resize, format!("Image enlarged to {} sectors", target));
        Ok(())
    }

    async fn convert_with_icon(&self, job: &mut Job<'_>, request: &ConversionRequest) -> Result<PathBuf, DmgError> {
        let Some(bundle) = self.extract_app_bundle(job, request).await else {
            job.warn(Stage::LocateBundle, DmgError::IconNotFound(request.source.clone()));
            return self
                .compress(job, Stage::Convert, &request.source, &request.destination, &request.passphrase)
                .await;
        };

        let output = self.compact(job, request, &bundle).await?;

        if output.exists() {
            job.enter(Stage::FileIcon, format!("Setting icon of {}", output.display()));
            if let Err(e) = self.icons.embed_file_icon(&bundle, &output, &job.reporter).await {
                job.warnings.push(e);
            }
        }
        Ok(output)
    }

    /// Copy the first application bundle out of the source image. The
    /// copy lives in the temporary directory until the job is swept.
    async fn extract_app_bundle(&self, job: &mut Job<'_>, request: &ConversionRequest) -> Option<PathBuf> {
        job.enter(Stage::LocateBundle, "Looking for an application bundle");
        let reporter = job.reporter;
        let mount = match self
            .registry
            .attach(&request.source, true, &request.passphrase, &reporter)
            .await
        {
            Ok(Some(mount)) => mount,
            Ok(None) => {
                reporter.warn(Stage::LocateBundle, "Source attached without a mount point");
                return None;
            }
            Err(e) => {
                reporter.warn(Stage::LocateBundle, format!("Could not attach source: {}", e));
                return None;
            }
        };
        let mounted = TemporaryArtifact::Mount(mount.clone());
        job.ledger.track(mounted.clone());
        reporter.info(Stage::LocateBundle, format!("Temporarily mounted: {}", mount.display()));

        let copy = match find_app_bundle(&mount) {
            Some(app) => {
                reporter.info(Stage::LocateBundle, format!("Found {}", app.display()));
                let copy = job.ledger.temp_path("temp_app_for_icon", Some("app"));
                job.ledger.track(TemporaryArtifact::Directory(copy.clone()));
                match copy_tree(&app, &copy) {
                    Ok(()) => Some(copy),
                    Err(e) => {
                        reporter.warn(Stage::LocateBundle, format!("Could not copy bundle: {}", e));
                        None
                    }
                }
            }
            None => {
                reporter.info(Stage::LocateBundle, "No application bundle on the volume");
                None
            }
        };

        self.release_tracked_mount(job, &mount).await;
        copy
    }

    /// Detach a mount this job attached and drop it from the ledger. A mount
    /// that resists stays tracked for the final sweep.
    pub(super) async fn release_tracked_mount(&self, job: &mut Job<'_>, mount: &Path) {
        match self.registry.release_mount(mount).await {
            Ok(()) => {
                job.ledger.release(&TemporaryArtifact::Mount(mount.to_path_buf()));
                job.reporter.info(job.stage, format!("Detached {}", mount.display()));
            }
            Err(e) => job
                .reporter
                .warn(job.stage, format!("Could not detach {}: {}", mount.display(), e)),
        }
    }
}
