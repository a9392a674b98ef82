//! Shrinking a writable image before it is compressed.
//!
//! A writable image keeps every block it ever allocated. Compressing it as-is
//! carries deleted data along, so the icon path first rebuilds the image
//! from its mounted contents (or routes it through a sparse image) and only
//! then compresses. Any failure here degrades to compressing the source
//! directly.

use super::{ConversionPipeline, Job};
use crate::artifact::{remove_path, TemporaryArtifact};
use crate::events::Stage;
use crate::icon::VOLUME_ICON_NAME;
use crate::request::{ConversionRequest, ImageFormat};
use crate::{CompactionStrategy, DmgError};
use std::fs;
use std::path::{Path, PathBuf};

impl ConversionPipeline {
    pub(super) async fn compact(
        &self,
        job: &mut Job<'_>,
        request: &ConversionRequest,
        bundle: &Path,
    ) -> Result<PathBuf, DmgError> {
        let attempt = match self.settings.compaction {
            CompactionStrategy::Recreate => self.recreate(job, request).await,
            CompactionStrategy::Sparse => self.sparse(job, request, bundle).await,
            CompactionStrategy::Direct => {
                return self
                    .compress(job, Stage::Convert, &request.source, &request.destination, &request.passphrase)
                    .await;
            }
        };

        match attempt {
            Ok(output) => Ok(output),
            Err(e) => {
                let stage = job.stage;
                job.warn(stage, e);
                job.reporter
                    .info(Stage::Convert, "Compacting failed, compressing the source directly");
                self.direct_fallback(job, request).await
            }
        }
    }

    async fn direct_fallback(&self, job: &mut Job<'_>, request: &ConversionRequest) -> Result<PathBuf, DmgError> {
        if !self.registry.ensure_detached(&request.source, &job.reporter).await {
            return Err(DmgError::MountBusy(request.source.clone()));
        }
        self.clear_destination(job, &request.destination).await?;
        self.compress(job, Stage::Convert, &request.source, &request.destination, &request.passphrase)
            .await
    }

    /// Rebuild the source's volume into a fresh writable image, restore its
    /// volume icon, and compress the result.
    async fn recreate(&self, job: &mut Job<'_>, request: &ConversionRequest) -> Result<PathBuf, DmgError> {
        job.enter(Stage::Recreate, format!("Mounting {} writable", request.source.display()));
        let reporter = job.reporter;
        let mount = self
            .registry
            .attach(&request.source, false, &request.passphrase, &reporter)
            .await?
            .ok_or_else(|| DmgError::UnexpectedOutput {
                program: "hdiutil".to_string(),
                detail: format!("no mount point reported for {}", request.source.display()),
            })?;
        job.ledger.track(TemporaryArtifact::Mount(mount.clone()));
        reporter.info(Stage::Recreate, format!("Mounted writable: {}", mount.display()));

        let recreated = job.ledger.temp_path("temp_recreated", Some("dmg"));
        let rebuilt = self.rebuild_from_mount(job, request, &mount, &recreated).await;
        self.release_tracked_mount(job, &mount).await;
        let preserved_icon = rebuilt?;

        if let Some(icon) = preserved_icon {
            job.enter(Stage::VolumeIcon, "Restoring volume icon");
            if let Err(e) = self
                .icons
                .apply_volume_icon(&icon, &recreated, &request.passphrase, &reporter)
                .await
            {
                job.warnings.push(e);
            }
        }

        let output = self
            .compress(job, Stage::Compact, &recreated, &request.destination, &request.passphrase)
            .await?;
        if remove_path(&recreated).is_ok() {
            job.ledger.release(&TemporaryArtifact::Image(recreated));
        }
        Ok(output)
    }

    /// Copy aside the volume icon, then create the new image from the
    /// mounted folder. Returns the preserved icon, if there was one.
    async fn rebuild_from_mount(
        &self,
        job: &mut Job<'_>,
        request: &ConversionRequest,
        mount: &Path,
        recreated: &Path,
    ) -> Result<Option<PathBuf>, DmgError> {
        let volume_icon = mount.join(VOLUME_ICON_NAME);
        let preserved = if volume_icon.is_file() {
            let keep = job.ledger.temp_path("volume_icon", Some("icns"));
            job.ledger.track(TemporaryArtifact::File(keep.clone()));
            fs::copy(&volume_icon, &keep)?;
            job.reporter.info(Stage::Recreate, "Existing volume icon preserved");
            Some(keep)
        } else {
            None
        };

        let volume_name = self.recreated_volume_name(job, mount).await;
        let invocation = self
            .with_encryption(self.registry.hdiutil().arg("create"), &request.passphrase)
            .args(["-volname", volume_name.as_str()])
            .arg("-srcfolder")
            .arg_path(mount)
            .args(["-format", ImageFormat::ReadWrite.as_arg()])
            .arg_path(recreated);

        job.ledger.track(TemporaryArtifact::Image(recreated.to_path_buf()));
        job.enter(Stage::Recreate, format!("Recreating volume {}", volume_name));
        self.run_stage(job, Stage::Recreate, invocation).await?;
        Ok(preserved)
    }

    /// The source's volume name. Falls back to the mount directory name,
    /// which may carry a " 1" style suffix.
    async fn recreated_volume_name(&self, job: &Job<'_>, mount: &Path) -> String {
        let fallback = || {
            mount
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Untitled".to_string())
        };
        match self.registry.volume_name(mount).await {
            Ok(Some(name)) => name,
            Ok(None) => fallback(),
            Err(e) => {
                job.reporter
                    .warn(Stage::Recreate, format!("Could not read volume name: {}", e));
                fallback()
            }
        }
    }

    /// Writable copy with the bundle's volume icon, converted through a
    /// sparse image, then compressed.
    async fn sparse(&self, job: &mut Job<'_>, request: &ConversionRequest, bundle: &Path) -> Result<PathBuf, DmgError> {
        let passphrase = &request.passphrase;
        let writable = job.ledger.temp_path("temp_rw", Some("dmg"));
        job.ledger.track(TemporaryArtifact::Image(writable.clone()));

        job.enter(Stage::Compact, "Making a writable working copy");
        let invocation = self.conversion_invocation(&request.source, ImageFormat::ReadWrite, &writable, passphrase);
        self.run_stage(job, Stage::Compact, invocation).await?;

        job.enter(Stage::VolumeIcon, "Setting volume icon");
        if let Err(e) = self
            .icons
            .embed_volume_icon(bundle, &writable, passphrase, &job.reporter)
            .await
        {
            job.warnings.push(e);
        }

        // hdiutil appends the extension itself
        let sparse_base = job.ledger.temp_path("temp_sparse_icon", None);
        let sparse = sparse_base.with_extension("sparseimage");
        job.ledger.track(TemporaryArtifact::Image(sparse.clone()));

        job.enter(Stage::Compact, "Converting to sparse image");
        let invocation = self.conversion_invocation(&writable, ImageFormat::Sparse, &sparse_base, passphrase);
        self.run_stage(job, Stage::Compact, invocation).await?;

        self.compress(job, Stage::Compact, &sparse, &request.destination, passphrase)
            .await
    }
}
