use super::{ConversionPipeline, Job, PipelineOutcome};
use crate::artifact::remove_path;
use crate::events::{EventSink, Stage};
use crate::process::Invocation;
use crate::request::{CreationRequest, CreationSource};
use crate::DmgError;
use std::path::PathBuf;

impl ConversionPipeline {
    /// `hdiutil create` arguments for a validated request.
    pub fn creation_invocation(&self, request: &CreationRequest, source: &CreationSource) -> Invocation {
        let invocation = self.with_encryption(self.registry.hdiutil().arg("create"), &request.passphrase);

        match source {
            CreationSource::Folder(folder) => invocation
                .args(["-volname", request.volume_name.as_str()])
                .args(["-fs", request.filesystem.as_arg()])
                .args(["-format", request.access.format().as_arg()])
                .arg("-srcfolder")
                .arg_path(folder)
                .arg_path(&request.destination),
            CreationSource::Empty(size) => invocation
                .args(["-size", size.as_str()])
                .args(["-fs", request.filesystem.as_arg()])
                .args(["-volname", request.volume_name.as_str()])
                .arg_path(&request.destination),
        }
    }

    /// Build a new image from a folder or at a fixed size.
    pub async fn create(&self, request: &CreationRequest, sink: &dyn EventSink) -> PipelineOutcome {
        let mut job = self.job(sink);
        job.enter(Stage::Validate, "Checking request");
        let source = match request.validate() {
            Ok(source) => source,
            Err(e) => return self.finish(job, Err(e)).await,
        };
        let _guards = self.locks.acquire(&[request.destination.as_path()]).await;

        let result = self.run_create(&mut job, request, &source).await;
        self.finish(job, result).await
    }

    async fn run_create(
        &self,
        job: &mut Job<'_>,
        request: &CreationRequest,
        source: &CreationSource,
    ) -> Result<PathBuf, DmgError> {
        let destination = &request.destination;
        if destination.exists() {
            job.enter(Stage::Detach, format!("Replacing {}", destination.display()));
            if !self.registry.ensure_detached(destination, &job.reporter).await {
                return Err(DmgError::MountBusy(destination.clone()));
            }
            remove_path(destination)?;
            job.reporter.info(Stage::Detach, "Existing destination removed");
        }

        job.enter(Stage::Create, format!("Creating {}", destination.display()));
        self.run_stage(job, Stage::Create, self.creation_invocation(request, source))
            .await?;
        Ok(destination.clone())
    }
}
