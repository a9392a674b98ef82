//! Temporary files and mounts created mid-pipeline.
//!
//! Every artifact a pipeline creates is recorded in its ledger as soon as it
//! exists and removed by [`ArtifactLedger::cleanup`] before the pipeline
//! returns. Mounts are always released before any file is deleted.

use crate::events::{Reporter, Stage};
use crate::mount::MountRegistry;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporaryArtifact {
    /// Plain scratch file.
    File(PathBuf),
    /// Disk image file; detached before deletion.
    Image(PathBuf),
    /// Directory tree, e.g. a copied application bundle.
    Directory(PathBuf),
    /// Mount point of an image this pipeline attached.
    Mount(PathBuf),
}

impl TemporaryArtifact {
    pub fn path(&self) -> &Path {
        match self {
            TemporaryArtifact::File(p)
            | TemporaryArtifact::Image(p)
            | TemporaryArtifact::Directory(p)
            | TemporaryArtifact::Mount(p) => p,
        }
    }
}

#[derive(Debug)]
pub struct ArtifactLedger {
    root: PathBuf,
    artifacts: Vec<TemporaryArtifact>,
}

impl ArtifactLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            artifacts: Vec::new(),
        }
    }

    /// Fresh, unused path in the temporary directory.
    pub fn temp_path(&self, prefix: &str, extension: Option<&str>) -> PathBuf {
        let mut name = format!("{}_{}", prefix, Uuid::new_v4());
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext);
        }
        self.root.join(name)
    }

    pub fn track(&mut self, artifact: TemporaryArtifact) {
        tracing::debug!(?artifact, "tracking temporary artifact");
        self.artifacts.push(artifact);
    }

    /// Forget an artifact that was already cleaned up along the normal path.
    pub fn release(&mut self, artifact: &TemporaryArtifact) {
        self.artifacts.retain(|a| a != artifact);
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn artifacts(&self) -> &[TemporaryArtifact] {
        &self.artifacts
    }

    /// Detach every tracked mount, then delete files newest first.
    /// Failures are reported and do not stop the sweep.
    pub async fn cleanup(&mut self, registry: &MountRegistry, reporter: &Reporter<'_>) {
        if self.artifacts.is_empty() {
            return;
        }
        let artifacts = std::mem::take(&mut self.artifacts);
        let (mounts, files): (Vec<_>, Vec<_>) = artifacts
            .into_iter()
            .partition(|a| matches!(a, TemporaryArtifact::Mount(_)));

        for mount in mounts.iter().rev() {
            match registry.release_mount(mount.path()).await {
                Ok(()) => reporter.info(
                    Stage::Cleanup,
                    format!("Temporary mount removed: {}", mount.path().display()),
                ),
                Err(e) => reporter.warn(
                    Stage::Cleanup,
                    format!("Temporary mount {} could not be removed: {}", mount.path().display(), e),
                ),
            }
        }

        for artifact in files.iter().rev() {
            let path = artifact.path();
            if !path.exists() {
                continue;
            }
            if let TemporaryArtifact::Image(image) = artifact {
                if !registry.ensure_detached(image, reporter).await {
                    reporter.warn(
                        Stage::Cleanup,
                        format!("Left attached temporary image in place: {}", image.display()),
                    );
                    continue;
                }
            }
            match remove_path(path) {
                Ok(()) => reporter.info(
                    Stage::Cleanup,
                    format!("Temporary file deleted: {}", path.display()),
                ),
                Err(e) => reporter.warn(
                    Stage::Cleanup,
                    format!("Temporary file {} could not be deleted: {}", path.display(), e),
                ),
            }
        }
    }
}

/// Remove a file or a whole directory tree.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Recursively copy `src` to `dst`, keeping symlinks as links.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            fs::copy(entry.path().parent().unwrap_or(src).join(link), &target).map(|_| ())?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
