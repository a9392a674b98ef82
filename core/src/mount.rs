//! Attached-image discovery and release.
//!
//! The OS mount table is the only source of truth. Nothing here caches it:
//! every query re-runs `hdiutil info` in plist mode and re-parses it.

use crate::events::{Reporter, Stage};
use crate::process::{Invocation, ProcessExecutor, ProcessResult};
use crate::request::Passphrase;
use crate::{DmgError, Settings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const DEFAULT_VOLUMES_ROOT: &str = "/Volumes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedImageEntry {
    pub image_path: PathBuf,
    /// Device nodes in the order `hdiutil` lists them, parent disk first.
    pub devices: Vec<String>,
    pub mount_points: Vec<PathBuf>,
}

impl MountedImageEntry {
    pub fn is_attached(&self) -> bool {
        !self.devices.is_empty() || !self.mount_points.is_empty()
    }
}

#[derive(Deserialize)]
struct InfoDocument {
    #[serde(default)]
    images: Vec<InfoImage>,
}

#[derive(Deserialize)]
struct InfoImage {
    #[serde(rename = "image-path", default)]
    image_path: Option<String>,
    #[serde(rename = "system-entities", default)]
    system_entities: Vec<InfoEntity>,
}

#[derive(Deserialize)]
struct InfoEntity {
    #[serde(rename = "dev-entry", default)]
    dev_entry: Option<String>,
    #[serde(rename = "mount-point", default)]
    mount_point: Option<String>,
}

/// Parse `hdiutil info -plist` output after conversion to JSON.
///
/// Images with neither a device node nor a mount point are dropped.
pub fn parse_info_json(json: &str) -> Result<Vec<MountedImageEntry>, DmgError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let document: InfoDocument = serde_json::from_str(json)?;

    let entries = document
        .images
        .into_iter()
        .filter_map(|image| {
            let image_path = image.image_path?.trim().to_string();
            if image_path.is_empty() {
                return None;
            }
            let mut devices = Vec::new();
            let mut mount_points = Vec::new();
            for entity in image.system_entities {
                if let Some(dev) = entity.dev_entry.filter(|d| d.starts_with("/dev/")) {
                    devices.push(dev);
                }
                if let Some(mount) = entity.mount_point.filter(|m| m.starts_with('/')) {
                    mount_points.push(PathBuf::from(mount));
                }
            }
            Some(MountedImageEntry {
                image_path: PathBuf::from(image_path),
                devices,
                mount_points,
            })
        })
        .filter(MountedImageEntry::is_attached)
        .collect();
    Ok(entries)
}

/// First mount point under `/Volumes` in attach output.
pub fn parse_mount_point(stdout: &str) -> Option<PathBuf> {
    parse_mount_point_under(stdout, Path::new(DEFAULT_VOLUMES_ROOT))
}

/// First line mentioning `root` wins; the path runs from there to the end
/// of the line, trimmed. No such line means no mount point was reported.
pub fn parse_mount_point_under(stdout: &str, root: &Path) -> Option<PathBuf> {
    let mut prefix = root.to_string_lossy().trim_end_matches('/').to_string();
    prefix.push('/');

    stdout
        .lines()
        .find_map(|line| line.find(&prefix).map(|idx| line[idx..].trim()))
        .filter(|mount| !mount.is_empty())
        .map(PathBuf::from)
}

/// Symlink-resolved absolute form of `path`. Missing files resolve through
/// their parent directory.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Identity key for an image path: resolved, case folded, diacritics stripped.
pub fn normalize_image_path(path: &Path) -> String {
    resolve_path(path)
        .to_string_lossy()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

pub fn same_image(a: &Path, b: &Path) -> bool {
    normalize_image_path(a) == normalize_image_path(b)
}

pub struct MountRegistry {
    executor: Arc<dyn ProcessExecutor>,
    hdiutil: PathBuf,
    plutil: PathBuf,
    diskutil: PathBuf,
    max_attempts: u32,
    settle: Duration,
    volumes_root: PathBuf,
}

impl MountRegistry {
    pub fn new(executor: Arc<dyn ProcessExecutor>, settings: &Settings) -> Self {
        Self {
            executor,
            hdiutil: settings.tools.hdiutil.clone(),
            plutil: settings.tools.plutil.clone(),
            diskutil: settings.tools.diskutil.clone(),
            max_attempts: settings.detach_attempts.max(1),
            settle: settings.settle_interval(),
            volumes_root: settings.volumes_root.clone(),
        }
    }

    pub fn hdiutil(&self) -> Invocation {
        Invocation::new(&self.hdiutil)
    }

    pub fn volumes_root(&self) -> &Path {
        &self.volumes_root
    }

    pub async fn list_mounted_images(&self) -> Result<Vec<MountedImageEntry>, DmgError> {
        let info = self
            .executor
            .run(&self.hdiutil().args(["info", "-plist"]))
            .await?
            .check("hdiutil")?;
        if info.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }

        parse_info_json(&self.plist_to_json(info.stdout).await?)
    }

    async fn plist_to_json(&self, plist: String) -> Result<String, DmgError> {
        let json = self
            .executor
            .run(
                &Invocation::new(&self.plutil)
                    .args(["-convert", "json", "-o", "-", "-"])
                    .stdin(plist.into_bytes()),
            )
            .await?
            .check("plutil")?;
        Ok(json.stdout)
    }

    /// Name of the volume mounted at `mount` as `diskutil` reports it. The
    /// mount directory can carry a suffix when another volume of the same
    /// name is already attached.
    pub async fn volume_name(&self, mount: &Path) -> Result<Option<String>, DmgError> {
        let info = self
            .executor
            .run(&Invocation::new(&self.diskutil).args(["info", "-plist"]).arg_path(mount))
            .await?
            .check("diskutil")?;
        if info.stdout.trim().is_empty() {
            return Ok(None);
        }
        let json: serde_json::Value = serde_json::from_str(&self.plist_to_json(info.stdout).await?)?;
        Ok(json
            .get("VolumeName")
            .and_then(serde_json::Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string))
    }

    pub async fn find_entry(&self, image: &Path) -> Result<Option<MountedImageEntry>, DmgError> {
        let wanted = normalize_image_path(image);
        Ok(self
            .list_mounted_images()
            .await?
            .into_iter()
            .find(|entry| normalize_image_path(&entry.image_path) == wanted))
    }

    /// Attached entry for `image`, treating an unreadable mount table as
    /// "nothing attached".
    async fn lookup(&self, image: &Path, reporter: &Reporter<'_>) -> Option<MountedImageEntry> {
        match self.find_entry(image).await {
            Ok(entry) => entry.filter(MountedImageEntry::is_attached),
            Err(e) => {
                reporter.warn(Stage::Detach, format!("Could not read mount table: {}", e));
                None
            }
        }
    }

    /// Release every attachment of `image`, escalating to a forced detach
    /// on the last attempt. Returns whether the image is confirmed absent.
    pub async fn ensure_detached(&self, image: &Path, reporter: &Reporter<'_>) -> bool {
        for attempt in 1..=self.max_attempts {
            let Some(entry) = self.lookup(image, reporter).await else {
                return true;
            };

            let force = attempt == self.max_attempts;
            reporter.info(
                Stage::Detach,
                format!(
                    "Detaching {} (attempt {}/{}{})",
                    image.display(),
                    attempt,
                    self.max_attempts,
                    if force { ", forced" } else { "" }
                ),
            );
            tracing::info!(image = %image.display(), attempt, force, "detaching");

            for mount in &entry.mount_points {
                self.detach_quietly(&mount.to_string_lossy(), force).await;
            }
            // Child partitions before the whole disk
            for device in entry.devices.iter().rev() {
                self.detach_quietly(device, force).await;
            }

            tokio::time::sleep(self.settle).await;
            if self.lookup(image, reporter).await.is_none() {
                reporter.info(Stage::Detach, format!("Detached {}", image.display()));
                return true;
            }
        }

        reporter.warn(
            Stage::Detach,
            format!("Could not fully detach {}", image.display()),
        );
        false
    }

    async fn detach_quietly(&self, target: &str, force: bool) {
        if let Err(e) = self.detach(target, force).await {
            tracing::debug!(target, error = %e, "detach failed");
        }
    }

    /// Detach one device node or mount point.
    pub async fn detach(&self, target: &str, force: bool) -> Result<ProcessResult, DmgError> {
        let mut invocation = self.hdiutil().arg("detach");
        if force {
            invocation = invocation.arg("-force");
        }
        self.executor
            .run(&invocation.arg(target))
            .await?
            .check("hdiutil")
    }

    /// Detach a mount point gracefully, forcing it if the first try fails.
    pub async fn release_mount(&self, mount: &Path) -> Result<(), DmgError> {
        let target = mount.to_string_lossy();
        if self.detach(&target, false).await.is_ok() {
            return Ok(());
        }
        self.detach(&target, true).await.map(|_| ())
    }

    pub fn attach_invocation(&self, image: &Path, read_only: bool, passphrase: &Passphrase) -> Invocation {
        let mut invocation = self.hdiutil().arg("attach").arg_path(image);
        if read_only {
            invocation = invocation.arg("-readonly");
        }
        invocation = invocation.args(["-nobrowse", "-noautoopen"]);
        if let Some(bytes) = passphrase.stdin_bytes() {
            invocation = invocation.arg("-stdinpass").stdin(bytes);
        }
        invocation
    }

    /// Attach `image` and return the mount point it reported, if any.
    pub async fn attach(
        &self,
        image: &Path,
        read_only: bool,
        passphrase: &Passphrase,
        reporter: &Reporter<'_>,
    ) -> Result<Option<PathBuf>, DmgError> {
        let invocation = self.attach_invocation(image, read_only, passphrase);
        reporter.command(Stage::Attach, &invocation);
        let result = self.executor.run(&invocation).await?;
        reporter.output(Stage::Attach, &result);
        let result = result.check("hdiutil")?;
        Ok(parse_mount_point_under(&result.stdout, &self.volumes_root))
    }
}
