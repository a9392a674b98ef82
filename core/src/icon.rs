//! Custom icons for image files and mounted volumes.
//!
//! A file icon is embedded with `sips` when the tool accepts the icon,
//! otherwise by copying the icon's resource fork onto the target and setting
//! the custom-icon attribute. A volume icon is the `.VolumeIcon.icns` file at
//! the volume root plus the custom-icon bit on the root directory.
//!
//! Nothing here fails an image operation: callers treat every error as a
//! warning.

use crate::events::{Reporter, Stage};
use crate::mount::MountRegistry;
use crate::process::{Invocation, ProcessExecutor, ProcessResult};
use crate::request::Passphrase;
use crate::{DmgError, ToolPaths};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ICON_EXTENSION: &str = "icns";
pub const APP_EXTENSION: &str = "app";
pub const VOLUME_ICON_NAME: &str = ".VolumeIcon.icns";

/// Places inside a bundle where icon resources live, most specific first.
const RESOURCE_DIRS: [&str; 3] = ["Contents/Resources", "Resources", "Contents"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IconLookup {
    Found(PathBuf),
    NotFound,
}

/// Technique that ended up applying a file icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconMethod {
    Sips,
    ResourceFork,
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

/// Visible entries of `dir`, sorted so lookups are deterministic.
fn visible_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(read) => read
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| !is_hidden(p))
            .collect(),
        Err(_) => Vec::new(),
    };
    entries.sort();
    entries
}

/// First application bundle at the top level of a mounted volume.
pub fn find_app_bundle(mount_point: &Path) -> Option<PathBuf> {
    visible_entries(mount_point)
        .into_iter()
        .find(|p| has_extension(p, APP_EXTENSION) && p.is_dir())
}

pub struct IconEmbedder {
    executor: Arc<dyn ProcessExecutor>,
    tools: ToolPaths,
    registry: Arc<MountRegistry>,
}

impl IconEmbedder {
    pub fn new(executor: Arc<dyn ProcessExecutor>, tools: ToolPaths, registry: Arc<MountRegistry>) -> Self {
        Self {
            executor,
            tools,
            registry,
        }
    }

    async fn run_checked(&self, invocation: Invocation) -> Result<ProcessResult, DmgError> {
        let name = invocation.program_name();
        self.executor.run(&invocation).await?.check(&name)
    }

    /// Icon file name declared by the bundle's `Info.plist`, if readable.
    async fn declared_icon_name(&self, bundle: &Path) -> Option<String> {
        let plist = bundle.join("Contents/Info.plist");
        if !plist.is_file() {
            return None;
        }
        let invocation = Invocation::new(&self.tools.plutil)
            .args(["-convert", "json", "-o", "-"])
            .arg_path(&plist);
        let output = self.run_checked(invocation).await.ok()?;
        let info: serde_json::Value = serde_json::from_str(&output.stdout).ok()?;
        let name = info.get("CFBundleIconFile")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }
        if has_extension(Path::new(name), ICON_EXTENSION) {
            Some(name.to_string())
        } else {
            Some(format!("{}.{}", name, ICON_EXTENSION))
        }
    }

    /// Find the bundle's icon: the declared one first, then any `.icns`.
    pub async fn locate_icon(&self, bundle: &Path) -> IconLookup {
        let dirs: Vec<PathBuf> = RESOURCE_DIRS
            .iter()
            .map(|d| bundle.join(d))
            .filter(|d| d.is_dir())
            .collect();

        if let Some(name) = self.declared_icon_name(bundle).await {
            if let Some(found) = dirs.iter().map(|d| d.join(&name)).find(|p| p.is_file()) {
                return IconLookup::Found(found);
            }
        }

        dirs.iter()
            .flat_map(|d| visible_entries(d))
            .find(|p| has_extension(p, ICON_EXTENSION) && p.is_file())
            .map(IconLookup::Found)
            .unwrap_or(IconLookup::NotFound)
    }

    async fn locate_or_report(&self, bundle: &Path, stage: Stage, reporter: &Reporter<'_>) -> Result<PathBuf, DmgError> {
        match self.locate_icon(bundle).await {
            IconLookup::Found(icon) => {
                reporter.info(
                    stage,
                    format!("Using icon: {}", icon.file_name().unwrap_or_default().to_string_lossy()),
                );
                Ok(icon)
            }
            IconLookup::NotFound => {
                let err = DmgError::IconNotFound(bundle.to_path_buf());
                reporter.warn(stage, err.to_string());
                Err(err)
            }
        }
    }

    /// Whether `sips` reads the icon as a raster image.
    async fn sips_accepts(&self, icon: &Path) -> bool {
        let invocation = Invocation::new(&self.tools.sips)
            .args(["--getProperty", "pixelWidth"])
            .arg_path(icon);
        matches!(self.executor.run(&invocation).await, Ok(result) if result.success())
    }

    async fn touch(&self, target: &Path) {
        let _ = self
            .executor
            .run(&Invocation::new(&self.tools.touch).arg_path(target))
            .await;
    }

    /// Give an image file the icon of `bundle`.
    pub async fn embed_file_icon(
        &self,
        bundle: &Path,
        target: &Path,
        reporter: &Reporter<'_>,
    ) -> Result<IconMethod, DmgError> {
        let icon = self.locate_or_report(bundle, Stage::FileIcon, reporter).await?;

        if self.sips_accepts(&icon).await {
            let invocation = Invocation::new(&self.tools.sips)
                .arg("-i")
                .arg_path(&icon)
                .arg_path(target);
            match self.run_checked(invocation).await {
                Ok(_) => {
                    self.touch(target).await;
                    reporter.succeeded(Stage::FileIcon, "Image icon set (sips)");
                    return Ok(IconMethod::Sips);
                }
                Err(e) => reporter.info(
                    Stage::FileIcon,
                    format!("sips rejected the image ({}), trying resource fork", e),
                ),
            }
        } else {
            reporter.info(
                Stage::FileIcon,
                "Icon not readable by sips, trying resource fork",
            );
        }

        match self.resource_fork_method(&icon, target, reporter).await {
            Ok(()) => {
                reporter.succeeded(Stage::FileIcon, "Image icon set (resource fork)");
                Ok(IconMethod::ResourceFork)
            }
            Err(e) => {
                reporter.warn(Stage::FileIcon, format!("All icon methods tried: {}", e));
                Err(e)
            }
        }
    }

    async fn resource_fork_method(&self, icon: &Path, target: &Path, reporter: &Reporter<'_>) -> Result<(), DmgError> {
        let fork = |p: &Path| format!("{}/..namedfork/rsrc", p.display());
        let failed = |what: &str, e: DmgError| DmgError::IconMethodFailed(format!("{}: {}", what, e));

        self.run_checked(Invocation::new(&self.tools.cp).arg(fork(icon)).arg(fork(target)))
            .await
            .map_err(|e| failed("copying resource fork", e))?;
        reporter.info(Stage::FileIcon, "Resource fork copied");

        self.run_checked(Invocation::new(&self.tools.set_file).args(["-a", "C"]).arg_path(target))
            .await
            .map_err(|e| failed("setting custom icon bit", e))?;
        self.touch(target).await;

        let verify = self
            .run_checked(Invocation::new(&self.tools.get_file_info).arg("-aC").arg_path(target))
            .await
            .map_err(|e| failed("reading file info", e))?;
        if verify.stdout.trim() == "1" {
            Ok(())
        } else {
            Err(DmgError::IconMethodFailed(
                "custom icon bit not reported after setting it".to_string(),
            ))
        }
    }

    /// Give the volume inside `image` the icon of `bundle`.
    pub async fn embed_volume_icon(
        &self,
        bundle: &Path,
        image: &Path,
        passphrase: &Passphrase,
        reporter: &Reporter<'_>,
    ) -> Result<(), DmgError> {
        let icon = self.locate_or_report(bundle, Stage::VolumeIcon, reporter).await?;
        self.apply_volume_icon(&icon, image, passphrase, reporter).await
    }

    /// Install `icon` as the volume icon of a writable `image`, attaching it
    /// if needed. An image attached here is always detached again.
    pub async fn apply_volume_icon(
        &self,
        icon: &Path,
        image: &Path,
        passphrase: &Passphrase,
        reporter: &Reporter<'_>,
    ) -> Result<(), DmgError> {
        let existing = match self.registry.find_entry(image).await {
            Ok(entry) => entry.and_then(|e| e.mount_points.into_iter().next()),
            Err(_) => None,
        };
        let (mount, attached_here) = match existing {
            Some(mount) => (mount, false),
            None => {
                let mount = self
                    .registry
                    .attach(image, false, passphrase, reporter)
                    .await
                    .map_err(|e| DmgError::IconMethodFailed(format!("attaching {}: {}", image.display(), e)))?
                    .ok_or_else(|| {
                        DmgError::IconMethodFailed(format!("no mount point reported for {}", image.display()))
                    })?;
                reporter.info(Stage::VolumeIcon, format!("Mounted writable: {}", mount.display()));
                (mount, true)
            }
        };

        let result = self.decorate_volume(icon, &mount, reporter).await;

        if attached_here {
            match self.registry.release_mount(&mount).await {
                Ok(()) => reporter.info(Stage::VolumeIcon, format!("Detached {}", mount.display())),
                Err(e) => reporter.warn(Stage::VolumeIcon, format!("Detaching {} had problems: {}", mount.display(), e)),
            }
        }
        result
    }

    async fn decorate_volume(&self, icon: &Path, mount: &Path, reporter: &Reporter<'_>) -> Result<(), DmgError> {
        let volume_icon = mount.join(VOLUME_ICON_NAME);
        if volume_icon.exists() {
            fs::remove_file(&volume_icon)?;
        }
        fs::copy(icon, &volume_icon)?;
        reporter.info(Stage::VolumeIcon, format!("Icon copied to {}", volume_icon.display()));

        let steps: [(&[&str], &Path, &str); 3] = [
            (&["-a", "C"], &volume_icon, "custom icon bit on volume icon"),
            (&["-a", "C"], mount, "custom icon bit on volume root"),
            (&["-a", "V"], &volume_icon, "invisible bit on volume icon"),
        ];
        let mut failures = Vec::new();
        for (flags, path, what) in steps {
            let invocation = Invocation::new(&self.tools.set_file)
                .args(flags.iter().copied())
                .arg_path(path);
            match self.run_checked(invocation).await {
                Ok(_) => reporter.info(Stage::VolumeIcon, format!("Set {}", what)),
                Err(e) => {
                    reporter.warn(Stage::VolumeIcon, format!("Failed to set {}: {}", what, e));
                    failures.push(what);
                }
            }
        }

        if failures.is_empty() {
            reporter.succeeded(Stage::VolumeIcon, "Volume icon set");
            Ok(())
        } else {
            Err(DmgError::IconMethodFailed(format!("could not set {}", failures.join(", "))))
        }
    }
}
