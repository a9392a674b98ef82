use crate::DmgError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "settings.json";

/// Absolute paths of the external utilities the pipeline drives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
    pub hdiutil: PathBuf,
    pub plutil: PathBuf,
    pub diskutil: PathBuf,
    pub sips: PathBuf,
    pub cp: PathBuf,
    pub set_file: PathBuf,
    pub get_file_info: PathBuf,
    pub touch: PathBuf,
    pub open: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            hdiutil: PathBuf::from("/usr/bin/hdiutil"),
            plutil: PathBuf::from("/usr/bin/plutil"),
            diskutil: PathBuf::from("/usr/sbin/diskutil"),
            sips: PathBuf::from("/usr/bin/sips"),
            cp: PathBuf::from("/bin/cp"),
            set_file: PathBuf::from("/usr/bin/SetFile"),
            get_file_info: PathBuf::from("/usr/bin/GetFileInfo"),
            touch: PathBuf::from("/usr/bin/touch"),
            open: PathBuf::from("/usr/bin/open"),
        }
    }
}

impl ToolPaths {
    fn entries(&self) -> [(&'static str, &Path); 9] {
        [
            ("hdiutil", &self.hdiutil),
            ("plutil", &self.plutil),
            ("diskutil", &self.diskutil),
            ("sips", &self.sips),
            ("cp", &self.cp),
            ("SetFile", &self.set_file),
            ("GetFileInfo", &self.get_file_info),
            ("touch", &self.touch),
            ("open", &self.open),
        ]
    }

    /// Each tool with its configured path and whether it can be found there
    /// or on `PATH`.
    pub fn availability(&self) -> Vec<(&'static str, PathBuf, bool)> {
        self.entries()
            .into_iter()
            .map(|(name, path)| (name, path.to_path_buf(), path.exists() || which::which(name).is_ok()))
            .collect()
    }

    /// Tools that are neither present at their configured path nor on `PATH`.
    ///
    /// `SetFile` and `GetFileInfo` ship with the Xcode command line tools and
    /// are commonly the only ones missing.
    pub fn missing(&self) -> Vec<String> {
        self.availability()
            .into_iter()
            .filter(|(_, _, found)| !found)
            .map(|(name, path, _)| format!("{} ({})", name, path.display()))
            .collect()
    }
}

/// How a writable image is shrunk before compression when an application
/// icon is embedded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    /// Build a fresh writable image from the mounted contents, then compress.
    #[default]
    Recreate,
    /// Convert through a sparse image so unwritten blocks are dropped.
    Sparse,
    /// Compress the source as-is.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub tools: ToolPaths,
    pub detach_attempts: u32,
    pub settle_interval_ms: u64,
    pub compression_level: u8,
    pub encryption: String,
    pub resize_increment_bytes: u64,
    pub compaction: CompactionStrategy,
    pub temp_dir: Option<PathBuf>,
    /// Prefix that marks the mount point in attach output.
    pub volumes_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            detach_attempts: 3,
            settle_interval_ms: 300,
            compression_level: 9,
            encryption: "AES-256".to_string(),
            resize_increment_bytes: 1024 * 1024 * 1024,
            compaction: CompactionStrategy::default(),
            temp_dir: None,
            volumes_root: PathBuf::from("/Volumes"),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, DmgError> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from the per-user config directory, falling back to defaults
    /// when no settings file exists there.
    pub fn load_default() -> Result<Self, DmgError> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "loading settings");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dmgtweak").join(SETTINGS_FILE))
    }

    pub fn validate(&self) -> Result<(), DmgError> {
        if self.detach_attempts == 0 {
            return Err(DmgError::Validation(
                "detach_attempts must be at least 1".to_string(),
            ));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(DmgError::Validation(format!(
                "compression_level must be between 1 and 9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
